mod optibus_api;
mod optibus_auth;
mod optibus_config;
mod optibus_controllers;
mod optibus_gui;
mod optibus_map;
mod optibus_models;
mod optibus_routing;
mod optibus_search;
mod optibus_views;

use clap::Parser;
use optibus_controllers::{Cli, OptiBusControllers};
use optibus_views::OptiBusViews;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\n{}", "═".repeat(70));
        eprintln!("❌ OPTIBUS PANIC");
        eprintln!("{}", "═".repeat(70));
        eprintln!("\n{}", panic_info);
        eprintln!("\nRun again with RUST_LOG=debug and report the output if this repeats.");
        eprintln!("{}", "═".repeat(70));
    }));

    let cli = Cli::parse();
    if let Err(e) = OptiBusControllers::run(cli) {
        log::debug!("Command failed: {:?}", e);
        OptiBusViews::show_error("Request failed", &format!("{:#}", e));
        std::process::exit(1);
    }
}
