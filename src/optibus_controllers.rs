// Command line controllers for the OptiBus client
use crate::optibus_api::{PredictionClient, RoutePredictionSource};
use crate::optibus_auth::{AnonymousIdentity, FirebaseIdentity, IdentityService, OAuthProvider};
use crate::optibus_config::{parse_timezone, OptiBusConfig};
use crate::optibus_gui;
use crate::optibus_map::MapScene;
use crate::optibus_models::{StopPrediction, Waypoint};
use crate::optibus_routing::{OsrmRouter, RoadRouter};
use crate::optibus_search::{RouteSearch, SearchOptions};
use crate::optibus_views::OptiBusViews;
use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "optibus", version, about = "Live bus route predictions on a map")]
pub struct Cli {
    /// Prediction backend base URL
    #[arg(long, global = true)]
    pub api_base: Option<String>,

    /// OSRM routing service base URL
    #[arg(long, global = true)]
    pub routing_base: Option<String>,

    /// Timezone used to display ETAs (e.g. Asia/Kolkata)
    #[arg(long, global = true)]
    pub timezone: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Open the map dashboard (default)
    Gui,
    /// Fetch predictions for one route
    Route {
        /// Route short name, e.g. 101 or BRT-1
        name: String,
        #[arg(long)]
        from_stop: Option<i64>,
        #[arg(long)]
        to_stop: Option<i64>,
        /// Start point as "lat,lon" when no stop id is known
        #[arg(long, value_parser = parse_coord)]
        from_coord: Option<Waypoint>,
        #[arg(long, value_parser = parse_coord)]
        to_coord: Option<Waypoint>,
        /// Journey start as an ISO timestamp
        #[arg(long)]
        at: Option<String>,
        #[arg(long)]
        holiday: bool,
        /// Snap the route onto roads with OSRM
        #[arg(long)]
        road: bool,
        /// Write the map scene as GeoJSON
        #[arg(long)]
        geojson: Option<PathBuf>,
        /// Write the stop table as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Check the public health endpoint
    Ping,
    /// Check the authenticated endpoint with the current session
    Protected,
    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Create an account
    Signup {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Sign in with an identity-provider token
    Oauth {
        #[arg(long, value_enum, default_value_t = ProviderArg::Google)]
        provider: ProviderArg,
        #[arg(long)]
        id_token: String,
    },
    Logout,
    Whoami,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ProviderArg {
    Google,
    Github,
}

impl From<ProviderArg> for OAuthProvider {
    fn from(value: ProviderArg) -> Self {
        match value {
            ProviderArg::Google => OAuthProvider::Google,
            ProviderArg::Github => OAuthProvider::GitHub,
        }
    }
}

#[derive(Debug, Serialize)]
struct StopRow<'a> {
    stop_id: i64,
    stop_name: String,
    stop_sequence: i64,
    lat: f64,
    lon: f64,
    scheduled_arrival_time: &'a str,
    predicted_delay_minutes: f64,
    predicted_eta_iso: &'a str,
}

pub struct OptiBusControllers;

impl OptiBusControllers {
    pub fn run(cli: Cli) -> anyhow::Result<()> {
        let config = Self::load_config(&cli)?;
        let identity = Self::build_identity(&config);

        match cli.command.unwrap_or(Command::Gui) {
            Command::Gui => optibus_gui::run_gui(config, identity),
            Command::Route {
                name,
                from_stop,
                to_stop,
                from_coord,
                to_coord,
                at,
                holiday,
                road,
                geojson,
                csv,
            } => {
                let options = SearchOptions {
                    from_stop_id: from_stop,
                    to_stop_id: to_stop,
                    from_coord,
                    to_coord,
                    timestamp_iso: at,
                    holiday,
                };
                Self::handle_route(
                    &config,
                    identity.as_ref(),
                    &name,
                    &options,
                    road,
                    geojson.as_deref(),
                    csv.as_deref(),
                )
            }
            Command::Ping => {
                let client = PredictionClient::from_config(&config)?;
                OptiBusViews::show_banner();
                OptiBusViews::show_backend_status("/ping", &client.ping());
                Ok(())
            }
            Command::Protected => {
                let client = PredictionClient::from_config(&config)?;
                let token = identity.id_token(false)?;
                OptiBusViews::show_banner();
                OptiBusViews::show_backend_status("/protected", &client.check_protected(token.as_deref()));
                Ok(())
            }
            Command::Login { email, password } => {
                let password = Self::password_or_prompt(password)?;
                let user = identity.sign_in(&email, &password)?;
                OptiBusViews::show_user(Some(&user));
                Ok(())
            }
            Command::Signup { email, password } => {
                let password = Self::password_or_prompt(password)?;
                let user = identity.sign_up(&email, &password)?;
                println!("\n✓ Account created");
                OptiBusViews::show_user(Some(&user));
                Ok(())
            }
            Command::Oauth { provider, id_token } => {
                let user = identity.sign_in_with_oauth(provider.into(), &id_token)?;
                OptiBusViews::show_user(Some(&user));
                Ok(())
            }
            Command::Logout => {
                identity.sign_out()?;
                println!("\n✓ Signed out");
                Ok(())
            }
            Command::Whoami => {
                OptiBusViews::show_user(identity.current_user().as_ref());
                Ok(())
            }
        }
    }

    fn load_config(cli: &Cli) -> anyhow::Result<OptiBusConfig> {
        let mut config = OptiBusConfig::from_env().context("Invalid configuration")?;
        if let Some(base) = &cli.api_base {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(base) = &cli.routing_base {
            config.routing_base = base.trim_end_matches('/').to_string();
        }
        if let Some(tz) = &cli.timezone {
            config.timezone = parse_timezone(tz)?;
        }
        log::debug!("Using backend {} and router {}", config.api_base, config.routing_base);
        Ok(config)
    }

    fn build_identity(config: &OptiBusConfig) -> Arc<dyn IdentityService> {
        let Some(key) = config.auth_api_key.as_deref() else {
            log::info!("OPTIBUS_AUTH_API_KEY is not set, requests will be sent without a token");
            return Arc::new(AnonymousIdentity);
        };
        match FirebaseIdentity::new(key, config.session_path.clone(), config.request_timeout) {
            Ok(identity) => Arc::new(identity),
            Err(e) => {
                log::error!("Identity service unavailable: {}", e);
                Arc::new(AnonymousIdentity)
            }
        }
    }

    fn handle_route(
        config: &OptiBusConfig,
        identity: &dyn IdentityService,
        name: &str,
        options: &SearchOptions,
        road: bool,
        geojson: Option<&Path>,
        csv_path: Option<&Path>,
    ) -> anyhow::Result<()> {
        let client = PredictionClient::from_config(config)?;
        let mut search = RouteSearch::new(config.default_center, config.recent_routes.clone());

        search.set_input(name);
        let Some(ticket) = search.begin() else {
            bail!("{}", search.error().unwrap_or("Invalid route name"));
        };

        println!("\n🔄 Fetching predictions for route {}...", ticket.route);
        let token = identity.id_token(false)?;
        let result = client.fetch_route_eta(&options.request_for(&ticket.route), token.as_deref());
        search.complete(&ticket, result);

        if let Some(error) = search.error() {
            bail!("{}", error);
        }

        if road {
            if let Some((road_ticket, waypoints)) = search.begin_road_resolution() {
                println!("🛣️  Snapping {} waypoints to roads...", waypoints.len());
                let router = OsrmRouter::from_config(config)?;
                let path = router.resolve(&waypoints);
                search.complete_road(&road_ticket, path);
            }
        }

        let scene = MapScene::from_search(&search, config.timezone, config.default_zoom);
        let route = search.route_name().unwrap_or(&ticket.route).to_string();

        OptiBusViews::show_route_header(&route, &scene);
        OptiBusViews::show_stops(search.stops(), config.timezone);
        OptiBusViews::show_summary(search.summary_map());

        if let Some(path) = geojson {
            let body = scene.to_geojson_string()?;
            fs::write(path, body).with_context(|| format!("Failed to write {:?}", path))?;
            OptiBusViews::show_saved("GeoJSON", path);
        }
        if let Some(path) = csv_path {
            Self::write_csv(path, search.stops())?;
            OptiBusViews::show_saved("CSV", path);
        }

        Ok(())
    }

    fn write_csv(path: &Path, stops: &[StopPrediction]) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(path).with_context(|| format!("Failed to create {:?}", path))?;
        for stop in stops {
            writer.serialize(StopRow {
                stop_id: stop.stop_id,
                stop_name: stop.display_name(),
                stop_sequence: stop.stop_sequence,
                lat: stop.lat,
                lon: stop.lon,
                scheduled_arrival_time: stop.scheduled_arrival_time.as_deref().unwrap_or(""),
                predicted_delay_minutes: stop.predicted_delay_minutes,
                predicted_eta_iso: &stop.predicted_eta_iso,
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    fn password_or_prompt(password: Option<String>) -> anyhow::Result<String> {
        if let Some(password) = password {
            return Ok(password);
        }
        print!("🔑 Password: ");
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let password = input.trim_end_matches(['\r', '\n']).to_string();
        if password.is_empty() {
            bail!("No password provided");
        }
        Ok(password)
    }
}

fn parse_coord(value: &str) -> Result<Waypoint, String> {
    let (lat, lon) = value
        .split_once(',')
        .ok_or_else(|| format!("expected LAT,LON, got '{}'", value))?;
    let lat: f64 = lat.trim().parse().map_err(|_| format!("invalid latitude '{}'", lat.trim()))?;
    let lon: f64 = lon.trim().parse().map_err(|_| format!("invalid longitude '{}'", lon.trim()))?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(format!("coordinate out of range: {}, {}", lat, lon));
    }
    Ok(Waypoint::new(lat, lon))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn route_flags_parse() {
        let cli = Cli::try_parse_from([
            "optibus", "--timezone", "UTC", "route", "101", "--from-stop", "5", "--holiday", "--road",
            "--geojson", "out.geojson",
        ])
        .unwrap();
        assert_eq!(cli.timezone.as_deref(), Some("UTC"));
        match cli.command {
            Some(Command::Route { name, from_stop, holiday, road, geojson, csv, .. }) => {
                assert_eq!(name, "101");
                assert_eq!(from_stop, Some(5));
                assert!(holiday && road);
                assert_eq!(geojson, Some(PathBuf::from("out.geojson")));
                assert!(csv.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn coordinates_parse_as_lat_lon() {
        assert_eq!(parse_coord("28.61, 77.2"), Ok(Waypoint::new(28.61, 77.2)));
        assert!(parse_coord("28.61").is_err());
        assert!(parse_coord("91,0").is_err());
    }

    #[test]
    fn no_subcommand_means_gui() {
        let cli = Cli::try_parse_from(["optibus"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn csv_export_uses_display_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stops.csv");
        let stops = vec![StopPrediction {
            stop_id: 4,
            stop_name: None,
            stop_sequence: 1,
            lat: 28.6,
            lon: 77.2,
            scheduled_arrival_time: None,
            predicted_delay_minutes: 1.5,
            predicted_eta_iso: "2024-05-01T10:00:00Z".into(),
        }];
        OptiBusControllers::write_csv(&path, &stops).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        let mut lines = written.lines();
        assert_eq!(
            lines.next(),
            Some("stop_id,stop_name,stop_sequence,lat,lon,scheduled_arrival_time,predicted_delay_minutes,predicted_eta_iso")
        );
        assert_eq!(lines.next(), Some("4,Stop 4,1,28.6,77.2,,1.5,2024-05-01T10:00:00Z"));
    }
}
