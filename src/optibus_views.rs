// Terminal views for the OptiBus command line
use crate::optibus_api::BackendStatus;
use crate::optibus_auth::User;
use crate::optibus_map::MapScene;
use crate::optibus_models::{format_delay, format_eta, DelaySeverity, RouteSummary, StopPrediction};
use chrono_tz::Tz;
use serde_json::{Map, Value};

pub struct OptiBusViews;

impl OptiBusViews {
    pub fn show_banner() {
        println!("\n{}", "═".repeat(70));
        println!("           🚌 OPTIBUS - LIVE ROUTE PREDICTIONS");
        println!("{}", "═".repeat(70));
    }

    pub fn show_route_header(route: &str, scene: &MapScene) {
        println!("\n{}", "─".repeat(70));
        println!("🚌 Route {}", route);
        println!(
            "   📌 Center: ({:.5}, {:.5}) | {} stops | {} path points{}",
            scene.center.lat,
            scene.center.lon,
            scene.markers.len(),
            scene.polyline.len(),
            if scene.road_snapped { " (road-snapped)" } else { "" }
        );
        if scene.polyline.len() >= 2 {
            println!("   📏 Length: {:.2} km", scene.route_length_km());
        }
        println!("{}", "─".repeat(70));
    }

    pub fn show_stops(stops: &[StopPrediction], tz: Tz) {
        if stops.is_empty() {
            println!("\nNo stops data available.");
            return;
        }

        println!(
            "\n  {:>4}  {:<28} {:>9} {:>10} {:>10}  {:>6}",
            "#", "Stop", "Scheduled", "Delay", "ETA", "ID"
        );
        println!("  {}", "─".repeat(76));
        for stop in stops {
            let delay = format_delay(stop.predicted_delay_minutes);
            println!(
                "  {:>4}  {:<28} {:>9} {} {:>10}  {:>6}",
                stop.stop_sequence,
                truncate(&stop.display_name(), 28),
                stop.scheduled_arrival_time.as_deref().unwrap_or("-"),
                Self::colorize_delay(&format!("{:>10}", delay), stop.severity()),
                format_eta(&stop.predicted_eta_iso, tz),
                stop.stop_id
            );
        }
    }

    pub fn show_summary(summary: &Map<String, Value>) {
        if summary.is_empty() {
            return;
        }
        let known = RouteSummary::from_map(summary);

        println!("\n📊 Summary:");
        if let Some(count) = known.stop_count {
            println!("   • Stops: {}", count);
        }
        if let Some(total) = known.total_predicted_delay_minutes {
            println!("   • Total predicted delay: {}", format_delay(total));
        }
        if let (Some(dow), Some(hour)) = (known.day_of_week, known.hour_of_day) {
            println!("   • Context: day {} at {:02}:00", dow, hour);
        }
        match serde_json::to_string_pretty(summary) {
            Ok(raw) => {
                for line in raw.lines() {
                    println!("     {}", line);
                }
            }
            Err(e) => log::warn!("Could not print summary: {}", e),
        }
    }

    pub fn show_backend_status(endpoint: &str, status: &BackendStatus) {
        let badge = match status {
            BackendStatus::Idle => "–".to_string(),
            BackendStatus::Loading => "Checking…".to_string(),
            BackendStatus::Success(_) => "✓ Success".to_string(),
            BackendStatus::Error(e) => format!("✕ Error: {}", e),
            BackendStatus::Unauthenticated => "User not logged in".to_string(),
        };
        println!("  {:<12} {}", endpoint, badge);
        if let BackendStatus::Success(body) = status {
            if let Ok(pretty) = serde_json::to_string_pretty(body) {
                for line in pretty.lines() {
                    println!("               {}", line);
                }
            }
        }
    }

    pub fn show_user(user: Option<&User>) {
        match user {
            Some(user) => {
                println!("\n👤 Signed in as {}", user.label());
                println!("   🆔 {}", user.uid);
            }
            None => println!("\n👤 Not signed in"),
        }
    }

    pub fn show_error(context: &str, error: &str) {
        println!("\n{}", "═".repeat(60));
        println!("❌ {}", context.to_uppercase());
        println!("{}", "═".repeat(60));
        println!("\n{}", error);
        println!("\n💡 Troubleshooting:");
        println!("  • Check that the OptiBus backend is running (OPTIBUS_API_BASE)");
        println!("  • Sign in again if your session expired");
        println!("\n{}", "═".repeat(60));
    }

    pub fn show_saved(what: &str, path: &std::path::Path) {
        println!("✓ {} written to {:?}", what, path);
    }

    fn colorize_delay(text: &str, severity: DelaySeverity) -> String {
        let (r, g, b) = severity.rgb();
        format!("\x1b[38;2;{};{};{}m{}\x1b[0m", r, g, b, text)
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(max.saturating_sub(1)).collect();
        cut.push('…');
        cut
    }
}
