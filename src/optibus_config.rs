// Runtime configuration, read from the environment (and `.env`) with CLI overrides
use crate::optibus_models::{OptiBusError, Result, Waypoint};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "http://localhost:8000";
pub const DEFAULT_ROUTING_BASE: &str = "https://router.project-osrm.org";
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_ZOOM: u8 = 12;
pub const DEFAULT_RECENT_ROUTES: [&str; 4] = ["101", "102", "103", "201"];
/// Delhi
pub const DEFAULT_CENTER: Waypoint = Waypoint { lat: 28.6139, lon: 77.209 };

#[derive(Debug, Clone)]
pub struct OptiBusConfig {
    pub api_base: String,
    pub routing_base: String,
    pub auth_api_key: Option<String>,
    pub timezone: Tz,
    pub request_timeout: Duration,
    pub recent_routes: Vec<String>,
    pub default_center: Waypoint,
    pub default_zoom: u8,
    pub session_path: PathBuf,
}

impl Default for OptiBusConfig {
    fn default() -> Self {
        OptiBusConfig {
            api_base: DEFAULT_API_BASE.to_string(),
            routing_base: DEFAULT_ROUTING_BASE.to_string(),
            auth_api_key: None,
            timezone: chrono_tz::Asia::Kolkata,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            recent_routes: DEFAULT_RECENT_ROUTES.iter().map(|r| r.to_string()).collect(),
            default_center: DEFAULT_CENTER,
            default_zoom: DEFAULT_ZOOM,
            session_path: Self::default_session_path(),
        }
    }
}

impl OptiBusConfig {
    /// Loads `.env` (if any) and reads the process environment.
    pub fn from_env() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => log::debug!("Loaded environment from {:?}", path),
            Err(e) if e.not_found() => {}
            Err(e) => log::warn!("Ignoring unreadable .env file: {}", e),
        }
        Self::from_vars(&std::env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(String::from)
        };

        let mut config = OptiBusConfig::default();

        if let Some(base) = get("OPTIBUS_API_BASE").or_else(|| get("VITE_API_BASE")) {
            config.api_base = base;
        }
        if let Some(base) = get("OPTIBUS_ROUTING_BASE") {
            config.routing_base = base;
        }
        config.auth_api_key = get("OPTIBUS_AUTH_API_KEY");
        if let Some(tz) = get("OPTIBUS_TIMEZONE") {
            config.timezone = parse_timezone(&tz)?;
        }
        if let Some(secs) = get("OPTIBUS_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                OptiBusError::ConfigError(format!("OPTIBUS_TIMEOUT_SECS must be a number, got '{}'", secs))
            })?;
            config.request_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(routes) = get("OPTIBUS_RECENT_ROUTES") {
            config.recent_routes = parse_route_list(&routes);
        }
        if let Some(path) = get("OPTIBUS_SESSION_FILE") {
            config.session_path = PathBuf::from(path);
        }

        config.api_base = trim_base(&config.api_base);
        config.routing_base = trim_base(&config.routing_base);
        Ok(config)
    }

    pub fn default_session_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("optibus");
        path.push("session.json");
        path
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| OptiBusError::ConfigError(format!("Unknown timezone '{}'", name)))
}

fn parse_route_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|r| r.trim().to_uppercase())
        .filter(|r| !r.is_empty())
        .collect()
}

fn trim_base(base: &str) -> String {
    base.trim_end_matches('/').to_string()
}
