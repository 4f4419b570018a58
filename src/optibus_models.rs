// API models for the OptiBus route prediction backend
//
// Backend endpoints:
// - Route ETA:   POST /api/predictions/route_eta
// - Health:      GET  /ping
// - Auth check:  GET  /protected

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

// ============================================================================
// Data Structures
// ============================================================================

/// A latitude/longitude pair. Travels over the wire as `[lat, lon]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
}

impl Waypoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Waypoint { lat, lon }
    }
}

impl Serialize for Waypoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (self.lat, self.lon).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Waypoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (lat, lon) = <(f64, f64)>::deserialize(deserializer)?;
        Ok(Waypoint { lat, lon })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopPrediction {
    pub stop_id: i64,
    #[serde(default)]
    pub stop_name: Option<String>,
    #[serde(default)]
    pub stop_sequence: i64,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub scheduled_arrival_time: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub predicted_delay_minutes: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub predicted_eta_iso: String,
}

impl StopPrediction {
    pub fn display_name(&self) -> String {
        match self.stop_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("Stop {}", self.stop_id),
        }
    }

    pub fn position(&self) -> Waypoint {
        Waypoint::new(self.lat, self.lon)
    }

    pub fn severity(&self) -> DelaySeverity {
        DelaySeverity::from_minutes(self.predicted_delay_minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RouteEtaRequest {
    pub route_short_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_stop_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_stop_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_coord: Option<Waypoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_coord: Option<Waypoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_iso: Option<String>,
    pub holiday_flag: u8,
}

impl RouteEtaRequest {
    pub fn for_route(route_short_name: &str) -> Self {
        RouteEtaRequest {
            route_short_name: route_short_name.trim().to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RouteEtaResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub route_short_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub waypoints: Vec<Waypoint>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub stops: Vec<StopPrediction>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub summary: Map<String, Value>,
}

impl RouteEtaResponse {
    pub fn has_route_data(&self) -> bool {
        !self.waypoints.is_empty() || !self.stops.is_empty()
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Known keys of the free-form `summary` object. The backend has shipped two
/// shapes of it, so every field is optional.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RouteSummary {
    pub stop_count: Option<u64>,
    pub start_stop_id: Option<i64>,
    pub end_stop_id: Option<i64>,
    pub total_predicted_delay_minutes: Option<f64>,
    pub route_key_used: Option<String>,
    pub day_of_week: Option<u64>,
    pub hour_of_day: Option<u64>,
}

impl RouteSummary {
    pub fn from_map(map: &Map<String, Value>) -> Self {
        RouteSummary {
            stop_count: map
                .get("n_stops")
                .or_else(|| map.get("segment_stop_count"))
                .and_then(Value::as_u64),
            start_stop_id: map.get("start_stop_id").and_then(Value::as_i64),
            end_stop_id: map.get("end_stop_id").and_then(Value::as_i64),
            total_predicted_delay_minutes: map
                .get("total_predicted_delay_minutes")
                .and_then(Value::as_f64),
            route_key_used: map
                .get("route_key_used")
                .and_then(Value::as_str)
                .map(String::from),
            day_of_week: map.get("context_day_of_week").and_then(Value::as_u64),
            hour_of_day: map.get("context_hour_of_day").and_then(Value::as_u64),
        }
    }
}

// ============================================================================
// Delay classification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelaySeverity {
    OnTime,
    Minor,
    Severe,
}

impl DelaySeverity {
    pub fn from_minutes(delay_minutes: f64) -> Self {
        if delay_minutes <= 0.0 {
            DelaySeverity::OnTime
        } else if delay_minutes <= 5.0 {
            DelaySeverity::Minor
        } else {
            DelaySeverity::Severe
        }
    }

    pub fn rgb(&self) -> (u8, u8, u8) {
        match self {
            DelaySeverity::OnTime => (22, 163, 74),
            DelaySeverity::Minor => (202, 138, 4),
            DelaySeverity::Severe => (220, 38, 38),
        }
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OptiBusError {
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("{detail}")]
    HttpError { status: u16, detail: String },
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("No route data available")]
    NoRouteData,
    #[error("No road path found")]
    NoRoadPath,
    #[error("Authentication error: {0}")]
    AuthError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("File error: {0}")]
    FileError(String),
}

impl OptiBusError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, OptiBusError::HttpError { status: 401, .. })
    }
}

pub type Result<T> = std::result::Result<T, OptiBusError>;

// ============================================================================
// Formatting helpers
// ============================================================================

pub const MAX_ROUTE_NAME_LEN: usize = 10;

lazy_static! {
    static ref ROUTE_NAME_RE: Regex = Regex::new(r"^[A-Za-z0-9_\- ]+$").unwrap();
}

/// Route names are entered upper-case and capped like the search box.
pub fn normalize_route_name(input: &str) -> String {
    input
        .to_uppercase()
        .chars()
        .take(MAX_ROUTE_NAME_LEN)
        .collect()
}

pub fn is_valid_route_name(name: &str) -> bool {
    let trimmed = name.trim();
    !trimmed.is_empty() && ROUTE_NAME_RE.is_match(trimmed)
}

/// Parses the backend's ETA strings. Offsets are honoured; naive
/// timestamps are read as UTC.
pub fn parse_eta(iso: &str) -> Option<DateTime<Utc>> {
    let iso = iso.trim();
    if iso.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(iso) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(iso, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub fn format_eta(iso: &str, tz: Tz) -> String {
    match parse_eta(iso) {
        Some(dt) => dt.with_timezone(&tz).format("%H:%M").to_string(),
        None => "Invalid time".to_string(),
    }
}

pub fn format_delay(delay_minutes: f64) -> String {
    let sign = if delay_minutes > 0.0 { "+" } else { "" };
    format!("{}{:.1} min", sign, delay_minutes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn waypoint_travels_as_lat_lon_pair() {
        let wp: Waypoint = serde_json::from_value(json!([28.61, 77.2])).unwrap();
        assert_eq!(wp, Waypoint::new(28.61, 77.2));
        assert_eq!(serde_json::to_value(wp).unwrap(), json!([28.61, 77.2]));
    }

    #[test]
    fn response_tolerates_missing_and_null_fields() {
        let resp: RouteEtaResponse = serde_json::from_value(json!({
            "route_short_name": "101",
            "waypoints": null,
            "stops": [{ "stop_id": 7, "lat": 28.6, "lon": 77.2, "predicted_delay_minutes": null }]
        }))
        .unwrap();

        assert!(resp.waypoints.is_empty());
        assert!(resp.summary.is_empty());
        assert_eq!(resp.stops.len(), 1);
        let stop = &resp.stops[0];
        assert_eq!(stop.predicted_delay_minutes, 0.0);
        assert_eq!(stop.predicted_eta_iso, "");
        assert_eq!(stop.display_name(), "Stop 7");
        assert!(resp.has_route_data());
    }

    #[test]
    fn empty_response_has_no_route_data() {
        let resp: RouteEtaResponse = serde_json::from_value(json!({})).unwrap();
        assert!(!resp.has_route_data());
    }

    #[test]
    fn request_omits_unset_optionals() {
        let body = serde_json::to_value(RouteEtaRequest::for_route("  142 ")).unwrap();
        assert_eq!(body, json!({ "route_short_name": "142", "holiday_flag": 0 }));
    }

    #[test]
    fn summary_reads_both_backend_shapes() {
        let a = RouteSummary::from_map(
            json!({ "n_stops": 12, "total_predicted_delay_minutes": 4.5, "route_key_used": "101" })
                .as_object()
                .unwrap(),
        );
        assert_eq!(a.stop_count, Some(12));
        assert_eq!(a.route_key_used.as_deref(), Some("101"));

        let b = RouteSummary::from_map(json!({ "segment_stop_count": 3 }).as_object().unwrap());
        assert_eq!(b.stop_count, Some(3));
        assert_eq!(b.total_predicted_delay_minutes, None);
    }

    #[test]
    fn delay_severity_thresholds() {
        assert_eq!(DelaySeverity::from_minutes(-2.0), DelaySeverity::OnTime);
        assert_eq!(DelaySeverity::from_minutes(0.0), DelaySeverity::OnTime);
        assert_eq!(DelaySeverity::from_minutes(5.0), DelaySeverity::Minor);
        assert_eq!(DelaySeverity::from_minutes(5.1), DelaySeverity::Severe);
    }

    #[test]
    fn route_names_are_normalized_and_validated() {
        assert_eq!(normalize_route_name("brt-1"), "BRT-1");
        assert_eq!(normalize_route_name("abcdefghijklmnop"), "ABCDEFGHIJ");
        assert!(is_valid_route_name(" A1 "));
        assert!(!is_valid_route_name("   "));
        assert!(!is_valid_route_name("101;DROP"));
    }

    #[test]
    fn eta_formatting() {
        let tz: Tz = "Asia/Kolkata".parse().unwrap();
        assert_eq!(format_eta("2024-05-01T10:00:00Z", tz), "15:30");
        assert_eq!(format_eta("2024-05-01T10:00:00+05:30", tz), "10:00");
        assert_eq!(format_eta("2024-05-01T10:00:00", chrono_tz::UTC), "10:00");
        assert_eq!(format_eta("soon", tz), "Invalid time");
        assert_eq!(format_eta("", tz), "Invalid time");
    }

    #[test]
    fn delay_formatting() {
        assert_eq!(format_delay(2.46), "+2.5 min");
        assert_eq!(format_delay(0.0), "0.0 min");
        assert_eq!(format_delay(-1.0), "-1.0 min");
    }
}
