// Road-following paths from an OSRM routing service
//
// API: {base}/route/v1/driving/{lon,lat;lon,lat;...}?overview=full&geometries=geojson
use crate::optibus_config::OptiBusConfig;
use crate::optibus_models::{OptiBusError, Result, Waypoint};
use geojson::{Geometry, Value as GeoValue};
use reqwest::blocking;
use serde::Deserialize;
use std::time::Duration;

pub trait RoadRouter: Send + Sync {
    /// Returns the road path through `waypoints`, or an empty path when
    /// there is nothing to route.
    fn resolve(&self, waypoints: &[Waypoint]) -> Result<Vec<Waypoint>>;
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    geometry: Geometry,
    #[serde(default)]
    distance: Option<f64>,
}

pub struct OsrmRouter {
    base_url: String,
    client: blocking::Client,
}

impl OsrmRouter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OptiBusError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(OsrmRouter {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn from_config(config: &OptiBusConfig) -> Result<Self> {
        Self::new(&config.routing_base, config.request_timeout)
    }

    pub fn route_url(&self, waypoints: &[Waypoint]) -> String {
        format!(
            "{}/route/v1/driving/{}?overview=full&geometries=geojson",
            self.base_url,
            encode_coordinates(waypoints)
        )
    }
}

impl RoadRouter for OsrmRouter {
    fn resolve(&self, waypoints: &[Waypoint]) -> Result<Vec<Waypoint>> {
        if waypoints.len() < 2 {
            return Ok(Vec::new());
        }

        let url = self.route_url(waypoints);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| OptiBusError::NetworkError(format!("Failed to reach routing service: {}", e)))?;

        let body = response
            .text()
            .map_err(|e| OptiBusError::NetworkError(format!("Failed to read routing response: {}", e)))?;

        let data: OsrmResponse = serde_json::from_str(&body)
            .map_err(|e| OptiBusError::ParseError(format!("Invalid routing response: {}", e)))?;

        let path = path_from_response(data)?;
        log::debug!("Resolved road path with {} points", path.len());
        Ok(path)
    }
}

/// OSRM wants `lon,lat` pairs separated by `;`.
pub fn encode_coordinates(waypoints: &[Waypoint]) -> String {
    waypoints
        .iter()
        .map(|wp| format!("{},{}", wp.lon, wp.lat))
        .collect::<Vec<_>>()
        .join(";")
}

fn path_from_response(data: OsrmResponse) -> Result<Vec<Waypoint>> {
    if let Some(code) = data.code.as_deref() {
        if code != "Ok" {
            log::warn!(
                "Routing service returned {}: {}",
                code,
                data.message.as_deref().unwrap_or("no message")
            );
            return Err(OptiBusError::NoRoadPath);
        }
    }

    let route = data.routes.into_iter().next().ok_or(OptiBusError::NoRoadPath)?;
    if let Some(distance) = route.distance {
        log::debug!("Road path length reported as {:.0} m", distance);
    }

    match route.geometry.value {
        GeoValue::LineString(coords) => {
            let path: Vec<Waypoint> = coords
                .iter()
                .filter(|c| c.len() >= 2)
                .map(|c| Waypoint::new(c[1], c[0]))
                .collect();
            if path.is_empty() {
                Err(OptiBusError::NoRoadPath)
            } else {
                Ok(path)
            }
        }
        _ => Err(OptiBusError::ParseError(
            "Routing geometry is not a LineString".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_waypoints() -> Vec<Waypoint> {
        vec![Waypoint::new(28.61, 77.2), Waypoint::new(28.62, 77.25)]
    }

    #[test]
    fn coordinates_are_lon_lat() {
        assert_eq!(encode_coordinates(&sample_waypoints()), "77.2,28.61;77.25,28.62");
    }

    #[test]
    fn fewer_than_two_waypoints_skips_the_request() {
        // Unroutable base: any request would fail.
        let router = OsrmRouter::new("http://127.0.0.1:1", Duration::from_millis(50)).unwrap();
        assert!(router.resolve(&[]).unwrap().is_empty());
        assert!(router.resolve(&[Waypoint::new(1.0, 2.0)]).unwrap().is_empty());
    }

    #[test]
    fn geometry_is_swapped_back_to_lat_lon() {
        let data: OsrmResponse = serde_json::from_value(json!({
            "code": "Ok",
            "routes": [{
                "distance": 5210.4,
                "geometry": { "type": "LineString", "coordinates": [[77.2, 28.61], [77.22, 28.615], [77.25, 28.62]] }
            }]
        }))
        .unwrap();

        let path = path_from_response(data).unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(path[1], Waypoint::new(28.615, 77.22));
    }

    #[test]
    fn no_routes_is_reported() {
        let data: OsrmResponse = serde_json::from_value(json!({ "code": "NoRoute", "message": "Impossible route" })).unwrap();
        assert!(matches!(path_from_response(data), Err(OptiBusError::NoRoadPath)));

        let data: OsrmResponse = serde_json::from_value(json!({ "routes": [] })).unwrap();
        assert!(matches!(path_from_response(data), Err(OptiBusError::NoRoadPath)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolves_against_osrm() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/route/v1/driving/77.2,28.61;77.25,28.62"))
            .and(query_param("overview", "full"))
            .and(query_param("geometries", "geojson"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": "Ok",
                "routes": [{ "geometry": { "type": "LineString", "coordinates": [[77.2, 28.61], [77.25, 28.62]] } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let base = server.uri();
        let path = tokio::task::spawn_blocking(move || {
            let router = OsrmRouter::new(&base, Duration::from_secs(5)).unwrap();
            router.resolve(&sample_waypoints())
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(path, sample_waypoints());
    }
}
