// HTTP client for the OptiBus prediction backend
use crate::optibus_config::OptiBusConfig;
use crate::optibus_models::{OptiBusError, Result, RouteEtaRequest, RouteEtaResponse};
use reqwest::blocking;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Anything that can answer a route ETA request.
pub trait RoutePredictionSource: Send + Sync {
    fn fetch_route_eta(&self, request: &RouteEtaRequest, token: Option<&str>) -> Result<RouteEtaResponse>;
}

/// Outcome of one backend connectivity probe.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendStatus {
    Idle,
    Loading,
    Success(Value),
    Error(String),
    Unauthenticated,
}

pub struct PredictionClient {
    base_url: String,
    client: blocking::Client,
}

impl PredictionClient {
    const ROUTE_ETA_PATH: &'static str = "/api/predictions/route_eta";

    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OptiBusError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(PredictionClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn from_config(config: &OptiBusConfig) -> Result<Self> {
        Self::new(&config.api_base, config.request_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Public health endpoint.
    pub fn ping(&self) -> BackendStatus {
        let url = format!("{}/ping", self.base_url);
        match self.get_json(&url, None) {
            Ok(value) => BackendStatus::Success(value),
            Err(e) => BackendStatus::Error(e.to_string()),
        }
    }

    /// Auth-gated endpoint; reports `Unauthenticated` without a token or on 401.
    pub fn check_protected(&self, token: Option<&str>) -> BackendStatus {
        let Some(token) = token else {
            return BackendStatus::Unauthenticated;
        };
        let url = format!("{}/protected", self.base_url);
        match self.get_json(&url, Some(token)) {
            Ok(value) => BackendStatus::Success(value),
            Err(e) if e.is_unauthorized() => BackendStatus::Unauthenticated,
            Err(e) => BackendStatus::Error(e.to_string()),
        }
    }

    fn get_json(&self, url: &str, token: Option<&str>) -> Result<Value> {
        let mut request = self.client.get(url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .map_err(|e| OptiBusError::NetworkError(format!("Failed to reach backend: {}", e)))?;

        Self::decode(response)
    }

    fn decode<T: serde::de::DeserializeOwned>(response: blocking::Response) -> Result<T> {
        let status = response.status();
        let body = response
            .text()
            .map_err(|e| OptiBusError::NetworkError(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(error_from_body(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| OptiBusError::ParseError(format!("Invalid JSON response: {}", e)))
    }
}

impl RoutePredictionSource for PredictionClient {
    fn fetch_route_eta(&self, request: &RouteEtaRequest, token: Option<&str>) -> Result<RouteEtaResponse> {
        let url = format!("{}{}", self.base_url, Self::ROUTE_ETA_PATH);
        let request_id = Uuid::new_v4();
        log::info!(
            "Requesting ETA for route {} (request {})",
            request.route_short_name,
            request_id
        );

        let mut builder = self
            .client
            .post(&url)
            .header("X-Request-Id", request_id.to_string())
            .json(request);
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().map_err(|e| {
            OptiBusError::NetworkError(format!("Failed to fetch route predictions: {}", e))
        })?;

        let data: RouteEtaResponse = Self::decode(response)?;
        log::debug!(
            "Route {} returned {} stops and {} waypoints",
            request.route_short_name,
            data.stops.len(),
            data.waypoints.len()
        );
        Ok(data)
    }
}

/// Prefer the backend's `detail` message, fall back to the status code.
fn error_from_body(status: StatusCode, body: &str) -> OptiBusError {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(Value::as_str).map(String::from))
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| format!("Request failed with status {}", status.as_u16()));

    OptiBusError::HttpError {
        status: status.as_u16(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn fetch(server: &MockServer, route: &str, token: Option<&'static str>) -> Result<RouteEtaResponse> {
        let base = server.uri();
        let route = route.to_string();
        tokio::task::spawn_blocking(move || {
            let client = PredictionClient::new(&base, Duration::from_secs(5))?;
            client.fetch_route_eta(&RouteEtaRequest::for_route(&route), token)
        })
        .await
        .unwrap()
    }

    #[test]
    fn error_detail_is_preferred() {
        let err = error_from_body(StatusCode::NOT_FOUND, r#"{"detail":"'Route 999 not found'"}"#);
        assert_eq!(err.to_string(), "'Route 999 not found'");

        let err = error_from_body(StatusCode::BAD_GATEWAY, "<html>oops</html>");
        assert_eq!(err.to_string(), "Request failed with status 502");

        let err = error_from_body(StatusCode::BAD_REQUEST, r#"{"detail":[{"loc":"body"}]}"#);
        assert_eq!(err.to_string(), "Request failed with status 400");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn posts_route_with_bearer_token() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/predictions/route_eta"))
            .and(header("authorization", "Bearer abc123"))
            .and(header_exists("x-request-id"))
            .and(body_json(json!({ "route_short_name": "101", "holiday_flag": 0 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "route_short_name": "101",
                "waypoints": [[28.61, 77.20], [28.62, 77.21]],
                "stops": [{
                    "stop_id": 1, "stop_name": "Kashmere Gate", "stop_sequence": 1,
                    "lat": 28.61, "lon": 77.20, "scheduled_arrival_time": "10:00:00",
                    "predicted_delay_minutes": 1.5, "predicted_eta_iso": "2024-05-01T10:01:30"
                }],
                "summary": { "n_stops": 1 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let data = fetch(&server, "101", Some("abc123")).await.unwrap();
        assert_eq!(data.waypoints.len(), 2);
        assert_eq!(data.stops[0].display_name(), "Kashmere Gate");
        assert_eq!(data.summary.get("n_stops"), Some(&json!(1)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn omits_authorization_without_token() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/predictions/route_eta"))
            .respond_with(|req: &wiremock::Request| {
                if req.headers.contains_key("authorization") {
                    ResponseTemplate::new(400)
                } else {
                    ResponseTemplate::new(200).set_body_json(json!({ "route_short_name": "7" }))
                }
            })
            .mount(&server)
            .await;

        let data = fetch(&server, "7", None).await.unwrap();
        assert!(!data.has_route_data());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn surfaces_backend_detail() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/predictions/route_eta"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({ "detail": "Unknown route 999" })),
            )
            .mount(&server)
            .await;

        let err = fetch(&server, "999", None).await.unwrap_err();
        assert!(matches!(err, OptiBusError::HttpError { status: 404, .. }));
        assert_eq!(err.to_string(), "Unknown route 999");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_success_body_is_a_parse_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = fetch(&server, "101", None).await.unwrap_err();
        assert!(matches!(err, OptiBusError::ParseError(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn backend_checks() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "Backend is working" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/protected"))
            .and(header("authorization", "Bearer good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "uid": "u1" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/protected"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "detail": "Invalid or expired token" })))
            .mount(&server)
            .await;

        let base = server.uri();
        let (ping, good, stale, anonymous) = tokio::task::spawn_blocking(move || {
            let client = PredictionClient::new(&base, Duration::from_secs(5)).unwrap();
            (
                client.ping(),
                client.check_protected(Some("good")),
                client.check_protected(Some("stale")),
                client.check_protected(None),
            )
        })
        .await
        .unwrap();

        assert_eq!(ping, BackendStatus::Success(json!({ "status": "Backend is working" })));
        assert_eq!(good, BackendStatus::Success(json!({ "uid": "u1" })));
        assert_eq!(stale, BackendStatus::Unauthenticated);
        assert_eq!(anonymous, BackendStatus::Unauthenticated);
    }
}
