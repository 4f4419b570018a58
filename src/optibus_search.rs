// Route search state: loading / error / success transitions for one route lookup
use crate::optibus_api::RoutePredictionSource;
use crate::optibus_auth::IdentityService;
use crate::optibus_models::{
    is_valid_route_name, normalize_route_name, OptiBusError, Result, RouteEtaRequest,
    RouteEtaResponse, RouteSummary, StopPrediction, Waypoint,
};
use crate::optibus_routing::RoadRouter;
use chrono::{DateTime, Local};
use poll_promise::Promise;
use serde_json::{Map, Value};
use std::sync::Arc;

pub const MAX_RECENT_ROUTES: usize = 8;

pub const EMPTY_INPUT_MESSAGE: &str = "Please enter a route name";
pub const INVALID_INPUT_MESSAGE: &str = "Route names may only contain letters, digits, spaces, '-' or '_'";
pub const EMPTY_HINT: &str = "Enter a route number to see live predictions";

/// Identifies one in-flight request. Results carrying an older `seq` than the
/// search's current one are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTicket {
    pub seq: u64,
    pub route: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Overlay {
    None,
    Loading,
    Empty,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct RouteSearch {
    input: String,
    route_name: Option<String>,
    waypoints: Vec<Waypoint>,
    stops: Vec<StopPrediction>,
    summary: Map<String, Value>,
    road_path: Vec<Waypoint>,
    resolving_road: bool,
    road_attempted: bool,
    loading: bool,
    error: Option<String>,
    last_updated: Option<DateTime<Local>>,
    seq: u64,
    recent_routes: Vec<String>,
    default_center: Waypoint,
}

impl RouteSearch {
    pub fn new(default_center: Waypoint, mut recent_routes: Vec<String>) -> Self {
        recent_routes.truncate(MAX_RECENT_ROUTES);
        RouteSearch {
            input: String::new(),
            route_name: None,
            waypoints: Vec::new(),
            stops: Vec::new(),
            summary: Map::new(),
            road_path: Vec::new(),
            resolving_road: false,
            road_attempted: false,
            loading: false,
            error: None,
            last_updated: None,
            seq: 0,
            recent_routes,
            default_center,
        }
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn route_name(&self) -> Option<&str> {
        self.route_name.as_deref()
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn stops(&self) -> &[StopPrediction] {
        &self.stops
    }

    pub fn summary_map(&self) -> &Map<String, Value> {
        &self.summary
    }

    pub fn summary(&self) -> RouteSummary {
        RouteSummary::from_map(&self.summary)
    }

    pub fn road_path(&self) -> &[Waypoint] {
        &self.road_path
    }

    pub fn is_resolving_road(&self) -> bool {
        self.resolving_road
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn last_updated(&self) -> Option<DateTime<Local>> {
        self.last_updated
    }

    pub fn recent_routes(&self) -> &[String] {
        &self.recent_routes
    }

    pub fn can_submit(&self) -> bool {
        !self.loading && !self.input.trim().is_empty()
    }

    pub fn set_input(&mut self, value: &str) {
        self.input = normalize_route_name(value);
        if self.error.is_some() && !self.input.trim().is_empty() {
            self.error = None;
        }
    }

    /// Validates the input and opens a new request.
    pub fn begin(&mut self) -> Option<RequestTicket> {
        let route = self.input.trim().to_string();
        if route.is_empty() {
            self.error = Some(EMPTY_INPUT_MESSAGE.to_string());
            return None;
        }
        if !is_valid_route_name(&route) {
            self.error = Some(INVALID_INPUT_MESSAGE.to_string());
            return None;
        }

        self.seq += 1;
        self.loading = true;
        self.error = None;
        self.resolving_road = false;
        self.road_attempted = false;
        Some(RequestTicket { seq: self.seq, route })
    }

    /// Applies a finished request. Returns false when the ticket is stale.
    pub fn complete(&mut self, ticket: &RequestTicket, result: Result<RouteEtaResponse>) -> bool {
        if ticket.seq != self.seq {
            log::debug!("Dropping stale result for route {} (#{})", ticket.route, ticket.seq);
            return false;
        }

        self.loading = false;
        match result {
            Ok(data) if !data.has_route_data() => {
                self.error = Some(OptiBusError::NoRouteData.to_string());
            }
            Ok(data) => {
                log::info!(
                    "Route {}: {} stops, {} waypoints",
                    ticket.route,
                    data.stops.len(),
                    data.waypoints.len()
                );
                self.route_name = Some(if data.route_short_name.is_empty() {
                    ticket.route.clone()
                } else {
                    data.route_short_name
                });
                self.waypoints = data.waypoints;
                self.stops = data.stops;
                self.summary = data.summary;
                self.road_path.clear();
                self.road_attempted = false;
                self.last_updated = Some(Local::now());
                self.remember_route(&ticket.route);
            }
            Err(e) => {
                log::error!("Route fetch error for {}: {}", ticket.route, e);
                self.error = Some(e.to_string());
            }
        }
        true
    }

    /// Hands out the waypoints to snap onto roads, once per result. A failed
    /// attempt is not retried until a new result arrives.
    pub fn begin_road_resolution(&mut self) -> Option<(RequestTicket, Vec<Waypoint>)> {
        if self.loading
            || self.resolving_road
            || self.road_attempted
            || self.waypoints.len() < 2
            || !self.road_path.is_empty()
        {
            return None;
        }
        let route = self.route_name.clone().unwrap_or_default();
        self.resolving_road = true;
        self.road_attempted = true;
        Some((RequestTicket { seq: self.seq, route }, self.waypoints.clone()))
    }

    pub fn complete_road(&mut self, ticket: &RequestTicket, result: Result<Vec<Waypoint>>) -> bool {
        if ticket.seq != self.seq {
            return false;
        }

        self.resolving_road = false;
        match result {
            Ok(path) if path.len() >= 2 => {
                self.road_path = path;
            }
            Ok(_) => {
                log::warn!("No road path for route {}, drawing straight segments", ticket.route);
            }
            Err(e) => {
                log::warn!("Road routing failed for route {} ({}), drawing straight segments", ticket.route, e);
            }
        }
        true
    }

    /// Resets everything; any request still in flight becomes stale.
    pub fn clear(&mut self) {
        self.seq += 1;
        self.input.clear();
        self.route_name = None;
        self.waypoints.clear();
        self.stops.clear();
        self.summary.clear();
        self.road_path.clear();
        self.resolving_road = false;
        self.road_attempted = false;
        self.loading = false;
        self.error = None;
        self.last_updated = None;
    }

    pub fn select_recent(&mut self, route: &str) -> Option<RequestTicket> {
        self.set_input(route);
        self.begin()
    }

    /// Road path when resolved, otherwise straight segments between waypoints.
    pub fn polyline(&self) -> &[Waypoint] {
        if self.road_path.len() >= 2 {
            &self.road_path
        } else if self.waypoints.len() >= 2 {
            &self.waypoints
        } else {
            &[]
        }
    }

    pub fn map_center(&self) -> Waypoint {
        self.waypoints
            .first()
            .copied()
            .or_else(|| self.stops.first().map(StopPrediction::position))
            .unwrap_or(self.default_center)
    }

    pub fn overlay(&self) -> Overlay {
        if self.loading {
            Overlay::Loading
        } else if let Some(error) = &self.error {
            Overlay::Error(error.clone())
        } else if self.stops.is_empty() && self.waypoints.is_empty() {
            Overlay::Empty
        } else {
            Overlay::None
        }
    }

    fn remember_route(&mut self, route: &str) {
        self.recent_routes.retain(|r| r != route);
        self.recent_routes.insert(0, route.to_string());
        self.recent_routes.truncate(MAX_RECENT_ROUTES);
    }
}

// ============================================================================
// Background controller
// ============================================================================

/// Extra request fields applied to every search.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub from_stop_id: Option<i64>,
    pub to_stop_id: Option<i64>,
    pub from_coord: Option<Waypoint>,
    pub to_coord: Option<Waypoint>,
    pub timestamp_iso: Option<String>,
    pub holiday: bool,
}

impl SearchOptions {
    pub fn request_for(&self, route: &str) -> RouteEtaRequest {
        RouteEtaRequest {
            from_stop_id: self.from_stop_id,
            to_stop_id: self.to_stop_id,
            from_coord: self.from_coord,
            to_coord: self.to_coord,
            timestamp_iso: self.timestamp_iso.clone(),
            holiday_flag: u8::from(self.holiday),
            ..RouteEtaRequest::for_route(route)
        }
    }
}

/// Runs searches on background threads and feeds results into `RouteSearch`.
pub struct RouteSearchController {
    pub state: RouteSearch,
    pub options: SearchOptions,
    source: Arc<dyn RoutePredictionSource>,
    router: Option<Arc<dyn RoadRouter>>,
    identity: Arc<dyn IdentityService>,
    pending: Option<(RequestTicket, Promise<Result<RouteEtaResponse>>)>,
    pending_road: Option<(RequestTicket, Promise<Result<Vec<Waypoint>>>)>,
}

impl RouteSearchController {
    pub fn new(
        state: RouteSearch,
        source: Arc<dyn RoutePredictionSource>,
        router: Option<Arc<dyn RoadRouter>>,
        identity: Arc<dyn IdentityService>,
    ) -> Self {
        RouteSearchController {
            state,
            options: SearchOptions::default(),
            source,
            router,
            identity,
            pending: None,
            pending_road: None,
        }
    }

    pub fn road_snapping_enabled(&self) -> bool {
        self.router.is_some()
    }

    pub fn submit(&mut self) {
        if let Some(ticket) = self.state.begin() {
            self.spawn_fetch(ticket);
        }
    }

    pub fn select_recent(&mut self, route: &str) {
        if let Some(ticket) = self.state.select_recent(route) {
            self.spawn_fetch(ticket);
        }
    }

    pub fn clear(&mut self) {
        self.state.clear();
        self.pending = None;
        self.pending_road = None;
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some() || self.pending_road.is_some()
    }

    /// Applies whatever finished since the last call. Returns true on change.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;

        if let Some((ticket, promise)) = self.pending.take() {
            match promise.try_take() {
                Ok(result) => {
                    changed |= self.state.complete(&ticket, result);
                }
                Err(promise) => self.pending = Some((ticket, promise)),
            }
        }

        if let Some((ticket, promise)) = self.pending_road.take() {
            match promise.try_take() {
                Ok(result) => {
                    changed |= self.state.complete_road(&ticket, result);
                }
                Err(promise) => self.pending_road = Some((ticket, promise)),
            }
        }

        if let Some(router) = &self.router {
            if let Some((ticket, waypoints)) = self.state.begin_road_resolution() {
                let router = Arc::clone(router);
                let promise = Promise::spawn_thread("road-path", move || router.resolve(&waypoints));
                self.pending_road = Some((ticket, promise));
                changed = true;
            }
        }

        changed
    }

    fn spawn_fetch(&mut self, ticket: RequestTicket) {
        let source = Arc::clone(&self.source);
        let identity = Arc::clone(&self.identity);
        let request = self.options.request_for(&ticket.route);

        let promise = Promise::spawn_thread("route-eta", move || {
            let token = identity.id_token(false)?;
            source.fetch_route_eta(&request, token.as_deref())
        });
        // A newer search supersedes whatever was pending.
        self.pending = Some((ticket, promise));
        self.pending_road = None;
    }
}

#[cfg(test)]
impl RouteSearchController {
    pub fn settle(&mut self) {
        loop {
            if let Some((_, promise)) = &self.pending {
                promise.block_until_ready();
            }
            if let Some((_, promise)) = &self.pending_road {
                promise.block_until_ready();
            }
            self.poll();
            if !self.is_busy() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optibus_auth::AnonymousIdentity;
    use crate::optibus_config::DEFAULT_CENTER;
    use std::sync::Mutex;
    use std::time::Duration;

    fn search() -> RouteSearch {
        RouteSearch::new(DEFAULT_CENTER, vec!["101".into(), "102".into()])
    }

    fn stop(id: i64, lat: f64, lon: f64) -> StopPrediction {
        StopPrediction {
            stop_id: id,
            stop_name: None,
            stop_sequence: id,
            lat,
            lon,
            scheduled_arrival_time: None,
            predicted_delay_minutes: 0.0,
            predicted_eta_iso: String::new(),
        }
    }

    fn response(route: &str, waypoints: Vec<Waypoint>, stops: Vec<StopPrediction>) -> RouteEtaResponse {
        RouteEtaResponse {
            route_short_name: route.to_string(),
            waypoints,
            stops,
            summary: Map::new(),
        }
    }

    fn two_points() -> Vec<Waypoint> {
        vec![Waypoint::new(28.5, 77.1), Waypoint::new(28.6, 77.2)]
    }

    #[test]
    fn blank_input_is_rejected_without_a_request() {
        let mut s = search();
        s.set_input("   ");
        assert_eq!(s.begin(), None);
        assert_eq!(s.error(), Some(EMPTY_INPUT_MESSAGE));
        assert!(!s.is_loading());

        s.set_input("1");
        assert_eq!(s.error(), None);

        s.set_input("1;2");
        assert_eq!(s.begin(), None);
        assert_eq!(s.error(), Some(INVALID_INPUT_MESSAGE));
    }

    #[test]
    fn spaced_route_names_match_the_hint() {
        let mut s = search();
        s.set_input("brt 1");
        assert!(s.begin().is_some());
        assert!(INVALID_INPUT_MESSAGE.contains("spaces"));
    }

    #[test]
    fn input_is_upper_cased() {
        let mut s = search();
        s.set_input("brt-1");
        assert_eq!(s.input(), "BRT-1");
        assert!(s.can_submit());
    }

    #[test]
    fn success_replaces_data_and_updates_recent() {
        let mut s = search();
        s.set_input("201");
        let ticket = s.begin().unwrap();
        assert_eq!(s.overlay(), Overlay::Loading);
        assert!(!s.can_submit());

        assert!(s.complete(&ticket, Ok(response("201", two_points(), vec![stop(1, 28.5, 77.1)]))));
        assert!(!s.is_loading());
        assert_eq!(s.overlay(), Overlay::None);
        assert_eq!(s.route_name(), Some("201"));
        assert!(s.last_updated().is_some());
        assert_eq!(s.map_center(), Waypoint::new(28.5, 77.1));
        assert_eq!(s.recent_routes(), ["201", "101", "102"]);
    }

    #[test]
    fn stale_results_are_dropped() {
        let mut s = search();
        s.set_input("101");
        let first = s.begin().unwrap();
        s.set_input("102");
        let second = s.begin().unwrap();

        assert!(s.complete(&second, Ok(response("102", two_points(), vec![]))));
        assert!(!s.complete(&first, Ok(response("101", vec![], vec![stop(9, 1.0, 1.0)]))));
        assert_eq!(s.route_name(), Some("102"));
        assert!(s.stops().is_empty());
    }

    #[test]
    fn clear_discards_in_flight_requests() {
        let mut s = search();
        s.set_input("101");
        let ticket = s.begin().unwrap();
        s.clear();
        assert!(!s.complete(&ticket, Ok(response("101", two_points(), vec![]))));
        assert!(s.waypoints().is_empty());
        assert_eq!(s.overlay(), Overlay::Empty);
        assert_eq!(s.map_center(), DEFAULT_CENTER);
    }

    #[test]
    fn empty_payload_is_an_error() {
        let mut s = search();
        s.set_input("404");
        let ticket = s.begin().unwrap();
        s.complete(&ticket, Ok(response("404", vec![], vec![])));
        assert_eq!(s.overlay(), Overlay::Error("No route data available".into()));
    }

    #[test]
    fn errors_keep_previous_data() {
        let mut s = search();
        s.set_input("101");
        let ok = s.begin().unwrap();
        s.complete(&ok, Ok(response("101", two_points(), vec![stop(1, 28.5, 77.1)])));

        s.set_input("999");
        let failing = s.begin().unwrap();
        s.complete(
            &failing,
            Err(OptiBusError::HttpError { status: 404, detail: "Unknown route 999".into() }),
        );
        assert_eq!(s.error(), Some("Unknown route 999"));
        assert_eq!(s.stops().len(), 1);
        assert_eq!(s.route_name(), Some("101"));
    }

    #[test]
    fn stops_without_waypoints_still_render() {
        let mut s = search();
        s.set_input("7");
        let ticket = s.begin().unwrap();
        s.complete(&ticket, Ok(response("", vec![], vec![stop(3, 12.0, 80.0)])));
        assert_eq!(s.overlay(), Overlay::None);
        assert_eq!(s.route_name(), Some("7"));
        assert!(s.polyline().is_empty());
        assert_eq!(s.map_center(), Waypoint::new(12.0, 80.0));
        assert!(s.begin_road_resolution().is_none());
    }

    #[test]
    fn road_path_replaces_straight_segments_once() {
        let mut s = search();
        s.set_input("101");
        let ticket = s.begin().unwrap();
        s.complete(&ticket, Ok(response("101", two_points(), vec![])));
        assert_eq!(s.polyline(), two_points().as_slice());

        let (road_ticket, waypoints) = s.begin_road_resolution().unwrap();
        assert_eq!(waypoints, two_points());
        assert!(s.begin_road_resolution().is_none());

        let road = vec![Waypoint::new(28.5, 77.1), Waypoint::new(28.55, 77.12), Waypoint::new(28.6, 77.2)];
        assert!(s.complete_road(&road_ticket, Ok(road.clone())));
        assert_eq!(s.polyline(), road.as_slice());
        assert!(s.begin_road_resolution().is_none());
    }

    #[test]
    fn failed_road_lookup_keeps_waypoints() {
        let mut s = search();
        s.set_input("101");
        let ticket = s.begin().unwrap();
        s.complete(&ticket, Ok(response("101", two_points(), vec![])));
        let (road_ticket, _) = s.begin_road_resolution().unwrap();
        s.complete_road(&road_ticket, Err(OptiBusError::NoRoadPath));
        assert_eq!(s.polyline(), two_points().as_slice());
        assert!(!s.is_resolving_road());
        assert!(s.begin_road_resolution().is_none());

        // A fresh result gets its own attempt.
        s.set_input("101");
        let ticket = s.begin().unwrap();
        s.complete(&ticket, Ok(response("101", two_points(), vec![])));
        assert!(s.begin_road_resolution().is_some());
    }

    #[test]
    fn road_result_for_old_route_is_dropped() {
        let mut s = search();
        s.set_input("101");
        let ticket = s.begin().unwrap();
        s.complete(&ticket, Ok(response("101", two_points(), vec![])));
        let (road_ticket, _) = s.begin_road_resolution().unwrap();

        s.set_input("102");
        s.begin().unwrap();
        assert!(!s.complete_road(&road_ticket, Ok(two_points())));
        assert!(s.road_path().is_empty());
    }

    #[test]
    fn recent_routes_are_capped() {
        let mut s = search();
        for i in 0..12 {
            let ticket = s.select_recent(&format!("R{}", i)).unwrap();
            s.complete(&ticket, Ok(response("", two_points(), vec![])));
        }
        assert_eq!(s.recent_routes().len(), MAX_RECENT_ROUTES);
        assert_eq!(s.recent_routes()[0], "R11");
    }

    #[test]
    fn configured_recent_routes_are_capped() {
        let seeded: Vec<String> = (1..=12).map(|i| format!("{}", 100 + i)).collect();
        let s = RouteSearch::new(DEFAULT_CENTER, seeded);
        assert_eq!(s.recent_routes().len(), MAX_RECENT_ROUTES);
        assert_eq!(s.recent_routes()[0], "101");
    }

    struct FakeSource {
        requests: Mutex<Vec<(RouteEtaRequest, Option<String>)>>,
    }

    impl RoutePredictionSource for FakeSource {
        fn fetch_route_eta(&self, request: &RouteEtaRequest, token: Option<&str>) -> Result<RouteEtaResponse> {
            self.requests
                .lock()
                .unwrap()
                .push((request.clone(), token.map(String::from)));
            if request.route_short_name == "SLOW" {
                std::thread::sleep(Duration::from_millis(150));
            }
            Ok(RouteEtaResponse {
                route_short_name: request.route_short_name.clone(),
                waypoints: two_points(),
                stops: vec![stop(1, 28.5, 77.1)],
                summary: Map::new(),
            })
        }
    }

    struct FakeRouter;

    impl RoadRouter for FakeRouter {
        fn resolve(&self, waypoints: &[Waypoint]) -> Result<Vec<Waypoint>> {
            let mut path = waypoints.to_vec();
            path.insert(1, Waypoint::new(28.55, 77.15));
            Ok(path)
        }
    }

    struct FailingRouter {
        calls: Mutex<usize>,
    }

    impl RoadRouter for FailingRouter {
        fn resolve(&self, _waypoints: &[Waypoint]) -> Result<Vec<Waypoint>> {
            *self.calls.lock().unwrap() += 1;
            Err(OptiBusError::NoRoadPath)
        }
    }

    #[test]
    fn controller_fetches_then_snaps_to_roads() {
        let source = Arc::new(FakeSource { requests: Mutex::new(Vec::new()) });
        let mut controller = RouteSearchController::new(
            search(),
            source.clone(),
            Some(Arc::new(FakeRouter)),
            Arc::new(AnonymousIdentity),
        );
        controller.options.holiday = true;
        controller.options.from_stop_id = Some(4);

        controller.state.set_input("101");
        controller.submit();
        assert!(controller.state.is_loading());
        controller.settle();

        assert_eq!(controller.state.stops().len(), 1);
        assert_eq!(controller.state.polyline().len(), 3);

        let requests = source.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0.holiday_flag, 1);
        assert_eq!(requests[0].0.from_stop_id, Some(4));
        assert_eq!(requests[0].1, None);
    }

    #[test]
    fn controller_newer_search_wins() {
        let source = Arc::new(FakeSource { requests: Mutex::new(Vec::new()) });
        let mut controller =
            RouteSearchController::new(search(), source, None, Arc::new(AnonymousIdentity));

        controller.state.set_input("slow");
        controller.submit();
        // Picking a recent route while SLOW is in flight supersedes it.
        controller.select_recent("102");
        controller.settle();

        assert_eq!(controller.state.route_name(), Some("102"));
        assert_eq!(controller.state.polyline(), two_points().as_slice());
    }

    #[test]
    fn controller_tries_road_snapping_once_per_result() {
        let source = Arc::new(FakeSource { requests: Mutex::new(Vec::new()) });
        let router = Arc::new(FailingRouter { calls: Mutex::new(0) });
        let mut controller = RouteSearchController::new(
            search(),
            source,
            Some(router.clone() as Arc<dyn RoadRouter>),
            Arc::new(AnonymousIdentity),
        );

        controller.state.set_input("101");
        controller.submit();
        controller.settle();
        for _ in 0..50 {
            controller.poll();
        }

        assert_eq!(*router.calls.lock().unwrap(), 1);
        assert!(!controller.is_busy());
        assert_eq!(controller.state.polyline(), two_points().as_slice());
    }
}
