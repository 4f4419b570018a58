// Map surface: what to draw for a route search, and where on screen
use crate::optibus_models::{format_delay, format_eta, DelaySeverity, OptiBusError, Result, Waypoint};
use crate::optibus_search::{Overlay, RouteSearch};
use chrono_tz::Tz;
use geo::BoundingRect;
use geo_types::{MultiPoint, Point, Rect};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value as GeoValue};
use serde_json::json;

pub const EARTH_RADIUS_KM: f64 = 6371.0;
const TILE_SIZE: f64 = 256.0;
const MIN_ZOOM: f64 = 2.0;
const MAX_ZOOM: f64 = 18.0;
/// Web Mercator stops being finite at the poles.
const MAX_LATITUDE: f64 = 85.051_128_78;

#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub stop_id: i64,
    pub sequence: i64,
    pub position: Waypoint,
    pub title: String,
    pub popup: Vec<String>,
    pub delay_minutes: f64,
    pub eta: String,
    pub severity: DelaySeverity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapScene {
    pub center: Waypoint,
    pub zoom: u8,
    pub markers: Vec<Marker>,
    pub polyline: Vec<Waypoint>,
    pub road_snapped: bool,
    pub overlay: Overlay,
}

impl MapScene {
    pub fn from_search(search: &RouteSearch, tz: Tz, zoom: u8) -> Self {
        let markers = search
            .stops()
            .iter()
            .map(|stop| {
                let eta = format_eta(&stop.predicted_eta_iso, tz);
                let mut popup = vec![
                    format!("Sequence: #{}", stop.stop_sequence),
                    format!("ETA: {}", eta),
                    format!("Delay: {}", format_delay(stop.predicted_delay_minutes)),
                ];
                if let Some(scheduled) = stop.scheduled_arrival_time.as_deref().filter(|s| !s.is_empty()) {
                    popup.push(format!("Scheduled: {}", scheduled));
                }
                Marker {
                    stop_id: stop.stop_id,
                    sequence: stop.stop_sequence,
                    position: stop.position(),
                    title: stop.display_name(),
                    popup,
                    delay_minutes: stop.predicted_delay_minutes,
                    eta,
                    severity: stop.severity(),
                }
            })
            .collect();

        MapScene {
            center: search.map_center(),
            zoom,
            markers,
            polyline: search.polyline().to_vec(),
            road_snapped: search.road_path().len() >= 2,
            overlay: search.overlay(),
        }
    }

    fn points(&self) -> impl Iterator<Item = Waypoint> + '_ {
        self.polyline
            .iter()
            .copied()
            .chain(self.markers.iter().map(|m| m.position))
    }

    /// Bounding box over the polyline and every marker (x = lon, y = lat).
    pub fn bounds(&self) -> Option<Rect<f64>> {
        let points: MultiPoint<f64> = self
            .points()
            .map(|wp| Point::new(wp.lon, wp.lat))
            .collect::<Vec<_>>()
            .into();
        points.bounding_rect()
    }

    pub fn route_length_km(&self) -> f64 {
        self.polyline
            .windows(2)
            .map(|pair| haversine_km(pair[0], pair[1]))
            .sum()
    }

    pub fn to_geojson(&self) -> FeatureCollection {
        let mut features: Vec<Feature> = self
            .markers
            .iter()
            .map(|marker| {
                let mut properties = JsonObject::new();
                properties.insert("stop_id".to_string(), json!(marker.stop_id));
                properties.insert("name".to_string(), json!(marker.title));
                properties.insert("sequence".to_string(), json!(marker.sequence));
                properties.insert("delay_minutes".to_string(), json!(marker.delay_minutes));
                properties.insert("eta".to_string(), json!(marker.eta));
                feature(
                    GeoValue::Point(vec![marker.position.lon, marker.position.lat]),
                    properties,
                )
            })
            .collect();

        if self.polyline.len() >= 2 {
            let mut properties = JsonObject::new();
            properties.insert("kind".to_string(), json!("route"));
            properties.insert("road_snapped".to_string(), json!(self.road_snapped));
            properties.insert("length_km".to_string(), json!(self.route_length_km()));
            features.push(feature(
                GeoValue::LineString(self.polyline.iter().map(|wp| vec![wp.lon, wp.lat]).collect()),
                properties,
            ));
        }

        FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        }
    }

    pub fn to_geojson_string(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.to_geojson())
            .map_err(|e| OptiBusError::ParseError(format!("Failed to serialize GeoJSON: {}", e)))
    }
}

fn feature(value: GeoValue, properties: JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(Geometry::new(value)),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

pub fn haversine_km(a: Waypoint, b: Waypoint) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

// ============================================================================
// Projection
// ============================================================================

/// Web Mercator position in pixels at zoom 0.
fn world_xy(wp: Waypoint) -> (f64, f64) {
    let lat = wp.lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let x = (wp.lon + 180.0) / 360.0 * TILE_SIZE;
    let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / std::f64::consts::PI) / 2.0 * TILE_SIZE;
    (x, y)
}

/// Maps lat/lon onto a screen rectangle of `width` x `height` pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
    pub zoom: f64,
    center_world: (f64, f64),
}

impl Viewport {
    pub fn centered(center: Waypoint, zoom: f64, width: f64, height: f64) -> Self {
        Viewport {
            width,
            height,
            zoom: zoom.clamp(MIN_ZOOM, MAX_ZOOM),
            center_world: world_xy(center),
        }
    }

    /// Zooms to show everything in the scene, leaving `padding` pixels free
    /// on each side. A scene with a single point keeps its own zoom.
    pub fn fit(scene: &MapScene, width: f64, height: f64, padding: f64) -> Self {
        let Some(bounds) = scene.bounds() else {
            return Self::centered(scene.center, f64::from(scene.zoom), width, height);
        };

        let (min_x, max_y) = world_xy(Waypoint::new(bounds.min().y, bounds.min().x));
        let (max_x, min_y) = world_xy(Waypoint::new(bounds.max().y, bounds.max().x));
        let (span_x, span_y) = (max_x - min_x, max_y - min_y);
        if span_x <= f64::EPSILON && span_y <= f64::EPSILON {
            return Self::centered(scene.center, f64::from(scene.zoom), width, height);
        }

        let avail_w = (width - 2.0 * padding).max(1.0);
        let avail_h = (height - 2.0 * padding).max(1.0);
        let zoom_x = if span_x > f64::EPSILON { (avail_w / span_x).log2() } else { MAX_ZOOM };
        let zoom_y = if span_y > f64::EPSILON { (avail_h / span_y).log2() } else { MAX_ZOOM };

        Viewport {
            width,
            height,
            zoom: zoom_x.min(zoom_y).clamp(MIN_ZOOM, MAX_ZOOM),
            center_world: ((min_x + max_x) / 2.0, (min_y + max_y) / 2.0),
        }
    }

    pub fn project(&self, wp: Waypoint) -> (f64, f64) {
        let scale = self.zoom.exp2();
        let (x, y) = world_xy(wp);
        (
            (x - self.center_world.0) * scale + self.width / 2.0,
            (y - self.center_world.1) * scale + self.height / 2.0,
        )
    }
}
