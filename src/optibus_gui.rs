// Map dashboard for OptiBus route predictions using egui/eframe
use crate::optibus_api::{BackendStatus, PredictionClient};
use crate::optibus_auth::{IdentityService, OAuthProvider, SessionProvider};
use crate::optibus_config::OptiBusConfig;
use crate::optibus_map::{MapScene, Marker, Viewport};
use crate::optibus_models::{
    format_delay, format_eta, DelaySeverity, StopPrediction, MAX_ROUTE_NAME_LEN,
};
use crate::optibus_routing::{OsrmRouter, RoadRouter};
use crate::optibus_search::{Overlay, RouteSearch, RouteSearchController, EMPTY_HINT};
use anyhow::anyhow;
use chrono::{DateTime, Local};
use chrono_tz::Tz;
use eframe::egui;
use egui::{Color32, RichText, Stroke, Ui};
use egui_extras::{Column, TableBuilder};
use poll_promise::Promise;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Application State
// ============================================================================

#[derive(PartialEq, Clone, Copy)]
enum AppView {
    Map,
    Stops,
    Summary,
    Backend,
}

#[derive(PartialEq, Clone, Copy)]
enum AuthMode {
    SignIn,
    SignUp,
}

pub struct OptiBusApp {
    session: SessionProvider,
    search: RouteSearchController,
    client: Arc<PredictionClient>,
    timezone: Tz,
    zoom: u8,

    current_view: AppView,

    // Sign-in form
    auth_mode: AuthMode,
    email: String,
    password: String,
    oauth_provider: OAuthProvider,
    oauth_token: String,

    // Request options, kept as typed text until submit
    from_stop: String,
    to_stop: String,
    departure: String,
    holiday: bool,

    // Backend connectivity check
    ping_status: BackendStatus,
    protected_status: BackendStatus,
    ping_promise: Option<Promise<BackendStatus>>,
    protected_promise: Option<Promise<BackendStatus>>,
}

impl OptiBusApp {
    pub fn new(
        _cc: &eframe::CreationContext<'_>,
        config: &OptiBusConfig,
        client: Arc<PredictionClient>,
        router: Option<Arc<dyn RoadRouter>>,
        identity: Arc<dyn IdentityService>,
    ) -> Self {
        let state = RouteSearch::new(config.default_center, config.recent_routes.clone());
        let search = RouteSearchController::new(state, client.clone(), router, Arc::clone(&identity));

        Self {
            session: SessionProvider::new(identity),
            search,
            client,
            timezone: config.timezone,
            zoom: config.default_zoom,
            current_view: AppView::Map,
            auth_mode: AuthMode::SignIn,
            email: String::new(),
            password: String::new(),
            oauth_provider: OAuthProvider::Google,
            oauth_token: String::new(),
            from_stop: String::new(),
            to_stop: String::new(),
            departure: String::new(),
            holiday: false,
            ping_status: BackendStatus::Idle,
            protected_status: BackendStatus::Idle,
            ping_promise: None,
            protected_promise: None,
        }
    }

    fn submit_search(&mut self) {
        let options = &mut self.search.options;
        options.from_stop_id = self.from_stop.trim().parse().ok();
        options.to_stop_id = self.to_stop.trim().parse().ok();
        options.timestamp_iso = Some(self.departure.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        options.holiday = self.holiday;
        self.search.submit();
    }

    fn start_backend_check(&mut self) {
        let client = Arc::clone(&self.client);
        self.ping_status = BackendStatus::Loading;
        self.ping_promise = Some(Promise::spawn_thread("ping", move || client.ping()));

        let client = Arc::clone(&self.client);
        let identity = self.session.identity();
        self.protected_status = BackendStatus::Loading;
        self.protected_promise = Some(Promise::spawn_thread("protected", move || {
            match identity.id_token(false) {
                Ok(token) => client.check_protected(token.as_deref()),
                Err(e) => BackendStatus::Error(e.to_string()),
            }
        }));
    }

    fn poll_backend_check(&mut self) {
        if let Some(promise) = self.ping_promise.take() {
            match promise.try_take() {
                Ok(status) => self.ping_status = status,
                Err(promise) => self.ping_promise = Some(promise),
            }
        }
        if let Some(promise) = self.protected_promise.take() {
            match promise.try_take() {
                Ok(status) => self.protected_status = status,
                Err(promise) => self.protected_promise = Some(promise),
            }
        }
    }

    fn is_busy(&self) -> bool {
        self.session.is_loading()
            || self.search.is_busy()
            || self.ping_promise.is_some()
            || self.protected_promise.is_some()
    }

    fn sign_out(&mut self) {
        self.session.sign_out();
        self.search.clear();
        self.protected_status = BackendStatus::Idle;
    }
}

impl eframe::App for OptiBusApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.session.poll();
        self.search.poll();
        self.poll_backend_check();

        // The top-bar clock needs a tick even when idle.
        ctx.request_repaint_after(repaint_interval(self.is_busy()));

        let mut sign_out = false;
        egui::TopBottomPanel::top("top_panel").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.heading("🚌 OptiBus - Live Route Predictions");
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    let now: DateTime<Local> = Local::now();
                    ui.label(now.format("%H:%M:%S").to_string());
                    if let Some(user) = self.session.user() {
                        ui.separator();
                        if ui.button("Sign out").clicked() {
                            sign_out = true;
                        }
                        ui.label(format!("👤 {}", user.label()));
                    }
                });
            });
        });
        if sign_out {
            self.sign_out();
        }

        if self.session.user().is_none() {
            egui::CentralPanel::default().show(ctx, |ui| {
                if self.session.is_loading() {
                    ui.centered_and_justified(|ui| {
                        ui.vertical_centered(|ui| {
                            ui.spinner();
                            ui.label("Checking session...");
                        });
                    });
                } else {
                    self.show_sign_in(ui);
                }
            });
            return;
        }

        egui::SidePanel::left("search_panel").min_width(280.0).show(ctx, |ui| {
            self.show_search_panel(ui);
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.selectable_value(&mut self.current_view, AppView::Map, "🗺 Map");
                ui.selectable_value(&mut self.current_view, AppView::Stops, "🚏 Stops");
                ui.selectable_value(&mut self.current_view, AppView::Summary, "📊 Summary");
                ui.selectable_value(&mut self.current_view, AppView::Backend, "🔌 Backend");
            });
            ui.separator();

            match self.current_view {
                AppView::Map => self.show_map(ui),
                AppView::Stops => self.show_stop_table(ui),
                AppView::Summary => self.show_summary(ui),
                AppView::Backend => self.show_backend_check(ui),
            }
        });
    }
}

// ============================================================================
// View Implementations
// ============================================================================

impl OptiBusApp {
    fn show_sign_in(&mut self, ui: &mut Ui) {
        ui.vertical_centered(|ui| {
            ui.add_space(60.0);
            ui.heading(match self.auth_mode {
                AuthMode::SignIn => "Sign in to OptiBus",
                AuthMode::SignUp => "Create an OptiBus account",
            });
            ui.add_space(10.0);
            ui.horizontal(|ui| {
                ui.selectable_value(&mut self.auth_mode, AuthMode::SignIn, "Sign in");
                ui.selectable_value(&mut self.auth_mode, AuthMode::SignUp, "Sign up");
            });
            ui.add_space(10.0);

            ui.add(egui::TextEdit::singleline(&mut self.email).hint_text("Email").desired_width(260.0));
            let password = ui.add(
                egui::TextEdit::singleline(&mut self.password)
                    .hint_text("Password")
                    .password(true)
                    .desired_width(260.0),
            );
            let entered = password.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter));

            let ready = !self.email.trim().is_empty() && !self.password.is_empty();
            let label = match self.auth_mode {
                AuthMode::SignIn => "Sign in",
                AuthMode::SignUp => "Create account",
            };
            if (ui.add_enabled(ready, egui::Button::new(label)).clicked() || (entered && ready))
                && !self.session.is_loading()
            {
                match self.auth_mode {
                    AuthMode::SignIn => self.session.sign_in(self.email.trim(), &self.password),
                    AuthMode::SignUp => self.session.sign_up(self.email.trim(), &self.password),
                }
                self.password.clear();
            }

            ui.add_space(16.0);
            ui.label(RichText::new("Or continue with a provider token").weak());
            ui.horizontal(|ui| {
                egui::ComboBox::from_id_source("oauth_provider")
                    .selected_text(format!("{:?}", self.oauth_provider))
                    .show_ui(ui, |ui| {
                        ui.selectable_value(&mut self.oauth_provider, OAuthProvider::Google, "Google");
                        ui.selectable_value(&mut self.oauth_provider, OAuthProvider::GitHub, "GitHub");
                    });
                ui.add(egui::TextEdit::singleline(&mut self.oauth_token).hint_text("ID token").desired_width(160.0));
                if ui
                    .add_enabled(!self.oauth_token.trim().is_empty(), egui::Button::new("Continue"))
                    .clicked()
                {
                    self.session.sign_in_with_oauth(self.oauth_provider, self.oauth_token.trim());
                    self.oauth_token.clear();
                }
            });

            if let Some(error) = self.session.last_error() {
                ui.add_space(10.0);
                ui.colored_label(Color32::RED, format!("❌ {}", error));
            }
        });
    }

    fn show_search_panel(&mut self, ui: &mut Ui) {
        ui.heading("Route search");
        ui.separator();

        let mut submit = false;
        let mut clear = false;
        let mut recent: Option<String> = None;

        ui.horizontal(|ui| {
            let mut input = self.search.state.input().to_string();
            let response = ui.add(
                egui::TextEdit::singleline(&mut input)
                    .hint_text("e.g. 101")
                    .char_limit(MAX_ROUTE_NAME_LEN)
                    .desired_width(150.0),
            );
            if response.changed() {
                self.search.state.set_input(&input);
            }
            if response.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter)) {
                submit = true;
            }
            if !input.is_empty() && ui.small_button("✕").on_hover_text("Clear").clicked() {
                clear = true;
            }
        });

        let label = if self.search.state.is_loading() { "Searching..." } else { "🔍 Search" };
        if ui.add_enabled(self.search.state.can_submit(), egui::Button::new(label)).clicked() {
            submit = true;
        }

        egui::CollapsingHeader::new("Options").show(ui, |ui| {
            egui::Grid::new("search_options").num_columns(2).show(ui, |ui| {
                ui.label("From stop");
                ui.text_edit_singleline(&mut self.from_stop);
                ui.end_row();
                ui.label("To stop");
                ui.text_edit_singleline(&mut self.to_stop);
                ui.end_row();
                ui.label("Departure");
                ui.add(egui::TextEdit::singleline(&mut self.departure).hint_text("2024-05-01T09:00:00"));
                ui.end_row();
            });
            ui.checkbox(&mut self.holiday, "Holiday");
            if !self.search.road_snapping_enabled() {
                ui.label(RichText::new("Road snapping unavailable").weak());
            }
        });

        if self.search.state.input().is_empty() {
            ui.add_space(8.0);
            ui.label("Recent routes");
            ui.horizontal_wrapped(|ui| {
                for route in self.search.state.recent_routes() {
                    if ui.button(route).clicked() {
                        recent = Some(route.clone());
                    }
                }
            });
        }

        if let Some(error) = self.search.state.error() {
            ui.add_space(8.0);
            egui::Frame::group(ui.style())
                .fill(Color32::from_rgb(254, 226, 226))
                .show(ui, |ui| {
                    ui.colored_label(Color32::from_rgb(185, 28, 28), format!("❌ {}", error));
                });
        }

        if let Some(updated) = self.search.state.last_updated() {
            ui.add_space(8.0);
            ui.horizontal(|ui| {
                ui.label(format!("Updated {}", updated.format("%H:%M:%S")));
                ui.colored_label(Color32::from_rgb(22, 163, 74), "● Live");
            });
        }

        ui.separator();
        let stops = self.search.state.stops();
        if stops.is_empty() {
            if !self.search.state.is_loading() && self.search.state.error().is_none() {
                ui.label(RichText::new(EMPTY_HINT).weak());
            }
        } else {
            ui.label(RichText::new(format!("{} stops", stops.len())).strong());
            egui::ScrollArea::vertical().show(ui, |ui| {
                for stop in stops {
                    show_stop_card(ui, stop, self.timezone);
                }
            });
        }

        if clear {
            self.search.clear();
        } else if let Some(route) = recent {
            self.search.select_recent(&route);
        } else if submit {
            self.submit_search();
        }
    }

    fn show_map(&mut self, ui: &mut Ui) {
        let scene = MapScene::from_search(&self.search.state, self.timezone, self.zoom);

        ui.horizontal(|ui| {
            match self.search.state.route_name() {
                Some(route) => ui.strong(format!("Route {}", route)),
                None => ui.strong("No route selected"),
            };
            let waypoints = self.search.state.waypoints().len();
            if waypoints > 0 {
                ui.label(format!("{} waypoints", waypoints));
            }
            if scene.polyline.len() >= 2 {
                ui.label(format!("📏 {:.2} km", scene.route_length_km()));
            }
            if self.search.state.is_resolving_road() {
                ui.spinner();
                ui.label("Snapping to roads...");
            } else if scene.road_snapped {
                ui.label("🛣 Road path");
            }
        });

        let (response, painter) = ui.allocate_painter(ui.available_size(), egui::Sense::hover());
        let rect = response.rect;
        painter.rect_filled(rect, 4.0, Color32::from_rgb(232, 238, 244));

        let viewport = Viewport::fit(&scene, f64::from(rect.width()), f64::from(rect.height()), 40.0);
        let to_screen = |position| {
            let (x, y) = viewport.project(position);
            rect.min + egui::vec2(x as f32, y as f32)
        };

        if scene.polyline.len() >= 2 {
            let points: Vec<egui::Pos2> = scene.polyline.iter().map(|wp| to_screen(*wp)).collect();
            painter.add(egui::Shape::line(points, Stroke::new(4.0, Color32::from_rgb(37, 99, 235))));
        }

        let pointer = response.hover_pos();
        let mut hovered: Option<&Marker> = None;
        for marker in &scene.markers {
            let center = to_screen(marker.position);
            painter.circle_filled(center, 7.0, severity_color(marker.severity));
            painter.circle_stroke(center, 7.0, Stroke::new(2.0, Color32::WHITE));
            if pointer.is_some_and(|p| p.distance(center) <= 10.0) {
                hovered = Some(marker);
            }
        }

        let overlay_text = match &scene.overlay {
            Overlay::None => None,
            Overlay::Loading => Some(("Loading route...".to_string(), Color32::DARK_GRAY)),
            Overlay::Empty => Some((EMPTY_HINT.to_string(), Color32::GRAY)),
            Overlay::Error(e) => Some((format!("❌ {}", e), Color32::from_rgb(185, 28, 28))),
        };
        if let Some((text, color)) = overlay_text {
            painter.rect_filled(rect, 4.0, Color32::from_white_alpha(140));
            painter.text(
                rect.center(),
                egui::Align2::CENTER_CENTER,
                text,
                egui::FontId::proportional(18.0),
                color,
            );
        }

        if let Some(marker) = hovered {
            response.on_hover_ui_at_pointer(|ui| {
                ui.strong(&marker.title);
                for line in &marker.popup {
                    ui.label(line);
                }
            });
        }
    }

    fn show_stop_table(&self, ui: &mut Ui) {
        let stops = self.search.state.stops();
        if stops.is_empty() {
            ui.label("No stops data available.");
            return;
        }

        TableBuilder::new(ui)
            .striped(true)
            .column(Column::auto())
            .column(Column::remainder().at_least(160.0))
            .column(Column::auto())
            .column(Column::auto())
            .column(Column::auto())
            .column(Column::auto())
            .header(22.0, |mut header| {
                for title in ["#", "Stop", "Scheduled", "Delay", "ETA", "Position"] {
                    header.col(|ui| {
                        ui.strong(title);
                    });
                }
            })
            .body(|mut body| {
                for stop in stops {
                    body.row(20.0, |mut row| {
                        row.col(|ui| {
                            ui.label(stop.stop_sequence.to_string());
                        });
                        row.col(|ui| {
                            ui.label(stop.display_name());
                        });
                        row.col(|ui| {
                            ui.label(stop.scheduled_arrival_time.as_deref().unwrap_or("-"));
                        });
                        row.col(|ui| {
                            ui.colored_label(
                                severity_color(stop.severity()),
                                format_delay(stop.predicted_delay_minutes),
                            );
                        });
                        row.col(|ui| {
                            ui.label(format_eta(&stop.predicted_eta_iso, self.timezone));
                        });
                        row.col(|ui| {
                            ui.monospace(format!("{:.5}, {:.5}", stop.lat, stop.lon));
                        });
                    });
                }
            });
    }

    fn show_summary(&self, ui: &mut Ui) {
        let raw = self.search.state.summary_map();
        if raw.is_empty() {
            ui.label("No summary available.");
            return;
        }

        let summary = self.search.state.summary();
        egui::Grid::new("summary_grid").num_columns(2).striped(true).show(ui, |ui| {
            if let Some(count) = summary.stop_count {
                ui.label("Stops");
                ui.label(count.to_string());
                ui.end_row();
            }
            if let (Some(start), Some(end)) = (summary.start_stop_id, summary.end_stop_id) {
                ui.label("Segment");
                ui.label(format!("{} → {}", start, end));
                ui.end_row();
            }
            if let Some(total) = summary.total_predicted_delay_minutes {
                ui.label("Total delay");
                ui.colored_label(severity_color(DelaySeverity::from_minutes(total)), format_delay(total));
                ui.end_row();
            }
            if let Some(key) = &summary.route_key_used {
                ui.label("Route key");
                ui.label(key);
                ui.end_row();
            }
        });

        ui.separator();
        egui::ScrollArea::vertical().show(ui, |ui| {
            let pretty = serde_json::to_string_pretty(raw).unwrap_or_default();
            ui.label(RichText::new(pretty).monospace());
        });
    }

    fn show_backend_check(&mut self, ui: &mut Ui) {
        ui.heading("Backend connectivity");
        ui.label(format!("Server: {}", self.client.base_url()));
        ui.add_space(8.0);

        let running = self.ping_promise.is_some() || self.protected_promise.is_some();
        if ui.add_enabled(!running, egui::Button::new("🔄 Run checks")).clicked() {
            self.start_backend_check();
        }
        ui.add_space(8.0);

        for (endpoint, status) in [("/ping", &self.ping_status), ("/protected", &self.protected_status)] {
            egui::Frame::group(ui.style()).show(ui, |ui| {
                ui.horizontal(|ui| {
                    ui.strong(endpoint);
                    show_status_badge(ui, status);
                });
                if let BackendStatus::Success(body) = status {
                    let pretty = serde_json::to_string_pretty(body).unwrap_or_default();
                    ui.label(RichText::new(pretty).monospace());
                }
            });
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn show_stop_card(ui: &mut Ui, stop: &StopPrediction, tz: Tz) {
    egui::Frame::group(ui.style()).show(ui, |ui| {
        ui.set_min_width(ui.available_width());
        ui.horizontal(|ui| {
            ui.label(RichText::new(format!("#{}", stop.stop_sequence)).weak());
            ui.strong(stop.display_name());
        });
        ui.horizontal(|ui| {
            ui.label(format!("ETA {}", format_eta(&stop.predicted_eta_iso, tz)));
            ui.colored_label(severity_color(stop.severity()), format_delay(stop.predicted_delay_minutes));
        });
    });
}

fn show_status_badge(ui: &mut Ui, status: &BackendStatus) {
    match status {
        BackendStatus::Idle => {
            ui.label(RichText::new("Not checked").weak());
        }
        BackendStatus::Loading => {
            ui.spinner();
            ui.label("Checking…");
        }
        BackendStatus::Success(_) => {
            ui.colored_label(Color32::from_rgb(22, 163, 74), "✓ Success");
        }
        BackendStatus::Error(e) => {
            ui.colored_label(Color32::from_rgb(220, 38, 38), format!("✕ Error: {}", e));
        }
        BackendStatus::Unauthenticated => {
            ui.colored_label(Color32::from_rgb(202, 138, 4), "User not logged in");
        }
    }
}

fn repaint_interval(busy: bool) -> Duration {
    if busy {
        Duration::from_millis(100)
    } else {
        Duration::from_secs(1)
    }
}

fn severity_color(severity: DelaySeverity) -> Color32 {
    let (r, g, b) = severity.rgb();
    Color32::from_rgb(r, g, b)
}

// ============================================================================
// Public entry point
// ============================================================================

pub fn run_gui(config: OptiBusConfig, identity: Arc<dyn IdentityService>) -> anyhow::Result<()> {
    let client = Arc::new(PredictionClient::from_config(&config)?);
    let router: Option<Arc<dyn RoadRouter>> = match OsrmRouter::from_config(&config) {
        Ok(router) => Some(Arc::new(router)),
        Err(e) => {
            log::warn!("Road snapping disabled: {}", e);
            None
        }
    };

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1280.0, 800.0])
            .with_min_inner_size([800.0, 600.0]),
        ..Default::default()
    };

    eframe::run_native(
        "OptiBus",
        options,
        Box::new(move |cc| Ok(Box::new(OptiBusApp::new(cc, &config, client, router, identity)))),
    )
    .map_err(|e| anyhow!("GUI failed: {}", e))
}
