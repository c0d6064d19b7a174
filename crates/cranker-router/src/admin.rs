//! A small REST surface for dark-launch control and registration inspection.
//! Grounded on the original's `api` package (`DarkLaunchIpResource`,
//! `DarkLaunchGrayToggleResource`, `RegistrationsResource`); kept
//! deliberately narrow since the wider admin console the original ships is
//! an operator-facing collaborator, not part of the proxying path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::Router;
use serde::Serialize;

use crate::state::RouterState;

pub fn router() -> Router<RouterState> {
    Router::new()
        .route("/api/dark-launch/ip", get(list_dark_ips))
        .route("/api/dark-launch/ip/{ip}", put(add_dark_ip).delete(remove_dark_ip))
        .route("/api/dark-launch/service", get(list_dark_services))
        .route("/api/dark-launch/service/{service}", put(add_dark_service).delete(remove_dark_service))
        .route("/api/dark-launch/gray", get(gray_status).put(gray_on))
        .route("/api/dark-launch/gray/off", put(gray_off))
        .route("/api/registrations", get(registrations))
}

async fn list_dark_ips(State(state): State<RouterState>) -> impl IntoResponse {
    (StatusCode::OK, format!("DarkMode IPs = {:?}", state.dark_launch.ip_list()))
}

async fn add_dark_ip(State(state): State<RouterState>, Path(ip): Path<String>) -> Response {
    match state.dark_launch.add_ip(ip.clone()) {
        Ok(()) => (StatusCode::OK, "update dark launch manager successfully".to_string()).into_response(),
        Err(e) => bad_request(&ip, "Add IP", e),
    }
}

async fn remove_dark_ip(State(state): State<RouterState>, Path(ip): Path<String>) -> Response {
    match state.dark_launch.remove_ip(&ip) {
        Ok(()) => (StatusCode::OK, format!("ip: {ip} was deleted successfully from dark launch manager")).into_response(),
        Err(e) => bad_request(&ip, "Remove IP", e),
    }
}

async fn list_dark_services(State(state): State<RouterState>) -> impl IntoResponse {
    (StatusCode::OK, format!("DarkMode services = {:?}", state.dark_launch.service_list()))
}

async fn add_dark_service(State(state): State<RouterState>, Path(service): Path<String>) -> Response {
    match state.dark_launch.add_service(service.clone()) {
        Ok(()) => (StatusCode::OK, "update dark launch manager successfully".to_string()).into_response(),
        Err(e) => bad_request(&service, "Add service", e),
    }
}

async fn remove_dark_service(State(state): State<RouterState>, Path(service): Path<String>) -> Response {
    match state.dark_launch.remove_service(&service) {
        Ok(()) => (StatusCode::OK, format!("service: {service} was deleted successfully from dark launch manager")).into_response(),
        Err(e) => bad_request(&service, "Remove service", e),
    }
}

async fn gray_status(State(state): State<RouterState>) -> impl IntoResponse {
    gray_summary(&state)
}

async fn gray_on(State(state): State<RouterState>) -> Response {
    if !state.dark_launch.is_dark_mode_on() {
        return (StatusCode::FORBIDDEN, format!("Forbidden request, ErrorID={}", uuid::Uuid::new_v4())).into_response();
    }
    state.dark_launch.turn_gray_testing_on("turned on by rest call");
    (StatusCode::OK, gray_summary(&state)).into_response()
}

async fn gray_off(State(state): State<RouterState>) -> Response {
    if !state.dark_launch.is_dark_mode_on() {
        return (StatusCode::FORBIDDEN, format!("Forbidden request, ErrorID={}", uuid::Uuid::new_v4())).into_response();
    }
    state.dark_launch.turn_gray_testing_off("turned off by rest call");
    (StatusCode::OK, gray_summary(&state)).into_response()
}

fn gray_summary(state: &RouterState) -> String {
    format!(
        "DarkMode={}, darkModeGrayTestToggle={}",
        state.dark_launch.is_dark_mode_on(),
        state.dark_launch.is_gray_testing_on()
    )
}

#[derive(Serialize)]
struct Registrations {
    #[serde(flatten)]
    services: HashMap<String, HashSet<String>>,
}

async fn registrations(State(state): State<RouterState>) -> impl IntoResponse {
    let mut services: HashMap<String, HashSet<String>> = HashMap::new();
    for (route, sockets) in state.farm.all_sockets() {
        let ips = sockets.iter().map(|s| s.ip().to_string()).collect();
        services.insert(route, ips);
    }
    let default_ips: HashSet<String> = state.farm.all_catchall().iter().map(|s| s.ip().to_string()).collect();
    services.insert("default".to_string(), default_ips);
    axum::Json(Registrations { services })
}

fn bad_request(subject: &str, action: &str, reason: String) -> Response {
    let error_id = uuid::Uuid::new_v4();
    (
        StatusCode::BAD_REQUEST,
        format!("Invalid request, {subject}, action: {action}, reason: {reason}, ErrorID: {error_id}"),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::darklaunch::DarkLaunchManager;
    use crate::farm::WebsocketFarm;
    use crate::validator::IpValidator;
    use cranker_core::ConnectionMonitor;

    fn test_state() -> RouterState {
        let dark_launch = Arc::new(DarkLaunchManager::default());
        let conn_monitor = Arc::new(ConnectionMonitor::default());
        RouterState {
            config: Arc::new(super::super::config::RouterConfig {
                websocket_interface: "0.0.0.0".to_string(),
                webserver_interface: "0.0.0.0".to_string(),
                registration_port: 9090,
                http_port: 8080,
                req_component_header: "X-Cranker-Component-Name".to_string(),
                socket_acquire_time: std::time::Duration::from_secs(15),
                ping_schedule_interval: std::time::Duration::from_secs(5),
                idle_timeout: std::time::Duration::from_secs(60),
                data_write_timeout: std::time::Duration::from_secs(30),
                shutdown_timeout: std::time::Duration::from_secs(15),
                ip_allow_list: None,
                dark_launch_ips: vec![],
                dark_launch_services: vec![],
            }),
            farm: WebsocketFarm::new(conn_monitor.clone(), dark_launch.clone()),
            conn_monitor,
            dark_launch,
            ip_validator: Arc::new(IpValidator::default()),
            router_socket_plugins: vec![],
            proxy_interceptors: vec![],
        }
    }

    #[test]
    fn gray_toggle_summary_reflects_dark_mode() {
        let state = test_state();
        assert_eq!(gray_summary(&state), "DarkMode=false, darkModeGrayTestToggle=false");
        state.dark_launch.add_ip("10.0.0.1".to_string()).unwrap();
        assert_eq!(gray_summary(&state), "DarkMode=true, darkModeGrayTestToggle=false");
    }
}
