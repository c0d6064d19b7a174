//! `/register` and `/deregister` WebSocket upgrade handlers: the connector
//! side of the protocol handshake. Grounded on the original's
//! `connectorRegisterToRouter` / `connectorDeregisterFromRouter`.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tracing::{info, warn};

use cranker_core::protocol::validate_protocol_version;
use cranker_core::route::CATCH_ALL_ROUTE;

use crate::read_loop;
use crate::socket::RouterSocket;
use crate::state::RouterState;

const ROUTE_HEADER: &str = "Route";
const PROTOCOL_HEADER: &str = "CrankerProtocol";
const NO_CONNECTOR_INSTANCE_ID: &str = "no connector instance id exist";

fn route_header(headers: &HeaderMap) -> String {
    let route = headers.get(ROUTE_HEADER).and_then(|v| v.to_str().ok()).unwrap_or("");
    if route.is_empty() {
        CATCH_ALL_ROUTE.to_string()
    } else {
        route.to_string()
    }
}

/// Rejects registrations from an IP outside the allow-list (403) or carrying
/// an unsupported `CrankerProtocol` version (500), matching `ValidateReq`.
fn validate(state: &RouterState, headers: &HeaderMap, addr: SocketAddr) -> Result<(), Response> {
    let ip = addr.ip().to_string();
    if !state.ip_validator.is_valid(&ip) {
        warn!(ip, "rejecting connector: not on the ip allow-list");
        return Err((StatusCode::FORBIDDEN, format!("ip not allowed: {ip}")).into_response());
    }
    let version = headers.get(PROTOCOL_HEADER).and_then(|v| v.to_str().ok()).unwrap_or("");
    if validate_protocol_version(version).is_err() {
        warn!(version, "rejecting connector: unsupported cranker protocol version");
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unsupported cranker protocol version: {version}"),
        )
            .into_response());
    }
    Ok(())
}

pub async fn register(
    State(state): State<RouterState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(resp) = validate(&state, &headers, addr) {
        return resp;
    }

    let route = route_header(&headers);
    let connector_instance_id = query
        .get("connectorInstanceID")
        .filter(|s| !s.is_empty())
        .cloned()
        .unwrap_or_else(|| format!("unknown-{addr}"));
    let ip = addr.ip().to_string();

    info!(route, connector_instance_id, %addr, "connector registering");

    ws.on_upgrade(move |socket| async move {
        let (ws_tx, ws_rx) = socket.split();
        let router_socket = RouterSocket::new(
            route.clone(),
            connector_instance_id,
            ip,
            true,
            ws_tx,
            state.conn_monitor.clone(),
            state.router_socket_plugins.clone(),
        );
        state.farm.add_websocket(&route, router_socket.clone());
        read_loop::drive(router_socket, ws_rx, state.farm.clone()).await;
    })
}

/// Unlike `register`, the farm removal here happens synchronously in the
/// HTTP handler, before the upgrade even completes — the original drops the
/// socket from its queue the instant a deregister call arrives rather than
/// waiting for the resulting (never-registered) websocket to close.
pub async fn deregister(
    State(state): State<RouterState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(resp) = validate(&state, &headers, addr) {
        return resp;
    }

    let route = route_header(&headers);
    let connector_instance_id = query
        .get("connectorInstanceID")
        .filter(|s| !s.is_empty())
        .cloned()
        .unwrap_or_else(|| NO_CONNECTOR_INSTANCE_ID.to_string());

    if connector_instance_id == NO_CONNECTOR_INSTANCE_ID {
        info!(route, "deregister call with no connectorInstanceID, nothing to remove");
    } else {
        info!(route, connector_instance_id, "deregistering connector");
        state.farm.deregister_socket(&route, &connector_instance_id);
    }

    let ip = addr.ip().to_string();

    ws.on_upgrade(move |socket| async move {
        let (ws_tx, ws_rx) = socket.split();
        let router_socket = RouterSocket::new(route, connector_instance_id, ip, false, ws_tx, state.conn_monitor.clone(), Vec::new());
        read_loop::drive(router_socket, ws_rx, state.farm.clone()).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_header_falls_back_to_catch_all() {
        let headers = HeaderMap::new();
        assert_eq!(route_header(&headers), CATCH_ALL_ROUTE);
    }

    #[test]
    fn route_header_reads_the_route_header() {
        let mut headers = HeaderMap::new();
        headers.insert(ROUTE_HEADER, "payments".parse().unwrap());
        assert_eq!(route_header(&headers), "payments");
    }
}
