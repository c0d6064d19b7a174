//! The client-facing HTTP handler: acquires an idle connector socket for the
//! request's route, frames the request over it, and streams back whatever
//! comes out the other end. Grounded on the original's `ReverseProxy.Handle`
//! / `sendRequestOverWebsocket`, reworked around the `ResponseEvent` channel
//! bound to the socket instead of an `http.ResponseWriter` + `sync.WaitGroup`
//! latch.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderName, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::warn;

use cranker_core::error::{close_code_to_http_status, CrankerError};
use cranker_core::protocol::{self, EndMarker};

use crate::socket::{ResponseEvent, RouterSocket};
use crate::state::RouterState;

/// Headers that never get forwarded to the target, per hop-by-hop semantics.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Response headers never relayed back to the client: `Server` is always
/// replaced by the router's own, and (mirroring the original's default)
/// `Content-Length` is dropped since the response is forwarded as an
/// unbounded chunked stream rather than a fixed-length body.
const DENY_RESPONSE_HEADERS: &[&str] = &["server", "content-length"];

/// Request chunk size sent over the websocket to the connector, matching the
/// original's `bufPool` buffer size.
const MAX_REQUEST_CHUNK: usize = 4096;

/// Client-facing reverse-proxy entry point: one call per inbound HTTP
/// request, mounted as the webserver's catch-all route.
pub async fn handle(State(state): State<RouterState>, ConnectInfo(addr): ConnectInfo<SocketAddr>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let method = parts.method.as_str().to_string();
    let path = parts.uri.path().to_string();
    let dest = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let component_name = parts
        .headers
        .get(state.config.req_component_header.as_str())
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let socket = match state.farm.acquire_socket(&path, &component_name).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(path, error = %e, "could not acquire a connector socket");
            return error_response(e.http_status(), e.to_string());
        }
    };

    let start = Instant::now();
    socket.conn_monitor().on_connection_started(socket.route(), &socket.sock_id().to_string());
    let rx = socket.bind_response_channel();

    let mut headers = build_forward_headers(&parts.headers, &addr, &parts.uri);
    if let Err(e) = apply_interceptors(&state, &method, &dest, &mut headers) {
        let status = e.http_status();
        return finish_with_error(&state, &socket, start, &component_name, 0, status, e);
    }

    let has_body = parts.headers.contains_key(CONTENT_LENGTH) || parts.headers.contains_key(TRANSFER_ENCODING);
    let marker = if has_body { EndMarker::BodyPending } else { EndMarker::NoBody };
    let frame = protocol::encode_request(&method, &dest, &headers, marker);
    let mut req_bytes = frame.len() as i64;

    if let Err(e) = socket.send_text(frame).await {
        return finish_with_error(&state, &socket, start, &component_name, req_bytes, 502, e);
    }

    if has_body {
        let mut stream = body.into_data_stream();
        loop {
            let chunk = match stream.next().await {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    return finish_with_error(&state, &socket, start, &component_name, req_bytes, 499, e);
                }
                None => break,
            };
            req_bytes += chunk.len() as i64;
            for piece in split_chunks(chunk, MAX_REQUEST_CHUNK) {
                if let Err(e) = send_binary_with_deadline(&socket, piece, state.config.data_write_timeout).await {
                    let status = e.http_status();
                    return finish_with_error(&state, &socket, start, &component_name, req_bytes, status, e);
                }
            }
        }
        if let Err(e) = socket.send_text(protocol::BODY_ENDED_MARKER.to_string()).await {
            return finish_with_error(&state, &socket, start, &component_name, req_bytes, 502, e);
        }
    }

    build_response(&state, socket, rx, start, component_name, req_bytes).await
}

async fn build_response(
    state: &RouterState,
    socket: RouterSocket,
    mut rx: mpsc::Receiver<ResponseEvent>,
    start: Instant,
    component_name: String,
    req_bytes: i64,
) -> Response {
    match rx.recv().await {
        Some(ResponseEvent::Header { status, headers }) => {
            let mut builder = Response::builder().status(status);
            if let Some(resp_headers) = builder.headers_mut() {
                for line in &headers {
                    let Some((name, value)) = line.split_once(':') else { continue };
                    if DENY_RESPONSE_HEADERS.contains(&name.trim().to_ascii_lowercase().as_str()) {
                        continue;
                    }
                    if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.trim().as_bytes()), HeaderValue::from_str(value.trim())) {
                        resp_headers.append(name, value);
                    }
                }
                resp_headers.append(HeaderName::from_static("via"), HeaderValue::from_static("1.1 crnk"));
            }

            let body = Body::from_stream(ResponseBodyStream {
                rx,
                socket,
                status,
                component_name,
                start,
                req_bytes,
                resp_bytes: 0,
                done: false,
            });

            builder.body(body).unwrap_or_else(|_| error_response(502, "failed to build response"))
        }
        Some(ResponseEvent::Closed { code, reason }) => {
            // The connector closed (or never opened) before any header frame
            // arrived — e.g. the target refused the connection outright.
            let status = close_code_to_http_status(code);
            finish_with_error(state, &socket, start, &component_name, req_bytes, status, reason)
        }
        Some(ResponseEvent::Body(_)) | None => finish_with_error(
            state,
            &socket,
            start,
            &component_name,
            req_bytes,
            502,
            "connector closed before sending a response",
        ),
    }
}

/// A streamed response body sourced from a [`RouterSocket`]'s bound channel.
/// Records connection-ended metrics once the channel reports `Closed`, and
/// closes the underlying websocket if the client walks away before then
/// (dropping the stream without ever seeing a `Closed` event).
struct ResponseBodyStream {
    rx: mpsc::Receiver<ResponseEvent>,
    socket: RouterSocket,
    status: u16,
    component_name: String,
    start: Instant,
    req_bytes: i64,
    resp_bytes: i64,
    done: bool,
}

impl Stream for ResponseBodyStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(ResponseEvent::Body(chunk))) => {
                this.resp_bytes += chunk.len() as i64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(ResponseEvent::Closed { code, .. })) => {
                this.done = true;
                let status = if code == 1000 { this.status } else { close_code_to_http_status(code) };
                this.socket.conn_monitor().on_connection_ended(
                    &this.socket.sock_id().to_string(),
                    this.socket.route(),
                    &this.component_name,
                    status,
                    this.start.elapsed().as_millis() as i64,
                    this.req_bytes,
                    this.resp_bytes,
                );
                Poll::Ready(None)
            }
            Poll::Ready(Some(ResponseEvent::Header { .. })) | Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseBodyStream {
    fn drop(&mut self) {
        if !self.done {
            let socket = self.socket.clone();
            tokio::spawn(async move { socket.close().await });
        }
    }
}

/// Removes a socket that failed mid-exchange, records the failed attempt on
/// the connection monitor, and returns the error response the client sees.
/// `status`/`message` are the caller's choice rather than derived solely
/// from `err`, since a close-code-driven failure (1008 -> 400) and a plain
/// `CrankerError` (always its own fixed `http_status()`) disagree on what the
/// right status is for the same underlying `err`.
fn finish_with_error(
    state: &RouterState,
    socket: &RouterSocket,
    start: Instant,
    component_name: &str,
    req_bytes: i64,
    status: u16,
    err: impl std::fmt::Display,
) -> Response {
    socket.clear_response_channel();
    if socket.mark_removed() {
        state.farm.remove_websocket(socket.route(), socket);
        let to_close = socket.clone();
        tokio::spawn(async move { to_close.close().await });
    }
    socket.conn_monitor().on_connection_ended(
        &socket.sock_id().to_string(),
        socket.route(),
        component_name,
        status,
        start.elapsed().as_millis() as i64,
        req_bytes,
        0,
    );
    warn!(sock_id = %socket.sock_id(), %err, "proxying error, socket removed");
    error_response(status, err.to_string())
}

fn apply_interceptors(state: &RouterState, method: &str, dest: &str, headers: &mut Vec<String>) -> Result<(), CrankerError> {
    for interceptor in &state.proxy_interceptors {
        interceptor.apply_on_request(method, dest, headers)?;
    }
    Ok(())
}

fn error_response(status: u16, message: String) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, message).into_response()
}

fn split_chunks(mut bytes: Bytes, max: usize) -> Vec<Bytes> {
    if bytes.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    while bytes.len() > max {
        out.push(bytes.split_to(max));
    }
    out.push(bytes);
    out
}

async fn send_binary_with_deadline(socket: &RouterSocket, data: Bytes, deadline: Duration) -> Result<(), CrankerError> {
    match tokio::time::timeout(deadline, socket.send_binary(data)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(CrankerError::UpstreamBadGateway(e.to_string())),
        Err(_) => Err(CrankerError::UpstreamTimeout("data write timed out".to_string())),
    }
}

fn connection_named_headers(headers: &HeaderMap) -> HashSet<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn should_forward_header(name: &str, named: &HashSet<String>) -> bool {
    let lower = name.to_ascii_lowercase();
    !HOP_BY_HOP_HEADERS.contains(&lower.as_str()) && !named.contains(&lower)
}

/// Builds the header lines sent to the connector: the client's own headers
/// (minus hop-by-hop and anything named in its `Connection` header) plus
/// `Forwarded` and the `X-Forwarded-*` family, each added only if the client
/// didn't already set it.
fn build_forward_headers(headers: &HeaderMap, addr: &SocketAddr, uri: &Uri) -> Vec<String> {
    let named = connection_named_headers(headers);
    let mut out: Vec<String> = headers
        .iter()
        .filter(|(name, _)| should_forward_header(name.as_str(), &named))
        .filter_map(|(name, value)| value.to_str().ok().map(|v| format!("{}:{}", name.as_str(), v)))
        .collect();

    let scheme = uri.scheme_str().unwrap_or("http");
    let host = headers.get("host").and_then(|v| v.to_str().ok()).unwrap_or("");
    let remote_ip = addr.ip().to_string();
    let local = local_ip();

    out.push(format!("Forwarded:for={remote_ip};proto={scheme};host={host};by={local}"));

    if !headers.contains_key("X-Forwarded-For") {
        out.push(format!("X-Forwarded-For:{remote_ip}"));
    }
    if !headers.contains_key("X-Forwarded-Proto") {
        out.push(format!("X-Forwarded-Proto:{scheme}"));
    }
    if !headers.contains_key("X-Forwarded-Host") {
        out.push(format!("X-Forwarded-Host:{host}"));
    }
    if !headers.contains_key("X-Forwarded-Server") {
        out.push(format!("X-Forwarded-Server:{local}"));
    }

    out
}

/// Best-effort local address, used as the `by=` field in `Forwarded`.
/// Resolved once per process via the usual "connect a UDP socket, read back
/// its local address" trick, since there is no portable syscall for "the
/// address other hosts would use to reach me".
fn local_ip() -> &'static str {
    use std::net::UdpSocket;
    use std::sync::OnceLock;
    static LOCAL_IP: OnceLock<String> = OnceLock::new();
    LOCAL_IP
        .get_or_init(|| {
            UdpSocket::bind("0.0.0.0:0")
                .and_then(|sock| {
                    sock.connect("8.8.8.8:80")?;
                    sock.local_addr()
                })
                .map(|addr| addr.ip().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
        .as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_headers() {
        let named = HashSet::new();
        assert!(!should_forward_header("Connection", &named));
        assert!(!should_forward_header("transfer-encoding", &named));
        assert!(should_forward_header("X-Custom", &named));
    }

    #[test]
    fn strips_headers_named_in_connection() {
        let mut named = HashSet::new();
        named.insert("x-internal".to_string());
        assert!(!should_forward_header("X-Internal", &named));
    }

    #[test]
    fn splits_oversized_chunks() {
        let data = Bytes::from(vec![0u8; 10_000]);
        let pieces = split_chunks(data, MAX_REQUEST_CHUNK);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].len(), MAX_REQUEST_CHUNK);
        assert_eq!(pieces.iter().map(|p| p.len()).sum::<usize>(), 10_000);
    }

    #[test]
    fn empty_chunk_produces_no_frames() {
        assert!(split_chunks(Bytes::new(), MAX_REQUEST_CHUNK).is_empty());
    }
}
