//! One router-side WebSocket: the connector end of a registered connection.
//! A `RouterSocket` sits idle in a [`crate::farm::WebsocketFarm`] queue until
//! an inbound HTTP request acquires it, at which point it carries exactly one
//! request/response pair before either going back in the queue (handled by
//! the connector replenishing its own pool) or being torn down.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::SinkExt;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use cranker_core::plugin::RouterSocketPlugin;
use cranker_core::protocol;
use cranker_core::queue::QueueItem;
use cranker_core::ConnectionMonitor;

pub const WRITE_WAIT: Duration = Duration::from_secs(1);

/// A header frame, body chunk, or close notification relayed from the
/// connector back to whoever currently holds this socket.
#[derive(Debug)]
pub enum ResponseEvent {
    Header { status: u16, headers: Vec<String> },
    Body(Bytes),
    Closed { code: u16, reason: String },
}

struct Inner {
    sock_id: Uuid,
    route: String,
    connector_instance_id: String,
    ip: String,
    is_register: bool,
    ws_tx: Mutex<SplitSink<WebSocket, Message>>,
    conn_monitor: Arc<ConnectionMonitor>,
    plugins: Vec<Arc<dyn RouterSocketPlugin>>,
    remote_addr: SyncMutex<Option<String>>,
    req_component_name: SyncMutex<String>,
    last_ping_time: SyncMutex<Option<Instant>>,
    last_pong_time: SyncMutex<Instant>,
    is_removed: AtomicBool,
    bytes_sent: AtomicI64,
    bytes_received: AtomicI64,
    /// Bound by whichever reverse-proxy handler currently holds this socket,
    /// for the duration of exactly one request/response exchange. The read
    /// loop forwards every `ResponseEvent` it parses here instead of calling
    /// back into an `http.ResponseWriter`-equivalent directly.
    response_tx: SyncMutex<Option<mpsc::Sender<ResponseEvent>>>,
}

/// Cheap, clonable handle to a router-side connector socket. Cloned freely so
/// it can live both in a [`cranker_core::queue::SocketQueue`] and in whatever
/// task is driving its WebSocket read loop.
#[derive(Clone)]
pub struct RouterSocket(Arc<Inner>);

impl QueueItem for RouterSocket {
    fn queue_id(&self) -> Uuid {
        self.0.sock_id
    }
}

impl RouterSocket {
    pub fn new(
        route: String,
        connector_instance_id: String,
        ip: String,
        is_register: bool,
        ws_tx: SplitSink<WebSocket, Message>,
        conn_monitor: Arc<ConnectionMonitor>,
        plugins: Vec<Arc<dyn RouterSocketPlugin>>,
    ) -> Self {
        Self(Arc::new(Inner {
            sock_id: Uuid::new_v4(),
            route,
            connector_instance_id,
            ip,
            is_register,
            ws_tx: Mutex::new(ws_tx),
            conn_monitor,
            plugins,
            remote_addr: SyncMutex::new(None),
            req_component_name: SyncMutex::new(String::new()),
            last_ping_time: SyncMutex::new(None),
            last_pong_time: SyncMutex::new(Instant::now()),
            is_removed: AtomicBool::new(false),
            bytes_sent: AtomicI64::new(0),
            bytes_received: AtomicI64::new(0),
            response_tx: SyncMutex::new(None),
        }))
    }

    pub fn sock_id(&self) -> Uuid {
        self.0.sock_id
    }

    pub fn route(&self) -> &str {
        &self.0.route
    }

    pub fn is_catch_all(&self) -> bool {
        self.0.route.is_empty()
    }

    pub fn connector_instance_id(&self) -> &str {
        &self.0.connector_instance_id
    }

    pub fn ip(&self) -> &str {
        &self.0.ip
    }

    pub fn is_register(&self) -> bool {
        self.0.is_register
    }

    pub fn remote_addr(&self) -> Option<String> {
        self.0.remote_addr.lock().clone()
    }

    pub fn set_remote_addr(&self, addr: String) {
        *self.0.remote_addr.lock() = Some(addr);
    }

    pub fn last_ping_time(&self) -> Option<Instant> {
        *self.0.last_ping_time.lock()
    }

    /// Time elapsed since this socket's last observed Pong (or since it was
    /// created, if none has arrived yet). Used to evict sockets that have
    /// gone quiet without the connector ever failing a ping outright.
    pub fn idle_for(&self) -> Duration {
        self.0.last_pong_time.lock().elapsed()
    }

    pub fn record_pong(&self) {
        *self.0.last_pong_time.lock() = Instant::now();
    }

    pub fn req_component_name(&self) -> String {
        self.0.req_component_name.lock().clone()
    }

    pub fn set_req_component_name(&self, name: String) {
        *self.0.req_component_name.lock() = name;
    }

    pub fn is_removed(&self) -> bool {
        self.0.is_removed.load(Ordering::Acquire)
    }

    /// Marks the socket removed. Returns `true` the first time this is
    /// called for a given socket (idempotent, mirroring `isRemoved` guards
    /// around the original's queue-removal call sites).
    pub fn mark_removed(&self) -> bool {
        !self.0.is_removed.swap(true, Ordering::AcqRel)
    }

    pub async fn send_text(&self, msg: String) -> Result<(), axum::Error> {
        self.0.bytes_sent.fetch_add(msg.len() as i64, Ordering::Relaxed);
        let mut tx = self.0.ws_tx.lock().await;
        tx.send(Message::Text(Utf8Bytes::from(msg))).await
    }

    pub async fn send_binary(&self, buf: Bytes) -> Result<(), axum::Error> {
        self.0.bytes_sent.fetch_add(buf.len() as i64, Ordering::Relaxed);
        let mut tx = self.0.ws_tx.lock().await;
        tx.send(Message::Binary(buf)).await
    }

    pub async fn send_ping(&self) -> Result<(), axum::Error> {
        *self.0.last_ping_time.lock() = Some(Instant::now());
        let mut tx = self.0.ws_tx.lock().await;
        tokio::time::timeout(WRITE_WAIT, tx.send(Message::Ping(Bytes::from_static(b"*ping*_%"))))
            .await
            .unwrap_or(Err(axum::Error::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "ping write timed out",
            ))))
    }

    pub async fn close(&self) {
        let mut tx = self.0.ws_tx.lock().await;
        let _ = tokio::time::timeout(WRITE_WAIT, tx.close()).await;
    }

    pub fn on_response_header(&self, status: u16, headers: &mut Vec<String>) {
        debug!(sock_id = %self.0.sock_id, status, "received response header from connector");
        for p in &self.0.plugins {
            p.handle_after_response_received(status, headers);
        }
    }

    pub fn record_bytes_received(&self, n: usize) {
        self.0.bytes_received.fetch_add(n as i64, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> i64 {
        self.0.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> i64 {
        self.0.bytes_received.load(Ordering::Relaxed)
    }

    pub fn conn_monitor(&self) -> &ConnectionMonitor {
        &self.0.conn_monitor
    }

    /// Binds a fresh response channel to this socket for the request about to
    /// be sent over it, handing back the receiving half. Mirrors the
    /// original's `SetResponse`, which stashes the `http.ResponseWriter` and
    /// `handleDone` latch for the duration of one exchange.
    pub fn bind_response_channel(&self) -> mpsc::Receiver<ResponseEvent> {
        let (tx, rx) = mpsc::channel(64);
        *self.0.response_tx.lock() = Some(tx);
        rx
    }

    /// The sender half of the currently bound response channel, if any. The
    /// read loop holds no reference of its own; it looks this up on every
    /// frame so a socket idling between requests has nowhere to forward to.
    pub fn response_sender(&self) -> Option<mpsc::Sender<ResponseEvent>> {
        self.0.response_tx.lock().clone()
    }

    /// Unbinds the response channel once an exchange is over, whether it
    /// finished cleanly or the socket closed mid-flight.
    pub fn clear_response_channel(&self) {
        *self.0.response_tx.lock() = None;
    }
}

impl std::fmt::Debug for RouterSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterSocket")
            .field("sock_id", &self.0.sock_id)
            .field("route", &self.0.route)
            .field("connector_instance_id", &self.0.connector_instance_id)
            .field("is_register", &self.0.is_register)
            .field("ip", &self.0.ip)
            .finish()
    }
}

/// Parses a text frame received from the connector into a response header
/// event, returning `None` (with a warning logged) on malformed input.
pub fn parse_response_event(text: &str) -> Option<ResponseEvent> {
    match protocol::parse_response(text) {
        Ok(resp) => Some(ResponseEvent::Header {
            status: resp.status,
            headers: resp.headers,
        }),
        Err(e) => {
            warn!(error = %e, "malformed response frame from connector");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_mapping_matches_the_original() {
        assert_eq!(cranker_core::error::close_code_to_http_status(1011), 502);
        assert_eq!(cranker_core::error::close_code_to_http_status(1008), 400);
    }

    #[test]
    fn parses_a_response_header_frame() {
        let msg = cranker_core::protocol::encode_response(
            200,
            "OK",
            "GET",
            "/x",
            &["content-type:text/plain".to_string()],
        );
        match parse_response_event(&msg) {
            Some(ResponseEvent::Header { status, .. }) => assert_eq!(status, 200),
            other => panic!("expected header event, got {other:?}"),
        }
    }
}
