//! One connector-side WebSocket's lifecycle: dial, idle, bind to exactly one
//! client request, stream it to the local target service, relay the response
//! back, then either die or hand itself back to the pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use cranker_core::protocol::{self, CrankerRequest, CRANKER_PROTOCOL_VERSION_1_0};

use crate::conn_info::ConnectionInfo;
use crate::farm_info::WebsocketClientFarm;
use crate::plugin::ConnectorPlugin;

const PING_INTERVAL: Duration = Duration::from_secs(5);
const CONTROL_WRITE_WAIT: Duration = Duration::from_secs(1);
/// Close code the router maps to HTTP 502; used when the connector proxy itself failed.
const CLOSE_INTERNAL_SERVER_ERR: u16 = 1011;
const CLOSE_NORMAL: u16 = 1000;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Shared, immutable configuration every socket of a connector is built from.
pub struct ConnectorSocketShared {
    pub target_uri: Url,
    pub target_service_name: String,
    pub component_name: String,
    pub http_client: reqwest::Client,
    pub data_write_timeout: Duration,
    pub plugins: Vec<Arc<dyn ConnectorPlugin>>,
}

/// One pooled WebSocket connection from the connector to a router.
pub struct ConnectorSocket {
    pub sock_id: Uuid,
    pub register_uri: Url,
    shared: Arc<ConnectorSocketShared>,
    conn_monitor: Arc<cranker_core::ConnectionMonitor>,
    conn_info: Arc<ConnectionInfo>,
    farm_info: Arc<WebsocketClientFarm>,
    parent_token: CancellationToken,
    had_error: AtomicBool,
    new_socket_added: AtomicBool,
    request_complete: AtomicBool,
}

/// Invoked exactly once per socket, either when it starts carrying a request
/// (so the pool can dial a replacement) or when it dies without ever having
/// done so (so the pool can retry the dial).
pub type WhenConsumed = Arc<dyn Fn() + Send + Sync>;

impl ConnectorSocket {
    pub fn new(
        register_uri: Url,
        shared: Arc<ConnectorSocketShared>,
        conn_monitor: Arc<cranker_core::ConnectionMonitor>,
        conn_info: Arc<ConnectionInfo>,
        farm_info: Arc<WebsocketClientFarm>,
        parent_token: CancellationToken,
    ) -> Self {
        Self {
            sock_id: Uuid::new_v4(),
            register_uri,
            shared,
            conn_monitor,
            conn_info,
            farm_info,
            parent_token,
            had_error: AtomicBool::new(false),
            new_socket_added: AtomicBool::new(false),
            request_complete: AtomicBool::new(false),
        }
    }

    /// Dials the router and runs the socket until it closes or errors,
    /// invoking `when_consumed` per the contract above.
    pub async fn connect_and_run(self: Arc<Self>, when_consumed: WhenConsumed) {
        self.conn_info.on_connection_starting();

        let request = match build_handshake_request(&self.register_uri, &self.shared.target_service_name) {
            Ok(r) => r,
            Err(e) => {
                error!(sock_id = %self.sock_id, error = %e, "failed to build handshake request");
                self.on_error(when_consumed).await;
                return;
            }
        };

        match connect_async(request).await {
            Ok((stream, _response)) => {
                debug!(sock_id = %self.sock_id, register_uri = %self.register_uri, "connected to router");
                self.conn_info.on_connected_successfully();
                self.on_connect(stream, when_consumed).await;
            }
            Err(e) => {
                warn!(sock_id = %self.sock_id, error = %e, "failed to dial router");
                self.on_error(when_consumed).await;
            }
        }
    }

    async fn on_connect(self: Arc<Self>, stream: WsStream, when_consumed: WhenConsumed) {
        let (ws_tx, mut ws_rx) = stream.split();
        let ws_tx = Arc::new(Mutex::new(ws_tx));
        let socket_token = CancellationToken::new();

        let heartbeat = {
            let ws_tx = ws_tx.clone();
            let sock_id = self.sock_id;
            let socket_token = socket_token.clone();
            let parent_token = self.parent_token.clone();
            tokio::spawn(async move {
                let mut tick = 0u64;
                loop {
                    tokio::select! {
                        _ = socket_token.cancelled() => {
                            debug!(sock_id = %sock_id, "socket closed, cancelling ping task");
                            return;
                        }
                        _ = parent_token.cancelled() => {
                            debug!(sock_id = %sock_id, "connector shutting down, cancelling ping task");
                            return;
                        }
                        _ = tokio::time::sleep(PING_INTERVAL) => {}
                    }
                    tick += 1;
                    let payload = format!("ping #{tick} from sockId={sock_id}").into_bytes();
                    let mut tx = ws_tx.lock().await;
                    if tokio::time::timeout(CONTROL_WRITE_WAIT, tx.send(Message::Ping(payload.into())))
                        .await
                        .is_err()
                    {
                        warn!(sock_id = %sock_id, "ping write timed out");
                    }
                }
            })
        };

        // Body pipe wired only once a request with a pending body arrives.
        let mut body_tx: Option<mpsc::Sender<Result<Bytes, std::io::Error>>> = None;
        let mut request_started = false;

        loop {
            match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => {
                    match protocol::parse_request(&text) {
                        Ok(req) => {
                            if !request_started {
                                request_started = true;
                                self.on_request_received(&when_consumed);
                                body_tx = self
                                    .spawn_target_request(req.clone(), ws_tx.clone(), socket_token.clone())
                                    .await;
                            } else if req.is_body_ended() {
                                debug!(sock_id = %self.sock_id, "request body ended");
                                body_tx = None; // dropping the sender closes the body stream
                            }
                        }
                        Err(e) => {
                            warn!(sock_id = %self.sock_id, error = %e, "malformed request frame");
                        }
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Some(tx) = &body_tx {
                        if tx.send(Ok(Bytes::from(data.to_vec()))).await.is_err() {
                            warn!(sock_id = %self.sock_id, "target body pipe closed early");
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((CLOSE_NORMAL, String::new()));
                    self.on_close(code, &reason, &ws_tx, &when_consumed).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(sock_id = %self.sock_id, error = %e, "websocket read error");
                    socket_token.cancel();
                    self.on_error(when_consumed).await;
                    break;
                }
                None => {
                    socket_token.cancel();
                    self.on_error(when_consumed).await;
                    break;
                }
            }
        }

        heartbeat.abort();
    }

    /// Fires the moment a cranker request frame is read off an idle socket.
    /// This is the spec's "consumed" instant: the pool must be told now, not
    /// when the request eventually finishes, so the replacement dial starts
    /// while this socket is still busy streaming to the target.
    fn on_request_received(&self, when_consumed: &WhenConsumed) {
        self.farm_info.remove_websocket(self.register_uri.as_str());
        if !self.new_socket_added.swap(true, Ordering::AcqRel) {
            when_consumed();
        }
    }

    /// Builds the target HTTP request, fires it on its own task, and returns
    /// the channel to feed request-body bytes into (if the request has one).
    async fn spawn_target_request(
        self: &Arc<Self>,
        req: CrankerRequest,
        ws_tx: Arc<Mutex<futures::stream::SplitSink<WsStream, Message>>>,
        socket_token: CancellationToken,
    ) -> Option<mpsc::Sender<Result<Bytes, std::io::Error>>> {
        let method = req.method.clone().unwrap_or_default();
        let dest = req.dest.clone().unwrap_or_default();
        let target_url = match self.shared.target_uri.join(&dest) {
            Ok(u) => u,
            Err(e) => {
                error!(sock_id = %self.sock_id, dest = %dest, error = %e, "failed to resolve target url");
                return None;
            }
        };

        let http_method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(m) => m,
            Err(_) => reqwest::Method::GET,
        };

        let mut builder = self.shared.http_client.request(http_method, target_url.clone());
        for line in &req.headers {
            if let Some(pos) = line.find(':') {
                let (name, value) = (&line[..pos], &line[pos + 1..]);
                builder = builder.header(name, value);
            }
        }
        builder = builder.header("Via", "1.1 crnk");

        let body_tx = if req.is_body_pending() {
            let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);
            let stream = ReceiverStream::new(rx);
            builder = builder.body(reqwest::Body::wrap_stream(stream));
            Some(tx)
        } else {
            None
        };

        self.conn_monitor.on_connection_started(&self.shared.target_service_name, &self.sock_id.to_string());

        let carriers: Vec<Option<Box<dyn crate::plugin::StatCarrier>>> = self
            .shared
            .plugins
            .iter()
            .map(|p| match p.handle_before_request_sent(&req) {
                Ok(carrier) => Some(carrier),
                Err(e) => {
                    warn!(sock_id = %self.sock_id, error = %e, "connector plugin before-request hook failed, skipping its after-response hook");
                    None
                }
            })
            .collect();

        let this = self.clone();
        let source_method = method;
        let source_url = dest;
        tokio::spawn(async move {
            let outcome = builder.send().await;
            this.conn_monitor.on_connection_ended(
                &this.sock_id.to_string(),
                &this.shared.target_service_name,
                &this.shared.component_name,
                outcome.as_ref().map(|r| r.status().as_u16()).unwrap_or(0),
                0,
                0,
                0,
            );
            socket_token.cancel(); // stop the heartbeat before writing the close frame

            match outcome {
                Ok(resp) => {
                    let status = resp.status();
                    let headers: Vec<String> = resp
                        .headers()
                        .iter()
                        .filter_map(|(k, v)| v.to_str().ok().map(|v| format!("{}:{}", k.as_str(), v)))
                        .collect();
                    let frame = protocol::encode_response(
                        status.as_u16(),
                        status.canonical_reason().unwrap_or(""),
                        &source_method,
                        &source_url,
                        &headers,
                    );
                    let cranker_resp = protocol::CrankerResponse {
                        status: status.as_u16(),
                        reason: status.canonical_reason().unwrap_or("").to_string(),
                        source_method: source_method.clone(),
                        source_url: source_url.clone(),
                        headers: headers.clone(),
                    };
                    for (plugin, carrier) in this.shared.plugins.iter().zip(carriers) {
                        if let Some(carrier) = carrier {
                            if let Err(e) = plugin.handle_after_response_received(&cranker_resp, carrier) {
                                warn!(sock_id = %this.sock_id, error = %e, "connector plugin after-response hook failed");
                            }
                        }
                    }
                    {
                        let mut tx = ws_tx.lock().await;
                        if let Err(e) = tx.send(Message::Text(frame.into())).await {
                            error!(sock_id = %this.sock_id, error = %e, "failed to send response header frame");
                        }
                    }

                    let mut stream = resp.bytes_stream();
                    let mut failed = false;
                    while let Some(chunk) = stream.next().await {
                        match chunk {
                            Ok(bytes) => {
                                let mut tx = ws_tx.lock().await;
                                if tx.send(Message::Binary(bytes.to_vec().into())).await.is_err() {
                                    failed = true;
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(sock_id = %this.sock_id, error = %e, "error streaming target response body");
                                failed = true;
                                break;
                            }
                        }
                    }

                    this.request_complete.store(!failed, Ordering::Release);
                    let mut tx = ws_tx.lock().await;
                    if failed {
                        let error_id = Uuid::new_v4();
                        let _ = tokio::time::timeout(
                            CONTROL_WRITE_WAIT,
                            tx.send(Message::Close(Some(CloseFrame {
                                code: CLOSE_INTERNAL_SERVER_ERR.into(),
                                reason: format!("ErrorID: {error_id}").into(),
                            }))),
                        )
                        .await;
                    } else {
                        let _ = tokio::time::timeout(
                            CONTROL_WRITE_WAIT,
                            tx.send(Message::Close(Some(CloseFrame {
                                code: CLOSE_NORMAL.into(),
                                reason: "Proxy complete".into(),
                            }))),
                        )
                        .await;
                    }
                }
                Err(e) => {
                    this.request_complete.store(false, Ordering::Release);
                    let error_id = Uuid::new_v4();
                    warn!(sock_id = %this.sock_id, error_id = %error_id, error = %e, "target request failed");
                    let mut tx = ws_tx.lock().await;
                    let _ = tokio::time::timeout(
                        CONTROL_WRITE_WAIT,
                        tx.send(Message::Close(Some(CloseFrame {
                            code: CLOSE_INTERNAL_SERVER_ERR.into(),
                            reason: format!("ErrorID: {error_id}").into(),
                        }))),
                    )
                    .await;
                }
            }
        });

        body_tx
    }

    async fn on_close(
        &self,
        code: u16,
        reason: &str,
        ws_tx: &Arc<Mutex<futures::stream::SplitSink<WsStream, Message>>>,
        when_consumed: &WhenConsumed,
    ) {
        debug!(sock_id = %self.sock_id, code, reason, "websocket closed");
        if !self.new_socket_added.swap(true, Ordering::AcqRel) {
            self.farm_info.remove_websocket(self.register_uri.as_str());
            when_consumed();
        }
        // An I/O error mid-proxy (not our own normal/error close) means the
        // router vanished before the target response finished; nothing left
        // to abort here since the spawned request task owns cancellation via
        // its own socket_token, already triggered by the closed connection.
        let _ = code;
        let mut tx = ws_tx.lock().await;
        let _ = tx.close().await;
    }

    /// Invoked both when the dial itself fails and when an already-connected
    /// socket's read loop errors out. Idempotent: a second call is a no-op.
    async fn on_error(self: Arc<Self>, when_consumed: WhenConsumed) {
        if self.had_error.swap(true, Ordering::AcqRel) {
            debug!(sock_id = %self.sock_id, "error already handled for this socket, ignoring");
            return;
        }
        warn!(sock_id = %self.sock_id, register_uri = %self.register_uri, target = %self.shared.target_uri, "websocket error");

        if !self.new_socket_added.swap(true, Ordering::AcqRel) {
            self.farm_info.remove_websocket(self.register_uri.as_str());
            let delay_ms = self.conn_info.retry_after_millis();
            info!(sock_id = %self.sock_id, delay_ms, "scheduling reconnect");
            let parent_token = self.parent_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = parent_token.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms as u64)) => {
                        when_consumed();
                    }
                }
            });
        }
    }
}

fn build_handshake_request(register_uri: &Url, route: &str) -> Result<Request<()>, String> {
    let mut request = register_uri
        .as_str()
        .into_client_request()
        .map_err(|e| e.to_string())?;
    let headers = request.headers_mut();
    headers.insert(
        "CrankerProtocol",
        HeaderValue::from_static(CRANKER_PROTOCOL_VERSION_1_0),
    );
    headers.insert(
        "Route",
        HeaderValue::from_str(route).map_err(|e| e.to_string())?,
    );
    headers.insert("Sec-WebSocket-Key", HeaderValue::from_str(&generate_key()).map_err(|e| e.to_string())?);
    Ok(request)
}
