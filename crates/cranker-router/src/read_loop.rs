//! Drives one registered connector's WebSocket read half for its entire
//! lifetime, dispatching every frame into whichever response channel is
//! currently bound to the socket. Lives apart from [`crate::socket`] because
//! it needs a farm handle to remove the socket on close, and `farm` already
//! depends on `socket` for `RouterSocket` itself.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::SplitStream;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::farm::WebsocketFarm;
use crate::socket::{parse_response_event, ResponseEvent, RouterSocket};

/// Reads `ws_rx` until the connector closes or errors, forwarding response
/// frames to whatever handler currently holds the socket and tearing the
/// socket down on the way out. Returns once the connection is gone.
///
/// Mirrors the original's `runForever`: a blocking read loop that ends the
/// connector's goroutine on the first close or I/O error.
pub async fn drive(socket: RouterSocket, mut ws_rx: SplitStream<WebSocket, Message>, farm: Arc<WebsocketFarm>) {
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Some(ResponseEvent::Header { status, mut headers }) = parse_response_event(&text) {
                    socket.on_response_header(status, &mut headers);
                    forward(&socket, ResponseEvent::Header { status, headers }).await;
                }
            }
            Some(Ok(Message::Binary(data))) => {
                let bytes = Bytes::from(data);
                socket.record_bytes_received(bytes.len());
                forward(&socket, ResponseEvent::Body(bytes)).await;
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((1000, String::new()));
                debug!(sock_id = %socket.sock_id(), code, "connector closed websocket");
                finish(&socket, &farm, code, reason).await;
                return;
            }
            Some(Ok(Message::Pong(_))) => {
                socket.record_pong();
            }
            Some(Ok(_)) => {
                // Ping frames from the connector need no response-side action.
            }
            Some(Err(e)) => {
                warn!(sock_id = %socket.sock_id(), error = %e, "error reading from connector websocket");
                finish(&socket, &farm, 1011, e.to_string()).await;
                return;
            }
            None => {
                finish(&socket, &farm, 1006, "connector websocket stream ended".to_string()).await;
                return;
            }
        }
    }
}

async fn forward(socket: &RouterSocket, event: ResponseEvent) {
    if let Some(tx) = socket.response_sender() {
        let _ = tx.send(event).await;
    }
}

/// Releases whoever is waiting on this exchange and, for a registered
/// connector socket, removes it from the farm. Idempotent: a deregister
/// socket (never added to the farm) and a register socket that already
/// removed itself via a failed ping both no-op harmlessly here.
async fn finish(socket: &RouterSocket, farm: &Arc<WebsocketFarm>, code: u16, reason: String) {
    forward(socket, ResponseEvent::Closed { code, reason }).await;
    socket.clear_response_channel();
    if socket.is_register() && socket.mark_removed() {
        farm.remove_websocket(socket.route(), socket);
    }
}
