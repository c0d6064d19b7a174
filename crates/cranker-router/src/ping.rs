//! Periodic heartbeat over every registered connector socket. Grounded on
//! the original's `RouterAvailability.scheduleSendPingToConnector`: a
//! goroutine that walks all four farm positions (normal/dark, per-route and
//! catch-all) every few seconds and pings each live socket, dropping any
//! that fail.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::farm::WebsocketFarm;

/// Owns the background ping task. Dropping this without calling [`stop`]
/// leaves the task running for the lifetime of the process, same as the
/// original never bothering to `defer cancelPing()`.
pub struct PingScheduler {
    token: CancellationToken,
}

impl PingScheduler {
    pub fn start(farm: Arc<WebsocketFarm>, interval: Duration, idle_timeout: Duration) -> Self {
        let token = CancellationToken::new();
        let task_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                ping_all(&farm, idle_timeout).await;
            }
        });
        Self { token }
    }

    /// Stops the background task. Safe to call more than once or from
    /// multiple places during shutdown; [`CancellationToken::cancel`] is
    /// itself idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

async fn ping_all(farm: &Arc<WebsocketFarm>, idle_timeout: Duration) {
    for (_route, sockets) in farm.all_sockets() {
        for socket in sockets {
            ping_one(farm, &socket, idle_timeout).await;
        }
    }
    for socket in farm.all_catchall() {
        ping_one(farm, &socket, idle_timeout).await;
    }
}

/// Pings one socket, removing it either on a failed write or because it has
/// gone quiet (no Pong observed) for longer than `idle_timeout`.
async fn ping_one(farm: &Arc<WebsocketFarm>, socket: &crate::socket::RouterSocket, idle_timeout: Duration) {
    if socket.idle_for() > idle_timeout {
        debug!(sock_id = %socket.sock_id(), route = socket.route(), "no pong within idle timeout, removing socket");
        if socket.mark_removed() {
            farm.remove_websocket(socket.route(), socket);
        }
        return;
    }
    if socket.send_ping().await.is_err() {
        debug!(sock_id = %socket.sock_id(), route = socket.route(), "ping failed, removing socket");
        if socket.mark_removed() {
            farm.remove_websocket(socket.route(), socket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::darklaunch::DarkLaunchManager;
    use cranker_core::ConnectionMonitor;

    #[tokio::test]
    async fn stop_is_idempotent() {
        let farm = WebsocketFarm::new(Arc::new(ConnectionMonitor::default()), Arc::new(DarkLaunchManager::default()));
        let scheduler = PingScheduler::start(farm, Duration::from_secs(60), Duration::from_secs(60));
        scheduler.stop();
        scheduler.stop();
    }
}
