//! Routes an inbound HTTP path to a live connector socket. Sockets are
//! grouped by route name into per-route FIFOs, with a catch-all FIFO for
//! connectors that registered without a `Route` header. Dark-launched
//! connectors (or gray-tested traffic) are served from a parallel shadow set
//! of queues instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use cranker_core::error::CrankerError;
use cranker_core::queue::SocketQueue;
use cranker_core::route::{route_for_path, CATCH_ALL_ROUTE};
use cranker_core::ConnectionMonitor;

use crate::darklaunch::DarkLaunchManager;
use crate::socket::RouterSocket;

const DEFAULT_SOCKET_ACQUIRE_TIME: Duration = Duration::from_secs(15);

pub struct WebsocketFarm {
    sockets: DashMap<String, Arc<SocketQueue<RouterSocket>>>,
    dark_sockets: DashMap<String, Arc<SocketQueue<RouterSocket>>>,
    catchall: Arc<SocketQueue<RouterSocket>>,
    dark_catchall: Arc<SocketQueue<RouterSocket>>,
    conn_monitor: Arc<ConnectionMonitor>,
    dark_launch: Arc<DarkLaunchManager>,
    socket_acquire_time: AtomicU64,
}

impl WebsocketFarm {
    pub fn new(conn_monitor: Arc<ConnectionMonitor>, dark_launch: Arc<DarkLaunchManager>) -> Arc<Self> {
        let farm = Arc::new(Self {
            sockets: DashMap::new(),
            dark_sockets: DashMap::new(),
            catchall: Arc::new(SocketQueue::new(0)),
            dark_catchall: Arc::new(SocketQueue::new(0)),
            conn_monitor,
            dark_launch,
            socket_acquire_time: AtomicU64::new(DEFAULT_SOCKET_ACQUIRE_TIME.as_millis() as u64),
        });
        farm.dark_launch.bind_farm(Arc::downgrade(&farm));
        farm
    }

    pub fn set_socket_acquire_time(&self, timeout: Duration) {
        self.socket_acquire_time.store(timeout.as_millis() as u64, Ordering::Release);
    }

    fn socket_acquire_time(&self) -> Duration {
        Duration::from_millis(self.socket_acquire_time.load(Ordering::Acquire))
    }

    fn is_dark(&self, socket: &RouterSocket) -> bool {
        self.dark_launch.is_dark_mode_on()
            && (self.dark_launch.contains_ip(socket.ip()) || self.dark_launch.contains_service(socket.route()))
    }

    pub fn add_websocket(&self, route: &str, socket: RouterSocket) {
        let route = if route.is_empty() { CATCH_ALL_ROUTE } else { route };
        let (map, catchall) = if self.is_dark(&socket) {
            debug!(route, sock_id = %socket.sock_id(), "adding dark websocket");
            (&self.dark_sockets, &self.dark_catchall)
        } else {
            debug!(route, sock_id = %socket.sock_id(), "adding websocket");
            (&self.sockets, &self.catchall)
        };
        let queue = if route == CATCH_ALL_ROUTE {
            catchall.clone()
        } else {
            map.entry(route.to_string())
                .or_insert_with(|| Arc::new(SocketQueue::new(0)))
                .clone()
        };
        queue.offer(socket);
    }

    pub fn remove_websocket(&self, route: &str, socket: &RouterSocket) {
        let route = if route.is_empty() { CATCH_ALL_ROUTE } else { route };
        let (map, catchall) = if self.is_dark(socket) {
            (&self.dark_sockets, &self.dark_catchall)
        } else {
            (&self.sockets, &self.catchall)
        };
        if route == CATCH_ALL_ROUTE {
            catchall.remove(socket);
        } else if let Some(queue) = map.get(route) {
            queue.remove(socket);
        }
    }

    /// Acquires a live socket for `target`'s path, blocking up to the
    /// configured socket-acquire timeout.
    pub async fn acquire_socket(&self, target_path: &str, component_name: &str) -> Result<RouterSocket, CrankerError> {
        let route = route_for_path(target_path);
        let (sockets, catchall) = if self.dark_launch.is_dark_mode_on() && self.dark_launch.is_gray_testing_on() {
            (&self.dark_sockets, &self.dark_catchall)
        } else {
            (&self.sockets, &self.catchall)
        };

        let queue = sockets.get(&route).map(|q| q.clone()).unwrap_or_else(|| catchall.clone());
        self.conn_monitor.report_websocket_pool_size(queue.len_alive());

        let route_registered = sockets.contains_key(&route);
        if !route_registered && queue.is_empty() {
            warn!(route, target_path, "no route registered and catch-all is empty");
            return Err(CrankerError::NoRoute(route));
        }

        match queue.poll_timeout(self.socket_acquire_time()).await {
            Some(socket) => {
                socket.set_req_component_name(component_name.to_string());
                Ok(socket)
            }
            None => Err(CrankerError::AcquireTimeout(route)),
        }
    }

    /// Polls every live socket registered for `route` and drops the ones
    /// whose `connectorInstanceID` matches the deregistering connector.
    pub fn deregister_socket(&self, route: &str, connector_instance_id: &str) {
        let queue = self
            .sockets
            .get(route)
            .map(|q| q.clone())
            .unwrap_or_else(|| self.catchall.clone());

        while !queue.is_empty() {
            let Some(socket) = queue.poll() else { break };
            if socket.connector_instance_id() == connector_instance_id {
                debug!(route, connector_instance_id, sock_id = %socket.sock_id(), "deregistering socket");
                self.remove_websocket(&socket.route().to_string(), &socket);
            } else {
                debug!(
                    route,
                    connector_instance_id,
                    actual = socket.connector_instance_id(),
                    "connectorInstanceID mismatch on deregister, leaving socket in place"
                );
            }
        }
    }

    pub fn all_sockets(&self) -> HashMap<String, Vec<RouterSocket>> {
        let mut out: HashMap<String, Vec<RouterSocket>> = HashMap::new();
        for entry in self.dark_sockets.iter() {
            out.entry(entry.key().clone()).or_default().extend(entry.value().alive_snapshot());
        }
        for entry in self.sockets.iter() {
            out.entry(entry.key().clone()).or_default().extend(entry.value().alive_snapshot());
        }
        out
    }

    pub fn all_catchall(&self) -> Vec<RouterSocket> {
        let mut all = self.catchall.alive_snapshot();
        all.extend(self.dark_catchall.alive_snapshot());
        all
    }

    pub fn stop(&self) {
        for entry in self.sockets.iter() {
            while let Some(socket) = entry.value().poll() {
                let ws = socket.clone();
                tokio::spawn(async move { ws.close().await });
            }
        }
        while let Some(socket) = self.catchall.poll() {
            tokio::spawn(async move { socket.close().await });
        }
    }

    // --- dark-launch migration, invoked by DarkLaunchManager ---

    pub fn migrate_ip_to_dark(&self, ip: &str) {
        self.migrate(&self.sockets, &self.dark_sockets, &self.catchall, &self.dark_catchall, |s| s.ip() == ip);
    }

    pub fn migrate_ip_to_normal(&self, ip: &str) {
        self.migrate(&self.dark_sockets, &self.sockets, &self.dark_catchall, &self.catchall, |s| s.ip() == ip);
    }

    pub fn migrate_service_to_dark(&self, service: &str) {
        self.migrate(&self.sockets, &self.dark_sockets, &self.catchall, &self.dark_catchall, |s| {
            s.route() == service
        });
    }

    pub fn migrate_service_to_normal(&self, service: &str) {
        self.migrate(&self.dark_sockets, &self.sockets, &self.dark_catchall, &self.catchall, |s| {
            s.route() == service
        });
    }

    fn migrate(
        &self,
        from_map: &DashMap<String, Arc<SocketQueue<RouterSocket>>>,
        to_map: &DashMap<String, Arc<SocketQueue<RouterSocket>>>,
        from_catchall: &Arc<SocketQueue<RouterSocket>>,
        to_catchall: &Arc<SocketQueue<RouterSocket>>,
        matches: impl Fn(&RouterSocket) -> bool,
    ) {
        for entry in from_map.iter() {
            let route = entry.key().clone();
            let queue = entry.value().clone();
            let mut to_move = Vec::new();
            queue.range(|s| {
                if matches(s) {
                    to_move.push(s.clone());
                }
                true
            });
            for socket in to_move {
                queue.remove(&socket);
                let dest = to_map.entry(route.clone()).or_insert_with(|| Arc::new(SocketQueue::new(0))).clone();
                dest.offer(socket);
            }
        }

        let mut to_move = Vec::new();
        from_catchall.range(|s| {
            if matches(s) {
                to_move.push(s.clone());
            }
            true
        });
        for socket in to_move {
            from_catchall.remove(&socket);
            to_catchall.offer(socket);
        }
    }
}

/// Splits `/<route>/...` into its route segment, matching
/// `WebsocketFarm.getRouterSocket`'s `resolveRoute`.
pub fn resolve_route(target_path: &str) -> String {
    route_for_path(target_path)
}
