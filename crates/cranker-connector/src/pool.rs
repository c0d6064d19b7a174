//! The connector: owns one sliding-window pool of idle sockets per router
//! URI, dials replacements as sockets get consumed, and drains cleanly on
//! shutdown.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::ClientBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use cranker_core::ConnectionMonitor;

use crate::config::ConnectorConfig;
use crate::conn_info::ConnectionInfo;
use crate::farm_info::WebsocketClientFarm;
use crate::socket::{ConnectorSocket, ConnectorSocketShared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    NotStarted = 0,
    Running = 1,
    ShuttingDown = 2,
    ShutDown = 3,
}

impl From<u8> for State {
    fn from(v: u8) -> Self {
        match v {
            1 => State::Running,
            2 => State::ShuttingDown,
            3 => State::ShutDown,
            _ => State::NotStarted,
        }
    }
}

/// Owns the pool of connector sockets across all configured router URIs.
pub struct Connector {
    router_uris: Vec<Url>,
    instance_id: Uuid,
    component_name: String,
    shared: Arc<ConnectorSocketShared>,
    conn_monitor: Arc<ConnectionMonitor>,
    farm_info: Arc<WebsocketClientFarm>,
    parent_token: CancellationToken,
    state: AtomicU8,
    sliding_window_size: usize,
    shutdown_timeout: Duration,
}

impl Connector {
    pub fn new(config: &ConnectorConfig, plugins: Vec<Arc<dyn crate::plugin::ConnectorPlugin>>) -> Arc<Self> {
        let http_client = ClientBuilder::new()
            .timeout(config.data_write_timeout.max(Duration::from_secs(30)))
            .build()
            .expect("failed to build reqwest client");

        let shared = Arc::new(ConnectorSocketShared {
            target_uri: config.target_uri.clone(),
            target_service_name: config.target_service_name.clone(),
            component_name: config.component_name.clone(),
            http_client,
            data_write_timeout: config.data_write_timeout,
            plugins,
        });

        Arc::new(Self {
            router_uris: config.router_uris.clone(),
            instance_id: config.instance_id,
            component_name: config.component_name.clone(),
            shared,
            conn_monitor: Arc::new(ConnectionMonitor::default()),
            farm_info: Arc::new(WebsocketClientFarm::new(config.sliding_window_size() as i32)),
            parent_token: CancellationToken::new(),
            state: AtomicU8::new(State::NotStarted as u8),
            sliding_window_size: config.sliding_window_size() as usize,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    pub fn connection_monitor(&self) -> &ConnectionMonitor {
        &self.conn_monitor
    }

    fn state(&self) -> State {
        State::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Dials `sliding_window_size` sockets against every configured router.
    pub fn start(self: &Arc<Self>) {
        for router_uri in &self.router_uris {
            let register_uri = self.build_uri(router_uri, "register/");
            info!(register_uri = %register_uri, "connecting to router");
            for i in 0..self.sliding_window_size {
                let conn_info = Arc::new(ConnectionInfo::new(register_uri.clone(), i));
                self.connect_to_router(register_uri.clone(), conn_info);
                self.farm_info.add_websocket(register_uri.as_str());
                self.conn_monitor.on_connection_available();
            }
        }
        info!(component = %self.component_name, "connector started");
        self.set_state(State::Running);
    }

    fn build_uri(&self, router_uri: &Url, path: &str) -> Url {
        let mut uri = router_uri.join(path).expect("router uri must be a valid base");
        uri.set_query(Some(&format!(
            "connectorInstanceID={}&componentName={}",
            self.instance_id, self.component_name
        )));
        uri
    }

    fn connect_to_router(self: &Arc<Self>, register_uri: Url, conn_info: Arc<ConnectionInfo>) {
        let socket = Arc::new(ConnectorSocket::new(
            register_uri.clone(),
            self.shared.clone(),
            self.conn_monitor.clone(),
            conn_info.clone(),
            self.farm_info.clone(),
            self.parent_token.clone(),
        ));

        let this = self.clone();
        let when_consumed: crate::socket::WhenConsumed = {
            let this = this.clone();
            let register_uri = register_uri.clone();
            let conn_info = conn_info.clone();
            Arc::new(move || {
                this.conn_monitor.on_connection_consumed();
                match this.state() {
                    State::ShuttingDown | State::ShutDown => {
                        info!(instance_id = %this.instance_id, "connector is shutting down, will not reconnect");
                    }
                    _ if this
                        .farm_info
                        .is_safe_to_add_websocket(register_uri.as_str(), is_deregister_uri(&register_uri)) =>
                    {
                        this.connect_to_router(register_uri.clone(), conn_info.clone());
                        this.farm_info.add_websocket(register_uri.as_str());
                        this.conn_monitor.on_connection_available();
                    }
                    _ => {
                        warn!(instance_id = %this.instance_id, "not adding a replacement websocket; sliding window already full");
                    }
                }
            })
        };

        if this.state() != State::ShutDown {
            tokio::spawn(async move {
                socket.connect_and_run(when_consumed).await;
            });
        }
    }

    /// Returns the current idle-socket count per router registration URI.
    pub fn idle_websocket_farm_info(&self) -> std::collections::HashMap<String, i32> {
        self.farm_info.to_map()
    }

    /// Convenience shutdown using the configured default timeout.
    pub async fn shut_down(self: &Arc<Self>) -> bool {
        self.shut_down_after_timeout(self.shutdown_timeout).await
    }

    /// Gracefully drains in-flight requests, blocking until they finish or
    /// `timeout` elapses. Returns `false` if the timeout was hit first.
    pub async fn shut_down_after_timeout(self: &Arc<Self>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if self.state() != State::ShutDown {
            self.call_shutdown();
        }
        loop {
            if self.conn_monitor.connection_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn call_shutdown(self: &Arc<Self>) {
        self.set_state(State::ShuttingDown);
        self.parent_token.cancel();

        for router_uri in &self.router_uris {
            let deregister_uri = self.build_uri(router_uri, "deregister/");
            info!(deregister_uri = %deregister_uri, "disconnecting, deregistering from router");
            let conn_info = Arc::new(ConnectionInfo::new(deregister_uri.clone(), 0));
            self.connect_to_router(deregister_uri, conn_info);
        }

        info!(
            available_conns = self.conn_monitor.available_conns(),
            connection_count = self.conn_monitor.connection_count(),
            "issued deregister to all routers"
        );

        self.set_state(State::ShutDown);
    }
}

fn is_deregister_uri(uri: &Url) -> bool {
    uri.path().starts_with("/deregister")
}
