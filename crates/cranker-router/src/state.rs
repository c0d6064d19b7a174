//! Shared application state handed to every axum handler via `State`.

use std::sync::Arc;

use cranker_core::plugin::{ProxyInterceptor, RouterSocketPlugin};
use cranker_core::ConnectionMonitor;

use crate::config::RouterConfig;
use crate::darklaunch::DarkLaunchManager;
use crate::farm::WebsocketFarm;
use crate::validator::IpValidator;

/// Cheap to clone: every field is already an `Arc` (or a `Vec` of them).
#[derive(Clone)]
pub struct RouterState {
    pub config: Arc<RouterConfig>,
    pub farm: Arc<WebsocketFarm>,
    pub conn_monitor: Arc<ConnectionMonitor>,
    pub dark_launch: Arc<DarkLaunchManager>,
    pub ip_validator: Arc<IpValidator>,
    pub router_socket_plugins: Vec<Arc<dyn RouterSocketPlugin>>,
    pub proxy_interceptors: Vec<Arc<dyn ProxyInterceptor>>,
}
