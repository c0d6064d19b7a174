//! Router configuration: listen interfaces, socket-acquire and ping
//! intervals, and the ambient knobs (IP allow-list, data-write timeout).

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_SOCKET_ACQUIRE_SECS: u64 = 15;
const DEFAULT_PING_SCHEDULE_SECS: u64 = 5;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_DATA_WRITE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 15;
const DEFAULT_REQ_COMPONENT_HEADER: &str = "X-Cranker-Component-Name";

/// YAML-deserializable router configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Interface the connector-facing registration WebSocket server binds to.
    #[serde(default = "default_bind_all")]
    pub websocket_interface: String,
    /// Interface the client-facing HTTP proxy server binds to.
    #[serde(default = "default_bind_all")]
    pub webserver_interface: String,
    /// Port `/register` and `/deregister` are served on.
    pub registration_port: u16,
    /// Port the client-facing reverse proxy is served on.
    pub http_port: u16,
    /// Header name a connector may use to tag an in-flight request with a
    /// caller-chosen component name, surfaced in connection-monitor logs.
    #[serde(default = "default_req_component_header")]
    pub req_component_header: String,
    /// How long `WebsocketFarm::acquire_socket` waits for an idle connector
    /// before giving up with a 503.
    #[serde(default = "default_socket_acquire_time", with = "duration_secs")]
    pub socket_acquire_time: Duration,
    /// Interval between heartbeat pings sent to every registered connector.
    #[serde(default = "default_ping_schedule_interval", with = "duration_secs")]
    pub ping_schedule_interval: Duration,
    /// How long a connector socket may stay idle without a pong before it's
    /// considered dead and evicted from its queue.
    #[serde(default = "default_idle_timeout", with = "duration_secs")]
    pub idle_timeout: Duration,
    /// Write deadline applied to binary body-frame writes.
    #[serde(default = "default_data_write_timeout", with = "duration_secs")]
    pub data_write_timeout: Duration,
    /// Budget for a graceful shutdown of both servers.
    #[serde(default = "default_shutdown_timeout", with = "duration_secs")]
    pub shutdown_timeout: Duration,
    /// Optional IP allow-list gating `/register` and `/deregister`. `None`
    /// (the default) allows any connector IP.
    #[serde(default)]
    pub ip_allow_list: Option<Vec<String>>,
    /// Dark-launch IPs configured at startup, before any admin API call.
    #[serde(default)]
    pub dark_launch_ips: Vec<String>,
    /// Dark-launch service routes configured at startup.
    #[serde(default)]
    pub dark_launch_services: Vec<String>,
}

fn default_bind_all() -> String {
    "0.0.0.0".to_string()
}

fn default_req_component_header() -> String {
    DEFAULT_REQ_COMPONENT_HEADER.to_string()
}

fn default_socket_acquire_time() -> Duration {
    Duration::from_secs(DEFAULT_SOCKET_ACQUIRE_SECS)
}

fn default_ping_schedule_interval() -> Duration {
    Duration::from_secs(DEFAULT_PING_SCHEDULE_SECS)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)
}

fn default_data_write_timeout() -> Duration {
    Duration::from_secs(DEFAULT_DATA_WRITE_TIMEOUT_SECS)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(de)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_yaml() -> &'static str {
        r#"
registration_port: 9090
http_port: 8080
"#
    }

    #[test]
    fn applies_defaults() {
        let cfg: RouterConfig = serde_yaml::from_str(base_yaml()).unwrap();
        assert_eq!(cfg.socket_acquire_time, Duration::from_secs(15));
        assert_eq!(cfg.ping_schedule_interval, Duration::from_secs(5));
        assert_eq!(cfg.req_component_header, DEFAULT_REQ_COMPONENT_HEADER);
        assert!(cfg.ip_allow_list.is_none());
    }

    #[test]
    fn reads_dark_launch_seed_lists() {
        let yaml = format!(
            "{}\ndark_launch_ips:\n  - 10.0.0.1\ndark_launch_services:\n  - payments",
            base_yaml()
        );
        let cfg: RouterConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.dark_launch_ips, vec!["10.0.0.1".to_string()]);
        assert_eq!(cfg.dark_launch_services, vec!["payments".to_string()]);
    }
}
