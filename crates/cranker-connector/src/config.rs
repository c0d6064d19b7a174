//! Connector configuration: router URIs, target service, sliding window
//! size, and the ambient knobs (data-write timeout, component name).

use std::time::Duration;

use serde::Deserialize;
use url::Url;
use uuid::Uuid;

const DEFAULT_SLIDING_WINDOW_SIZE: u32 = 2;
const MAX_SLIDING_WINDOW_SIZE: u32 = 1000;
const DEFAULT_DATA_WRITE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// YAML-deserializable connector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    /// Router registration endpoints, e.g. `ws://router1:9090/`.
    pub router_uris: Vec<Url>,
    /// Base URL of the local target service this connector proxies to.
    pub target_uri: Url,
    /// Route name this connector registers under (the `Route` header).
    pub target_service_name: String,
    /// Logical sub-identifier surfaced in request headers for correlation only.
    #[serde(default)]
    pub component_name: String,
    /// Desired idle-socket count per router URI.
    #[serde(default = "default_sliding_window_size")]
    sliding_window_size: u32,
    /// Unique id for this connector process, visible to the router. Generated
    /// at load time if absent from the file.
    #[serde(default = "Uuid::new_v4")]
    pub instance_id: Uuid,
    /// Write deadline applied to binary body-frame writes.
    #[serde(default = "default_data_write_timeout", with = "duration_secs")]
    pub data_write_timeout: Duration,
    /// Budget for a graceful shutdown to drain in-flight requests.
    #[serde(default = "default_shutdown_timeout", with = "duration_secs")]
    pub shutdown_timeout: Duration,
}

fn default_sliding_window_size() -> u32 {
    DEFAULT_SLIDING_WINDOW_SIZE
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

impl ConnectorConfig {
    /// Sliding window size, clamped to `(0, 1000]`; out-of-range values fall
    /// back to the default rather than being rejected, matching the
    /// original's `SetSlidingWindowSize` behavior.
    pub fn sliding_window_size(&self) -> u32 {
        if self.sliding_window_size > 0 && self.sliding_window_size <= MAX_SLIDING_WINDOW_SIZE {
            self.sliding_window_size
        } else {
            DEFAULT_SLIDING_WINDOW_SIZE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_yaml() -> &'static str {
        r#"
router_uris:
  - "ws://localhost:9090/"
target_uri: "http://localhost:8080/"
target_service_name: "svc"
"#
    }

    #[test]
    fn applies_defaults() {
        let cfg: ConnectorConfig = serde_yaml::from_str(base_yaml()).unwrap();
        assert_eq!(cfg.sliding_window_size(), 2);
        assert_eq!(cfg.data_write_timeout, Duration::from_secs(30));
    }

    #[test]
    fn clamps_out_of_range_sliding_window_to_default() {
        let yaml = format!("{}\nsliding_window_size: 5000", base_yaml());
        let cfg: ConnectorConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.sliding_window_size(), 2);
    }

    #[test]
    fn keeps_in_range_sliding_window() {
        let yaml = format!("{}\nsliding_window_size: 8", base_yaml());
        let cfg: ConnectorConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.sliding_window_size(), 8);
    }
}
