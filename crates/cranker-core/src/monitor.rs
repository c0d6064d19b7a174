//! Connection counters shared by router and connector, published to a list
//! of pluggable [`DataPublishHandler`]s (e.g. a metrics exporter an embedder
//! wires in). Mutation is lock-free; handlers are invoked synchronously and
//! must not block the request path.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tracing::info;

/// Sink for a single metric data point. Implementations must be fast and
/// non-blocking; this is called on every connection state transition.
pub trait DataPublishHandler: Send + Sync {
    fn publish(&self, key: &str, value: i64);
}

impl<F> DataPublishHandler for F
where
    F: Fn(&str, i64) + Send + Sync,
{
    fn publish(&self, key: &str, value: i64) {
        self(key, value)
    }
}

/// Tracks in-flight request count and idle-connection count, fanning out
/// every change to the registered handlers.
#[derive(Default)]
pub struct ConnectionMonitor {
    request_num: AtomicI32,
    available_conns: AtomicI32,
    handlers: Vec<Arc<dyn DataPublishHandler>>,
}

impl ConnectionMonitor {
    pub fn new(handlers: Vec<Arc<dyn DataPublishHandler>>) -> Self {
        Self {
            request_num: AtomicI32::new(0),
            available_conns: AtomicI32::new(0),
            handlers,
        }
    }

    /// Called when a request begins being proxied.
    pub fn on_connection_started(&self, path: &str, router_socket_id: &str) {
        let active = self.request_num.fetch_add(1, Ordering::AcqRel) + 1;
        self.report_conn_count(active);
        let path = if path.is_empty() { "default" } else { path };
        info!(active_connections = active, router_name = path, router_socket_id, "connection started");
    }

    /// Called when a request finishes, with the metrics the original source
    /// publishes per path: request bytes, duration, response status, response bytes.
    pub fn on_connection_ended(
        &self,
        router_socket_id: &str,
        path: &str,
        req_component_name: &str,
        resp_status: u16,
        req_duration_ms: i64,
        req_bytes: i64,
        resp_bytes: i64,
    ) {
        let active = self.request_num.fetch_add(-1, Ordering::AcqRel) - 1;
        let path = if path.is_empty() { "default" } else { path };
        for handler in &self.handlers {
            handler.publish("connections", active as i64);
            handler.publish(&format!("request.requestBytes,path={path}"), req_bytes);
            handler.publish(&format!("request.duration,path={path}"), req_duration_ms);
            handler.publish(&format!("request.responseStatus,path={path}"), resp_status as i64);
            handler.publish(&format!("request.responseBytes,path={path}"), resp_bytes);
        }
        info!(
            active_connections = active,
            router_name = path,
            router_socket_id,
            request_component_name = req_component_name,
            "connection ended"
        );
    }

    /// Called by the connector pool when a new idle socket becomes available.
    pub fn on_connection_available(&self) {
        let n = self.available_conns.fetch_add(1, Ordering::AcqRel) + 1;
        self.report_available_count(n);
    }

    /// Called by the connector when an idle socket is consumed by a request.
    pub fn on_connection_consumed(&self) {
        let n = self.available_conns.fetch_add(-1, Ordering::AcqRel) - 1;
        self.report_available_count(n);
    }

    pub fn report_websocket_pool_size(&self, size: usize) {
        for handler in &self.handlers {
            handler.publish("websocket.pool.size", size as i64);
        }
    }

    pub fn connection_count(&self) -> i32 {
        self.request_num.load(Ordering::Acquire)
    }

    pub fn available_conns(&self) -> i32 {
        self.available_conns.load(Ordering::Acquire)
    }

    fn report_conn_count(&self, active: i32) {
        for handler in &self.handlers {
            handler.publish("connections", active as i64);
        }
    }

    fn report_available_count(&self, n: i32) {
        for handler in &self.handlers {
            handler.publish("availableConnections", n as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn tracks_connection_count() {
        let published = Arc::new(Mutex::new(Vec::new()));
        let captured = published.clone();
        let handler: Arc<dyn DataPublishHandler> = Arc::new(move |k: &str, v: i64| {
            captured.lock().unwrap().push((k.to_string(), v));
        });
        let monitor = ConnectionMonitor::new(vec![handler]);
        monitor.on_connection_started("svc", "rs-1");
        assert_eq!(monitor.connection_count(), 1);
        monitor.on_connection_ended("rs-1", "svc", "", 200, 5, 0, 11);
        assert_eq!(monitor.connection_count(), 0);
        assert!(published.lock().unwrap().iter().any(|(k, _)| k == "connections"));
    }

    #[test]
    fn tracks_available_conns() {
        let monitor = ConnectionMonitor::new(vec![]);
        monitor.on_connection_available();
        monitor.on_connection_available();
        assert_eq!(monitor.available_conns(), 2);
        monitor.on_connection_consumed();
        assert_eq!(monitor.available_conns(), 1);
    }
}
