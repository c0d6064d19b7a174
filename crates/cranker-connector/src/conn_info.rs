//! Per-socket-slot connection bookkeeping: which router URI and slot index a
//! socket occupies, and the exponential-backoff state for reconnecting it.

use std::sync::atomic::{AtomicI64, Ordering};

use url::Url;

/// Reconnect delay formula: `500 * min(10000, 2^attempt)` milliseconds.
fn retry_after_millis(attempts: i64) -> i64 {
    let factor = 2f64.powi(attempts as i32).min(10_000.0);
    (500.0 * factor) as i64
}

/// Tracks one pooled slot's router URI, index, and reconnect-attempt count.
pub struct ConnectionInfo {
    pub router_uri: Url,
    pub slot_index: usize,
    attempts: AtomicI64,
}

impl ConnectionInfo {
    pub fn new(router_uri: Url, slot_index: usize) -> Self {
        Self {
            router_uri,
            slot_index,
            attempts: AtomicI64::new(0),
        }
    }

    pub fn on_connected_successfully(&self) {
        self.attempts.store(0, Ordering::Release);
    }

    pub fn on_connection_starting(&self) {
        self.attempts.fetch_add(1, Ordering::AcqRel);
    }

    pub fn retry_after_millis(&self) -> i64 {
        retry_after_millis(self.attempts.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let mut prev = 0;
        for attempts in 0..20 {
            let delay = retry_after_millis(attempts);
            assert!(delay >= prev);
            prev = delay;
        }
        assert_eq!(retry_after_millis(20), 500 * 10_000);
    }

    #[test]
    fn resets_on_success() {
        let info = ConnectionInfo::new(Url::parse("ws://localhost:9000/").unwrap(), 0);
        info.on_connection_starting();
        info.on_connection_starting();
        assert!(info.retry_after_millis() > 500);
        info.on_connected_successfully();
        assert_eq!(info.retry_after_millis(), 500);
    }
}
