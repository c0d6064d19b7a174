//! Per-router-URI idle-socket counters, used to decide whether the pool is
//! allowed to dial a replacement after a socket is consumed.

use std::sync::atomic::{AtomicI32, Ordering};

use dashmap::DashMap;

/// Tracks how many idle sockets currently exist for each router registration
/// URI, and enforces the sliding-window slack.
///
/// `max_sliding_window_size = 2 * slidingWindowSize`: the factor of two
/// tolerates the race between a socket being consumed (decrement) and its
/// replacement being added (increment) happening on different tasks.
pub struct WebsocketClientFarm {
    max_sliding_window_size: i32,
    counts: DashMap<String, AtomicI32>,
}

impl WebsocketClientFarm {
    pub fn new(sliding_window_size: i32) -> Self {
        Self {
            max_sliding_window_size: sliding_window_size * 2,
            counts: DashMap::new(),
        }
    }

    pub fn add_websocket(&self, register_url: &str) {
        self.counts
            .entry(register_url.to_string())
            .or_insert_with(|| AtomicI32::new(0))
            .fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove_websocket(&self, register_url: &str) {
        if let Some(counter) = self.counts.get(register_url) {
            counter.fetch_add(-1, Ordering::AcqRel);
        }
    }

    /// A deregister dial is never considered "safe to add" (it is an
    /// explicit drain, not a replacement), and a replacement is only safe
    /// while the idle count stays below the slack ceiling.
    pub fn is_safe_to_add_websocket(&self, register_url: &str, is_deregister_path: bool) -> bool {
        if is_deregister_path {
            return false;
        }
        let idle = self
            .counts
            .get(register_url)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0);
        self.max_sliding_window_size > idle
    }

    pub fn to_map(&self) -> std::collections::HashMap<String, i32> {
        self.counts
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Acquire)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_idle_count_per_uri() {
        let farm = WebsocketClientFarm::new(2);
        farm.add_websocket("ws://router/register/");
        farm.add_websocket("ws://router/register/");
        assert_eq!(farm.to_map()["ws://router/register/"], 2);
        farm.remove_websocket("ws://router/register/");
        assert_eq!(farm.to_map()["ws://router/register/"], 1);
    }

    #[test]
    fn refuses_to_add_past_slack_ceiling() {
        let farm = WebsocketClientFarm::new(2); // ceiling = 4
        for _ in 0..4 {
            farm.add_websocket("u");
        }
        assert!(!farm.is_safe_to_add_websocket("u", false));
    }

    #[test]
    fn deregister_path_is_never_safe_to_add() {
        let farm = WebsocketClientFarm::new(2);
        assert!(!farm.is_safe_to_add_websocket("u", true));
    }
}
