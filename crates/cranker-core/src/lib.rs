//! Shared primitives for the cranker reverse-tunneling proxy: the wire
//! protocol codec, the error taxonomy, the socket queue, route derivation,
//! connection counters, config loading and plugin extension points used by
//! both the router and the connector crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod plugin;
pub mod protocol;
pub mod queue;
pub mod route;

pub use error::{CrankerError, CrankerResult};
pub use monitor::ConnectionMonitor;
pub use queue::{QueueItem, SocketQueue};
