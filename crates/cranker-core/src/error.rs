//! Unified error types shared by the router and the connector.
//!
//! Every variant carries a fixed HTTP status / WebSocket close-code mapping,
//! per the protocol's error taxonomy.

use thiserror::Error;

/// Errors that can occur while framing or parsing a cranker protocol message.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// The `CrankerProtocol` handshake header carried an unsupported version.
    #[error("unsupported cranker protocol version: {0}")]
    InvalidVersion(String),

    /// A text frame did not parse as a well-formed request or response message.
    #[error("malformed cranker message: {0}")]
    Malformed(String),

    /// The end-marker on a request message was not one of `_1`, `_2`, `_3`.
    #[error("unknown end marker: {0}")]
    UnknownEndMarker(String),
}

/// Errors surfaced while acquiring or maintaining a socket queue.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// No live socket became available before the acquire deadline.
    #[error("timed out waiting for an idle socket")]
    AcquireTimeout,

    /// No queue (per-route or catch-all) exists for the requested route.
    #[error("no route registered for '{0}'")]
    NoRoute(String),
}

/// Top-level error taxonomy for one proxied HTTP exchange.
///
/// Each variant has a single, fixed mapping to an HTTP status code or a
/// WebSocket close code, listed in the doc comment.
#[derive(Debug, Clone, Error)]
pub enum CrankerError {
    /// Handshake protocol version mismatch. Maps to HTTP 500.
    #[error("invalid protocol version: {0}")]
    InvalidProtocolVersion(String),

    /// Remote address failed the IP allow-list check. Maps to HTTP 403.
    #[error("ip not allowed: {0}")]
    IpNotAllowed(String),

    /// No connector is registered for the requested route. Maps to HTTP 404.
    #[error("no route: {0}")]
    NoRoute(String),

    /// A route exists but no idle socket arrived before the deadline. Maps to HTTP 503.
    #[error("timed out acquiring a socket for route '{0}'")]
    AcquireTimeout(String),

    /// The connector-side target call exceeded its deadline. Maps to HTTP 504.
    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Any other connector/transport failure while proxying. Maps to HTTP 502.
    #[error("upstream bad gateway: {0}")]
    UpstreamBadGateway(String),

    /// The client disconnected before the exchange completed. Maps to close code 1001.
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// An unexpected internal failure. Maps to close code 1011, carries an `ErrorID`.
    #[error("internal error [{error_id}]: {reason}")]
    InternalError {
        /// Opaque id surfaced in the WebSocket close reason for correlation.
        error_id: uuid::Uuid,
        reason: String,
    },
}

impl CrankerError {
    /// Creates an [`CrankerError::InternalError`] with a freshly generated error id.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::InternalError {
            error_id: uuid::Uuid::new_v4(),
            reason: reason.into(),
        }
    }

    /// The HTTP status code a router should answer the client with, if the
    /// response has not already been committed.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidProtocolVersion(_) => 500,
            Self::IpNotAllowed(_) => 403,
            Self::NoRoute(_) => 404,
            Self::AcquireTimeout(_) => 503,
            Self::UpstreamTimeout(_) => 504,
            Self::UpstreamBadGateway(_) => 502,
            Self::Cancelled(_) => 499,
            Self::InternalError { .. } => 500,
        }
    }

    /// The WebSocket close code a connector socket should use when failing a
    /// request of this kind, if applicable.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Cancelled(_) => 1001,
            Self::InternalError { .. } => 1011,
            _ => 1000,
        }
    }
}

impl From<ProtocolError> for CrankerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidVersion(v) => Self::InvalidProtocolVersion(v),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<QueueError> for CrankerError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::AcquireTimeout => Self::AcquireTimeout(String::new()),
            QueueError::NoRoute(route) => Self::NoRoute(route),
        }
    }
}

/// Maps a WebSocket close code observed on a router socket to the HTTP status
/// the router should answer the still-pending client with.
///
/// `1000` (normal close) means the response was already flushed to the client
/// and there is nothing left for the caller to write; callers should treat
/// that case separately rather than calling this function.
pub fn close_code_to_http_status(code: u16) -> u16 {
    match code {
        1011 => 502,
        1008 => 400,
        _ => 502,
    }
}

/// Result type for protocol codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Result type for socket-queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Result type for a full proxied exchange.
pub type CrankerResult<T> = Result<T, CrankerError>;
