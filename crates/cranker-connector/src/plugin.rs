//! Connector-side extension hooks, run around the target HTTP call.
//!
//! A plugin may attach an opaque "stat carrier" at the before-request stage
//! (e.g. to start a timer) which is threaded back to its own after-response
//! call so it can close out what it started. Carriers are per-request and
//! per-plugin; a plugin failing its hook aborts only that hook chain for that
//! one request, never the socket.

use std::any::Any;

use cranker_core::protocol::{CrankerRequest, CrankerResponse};

/// Opaque per-request state a plugin may stash between its two hooks.
pub trait StatCarrier: Any + Send {
    fn close(self: Box<Self>) {}
}

/// A no-op carrier for plugins that don't need cross-hook state.
pub struct NoopCarrier;
impl StatCarrier for NoopCarrier {}

pub trait ConnectorPlugin: Send + Sync {
    /// Called just before the target HTTP request is built. May return a
    /// carrier to be handed back at the after-response stage.
    fn handle_before_request_sent(
        &self,
        request: &CrankerRequest,
    ) -> Result<Box<dyn StatCarrier>, String> {
        let _ = request;
        Ok(Box::new(NoopCarrier))
    }

    /// Called after the target response has been parsed into a cranker
    /// response frame, with whatever carrier the before-hook produced.
    fn handle_after_response_received(
        &self,
        response: &CrankerResponse,
        carrier: Box<dyn StatCarrier>,
    ) -> Result<(), String> {
        let _ = response;
        carrier.close();
        Ok(())
    }
}
