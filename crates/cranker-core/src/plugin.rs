//! Extension points for the reverse-proxy request path.
//!
//! Both plugin kinds are modeled as a plain `Vec<Arc<dyn Trait>>` run in
//! registration order, rather than a dynamic capability registry: the set of
//! interceptors a deployment wants is known at startup, not discovered at
//! runtime.

use crate::error::CrankerResult;

/// Runs before a request frame is sent to the connector; may rewrite headers
/// in place (e.g. to inject a correlation id or strip an internal header).
pub trait ProxyInterceptor: Send + Sync {
    /// Called with the outbound method, destination, and mutable header
    /// lines (`"Name:Value"`) just before the request frame is built.
    fn apply_on_request(&self, method: &str, dest: &str, headers: &mut Vec<String>) -> CrankerResult<()>;
}

/// Runs on a router socket after a response frame has been parsed, before it
/// is written to the client (e.g. to strip or rewrite response headers).
pub trait RouterSocketPlugin: Send + Sync {
    fn handle_after_response_received(&self, status: u16, headers: &mut Vec<String>);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AddHeader;
    impl ProxyInterceptor for AddHeader {
        fn apply_on_request(&self, _method: &str, _dest: &str, headers: &mut Vec<String>) -> CrankerResult<()> {
            headers.push("X-Injected:1".to_string());
            Ok(())
        }
    }

    #[test]
    fn interceptor_mutates_headers() {
        let mut headers = vec![];
        AddHeader.apply_on_request("GET", "/x", &mut headers).unwrap();
        assert_eq!(headers, vec!["X-Injected:1".to_string()]);
    }
}
