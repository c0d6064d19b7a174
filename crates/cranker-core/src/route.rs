//! Route derivation: the first path segment of a client URL selects a
//! connector pool; an empty segment maps to the catch-all route.

/// Sentinel route used when the client's path has no leading segment.
pub const CATCH_ALL_ROUTE: &str = "*";

/// Derives the route key from a request path (e.g. `/svc/ping` -> `svc`).
pub fn route_for_path(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split('/').next() {
        Some(segment) if !segment.is_empty() => segment.to_string(),
        _ => CATCH_ALL_ROUTE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_segment() {
        assert_eq!(route_for_path("/svc/ping"), "svc");
        assert_eq!(route_for_path("svc/ping"), "svc");
        assert_eq!(route_for_path("/svc"), "svc");
    }

    #[test]
    fn empty_path_is_catch_all() {
        assert_eq!(route_for_path("/"), CATCH_ALL_ROUTE);
        assert_eq!(route_for_path(""), CATCH_ALL_ROUTE);
    }
}
