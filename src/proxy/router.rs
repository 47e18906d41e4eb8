//! Host routing
//!
//! The first path segment names the backend. Anything else falls through
//! to the start page backend with the path left intact.

use crate::proxy::backend::BackendSet;

/// Outcome of routing one request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteResult {
    /// Backend name, possibly the start page
    pub backend: String,
    /// Path to forward, without leading slash; empty when nothing remains
    pub residual: String,
}

/// Map a request path to a backend name and the path left to forward.
///
/// `/` and the empty path go to `start_page` with an empty residual. When
/// the first segment is not a backend, the start page gets the whole path.
pub fn route(path: &str, backends: &BackendSet, start_page: &str) -> RouteResult {
    if path.is_empty() || path == "/" {
        return RouteResult {
            backend: start_page.to_string(),
            residual: String::new(),
        };
    }

    let without_first_slash = path.strip_prefix('/').unwrap_or(path);
    let (candidate, rest) = match without_first_slash.split_once('/') {
        Some((first, rest)) => (first, rest),
        None => (without_first_slash, ""),
    };

    let result = if backends.contains(candidate) {
        RouteResult {
            backend: candidate.to_string(),
            residual: rest.to_string(),
        }
    } else {
        RouteResult {
            backend: start_page.to_string(),
            residual: without_first_slash.to_string(),
        }
    };

    tracing::debug!(backend = %result.backend, path, "Host name parsed from URI");
    result
}
