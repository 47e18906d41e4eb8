//! Reverse proxy functionality
//!
//! Routing by first path segment, per-backend transports (direct or over
//! SSH), request forwarding, and response rewriting, tied together by the
//! gateway handler.

pub mod backend;
pub mod gateway;
pub mod rewrite;
pub mod router;
pub mod transport;
pub mod tunnel;
pub mod upstream;

pub use backend::{Backend, BackendSet};
pub use gateway::Gateway;
pub use router::{RouteResult, route};
pub use upstream::{CapturedResponse, ReverseProxy};
