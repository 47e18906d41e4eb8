//! HTTP/SSH gateway
//!
//! Multiplexes requests across named backends by first path segment,
//! reaches backends directly or through SSH tunnels, and rewrites HTML
//! responses so links keep resolving through the gateway.

pub mod config;
pub mod error;
pub mod http;
pub mod proxy;
pub mod server;
