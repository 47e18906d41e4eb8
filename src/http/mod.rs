//! HTTP/1.1 wire handling.
//!
//! A small HTTP/1.1 server and codec with keep-alive support. The
//! gateway uses the same primitives in both directions: parsing client
//! requests and writing responses here, talking to backends in
//! [`crate::proxy::upstream`].
//!
//! Requests are read into a buffer until [`parser::parse_http_request`]
//! yields a complete message, handed to the gateway, and the response is
//! written back before the next request on the same connection is read:
//!
//! ```text
//!   Reading ──request──▶ Proxying ──response──▶ Responding
//!      ▲                                            │
//!      └────────────── keep-alive ──────────────────┤
//!                                                   └── close ──▶ Closed
//! ```
//!
//! A malformed request skips `Proxying` and gets a 400 before the
//! connection closes.

pub mod chunked;
pub mod connection;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
