//! # trellis
//!
//! HTTP server and CLI over the `trellis-core` engine.
//!
//! Exposed as a library so the integration tests can build the router
//! without binding a socket.

pub mod api;
pub mod cli;
