//! cors-relay: transparent HTTP forwarding gateway.
//!
//! A request to `/<absolute-url>` is replayed against that URL with
//! policy-adjusted headers, and the response is streamed back with
//! `Access-Control-Allow-Origin: *`.

pub mod config;
pub mod error;
pub mod headers;
pub mod proxy;
pub mod server;
pub mod target;
