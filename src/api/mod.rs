//! HTTP API Module
//!
//! Provides a read-only REST API for controller status.

mod http;

pub use http::HttpServer;
