//! HTTP server and configuration

pub mod config;
pub mod http;

pub use config::{Config, DEFAULT_ADDR, DEFAULT_CONTENT_TYPE, DEFAULT_PATH};
pub use http::StreamServer;
