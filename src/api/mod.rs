//! Public API for embedding and running the proxy

pub mod proxy_api;

pub use proxy_api::*;
