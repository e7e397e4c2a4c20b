//! HTTP/HTTPS proxy implementation
//!
//! This module contains the listener, the per-connection handler and the
//! byte relays that carry allowed traffic.

pub mod handler;
pub mod relay;
pub mod request;
pub mod server;

pub use handler::{handle_connection, HandlerContext};
pub use request::{ProxyRequest, RequestError};
pub use server::{ConnectionCounters, ProxyServer};
