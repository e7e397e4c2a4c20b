//! Data models for the proxy
//!
//! These models are shared between the connection handlers and the log
//! dispatcher.

pub mod outcome;

pub use outcome::*;
