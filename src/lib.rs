//! # StudyGuard Proxy
//!
//! Forward proxy that decides, per destination, whether a client may reach it.
//! Plain HTTP requests and HTTPS `CONNECT` tunnels are checked against a
//! blocklist fetched periodically from a management backend; every decision is
//! reported back to that backend asynchronously.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐    ┌───────────────────────────────────────────────┐    ┌──────────┐
//! │  Client  │───▶│  Listener ─▶ Connection Handler ─▶ Relay      │───▶│  Origin  │
//! └──────────┘    │                 │          │                  │    └──────────┘
//!                 │                 ▼          ▼                  │
//!                 │        Blocklist Cache   Log Dispatcher       │
//!                 └─────────────▲──────────────────┬──────────────┘
//!                               │ GET /blocked-sites│ POST /logs
//!                        ┌──────┴──────────────────▼──────┐
//!                        │       Management backend        │
//!                        └─────────────────────────────────┘
//! ```
//!
//! TLS inside tunnels is never inspected, and each plain HTTP connection
//! carries exactly one request/response exchange.

pub mod api;
pub mod blocklist;
pub mod config;
pub mod dispatch;
pub mod models;
pub mod proxy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
