//! Connection outcome model
//!
//! The allow/block decision recorded for one proxied connection. Serializes to
//! the body the management backend expects on `POST /logs`.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Decision taken for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeStatus {
    Allowed,
    Blocked,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Allowed => "ALLOWED",
            OutcomeStatus::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents the decision for a single accepted connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOutcome {
    /// Target host as requested by the client
    pub domain: String,
    pub status: OutcomeStatus,
    /// When the decision was taken (RFC 3339, local offset)
    pub timestamp: DateTime<Local>,
}

impl ConnectionOutcome {
    /// Create an outcome stamped with the current time
    pub fn new(domain: impl Into<String>, status: OutcomeStatus) -> Self {
        Self {
            domain: domain.into(),
            status,
            timestamp: Local::now(),
        }
    }

    pub fn allowed(domain: impl Into<String>) -> Self {
        Self::new(domain, OutcomeStatus::Allowed)
    }

    pub fn blocked(domain: impl Into<String>) -> Self {
        Self::new(domain, OutcomeStatus::Blocked)
    }
}
