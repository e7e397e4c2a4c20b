//! Outcome delivery targets

use crate::models::ConnectionOutcome;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Failure delivering one outcome; always treated as retriable
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("log request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("log endpoint returned HTTP {0}")]
    Status(u16),
}

/// Somewhere outcomes are delivered to
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn deliver(&self, outcome: &ConnectionOutcome) -> Result<(), DeliveryError>;
}

/// POSTs each outcome as JSON to the backend's `/logs` endpoint
pub struct HttpLogSink {
    client: reqwest::Client,
    url: String,
}

impl HttpLogSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        // Bypass any configured proxy, including this one
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl OutcomeSink for HttpLogSink {
    async fn deliver(&self, outcome: &ConnectionOutcome) -> Result<(), DeliveryError> {
        let response = self.client.post(&self.url).json(outcome).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(DeliveryError::Status(status.as_u16()));
        }
        Ok(())
    }
}
