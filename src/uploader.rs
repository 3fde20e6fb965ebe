//! Delivery of merged batches to the ingestion backend.

use async_trait::async_trait;
use log::{debug, info};

use crate::batch::Batch;
use crate::error::{BudsError, Result};

/// Destination for finished batches.
///
/// The coordinator awaits each send before scheduling the next window, logs
/// any error, and never retries.
#[async_trait]
pub trait BatchSink: Send + Sync + 'static {
    async fn send(&self, batch: &Batch) -> Result<()>;
}

/// POSTs batches as JSON to the bulk ingestion endpoint.
///
/// No timeout and no auth header: a slow backend simply delays the next
/// collection window.
pub struct HttpUploader {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpUploader {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl BatchSink for HttpUploader {
    async fn send(&self, batch: &Batch) -> Result<()> {
        let payload = batch.to_payload();
        info!("Sending {} EEG records to backend …", payload.records.len());
        if let Some(first) = payload.records.first() {
            debug!(
                "First record: index={} ts={} eeg={:?} duration={}",
                first.sample_index, first.timestamp, first.eeg, payload.duration
            );
        }

        let response = self.client.post(&self.endpoint).json(&payload).send().await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            debug!("Backend rejected batch ({status}): {body}");
            return Err(BudsError::HttpStatus {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("unknown").to_string(),
            });
        }

        debug!("Backend accepted batch: {body}");
        Ok(())
    }
}
