//! Read-write health probe.
//!
//! The probe writes a marker document into its own partition and reads it
//! back through the same client the adapter uses, so it fails exactly when
//! resource reads and writes would.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancel::CancellationSignal;
use crate::client::{DocumentClient, DocumentClientError, WriteCondition};
use crate::error::{StoreError, StoreResult};

/// Partition and document id of the probe document.
pub const HEALTH_CHECK_DOCUMENT_ID: &str = "__healthcheck__";

/// Outcome of a health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// The write and the read both succeeded.
    Healthy {
        /// Time taken by the round trip.
        elapsed: Duration,
    },
    /// The store could not serve the probe.
    Unhealthy {
        /// Why the probe failed.
        reason: String,
    },
}

impl HealthStatus {
    /// Returns true if the probe succeeded.
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy { .. })
    }
}

/// Checks a collection with one write and one read.
#[derive(Debug, Clone)]
pub struct ReadWriteHealthProbe {
    client: Arc<dyn DocumentClient>,
    collection: String,
}

impl ReadWriteHealthProbe {
    /// Creates a probe for `collection`.
    pub fn new(client: Arc<dyn DocumentClient>, collection: impl Into<String>) -> Self {
        Self {
            client,
            collection: collection.into(),
        }
    }

    /// Runs the probe.
    ///
    /// Store failures are reported as [`HealthStatus::Unhealthy`]; only
    /// cancellation is returned as an error.
    pub async fn check(&self, cancel: &CancellationSignal) -> StoreResult<HealthStatus> {
        let started = Instant::now();
        let token = Uuid::new_v4().to_string();

        match cancel.run(self.round_trip(&token)).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                debug!(
                    collection = %self.collection,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "health check passed"
                );
                Ok(HealthStatus::Healthy { elapsed })
            }
            Err(StoreError::Cancelled) => Err(StoreError::Cancelled),
            Err(err) => {
                warn!(collection = %self.collection, error = %err, "health check failed");
                Ok(HealthStatus::Unhealthy {
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn round_trip(&self, token: &str) -> StoreResult<()> {
        let document = json!({
            "id": HEALTH_CHECK_DOCUMENT_ID,
            "partitionKey": HEALTH_CHECK_DOCUMENT_ID,
            "token": token,
            "checkedAt": Utc::now(),
        });

        self.client
            .write_document(
                &self.collection,
                HEALTH_CHECK_DOCUMENT_ID,
                document,
                WriteCondition::None,
            )
            .await?;

        let stored = self
            .client
            .read_document(
                &self.collection,
                HEALTH_CHECK_DOCUMENT_ID,
                HEALTH_CHECK_DOCUMENT_ID,
            )
            .await?;

        match stored {
            Some(stored) if stored.body.get("token").and_then(|t| t.as_str()) == Some(token) => {
                Ok(())
            }
            Some(_) => Err(StoreError::Fatal(DocumentClientError::Internal(
                "health check read returned a different document".to_string(),
            ))),
            None => Err(StoreError::Fatal(DocumentClientError::Internal(
                "health check document was not readable after write".to_string(),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::InMemoryDocumentClient;

    #[tokio::test]
    async fn test_healthy_store() {
        let client = Arc::new(InMemoryDocumentClient::new());
        let probe = ReadWriteHealthProbe::new(client.clone(), "fhir");

        let status = probe.check(&CancellationSignal::new()).await.unwrap();
        assert!(status.is_healthy());
        assert_eq!(client.round_trips(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_store_is_unhealthy() {
        let client = Arc::new(InMemoryDocumentClient::new());
        client.fail_next(DocumentClientError::Unavailable("maintenance".to_string()));
        let probe = ReadWriteHealthProbe::new(client, "fhir");

        let status = probe.check(&CancellationSignal::new()).await.unwrap();
        assert!(!status.is_healthy());
    }

    #[tokio::test]
    async fn test_cancelled_probe_is_an_error() {
        let probe = ReadWriteHealthProbe::new(Arc::new(InMemoryDocumentClient::new()), "fhir");
        let cancel = CancellationSignal::new();
        cancel.cancel();

        assert!(matches!(
            probe.check(&cancel).await,
            Err(StoreError::Cancelled)
        ));
    }
}
