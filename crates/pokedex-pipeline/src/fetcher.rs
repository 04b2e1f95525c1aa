//! Fetch-and-stage unit of the fan-out
//!
//! Transient failures are retried locally with exponential backoff; a
//! retry that eventually succeeds never surfaces to the orchestrator.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

use crate::catalog::CatalogClient;
use crate::config::FetchConfig;
use crate::error::{FetchError, FetchTaskError};
use crate::model::{CatalogReference, DetailRecord};
use crate::staging::StagingStore;

/// Longest wait between two attempts
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// How often and how patiently transient failures are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Wait before the first retry
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Wait before retry number `retry` (1-based): base, 2x base, 4x base, ...
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_backoff
            .checked_mul(factor)
            .map_or(MAX_RETRY_BACKOFF, |d| d.min(MAX_RETRY_BACKOFF))
    }
}

impl From<&FetchConfig> for RetryPolicy {
    fn from(config: &FetchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: config.retry_backoff,
        }
    }
}

/// Fetches one reference's detail document and stages it
pub struct DetailFetcher {
    client: Arc<dyn CatalogClient>,
    staging: StagingStore,
    policy: RetryPolicy,
    throttle_interval: Duration,
}

impl DetailFetcher {
    pub fn new(
        client: Arc<dyn CatalogClient>,
        staging: StagingStore,
        policy: RetryPolicy,
        throttle_interval: Duration,
    ) -> Self {
        Self {
            client,
            staging,
            policy,
            throttle_interval,
        }
    }

    /// Fetch the detail document, retrying transient failures
    pub async fn fetch(&self, reference: &CatalogReference) -> Result<DetailRecord, FetchTaskError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(entity_id = reference.id, attempt, "Fetching detail");

            match self.client.fetch_detail(reference).await {
                Ok(record) if record.id != reference.id => {
                    return Err(FetchTaskError::Permanent(format!(
                        "detail document at {} has id {}, expected {}",
                        reference.locator, record.id, reference.id
                    )));
                },
                Ok(record) => return Ok(record),
                Err(FetchError::Permanent(message)) => {
                    return Err(FetchTaskError::Permanent(message));
                },
                Err(FetchError::Transient(message)) => {
                    if attempt > self.policy.max_retries {
                        return Err(FetchTaskError::RetriesExhausted {
                            attempts: attempt,
                            last_error: message,
                        });
                    }

                    let delay = self.policy.backoff(attempt);
                    warn!(
                        entity_id = reference.id,
                        attempt,
                        max_attempts = self.policy.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient fetch failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }

    /// Write the record to staging under its id
    pub async fn stage(&self, record: &DetailRecord) -> Result<(), FetchTaskError> {
        self.staging.put(record.id, record).await?;
        Ok(())
    }

    /// Fetch then stage; re-running for the same reference overwrites the
    /// same staged document
    #[instrument(skip(self, reference), fields(entity_id = reference.id, name = %reference.name))]
    pub async fn fetch_and_stage(&self, reference: &CatalogReference) -> Result<(), FetchTaskError> {
        let result = async {
            let record = self.fetch(reference).await?;
            self.stage(&record).await
        }
        .await;

        if let Err(ref e) = result {
            error!(entity_id = reference.id, error = %e, "Detail task failed");
        }
        result
    }

    /// Spacing a worker keeps after each fetch before starting the next
    pub async fn pace(&self) {
        if !self.throttle_interval.is_zero() {
            tokio::time::sleep(self.throttle_interval).await;
        }
    }
}
