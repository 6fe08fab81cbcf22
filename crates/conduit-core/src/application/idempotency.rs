//!
//! Idempotency gate
//! Guarantees that the body of an idempotent step runs at most once per key
//!

use crate::{
    domain::repository::{ClaimOutcome, IdempotencyRepository},
    domain::step::ExecutionRecord,
    CoreError,
};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Idempotency gate configuration
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// Age after which an unfinished claim may be taken over
    pub claim_ttl: Duration,

    /// Poll interval while another owner holds the claim
    pub poll_interval: Duration,

    /// Maximum wait for a claim held by another owner
    pub wait_timeout: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            claim_ttl: Duration::from_secs(60),
            poll_interval: Duration::from_millis(25),
            wait_timeout: Duration::from_secs(30),
        }
    }
}

/// What the gate did with an operation
#[derive(Debug)]
pub enum GateOutcome<T> {
    /// A result was already stored; the operation did not run
    Replayed(ExecutionRecord),
    /// The operation ran
    Executed(T),
}

/// Per-key at-most-once execution
///
/// Duplicates within this process queue on a per-key async lock; duplicates
/// in other processes are excluded by the store-level claim. Both converge on
/// the stored record.
pub struct IdempotencyGate {
    config: IdempotencyConfig,
    repository: Arc<dyn IdempotencyRepository>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IdempotencyGate {
    /// Create a new gate
    pub fn new(config: IdempotencyConfig, repository: Arc<dyn IdempotencyRepository>) -> Self {
        Self {
            config,
            repository,
            locks: DashMap::new(),
        }
    }

    /// Run `operation` unless a result is already stored under `key`
    ///
    /// The operation returns its value together with the record to store;
    /// `None` releases the claim without storing, so a later call runs again.
    pub async fn run<T, F, Fut>(&self, key: &str, operation: F) -> Result<GateOutcome<T>, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = (T, Option<ExecutionRecord>)>,
    {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let outcome = {
            let _guard = lock.lock().await;
            self.run_claimed(key, operation).await
        };

        // Only this call and the map hold the lock: nobody else is queued
        self.locks
            .remove_if(key, |_, entry| Arc::strong_count(entry) <= 2);
        outcome
    }

    async fn run_claimed<T, F, Fut>(&self, key: &str, operation: F) -> Result<GateOutcome<T>, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = (T, Option<ExecutionRecord>)>,
    {
        let owner = Uuid::new_v4().to_string();
        let started = Instant::now();

        loop {
            match self
                .repository
                .claim_idempotency_key(key, &owner, self.config.claim_ttl)
                .await?
            {
                ClaimOutcome::Acquired => break,
                ClaimOutcome::Completed(record) => {
                    info!(idempotency_key = %key, "Replaying stored result");
                    return Ok(GateOutcome::Replayed(record));
                }
                ClaimOutcome::Held { owner: holder } => {
                    if started.elapsed() >= self.config.wait_timeout {
                        return Err(CoreError::ConcurrencyConflict(format!(
                            "Idempotency key {} is still held by {}",
                            key, holder
                        )));
                    }
                    debug!(idempotency_key = %key, holder = %holder, "Waiting for claim holder");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        let (value, record) = operation().await;
        match record {
            Some(record) => {
                let stored = self
                    .repository
                    .compare_and_swap_idempotency_key(key, &owner, record)
                    .await?;
                if !stored {
                    warn!(
                        idempotency_key = %key,
                        "Claim expired before the result was stored"
                    );
                }
            }
            None => {
                debug!(idempotency_key = %key, "Releasing claim without storing a result");
                self.repository.release_idempotency_key(key, &owner).await?;
            }
        }
        Ok(GateOutcome::Executed(value))
    }

    /// Stored record for `key`, if any
    pub async fn lookup(&self, key: &str) -> Result<Option<ExecutionRecord>, CoreError> {
        self.repository.find_record(key).await
    }
}
