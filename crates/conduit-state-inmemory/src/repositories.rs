use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use conduit_core::{
    ClaimOutcome, CoreError, ExecutionRecord, FlowId, FlowInstance, FlowInstanceId,
    FlowInstanceRepository, FlowStatus, IdempotencyRepository,
};

/// In-memory implementation of the FlowInstanceRepository
pub struct InMemoryFlowInstanceRepository {
    instances: Arc<RwLock<HashMap<String, FlowInstance>>>,
}

impl InMemoryFlowInstanceRepository {
    /// Create a new in-memory flow instance repository
    pub fn new(instances: Arc<RwLock<HashMap<String, FlowInstance>>>) -> Self {
        Self { instances }
    }
}

#[async_trait]
impl FlowInstanceRepository for InMemoryFlowInstanceRepository {
    async fn find_by_id(&self, id: &FlowInstanceId) -> Result<Option<FlowInstance>, CoreError> {
        let instances = self.instances.read().await;
        Ok(instances.get(&id.0).cloned())
    }

    async fn save(&self, instance: &FlowInstance) -> Result<u64, CoreError> {
        let mut instances = self.instances.write().await;

        let stored_version = instances.get(&instance.id.0).map(|stored| stored.version);
        match stored_version {
            Some(version) if version != instance.version => {
                return Err(CoreError::ConcurrencyConflict(format!(
                    "Flow instance {} is at version {}, not {}",
                    instance.id, version, instance.version
                )));
            }
            None if instance.version != 0 => {
                return Err(CoreError::ConcurrencyConflict(format!(
                    "Flow instance {} was deleted",
                    instance.id
                )));
            }
            _ => {}
        }

        let mut stored = instance.clone();
        stored.version = instance.version + 1;
        stored.updated_at = Utc::now();
        let version = stored.version;
        instances.insert(instance.id.0.clone(), stored);

        debug!(flow_instance_id = %instance.id, version, status = ?instance.status, "Flow instance saved");
        Ok(version)
    }

    async fn delete(&self, id: &FlowInstanceId) -> Result<(), CoreError> {
        let mut instances = self.instances.write().await;
        instances.remove(&id.0);
        Ok(())
    }

    async fn find_awaiting_event(&self, event_name: &str) -> Result<Vec<FlowInstance>, CoreError> {
        let instances = self.instances.read().await;

        let mut result: Vec<FlowInstance> = instances
            .values()
            .filter(|instance| instance.status == FlowStatus::Paused)
            .filter(|instance| {
                instance
                    .pause
                    .as_ref()
                    .map(|pause| pause.awaits_event(event_name))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        result.sort_by_key(|instance| instance.created_at);
        Ok(result)
    }

    async fn list_instances(
        &self,
        flow_id: Option<&FlowId>,
        status: Option<FlowStatus>,
    ) -> Result<Vec<FlowInstance>, CoreError> {
        let instances = self.instances.read().await;

        let mut result: Vec<FlowInstance> = instances
            .values()
            .filter(|instance| {
                // Apply flow_id filter if present
                let flow_match = match flow_id {
                    Some(id) => instance.flow_id == *id,
                    None => true,
                };

                // Apply status filter if present
                let status_match = match status {
                    Some(s) => instance.status == s,
                    None => true,
                };

                flow_match && status_match
            })
            .cloned()
            .collect();
        result.sort_by_key(|instance| instance.created_at);
        Ok(result)
    }
}

/// State of one idempotency key
#[derive(Debug, Clone)]
pub enum IdempotencyEntry {
    /// An owner is executing the step
    Claimed {
        /// Owner token
        owner: String,
        /// When the claim may be taken over
        expires_at: Instant,
    },
    /// The step finished and its record is stored
    Completed(ExecutionRecord),
}

/// In-memory implementation of the IdempotencyRepository
pub struct InMemoryIdempotencyRepository {
    entries: Arc<RwLock<HashMap<String, IdempotencyEntry>>>,
}

impl InMemoryIdempotencyRepository {
    /// Create a new in-memory idempotency repository
    pub fn new(entries: Arc<RwLock<HashMap<String, IdempotencyEntry>>>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl IdempotencyRepository for InMemoryIdempotencyRepository {
    async fn find_record(&self, key: &str) -> Result<Option<ExecutionRecord>, CoreError> {
        let entries = self.entries.read().await;
        Ok(match entries.get(key) {
            Some(IdempotencyEntry::Completed(record)) => Some(record.clone()),
            _ => None,
        })
    }

    async fn claim_idempotency_key(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, CoreError> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();

        match entries.get(key) {
            Some(IdempotencyEntry::Completed(record)) => {
                return Ok(ClaimOutcome::Completed(record.clone()));
            }
            Some(IdempotencyEntry::Claimed {
                owner: holder,
                expires_at,
            }) if *expires_at > now && holder != owner => {
                return Ok(ClaimOutcome::Held {
                    owner: holder.clone(),
                });
            }
            Some(IdempotencyEntry::Claimed { owner: holder, .. }) if holder != owner => {
                debug!(idempotency_key = %key, previous_owner = %holder, "Taking over expired claim");
            }
            _ => {}
        }

        entries.insert(
            key.to_string(),
            IdempotencyEntry::Claimed {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(ClaimOutcome::Acquired)
    }

    async fn compare_and_swap_idempotency_key(
        &self,
        key: &str,
        owner: &str,
        record: ExecutionRecord,
    ) -> Result<bool, CoreError> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(IdempotencyEntry::Claimed { owner: holder, .. }) if holder == owner => {
                entries.insert(key.to_string(), IdempotencyEntry::Completed(record));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_idempotency_key(&self, key: &str, owner: &str) -> Result<(), CoreError> {
        let mut entries = self.entries.write().await;
        let held = matches!(
            entries.get(key),
            Some(IdempotencyEntry::Claimed { owner: holder, .. }) if holder == owner
        );
        if held {
            entries.remove(key);
        }
        Ok(())
    }
}
