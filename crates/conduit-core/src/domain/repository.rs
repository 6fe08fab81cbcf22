//! Ports of the Conduit engine
//!
//! This module defines the traits the engine consumes: persistence of flow
//! instances and idempotency records, the inbound event bus and the timer.
//! External crates implement them to provide different infrastructure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;

use super::flow_instance::{FlowId, FlowInstance, FlowInstanceId, FlowStatus};
use super::step::ExecutionRecord;
use crate::CoreError;

/// Repository for flow instances
#[async_trait]
pub trait FlowInstanceRepository: Send + Sync {
    /// Find a flow instance by ID
    async fn find_by_id(&self, id: &FlowInstanceId) -> Result<Option<FlowInstance>, CoreError>;

    /// Save a flow instance if the stored version still equals `instance.version`
    ///
    /// Returns the new version. A stale version yields `ConcurrencyConflict`.
    async fn save(&self, instance: &FlowInstance) -> Result<u64, CoreError>;

    /// Delete a flow instance
    async fn delete(&self, id: &FlowInstanceId) -> Result<(), CoreError>;

    /// Paused instances with a signal set waiting for `event_name`
    async fn find_awaiting_event(&self, event_name: &str) -> Result<Vec<FlowInstance>, CoreError>;

    /// List flow instances with optional filters
    async fn list_instances(
        &self,
        flow_id: Option<&FlowId>,
        status: Option<FlowStatus>,
    ) -> Result<Vec<FlowInstance>, CoreError>;
}

/// Outcome of claiming an idempotency key
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller now owns the key
    Acquired,
    /// Another owner holds an unexpired claim
    Held {
        /// Current owner token
        owner: String,
    },
    /// A result is already stored under the key
    Completed(ExecutionRecord),
}

/// Store of idempotency keys and their results
#[async_trait]
pub trait IdempotencyRepository: Send + Sync {
    /// Stored record for `key`, if any
    async fn find_record(&self, key: &str) -> Result<Option<ExecutionRecord>, CoreError>;

    /// Claim `key` for `owner`; a claim older than `ttl` may be taken over
    async fn claim_idempotency_key(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, CoreError>;

    /// Store `record` under `key` only if `owner` still holds the claim
    async fn compare_and_swap_idempotency_key(
        &self,
        key: &str,
        owner: &str,
        record: ExecutionRecord,
    ) -> Result<bool, CoreError>;

    /// Drop the claim of `owner` without storing a result
    async fn release_idempotency_key(&self, key: &str, owner: &str) -> Result<(), CoreError>;
}

/// A named external event, typically a provider webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Event name
    pub name: String,
    /// Event payload
    pub payload: Value,
    /// When the event was received
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    /// An event received now
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Delivery of inbound events to the resume coordinator
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to every subscriber
    async fn publish(&self, event: InboundEvent) -> Result<(), CoreError>;

    /// Subscribe to events published from now on
    fn subscribe(&self) -> broadcast::Receiver<InboundEvent>;
}

/// Clock and tick source for timeouts
#[async_trait]
pub trait Timer: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;

    /// Wait for the next tick
    async fn tick(&self);
}
