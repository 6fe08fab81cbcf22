use crate::{
    domain::flow_instance::FlowInstanceId, types::DataBag, CoreError, StepResult,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Control flags of a step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFlags {
    /// A failure fails the whole flow instance and cancels unstarted steps
    pub critical: bool,
    /// A failure is recorded but treated as resolved for dependents
    pub allow_failure: bool,
    /// The step runs concurrently with the other parallel members of its wavefront
    pub in_parallel: bool,
}

impl StepFlags {
    /// Flags of a critical step
    pub fn critical() -> Self {
        Self {
            critical: true,
            ..Self::default()
        }
    }

    /// Flags of a best-effort step
    pub fn allow_failure() -> Self {
        Self {
            allow_failure: true,
            ..Self::default()
        }
    }

    /// Flags of a parallel step
    pub fn parallel() -> Self {
        Self {
            in_parallel: true,
            ..Self::default()
        }
    }

    /// Failure tier implied by the flags
    pub fn tier(&self) -> FailureTier {
        if self.critical {
            FailureTier::Critical
        } else if self.allow_failure {
            FailureTier::AllowFailure
        } else {
            FailureTier::Default
        }
    }
}

/// How a step failure propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureTier {
    /// Fails the flow instance immediately
    Critical,
    /// Recorded and treated as resolved
    AllowFailure,
    /// Blocks transitive dependents only
    Default,
}

/// Terminal resolution of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The body (or a stored idempotent result) succeeded
    Succeeded,
    /// The body failed
    Failed,
    /// Skipped by a jump; counts as success for dependents
    Skipped,
    /// Not run because a dependency failed
    Blocked,
    /// Not run, or interrupted, because the flow was cancelled
    Cancelled,
}

/// Persisted outcome of one step (or branch) of a flow instance
///
/// Consulted on every re-entry before a body runs, and stored by the
/// idempotency gate for replay across instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Record name: the step name, `owner/branch/step` or `owner[item]`
    pub step: String,
    /// Terminal status
    pub status: StepStatus,
    /// Terminal result
    pub result: StepResult,
    /// Idempotency key the result was stored under
    pub idempotency_key: Option<String>,
    /// Data bag entries the step wrote
    #[serde(default)]
    pub outputs: DataBag,
    /// Jump requested by the step
    #[serde(default)]
    pub jump_to: Option<String>,
    /// When the record was created
    pub recorded_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Create a record without outputs
    pub fn new(step: impl Into<String>, status: StepStatus, result: StepResult) -> Self {
        Self {
            step: step.into(),
            status,
            result,
            idempotency_key: None,
            outputs: DataBag::new(),
            jump_to: None,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct Scratch {
    data: DataBag,
    changes: DataBag,
    jump_to: Option<String>,
}

/// Handle given to a step body
///
/// Reads see the data bag as it was when the step started plus the step's
/// own writes. Writes are merged into the flow instance when the step
/// resolves. Clones share the same scratch space.
#[derive(Clone)]
pub struct StepContext {
    flow_instance_id: FlowInstanceId,
    step_name: String,
    cancellation: CancellationToken,
    scratch: Arc<Mutex<Scratch>>,
}

impl StepContext {
    pub(crate) fn new(
        flow_instance_id: FlowInstanceId,
        step_name: impl Into<String>,
        data: DataBag,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            flow_instance_id,
            step_name: step_name.into(),
            cancellation,
            scratch: Arc::new(Mutex::new(Scratch {
                data,
                ..Scratch::default()
            })),
        }
    }

    /// A context detached from any flow instance, for exercising step bodies in isolation
    pub fn standalone(step_name: impl Into<String>, data: DataBag) -> Self {
        Self::new(
            FlowInstanceId("standalone".to_string()),
            step_name,
            data,
            CancellationToken::new(),
        )
    }

    /// The flow instance the step belongs to
    pub fn flow_instance_id(&self) -> &FlowInstanceId {
        &self.flow_instance_id
    }

    /// Record name of the running step
    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// Read and deserialize a value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, CoreError> {
        self.scratch.lock().data.get(key)
    }

    /// Raw JSON value under `key` (dotted paths allowed)
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.scratch.lock().data.lookup(key).cloned()
    }

    /// Whether `key` resolves to a value
    pub fn contains(&self, key: &str) -> bool {
        self.scratch.lock().data.contains(key)
    }

    /// Whether `key` resolves to a truthy value
    pub fn is_set(&self, key: &str) -> bool {
        self.scratch.lock().data.is_truthy(key)
    }

    /// Write a serializable value
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CoreError> {
        let value = serde_json::to_value(value)?;
        self.set_value(key, value);
        Ok(())
    }

    /// Write a raw JSON value
    pub fn set_value(&self, key: &str, value: Value) {
        let mut scratch = self.scratch.lock();
        scratch.data.insert_value(key, value.clone());
        scratch.changes.insert_value(key, value);
    }

    /// Snapshot of the data bag as the step currently sees it
    pub fn data(&self) -> DataBag {
        self.scratch.lock().data.clone()
    }

    /// Continue the flow at `target` once this step succeeds, skipping the
    /// steps in between
    pub fn jump_to(&self, target: impl Into<String>) {
        self.scratch.lock().jump_to = Some(target.into());
    }

    /// Flow-scoped cancellation token
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the flow has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Writes made so far
    pub fn changes(&self) -> DataBag {
        self.scratch.lock().changes.clone()
    }

    /// Take the writes and the requested jump, leaving the context empty of both
    pub(crate) fn take_effects(&self) -> (DataBag, Option<String>) {
        let mut scratch = self.scratch.lock();
        (
            std::mem::take(&mut scratch.changes),
            scratch.jump_to.take(),
        )
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("flow_instance_id", &self.flow_instance_id)
            .field("step_name", &self.step_name)
            .finish_non_exhaustive()
    }
}
