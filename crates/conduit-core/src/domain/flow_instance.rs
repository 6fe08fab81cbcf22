use crate::{
    domain::events::{
        ChildFlowTriggered, DomainEvent, FlowInstanceCompleted, FlowInstanceCreated,
        FlowInstanceFailed, FlowInstancePaused, FlowInstanceResumed, StepCompleted, StepFailed,
        StepSkipped,
    },
    domain::pause::PauseState,
    domain::step::{ExecutionRecord, StepStatus},
    error::ErrorKind,
    types::DataBag,
    CoreError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Flow instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowStatus {
    /// Created, not yet started
    Pending,

    /// Being driven by the scheduler
    Running,

    /// Suspended until a resume condition fires
    Paused,

    /// Every remaining path completed
    Completed,

    /// Failed
    Failed,
}

impl FlowStatus {
    /// Completed or Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowStatus::Completed | FlowStatus::Failed)
    }

    /// Not going to make progress without outside input
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            FlowStatus::Paused | FlowStatus::Completed | FlowStatus::Failed
        )
    }
}

/// Value object: Flow Instance ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowInstanceId(pub String);

impl FlowInstanceId {
    /// Generate a fresh id
    pub fn generate() -> Self {
        FlowInstanceId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for FlowInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value object: Flow ID (the flow definition name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of an instance in the trigger DAG
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    /// Instance that triggered this one
    pub parent: Option<FlowInstanceId>,
    /// Step of the parent that triggered this one
    pub parent_step: Option<String>,
    /// Number of trigger hops from the root instance
    pub depth: u32,
    /// Every instance on the path from the root, root first
    pub ancestors: Vec<FlowInstanceId>,
}

impl Lineage {
    /// Lineage of a child started by `parent` from `step`
    pub fn child_of(parent: &FlowInstance, step: &str) -> Self {
        let mut ancestors = parent.lineage.ancestors.clone();
        ancestors.push(parent.id.clone());
        Self {
            parent: Some(parent.id.clone()),
            parent_step: Some(step.to_string()),
            depth: parent.lineage.depth + 1,
            ancestors,
        }
    }
}

/// Why an instance failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowFailure {
    /// Failing step, if a step caused it
    pub step: Option<String>,
    /// Failure message
    pub message: String,
    /// Failure classification
    pub kind: ErrorKind,
}

/// Aggregate: Flow instance
#[derive(Debug, Serialize, Deserialize)]
pub struct FlowInstance {
    /// Unique identifier
    pub id: FlowInstanceId,

    /// Flow definition ID
    pub flow_id: FlowId,

    /// Current status
    pub status: FlowStatus,

    /// Current data bag
    pub data: DataBag,

    /// Execution records keyed by record name
    pub records: BTreeMap<String, ExecutionRecord>,

    /// Pause state while Paused
    pub pause: Option<PauseState>,

    /// Failure summary once Failed
    pub failure: Option<FlowFailure>,

    /// Trigger lineage
    pub lineage: Lineage,

    /// Instances started by this one
    pub children: Vec<FlowInstanceId>,

    /// Optimistic concurrency version, incremented by every save
    pub version: u64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// Domain events
    #[serde(skip)]
    pub events: Vec<Box<dyn DomainEvent>>,
}

// Manually implement Clone for FlowInstance
impl Clone for FlowInstance {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            flow_id: self.flow_id.clone(),
            status: self.status,
            data: self.data.clone(),
            records: self.records.clone(),
            pause: self.pause.clone(),
            failure: self.failure.clone(),
            lineage: self.lineage.clone(),
            children: self.children.clone(),
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            events: Vec::new(), // We don't clone domain events
        }
    }
}

impl FlowInstance {
    /// Create a new flow instance
    pub fn new(flow_id: FlowId, data: DataBag) -> Self {
        Self::with_lineage(FlowInstanceId::generate(), flow_id, data, Lineage::default())
    }

    /// Create an instance with a known id and lineage
    pub fn with_lineage(
        id: FlowInstanceId,
        flow_id: FlowId,
        data: DataBag,
        lineage: Lineage,
    ) -> Self {
        let now = Utc::now();
        let mut instance = Self {
            id: id.clone(),
            flow_id: flow_id.clone(),
            status: FlowStatus::Pending,
            data,
            records: BTreeMap::new(),
            pause: None,
            failure: None,
            lineage,
            children: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
            events: Vec::with_capacity(8),
        };

        instance.record_event(Box::new(FlowInstanceCreated {
            flow_instance_id: id,
            flow_id,
            timestamp: now,
        }));

        instance
    }

    /// Start the flow execution
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.status != FlowStatus::Pending {
            return Err(CoreError::FlowExecutionError(format!(
                "Cannot start flow in state: {:?}",
                self.status
            )));
        }

        self.status = FlowStatus::Running;
        self.update_timestamp();
        Ok(())
    }

    /// Update the timestamp
    #[inline]
    pub fn update_timestamp(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Terminal status of a record
    pub fn step_status(&self, record: &str) -> Option<StepStatus> {
        self.records.get(record).map(|r| r.status)
    }

    /// Store the terminal resolution of a step, merging its outputs into the data bag
    pub fn record_step(&mut self, record: ExecutionRecord) -> Result<(), CoreError> {
        if self.status != FlowStatus::Running {
            return Err(CoreError::FlowExecutionError(format!(
                "Cannot record step '{}' while flow is in state: {:?}",
                record.step, self.status
            )));
        }

        self.data.merge(record.outputs.clone());
        let timestamp = record.recorded_at;
        match record.status {
            StepStatus::Succeeded => self.record_event(Box::new(StepCompleted {
                flow_instance_id: self.id.clone(),
                step: record.step.clone(),
                timestamp,
            })),
            StepStatus::Skipped => self.record_event(Box::new(StepSkipped {
                flow_instance_id: self.id.clone(),
                step: record.step.clone(),
                timestamp,
            })),
            StepStatus::Failed | StepStatus::Blocked | StepStatus::Cancelled => {
                self.record_event(Box::new(StepFailed {
                    flow_instance_id: self.id.clone(),
                    step: record.step.clone(),
                    status: record.status,
                    message: record.result.message(),
                    timestamp,
                }))
            }
        }

        self.records.insert(record.step.clone(), record);
        self.update_timestamp();
        Ok(())
    }

    /// Suspend the instance
    pub fn pause(&mut self, state: PauseState) -> Result<(), CoreError> {
        if self.status != FlowStatus::Running {
            return Err(CoreError::FlowExecutionError(format!(
                "Cannot pause flow in state: {:?}",
                self.status
            )));
        }

        self.record_event(Box::new(FlowInstancePaused {
            flow_instance_id: self.id.clone(),
            step: state.step.clone(),
            reason: state.reason.clone(),
            timestamp: state.paused_at,
        }));
        self.status = FlowStatus::Paused;
        self.pause = Some(state);
        self.update_timestamp();
        Ok(())
    }

    /// Resume a paused instance; `trigger` names what resumed it
    pub fn resume(&mut self, trigger: &str) -> Result<(), CoreError> {
        if self.status != FlowStatus::Paused {
            return Err(CoreError::FlowExecutionError(format!(
                "Cannot resume flow in state: {:?}",
                self.status
            )));
        }

        let step = self.pause.take().map(|p| p.step).unwrap_or_default();
        self.status = FlowStatus::Running;
        self.update_timestamp();
        self.record_event(Box::new(FlowInstanceResumed {
            flow_instance_id: self.id.clone(),
            step,
            trigger: trigger.to_string(),
            timestamp: self.updated_at,
        }));
        Ok(())
    }

    /// Complete the flow
    pub fn complete(&mut self) -> Result<(), CoreError> {
        if self.status != FlowStatus::Running {
            return Err(CoreError::FlowExecutionError(format!(
                "Cannot complete flow in state: {:?}",
                self.status
            )));
        }

        self.status = FlowStatus::Completed;
        self.update_timestamp();
        self.record_event(Box::new(FlowInstanceCompleted {
            flow_instance_id: self.id.clone(),
            timestamp: self.updated_at,
        }));
        Ok(())
    }

    /// Fail the flow
    pub fn fail(&mut self, failure: FlowFailure) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::FlowExecutionError(format!(
                "Cannot fail flow in state: {:?}",
                self.status
            )));
        }

        self.status = FlowStatus::Failed;
        self.pause = None;
        self.update_timestamp();
        self.record_event(Box::new(FlowInstanceFailed {
            flow_instance_id: self.id.clone(),
            step: failure.step.clone(),
            error: failure.message.clone(),
            timestamp: self.updated_at,
        }));
        self.failure = Some(failure);
        Ok(())
    }

    /// Remember a child instance started from `step`
    pub fn add_child(&mut self, child: FlowInstanceId, target_flow: &str, step: &str) {
        self.record_event(Box::new(ChildFlowTriggered {
            flow_instance_id: self.id.clone(),
            child_instance_id: child.clone(),
            target_flow: target_flow.to_string(),
            step: step.to_string(),
            timestamp: Utc::now(),
        }));
        self.children.push(child);
    }

    /// Record a domain event
    #[inline]
    pub fn record_event(&mut self, event: Box<dyn DomainEvent>) {
        self.events.push(event);
    }

    /// Take all recorded domain events
    #[inline]
    pub fn take_events(&mut self) -> Vec<Box<dyn DomainEvent>> {
        std::mem::take(&mut self.events)
    }
}
