use crate::domain::flow_instance::{FlowId, FlowInstanceId};
use crate::domain::step::StepStatus;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Domain event trait for all events in the system
pub trait DomainEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the flow instance ID this event is associated with
    fn flow_instance_id(&self) -> &FlowInstanceId;

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;

    /// Returns the step the event concerns, if any
    fn step(&self) -> Option<&str> {
        None
    }
}

/// Event: Flow instance created
#[derive(Debug)]
pub struct FlowInstanceCreated {
    /// The unique identifier of the flow instance
    pub flow_instance_id: FlowInstanceId,

    /// The identifier of the flow definition
    pub flow_id: FlowId,

    /// The timestamp when the flow instance was created
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for FlowInstanceCreated {
    fn event_type(&self) -> &'static str {
        "flow_instance.created"
    }

    fn flow_instance_id(&self) -> &FlowInstanceId {
        &self.flow_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Step completed successfully
#[derive(Debug)]
pub struct StepCompleted {
    /// The unique identifier of the flow instance
    pub flow_instance_id: FlowInstanceId,

    /// Record name of the step
    pub step: String,

    /// The timestamp when the step completed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for StepCompleted {
    fn event_type(&self) -> &'static str {
        "step.completed"
    }

    fn flow_instance_id(&self) -> &FlowInstanceId {
        &self.flow_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn step(&self) -> Option<&str> {
        Some(&self.step)
    }
}

/// Event: Step skipped by a jump
#[derive(Debug)]
pub struct StepSkipped {
    /// The unique identifier of the flow instance
    pub flow_instance_id: FlowInstanceId,

    /// Record name of the step
    pub step: String,

    /// The timestamp when the step was skipped
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for StepSkipped {
    fn event_type(&self) -> &'static str {
        "step.skipped"
    }

    fn flow_instance_id(&self) -> &FlowInstanceId {
        &self.flow_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn step(&self) -> Option<&str> {
        Some(&self.step)
    }
}

/// Event: Step failed, was blocked or was cancelled
#[derive(Debug)]
pub struct StepFailed {
    /// The unique identifier of the flow instance
    pub flow_instance_id: FlowInstanceId,

    /// Record name of the step
    pub step: String,

    /// Failed, Blocked or Cancelled
    pub status: StepStatus,

    /// The error message
    pub message: String,

    /// The timestamp when the step failed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for StepFailed {
    fn event_type(&self) -> &'static str {
        "step.failed"
    }

    fn flow_instance_id(&self) -> &FlowInstanceId {
        &self.flow_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn step(&self) -> Option<&str> {
        Some(&self.step)
    }
}

/// Event: Flow instance paused
#[derive(Debug)]
pub struct FlowInstancePaused {
    /// The unique identifier of the flow instance
    pub flow_instance_id: FlowInstanceId,

    /// The step that requested the pause
    pub step: String,

    /// Pause reason
    pub reason: String,

    /// The timestamp when the flow instance paused
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for FlowInstancePaused {
    fn event_type(&self) -> &'static str {
        "flow_instance.paused"
    }

    fn flow_instance_id(&self) -> &FlowInstanceId {
        &self.flow_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn step(&self) -> Option<&str> {
        Some(&self.step)
    }
}

/// Event: Flow instance resumed
#[derive(Debug)]
pub struct FlowInstanceResumed {
    /// The unique identifier of the flow instance
    pub flow_instance_id: FlowInstanceId,

    /// The step that had paused
    pub step: String,

    /// What resumed the instance: `signals`, `timeout` or `manual:<actor>`
    pub trigger: String,

    /// The timestamp when the flow instance resumed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for FlowInstanceResumed {
    fn event_type(&self) -> &'static str {
        "flow_instance.resumed"
    }

    fn flow_instance_id(&self) -> &FlowInstanceId {
        &self.flow_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn step(&self) -> Option<&str> {
        Some(&self.step)
    }
}

/// Event: Flow instance completed
#[derive(Debug)]
pub struct FlowInstanceCompleted {
    /// The unique identifier of the flow instance
    pub flow_instance_id: FlowInstanceId,

    /// The timestamp when the flow instance completed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for FlowInstanceCompleted {
    fn event_type(&self) -> &'static str {
        "flow_instance.completed"
    }

    fn flow_instance_id(&self) -> &FlowInstanceId {
        &self.flow_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Flow instance failed
#[derive(Debug)]
pub struct FlowInstanceFailed {
    /// The unique identifier of the flow instance
    pub flow_instance_id: FlowInstanceId,

    /// The failing step, if any
    pub step: Option<String>,

    /// The error message
    pub error: String,

    /// The timestamp when the flow instance failed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for FlowInstanceFailed {
    fn event_type(&self) -> &'static str {
        "flow_instance.failed"
    }

    fn flow_instance_id(&self) -> &FlowInstanceId {
        &self.flow_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn step(&self) -> Option<&str> {
        self.step.as_deref()
    }
}

/// Event: A step started another flow instance
#[derive(Debug)]
pub struct ChildFlowTriggered {
    /// The unique identifier of the parent flow instance
    pub flow_instance_id: FlowInstanceId,

    /// The child flow instance
    pub child_instance_id: FlowInstanceId,

    /// Name of the child's flow definition
    pub target_flow: String,

    /// The triggering step
    pub step: String,

    /// The timestamp when the child was dispatched
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for ChildFlowTriggered {
    fn event_type(&self) -> &'static str {
        "flow_instance.child_triggered"
    }

    fn flow_instance_id(&self) -> &FlowInstanceId {
        &self.flow_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn step(&self) -> Option<&str> {
        Some(&self.step)
    }
}

/// Event: A trigger was not dispatched
#[derive(Debug)]
pub struct TriggerRejected {
    /// The unique identifier of the parent flow instance
    pub flow_instance_id: FlowInstanceId,

    /// Name of the flow that was not started
    pub target_flow: String,

    /// The triggering step
    pub step: String,

    /// Why the trigger was rejected
    pub reason: String,

    /// The timestamp of the rejection
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for TriggerRejected {
    fn event_type(&self) -> &'static str {
        "flow_instance.trigger_rejected"
    }

    fn flow_instance_id(&self) -> &FlowInstanceId {
        &self.flow_instance_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn step(&self) -> Option<&str> {
        Some(&self.step)
    }
}
