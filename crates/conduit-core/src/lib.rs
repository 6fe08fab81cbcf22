//!
//! Conduit Core - flow orchestration engine
//!
//! This crate defines the domain model (flow definitions, flow instances,
//! branches, pause state) and the application services that drive
//! multi-step business transactions: the wavefront scheduler, the
//! pause/resume coordinator, the idempotency gate and the flow trigger
//! dispatcher.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Domain layer - core business models, entities, and rules
pub mod domain;

/// Application services - core application logic
pub mod application;

/// Core types
pub mod types;

/// Error types
pub mod error;

/// Engine configuration
pub mod config;

// Re-export key types
pub use config::EngineConfig;
pub use error::{CoreError, ErrorKind};
pub use types::{DataBag, DataRequirement, DataType};

// Application interfaces
pub use application::flow_engine::{
    CoordinatorHandle, EngineDependencies, FlowEngine, FlowSnapshot, PauseMetadata, StepSummary,
};
pub use application::flow_execution_service::{DomainEventHandler, TracingEventHandler};
pub use application::resume_coordinator::Actor;

// Re-export main API types for easy use
pub use domain::branching::{
    BranchItem, DynamicBranches, Distribution, StaticBranch,
};
pub use domain::condition::Condition;
pub use domain::flow_definition::{
    FlowDefinition, IdempotencyScope, Projection, StepDefinition, TriggerSpec,
};
pub use domain::flow_instance::{FlowFailure, FlowId, FlowInstance, FlowInstanceId, FlowStatus};
pub use domain::pause::{
    Correlation, PauseSpec, ResumeCondition, SignalSet, SignalSpec, TimeoutOutcome,
};
pub use domain::repository::{
    ClaimOutcome, EventBus, FlowInstanceRepository, IdempotencyRepository, InboundEvent, Timer,
};
pub use domain::step::{ExecutionRecord, StepContext, StepFlags, StepStatus};

/// Terminal result of a step body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepResult {
    /// The step did its work
    Success {
        /// Result message
        message: String,
        /// Optional payload, written to the step's output key
        payload: Option<Value>,
    },
    /// The step failed
    Failure {
        /// Failure message
        message: String,
        /// Failure classification
        kind: ErrorKind,
    },
    /// A resource the step needed does not exist
    NotFound {
        /// Resource type
        resource: String,
        /// Resource id
        id: String,
    },
    /// The step was not allowed to act
    NotAuthorized {
        /// Failure message
        message: String,
    },
}

impl StepResult {
    /// Success without payload
    pub fn success(message: impl Into<String>) -> Self {
        StepResult::Success {
            message: message.into(),
            payload: None,
        }
    }

    /// Success with payload
    pub fn success_with(message: impl Into<String>, payload: Value) -> Self {
        StepResult::Success {
            message: message.into(),
            payload: Some(payload),
        }
    }

    /// Failure of the given kind
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        StepResult::Failure {
            message: message.into(),
            kind,
        }
    }

    /// Missing resource
    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        StepResult::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Not authorized
    pub fn not_authorized(message: impl Into<String>) -> Self {
        StepResult::NotAuthorized {
            message: message.into(),
        }
    }

    /// Failure carrying the kind and message of `error`
    pub fn from_error(error: &CoreError) -> Self {
        StepResult::failure(error.kind(), error.to_string())
    }

    /// Whether this is a success
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Success { .. })
    }

    /// Failure classification, `None` on success
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            StepResult::Success { .. } => None,
            StepResult::Failure { kind, .. } => Some(*kind),
            StepResult::NotFound { .. } => Some(ErrorKind::NotFound),
            StepResult::NotAuthorized { .. } => Some(ErrorKind::NotAuthorized),
        }
    }

    /// Human readable message
    pub fn message(&self) -> String {
        match self {
            StepResult::Success { message, .. }
            | StepResult::Failure { message, .. }
            | StepResult::NotAuthorized { message } => message.clone(),
            StepResult::NotFound { resource, id } => format!("{} '{}' not found", resource, id),
        }
    }

    /// Success payload
    pub fn payload(&self) -> Option<&Value> {
        match self {
            StepResult::Success { payload, .. } => payload.as_ref(),
            _ => None,
        }
    }
}

/// A step body
///
/// Side effects happen only here; the engine inspects the returned
/// [`StepResult`] and the step flags. An `Err` is treated like a
/// `Failure` carrying the error's kind.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Execute the step
    async fn execute(&self, ctx: StepContext) -> Result<StepResult, CoreError>;
}

/// Adapter running a closure as a step body
pub struct FnStep<F>(F);

#[async_trait]
impl<F, Fut> StepExecutor for FnStep<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepResult, CoreError>> + Send + 'static,
{
    async fn execute(&self, ctx: StepContext) -> Result<StepResult, CoreError> {
        (self.0)(ctx).await
    }
}

/// Wrap a closure as a shared step executor
pub fn step_fn<F, Fut>(body: F) -> Arc<dyn StepExecutor>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepResult, CoreError>> + Send + 'static,
{
    Arc::new(FnStep(body))
}
