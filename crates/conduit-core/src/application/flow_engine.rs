//!
//! Flow engine facade
//! Wires the registry, scheduler, idempotency gate, trigger dispatcher and
//! resume coordinator behind one cloneable handle.
//!

use crate::{
    application::flow_execution_service::{DomainEventHandler, EngineContext, FlowExecutionService},
    application::flow_registry::FlowRegistry,
    application::idempotency::{IdempotencyConfig, IdempotencyGate},
    application::resume_coordinator::{Actor, ResumeCoordinator},
    application::trigger_dispatcher::TriggerDispatcher,
    config::EngineConfig,
    domain::flow_definition::FlowDefinition,
    domain::flow_instance::{FlowFailure, FlowId, FlowInstance, FlowInstanceId, FlowStatus},
    domain::pause::ResumeCondition,
    domain::repository::{EventBus, FlowInstanceRepository, IdempotencyRepository, InboundEvent, Timer},
    domain::step::StepStatus,
    error::ErrorKind,
    types::DataBag,
    CoreError,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Infrastructure the engine runs on
#[derive(Clone)]
pub struct EngineDependencies {
    /// Flow instance store
    pub instances: Arc<dyn FlowInstanceRepository>,
    /// Idempotency record store
    pub idempotency: Arc<dyn IdempotencyRepository>,
    /// Inbound event bus
    pub event_bus: Arc<dyn EventBus>,
    /// Clock and tick source
    pub timer: Arc<dyn Timer>,
    /// Receiver of domain events
    pub event_handler: Arc<dyn DomainEventHandler>,
}

/// What a paused instance is waiting for
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PauseMetadata {
    /// Step that requested the pause
    pub step: String,
    /// Pause reason
    pub reason: String,
    /// Payload of the pausing pass
    pub payload: Option<Value>,
    /// When the instance paused
    pub paused_at: DateTime<Utc>,
    /// Events received so far
    pub received: Vec<String>,
    /// Events still awaited
    pub awaiting: Vec<String>,
    /// When the earliest elapsed condition fires
    pub timeout_at: Option<DateTime<Utc>>,
    /// Roles allowed to resume manually
    pub manual_roles: Vec<String>,
}

/// Outcome of one recorded step, branch step or dynamic branch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSummary {
    /// Record name
    pub name: String,
    /// Step status
    pub status: StepStatus,
    /// Result message
    pub message: String,
    /// Failure classification, for failed steps
    pub kind: Option<ErrorKind>,
    /// Idempotency key, for idempotent steps
    pub idempotency_key: Option<String>,
    /// When the step was recorded
    pub recorded_at: DateTime<Utc>,
}

/// Read model of a flow instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowSnapshot {
    /// Instance ID
    pub id: FlowInstanceId,
    /// Flow name
    pub flow_id: FlowId,
    /// Current status
    pub status: FlowStatus,
    /// Current data bag
    pub data: DataBag,
    /// Pause metadata while Paused
    pub pause: Option<PauseMetadata>,
    /// Failure summary once Failed
    pub failure: Option<FlowFailure>,
    /// Recorded steps in recording order
    pub steps: Vec<StepSummary>,
    /// Parent instance, for triggered instances
    pub parent: Option<FlowInstanceId>,
    /// Instances triggered by this one
    pub children: Vec<FlowInstanceId>,
    /// Store version
    pub version: u64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl FlowSnapshot {
    /// Summary of the record named `name`
    pub fn step(&self, name: &str) -> Option<&StepSummary> {
        self.steps.iter().find(|step| step.name == name)
    }

    /// Status of the record named `name`
    pub fn step_status(&self, name: &str) -> Option<StepStatus> {
        self.step(name).map(|step| step.status)
    }
}

impl From<&FlowInstance> for FlowSnapshot {
    fn from(instance: &FlowInstance) -> Self {
        let mut steps: Vec<StepSummary> = instance
            .records
            .values()
            .map(|record| StepSummary {
                name: record.step.clone(),
                status: record.status,
                message: record.result.message(),
                kind: record.result.error_kind(),
                idempotency_key: record.idempotency_key.clone(),
                recorded_at: record.recorded_at,
            })
            .collect();
        steps.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then_with(|| a.name.cmp(&b.name)));

        let pause = instance.pause.as_ref().map(|pause| {
            let mut awaiting = Vec::new();
            let mut timeout_at: Option<DateTime<Utc>> = None;
            let mut manual_roles = Vec::new();
            for condition in &pause.resume {
                match condition {
                    ResumeCondition::Signals(set) => {
                        for signal in &set.signals {
                            if !instance.data.is_truthy(&signal.flag) && !awaiting.contains(&signal.event) {
                                awaiting.push(signal.event.clone());
                            }
                        }
                    }
                    ResumeCondition::Elapsed(elapsed) => {
                        if let Ok(after) = chrono::Duration::from_std(elapsed.after) {
                            let at = pause.paused_at + after;
                            timeout_at = Some(timeout_at.map_or(at, |current| current.min(at)));
                        }
                    }
                    ResumeCondition::Manual(manual) => manual_roles.extend(manual.roles.iter().cloned()),
                }
            }
            PauseMetadata {
                step: pause.step.clone(),
                reason: pause.reason.clone(),
                payload: pause.payload.clone(),
                paused_at: pause.paused_at,
                received: pause.received.clone(),
                awaiting,
                timeout_at,
                manual_roles,
            }
        });

        Self {
            id: instance.id.clone(),
            flow_id: instance.flow_id.clone(),
            status: instance.status,
            data: instance.data.clone(),
            pause,
            failure: instance.failure.clone(),
            steps,
            parent: instance.lineage.parent.clone(),
            children: instance.children.clone(),
            version: instance.version,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

/// Handle of the background coordinator loop
pub struct CoordinatorHandle {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Stop the loop and wait for it to exit
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Resume coordinator task ended abnormally");
        }
    }
}

/// Flow orchestration engine
///
/// Cloning is cheap; all clones share the same registry, stores and
/// background tasks.
#[derive(Clone)]
pub struct FlowEngine {
    ctx: Arc<EngineContext>,
    executor: FlowExecutionService,
    coordinator: Arc<ResumeCoordinator>,
    event_bus: Arc<dyn EventBus>,
}

impl FlowEngine {
    /// Create an engine on the given infrastructure
    pub fn new(config: EngineConfig, deps: EngineDependencies) -> Self {
        let gate = IdempotencyGate::new(
            IdempotencyConfig {
                claim_ttl: config.idempotency_claim_ttl(),
                poll_interval: config.idempotency_poll_interval(),
                wait_timeout: config.idempotency_wait_timeout(),
            },
            deps.idempotency,
        );

        let ctx = Arc::new(EngineContext {
            dispatcher: TriggerDispatcher::new(config.max_trigger_depth),
            registry: FlowRegistry::new(),
            instances: deps.instances,
            gate,
            timer: deps.timer,
            event_handler: deps.event_handler,
            running: DashMap::new(),
            status: DashMap::new(),
            config,
        });
        let executor = FlowExecutionService::new(ctx.clone());
        let coordinator = Arc::new(ResumeCoordinator::new(ctx.clone(), executor.clone()));

        Self {
            ctx,
            executor,
            coordinator,
            event_bus: deps.event_bus,
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// Register a validated flow definition
    pub fn register(&self, definition: FlowDefinition) -> Result<(), CoreError> {
        self.ctx.registry.register(definition).map(|_| ())
    }

    /// Names of the registered flows
    pub fn list_definitions(&self) -> Vec<FlowId> {
        self.ctx.registry.list()
    }

    /// Start a new instance of `flow` with `data` as its initial data bag
    ///
    /// Returns once the instance is persisted; execution continues in the
    /// background.
    pub async fn start(&self, flow: &str, data: DataBag) -> Result<FlowInstanceId, CoreError> {
        let definition = self.ctx.registry.get(flow)?;
        definition.validate_inputs(&data)?;

        let mut instance = FlowInstance::new(definition.id().clone(), data);
        instance.start()?;
        info!(flow_id = %flow, flow_instance_id = %instance.id, "Starting flow instance");
        self.executor.launch(definition, instance).await
    }

    /// Deliver an external event directly; returns the resumed instances
    pub async fn deliver_event(
        &self,
        name: &str,
        payload: Value,
    ) -> Result<Vec<FlowInstanceId>, CoreError> {
        self.coordinator.deliver_event(name, &payload).await
    }

    /// Publish an external event on the bus for the coordinator loop
    pub async fn publish_event(&self, name: &str, payload: Value) -> Result<(), CoreError> {
        self.event_bus.publish(InboundEvent::new(name, payload)).await
    }

    /// Resume a paused instance on behalf of an actor
    pub async fn resume_manually(&self, id: &FlowInstanceId, actor: &Actor) -> Result<(), CoreError> {
        self.coordinator.resume_manually(id, actor).await
    }

    /// Apply every elapsed pause timeout now
    pub async fn evaluate_timeouts(&self) -> Result<Vec<FlowInstanceId>, CoreError> {
        self.coordinator.evaluate_timeouts().await
    }

    /// Current state of an instance
    pub async fn query(&self, id: &FlowInstanceId) -> Result<FlowSnapshot, CoreError> {
        self.load(id).await.map(|instance| FlowSnapshot::from(&instance))
    }

    /// Instances, optionally filtered by flow and status
    pub async fn list_instances(
        &self,
        flow: Option<&str>,
        status: Option<FlowStatus>,
    ) -> Result<Vec<FlowSnapshot>, CoreError> {
        let flow = flow.map(|name| FlowId(name.to_string()));
        let instances = self.ctx.instances.list_instances(flow.as_ref(), status).await?;
        Ok(instances.iter().map(FlowSnapshot::from).collect())
    }

    /// Abort an instance
    ///
    /// An instance driven by this process stops at its next suspension
    /// point and fails with `Cancelled`; a paused instance fails immediately.
    /// A Running instance driven by another process is failed in the store
    /// and that process stops driving it at its next save.
    pub async fn abort(&self, id: &FlowInstanceId, reason: &str) -> Result<(), CoreError> {
        let instance = self.load(id).await?;
        if instance.status.is_terminal() {
            return Err(CoreError::FlowExecutionError(format!(
                "Cannot abort flow in state: {:?}",
                instance.status
            )));
        }

        if let Some(token) = self.ctx.running.get(id) {
            info!(flow_instance_id = %id, reason = %reason, "Cancelling running flow instance");
            token.cancel();
            return Ok(());
        }

        self.coordinator.abort(id, reason).await
    }

    /// Drive Running instances that no task in this process is driving,
    /// for instance after a restart
    pub async fn recover(&self) -> Result<Vec<FlowInstanceId>, CoreError> {
        let running = self
            .ctx
            .instances
            .list_instances(None, Some(FlowStatus::Running))
            .await?;

        let mut recovered = Vec::new();
        for instance in running {
            if self.ctx.running.contains_key(&instance.id) {
                continue;
            }
            let id = instance.id.clone();
            match self.executor.resume_drive(instance) {
                Ok(()) => {
                    info!(flow_instance_id = %id, "Recovered flow instance");
                    recovered.push(id);
                }
                Err(e) => warn!(flow_instance_id = %id, error = %e, "Cannot recover flow instance"),
            }
        }
        Ok(recovered)
    }

    /// Wait until the instance is Paused, Completed or Failed
    pub async fn wait_until_settled(
        &self,
        id: &FlowInstanceId,
        timeout: Duration,
    ) -> Result<FlowSnapshot, CoreError> {
        let mut status = self.ctx.subscribe_status(id);
        let instance = self.load(id).await?;
        if instance.status.is_settled() {
            drop(status);
            if instance.status.is_terminal() {
                self.ctx.forget_status(id);
            }
            return Ok(FlowSnapshot::from(&instance));
        }

        let waited = tokio::time::timeout(timeout, status.wait_for(|status| status.is_settled()))
            .await
            .map(|received| received.is_ok());
        match waited {
            Ok(_) => self.query(id).await,
            Err(_) => Err(CoreError::TimeoutError(format!(
                "Flow instance {} did not settle within {:?}",
                id, timeout
            ))),
        }
    }

    /// Start the coordinator loop routing bus events and timer ticks
    pub fn spawn_coordinator(&self) -> CoordinatorHandle {
        let shutdown = CancellationToken::new();
        let events = self.event_bus.subscribe();
        let coordinator = self.coordinator.clone();
        let handle = tokio::spawn(coordinator.run(events, shutdown.clone()));
        CoordinatorHandle { shutdown, handle }
    }

    async fn load(&self, id: &FlowInstanceId) -> Result<FlowInstance, CoreError> {
        self.ctx
            .instances
            .find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::FlowInstanceNotFound(id.to_string()))
    }
}
