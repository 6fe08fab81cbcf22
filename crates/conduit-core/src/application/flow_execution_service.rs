use crate::{
    application::flow_registry::FlowRegistry,
    application::idempotency::{GateOutcome, IdempotencyGate},
    application::trigger_dispatcher::{ChildLaunch, TriggerDispatcher},
    config::EngineConfig,
    domain::branching::{
        plan_branches, select_branch, BranchGroup, BranchReport, DynamicBranches, PlannedBranch,
        StaticBranch,
    },
    domain::events::DomainEvent,
    domain::flow_definition::{FlowDefinition, StepDefinition},
    domain::flow_instance::{FlowFailure, FlowInstance, FlowInstanceId, FlowStatus},
    domain::pause::{PauseState, ResumeCondition},
    domain::repository::{FlowInstanceRepository, Timer},
    domain::step::{ExecutionRecord, FailureTier, StepContext, StepStatus},
    error::ErrorKind,
    types::DataBag,
    CoreError, StepExecutor, StepResult,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::{stream::FuturesUnordered, FutureExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Receives domain events once the instance that raised them is persisted
#[async_trait]
pub trait DomainEventHandler: Send + Sync {
    /// Handle a domain event
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError>;
}

/// Event handler that logs every domain event
#[derive(Debug, Default, Clone)]
pub struct TracingEventHandler;

#[async_trait]
impl DomainEventHandler for TracingEventHandler {
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError> {
        info!(
            event_type = event.event_type(),
            flow_instance_id = %event.flow_instance_id(),
            step = event.step().unwrap_or("-"),
            timestamp = %event.timestamp(),
            "Domain event"
        );
        Ok(())
    }
}

/// State shared by the engine services
pub(crate) struct EngineContext {
    pub(crate) config: EngineConfig,
    pub(crate) registry: FlowRegistry,
    pub(crate) instances: Arc<dyn FlowInstanceRepository>,
    pub(crate) gate: IdempotencyGate,
    pub(crate) dispatcher: TriggerDispatcher,
    pub(crate) timer: Arc<dyn Timer>,
    pub(crate) event_handler: Arc<dyn DomainEventHandler>,
    /// Cancellation tokens of the instances driven by this process
    pub(crate) running: DashMap<FlowInstanceId, CancellationToken>,
    /// Status channels used to wait for instances to settle
    pub(crate) status: DashMap<FlowInstanceId, watch::Sender<FlowStatus>>,
}

impl EngineContext {
    /// Save with version check, then publish status and domain events
    pub(crate) async fn persist(&self, instance: &mut FlowInstance) -> Result<(), CoreError> {
        let version = self.instances.save(instance).await?;
        instance.version = version;
        self.publish_status(&instance.id, instance.status);

        for event in instance.take_events() {
            let event_type = event.event_type();
            if let Err(e) = self.event_handler.handle_event(event).await {
                warn!(
                    flow_instance_id = %instance.id,
                    event_type,
                    error = %e,
                    "Domain event handler failed"
                );
            }
        }
        Ok(())
    }

    fn publish_status(&self, id: &FlowInstanceId, status: FlowStatus) {
        self.status
            .entry(id.clone())
            .and_modify(|sender| {
                sender.send_replace(status);
            })
            .or_insert_with(|| watch::channel(status).0);
        if status.is_terminal() {
            self.status.remove(id);
        }
    }

    /// Drop the status channel of a settled instance nobody waits on
    pub(crate) fn forget_status(&self, id: &FlowInstanceId) {
        self.status
            .remove_if(id, |_, sender| sender.receiver_count() == 0);
    }

    /// Status receiver; a fresh channel starts as Running until the store says otherwise
    pub(crate) fn subscribe_status(&self, id: &FlowInstanceId) -> watch::Receiver<FlowStatus> {
        self.status
            .entry(id.clone())
            .or_insert_with(|| watch::channel(FlowStatus::Running).0)
            .subscribe()
    }
}

/// A pause requested by a successful body pass
#[derive(Debug)]
struct PauseRequest {
    reason: String,
    payload: Option<Value>,
    resume: Vec<ResumeCondition>,
}

/// Everything a step execution produced, before it is applied to the instance
#[derive(Debug)]
struct StepOutcome {
    result: StepResult,
    outputs: DataBag,
    idempotency_key: Option<String>,
    jump: Option<String>,
    pause: Option<PauseRequest>,
    branch_records: Vec<ExecutionRecord>,
}

impl StepOutcome {
    fn from_result(result: StepResult) -> Self {
        Self {
            result,
            outputs: DataBag::new(),
            idempotency_key: None,
            jump: None,
            pause: None,
            branch_records: Vec::new(),
        }
    }

    fn replayed(record: ExecutionRecord, key: String) -> Self {
        Self {
            result: record.result,
            outputs: record.outputs,
            idempotency_key: Some(key),
            jump: record.jump_to,
            pause: None,
            branch_records: Vec::new(),
        }
    }

    /// Record to keep under the idempotency key; pausing passes and
    /// retryable failures are not kept
    fn storable(&self, record_name: &str) -> Option<ExecutionRecord> {
        if self.pause.is_some() {
            return None;
        }
        if self
            .result
            .error_kind()
            .map(|kind| kind.is_retryable())
            .unwrap_or(false)
        {
            return None;
        }
        Some(self.to_record(record_name))
    }

    fn to_record(&self, record_name: &str) -> ExecutionRecord {
        ExecutionRecord {
            step: record_name.to_string(),
            status: classify(&self.result),
            result: self.result.clone(),
            idempotency_key: self.idempotency_key.clone(),
            outputs: self.outputs.clone(),
            jump_to: self.jump.clone(),
            recorded_at: Utc::now(),
        }
    }
}

/// How an applied outcome affects the rest of the wavefront
enum Resolution {
    Resolved,
    Pause(PauseState),
    Critical(FlowFailure),
}

fn classify(result: &StepResult) -> StepStatus {
    match result.error_kind() {
        None => StepStatus::Succeeded,
        Some(ErrorKind::Cancelled) => StepStatus::Cancelled,
        Some(_) => StepStatus::Failed,
    }
}

/// Dependency resolved for scheduling purposes
fn is_resolved(definition: &FlowDefinition, instance: &FlowInstance, name: &str) -> bool {
    match instance.step_status(name) {
        Some(StepStatus::Succeeded) | Some(StepStatus::Skipped) => true,
        Some(StepStatus::Failed) => definition
            .step(name)
            .map(|step| step.flags.allow_failure)
            .unwrap_or(false),
        _ => false,
    }
}

/// Dependency can never resolve
fn is_blocking(definition: &FlowDefinition, instance: &FlowInstance, name: &str) -> bool {
    match instance.step_status(name) {
        Some(StepStatus::Blocked) | Some(StepStatus::Cancelled) => true,
        Some(StepStatus::Failed) => !definition
            .step(name)
            .map(|step| step.flags.allow_failure)
            .unwrap_or(false),
        _ => false,
    }
}

/// Unrecorded steps whose dependencies have all resolved, in topological order
fn ready_steps<'a>(definition: &'a FlowDefinition, instance: &FlowInstance) -> Vec<&'a StepDefinition> {
    definition
        .ordered_steps()
        .filter(|step| instance.step_status(&step.name).is_none())
        .filter(|step| step.after.iter().all(|dep| is_resolved(definition, instance, dep)))
        .collect()
}

/// Run a step body, converting errors, panics and cancellation into results
async fn execute_body(
    executor: Arc<dyn StepExecutor>,
    ctx: StepContext,
    cancel: &CancellationToken,
) -> StepResult {
    let body = AssertUnwindSafe(executor.execute(ctx)).catch_unwind();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => StepResult::failure(ErrorKind::Cancelled, "step cancelled"),
        outcome = body => match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => StepResult::from_error(&error),
            Err(_) => StepResult::failure(ErrorKind::Internal, "step body panicked"),
        },
    }
}

/// Wavefront scheduler
///
/// Drives one flow instance at a time: computes the ready frontier, runs
/// sequential members in order and parallel members behind a join barrier,
/// applies failure tiers, branches, jumps, pauses and triggers, and persists
/// the instance after every wavefront.
#[derive(Clone)]
pub struct FlowExecutionService {
    ctx: Arc<EngineContext>,
}

impl FlowExecutionService {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Persist a freshly started instance and drive it in the background
    pub(crate) async fn launch(
        &self,
        definition: Arc<FlowDefinition>,
        mut instance: FlowInstance,
    ) -> Result<FlowInstanceId, CoreError> {
        self.ctx.persist(&mut instance).await?;
        let id = instance.id.clone();
        self.spawn_drive(definition, instance);
        Ok(id)
    }

    /// Drive a Running instance on a background task
    pub(crate) fn spawn_drive(&self, definition: Arc<FlowDefinition>, instance: FlowInstance) {
        let cancel = CancellationToken::new();
        self.ctx.running.insert(instance.id.clone(), cancel.clone());
        let service = self.clone();
        tokio::spawn(async move {
            let id = instance.id.clone();
            if let Err(e) = service.drive(definition, instance, cancel).await {
                error!(flow_instance_id = %id, error = %e, "Flow instance execution aborted");
            }
        });
    }

    async fn drive(
        &self,
        definition: Arc<FlowDefinition>,
        mut instance: FlowInstance,
        cancel: CancellationToken,
    ) -> Result<FlowInstance, CoreError> {
        let span = tracing::info_span!(
            "flow_instance",
            flow_id = %instance.flow_id,
            flow_instance_id = %instance.id
        );
        let outcome = self
            .run_wavefronts(&definition, &mut instance, &cancel)
            .instrument(span)
            .await;
        self.ctx.running.remove(&instance.id);
        match outcome {
            Ok(()) => Ok(instance),
            // Another process changed the instance (an abort, or a second driver):
            // stop here and report what the store holds
            Err(CoreError::ConcurrencyConflict(message)) => {
                cancel.cancel();
                warn!(
                    flow_instance_id = %instance.id,
                    %message,
                    "Flow instance changed elsewhere, no longer driving it"
                );
                let stored = self
                    .ctx
                    .instances
                    .find_by_id(&instance.id)
                    .await?
                    .ok_or_else(|| CoreError::FlowInstanceNotFound(instance.id.to_string()))?;
                self.ctx.publish_status(&stored.id, stored.status);
                Ok(stored)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_wavefronts(
        &self,
        definition: &FlowDefinition,
        instance: &mut FlowInstance,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        debug!(version = instance.version, "Driving flow instance");

        loop {
            if instance.status != FlowStatus::Running {
                return Ok(());
            }

            if cancel.is_cancelled() {
                warn!("Flow instance aborted");
                self.cancel_unstarted(definition, instance, "flow instance aborted")?;
                instance.fail(FlowFailure {
                    step: None,
                    message: "flow instance aborted".to_string(),
                    kind: ErrorKind::Cancelled,
                })?;
                self.ctx.persist(instance).await?;
                return Ok(());
            }

            self.block_dependents(definition, instance)?;
            let frontier = ready_steps(definition, instance);
            if frontier.is_empty() {
                self.finish(definition, instance)?;
                self.ctx.persist(instance).await?;
                return Ok(());
            }

            let (parallel, sequential): (Vec<&StepDefinition>, Vec<&StepDefinition>) =
                frontier.into_iter().partition(|step| step.flags.in_parallel);
            debug!(
                sequential = sequential.len(),
                parallel = parallel.len(),
                "Wavefront ready"
            );

            let mut launches = Vec::new();
            let mut halted = false;

            for step in sequential {
                // A jump earlier in this wavefront may have skipped it
                if instance.step_status(&step.name).is_some() {
                    continue;
                }
                let outcome = self.run_step(definition, step, instance, cancel).await;
                let resolution = self.apply_outcome(definition, instance, step, outcome, &mut launches)?;
                if self.settle(definition, instance, resolution, cancel)? {
                    halted = true;
                    break;
                }
            }

            if !halted {
                let eligible: Vec<&StepDefinition> = parallel
                    .into_iter()
                    .filter(|step| instance.step_status(&step.name).is_none())
                    .collect();
                if !eligible.is_empty() {
                    let outcomes = self.run_parallel(definition, &eligible, instance, cancel).await;

                    let mut critical = None;
                    let mut pause = None;
                    for (step, outcome) in eligible.iter().zip(outcomes) {
                        match self.apply_outcome(definition, instance, step, outcome, &mut launches)? {
                            Resolution::Resolved => {}
                            Resolution::Critical(failure) => {
                                critical.get_or_insert(failure);
                            }
                            Resolution::Pause(state) => {
                                pause.get_or_insert(state);
                            }
                        }
                    }

                    let resolution = match (critical, pause) {
                        (Some(failure), _) => Resolution::Critical(failure),
                        (None, Some(state)) => Resolution::Pause(state),
                        (None, None) => Resolution::Resolved,
                    };
                    self.settle(definition, instance, resolution, cancel)?;
                }
            }

            self.ctx.persist(instance).await?;
            for launch in launches {
                self.launch_child(launch).await;
            }
        }
    }

    async fn run_parallel(
        &self,
        definition: &FlowDefinition,
        steps: &[&StepDefinition],
        instance: &FlowInstance,
        cancel: &CancellationToken,
    ) -> Vec<StepOutcome> {
        let mut pending: FuturesUnordered<_> = steps
            .iter()
            .enumerate()
            .map(|(i, step)| async move {
                (i, self.run_step(definition, step, instance, cancel).await)
            })
            .collect();

        let mut slots: Vec<Option<StepOutcome>> = (0..steps.len()).map(|_| None).collect();
        while let Some((i, outcome)) = pending.next().await {
            if steps[i].flags.critical && !outcome.result.is_success() && !cancel.is_cancelled() {
                warn!(step = %steps[i].name, "Critical step failed, cancelling parallel peers");
                cancel.cancel();
            }
            slots[i] = Some(outcome);
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    StepOutcome::from_result(StepResult::failure(
                        ErrorKind::Internal,
                        "parallel step produced no outcome",
                    ))
                })
            })
            .collect()
    }

    async fn run_step(
        &self,
        definition: &FlowDefinition,
        step: &StepDefinition,
        instance: &FlowInstance,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        info!(step = %step.name, "Step started");
        let mut outcome = self
            .run_unit(definition, step, &step.name, instance, instance.data.clone(), cancel)
            .await;

        if outcome.result.is_success() && outcome.pause.is_none() {
            let mut data = instance.data.clone();
            data.merge(outcome.outputs.clone());

            if let Some(branch) = select_branch(&step.static_branches, &data) {
                self.run_static_branch(definition, step, branch, instance, &mut data, cancel, &mut outcome)
                    .await;
            }
            if outcome.result.is_success() {
                if let Some(dynamic) = &step.dynamic_branches {
                    self.run_dynamic_branches(step, dynamic, instance, &data, cancel, &mut outcome)
                        .await;
                }
            }
            if outcome.result.is_success() {
                if let Some(target) = &outcome.jump {
                    if let Err(e) = definition.validate_jump(&step.name, target) {
                        outcome.result = StepResult::from_error(&e);
                        outcome.jump = None;
                    }
                }
            }
        }

        debug!(
            step = %step.name,
            success = outcome.result.is_success(),
            paused = outcome.pause.is_some(),
            "Step finished"
        );
        outcome
    }

    /// Requirement check, idempotency gate and body of one step or branch step
    async fn run_unit(
        &self,
        definition: &FlowDefinition,
        step: &StepDefinition,
        record_name: &str,
        instance: &FlowInstance,
        data: DataBag,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        for requirement in &step.requires {
            if let Err(e) = requirement.check(&data) {
                return StepOutcome::from_result(StepResult::from_error(&e));
            }
        }

        let key = match step.idempotency_key(definition.id(), &instance.id, record_name, &data) {
            Ok(Some(key)) => key,
            Ok(None) => return self.invoke(step, record_name, &instance.id, data, cancel).await,
            Err(e) => return StepOutcome::from_result(StepResult::from_error(&e)),
        };

        let stored_key = key.clone();
        let gated = self
            .ctx
            .gate
            .run(&key, || async move {
                let mut outcome = self.invoke(step, record_name, &instance.id, data, cancel).await;
                outcome.idempotency_key = Some(stored_key);
                let record = outcome.storable(record_name);
                (outcome, record)
            })
            .await;

        match gated {
            Ok(GateOutcome::Executed(outcome)) => outcome,
            Ok(GateOutcome::Replayed(record)) => {
                info!(step = %record_name, idempotency_key = %key, "Idempotent step replayed");
                StepOutcome::replayed(record, key)
            }
            Err(e) => {
                let mut outcome = StepOutcome::from_result(StepResult::from_error(&e));
                outcome.idempotency_key = Some(key);
                outcome
            }
        }
    }

    async fn invoke(
        &self,
        step: &StepDefinition,
        record_name: &str,
        instance_id: &FlowInstanceId,
        data: DataBag,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let ctx = StepContext::new(instance_id.clone(), record_name, data, cancel.clone());
        let result = execute_body(step.body.clone(), ctx.clone(), cancel).await;
        let (outputs, jump) = ctx.take_effects();

        let mut outcome = StepOutcome::from_result(result);
        outcome.outputs = outputs;
        outcome.jump = jump;
        if !outcome.result.is_success() {
            return outcome;
        }

        if let (Some(key), Some(payload)) = (&step.output_key, outcome.result.payload()) {
            outcome.outputs.insert_value(key.clone(), payload.clone());
        }

        if let Some(pause) = &step.pause {
            let mut view = ctx.data();
            view.merge(outcome.outputs.clone());
            if pause.when.evaluate(&view) {
                outcome.pause = Some(PauseRequest {
                    reason: pause.reason.clone(),
                    payload: outcome.result.payload().cloned(),
                    resume: pause.resume.clone(),
                });
            }
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_static_branch(
        &self,
        definition: &FlowDefinition,
        owner: &StepDefinition,
        branch: &StaticBranch,
        instance: &FlowInstance,
        data: &mut DataBag,
        cancel: &CancellationToken,
        outcome: &mut StepOutcome,
    ) {
        info!(step = %owner.name, branch = %branch.name, "Static branch selected");

        for branch_step in &branch.steps {
            let record_name = format!("{}/{}/{}", owner.name, branch.name, branch_step.name);
            let unit = self
                .run_unit(definition, branch_step, &record_name, instance, data.clone(), cancel)
                .await;

            data.merge(unit.outputs.clone());
            outcome.outputs.merge(unit.outputs.clone());
            outcome.branch_records.push(unit.to_record(&record_name));

            if !unit.result.is_success() {
                outcome.result = StepResult::failure(
                    unit.result.error_kind().unwrap_or(ErrorKind::Internal),
                    format!(
                        "branch '{}' step '{}' failed: {}",
                        branch.name,
                        branch_step.name,
                        unit.result.message()
                    ),
                );
                return;
            }
            if let Some(target) = unit.jump {
                outcome.jump = Some(target);
                return;
            }
        }

        if let Some(target) = &branch.jump_to {
            outcome.jump = Some(target.clone());
        }
    }

    async fn run_dynamic_branches(
        &self,
        owner: &StepDefinition,
        dynamic: &DynamicBranches,
        instance: &FlowInstance,
        data: &DataBag,
        cancel: &CancellationToken,
        outcome: &mut StepOutcome,
    ) {
        let items = match (dynamic.selector)(data) {
            Ok(items) => items,
            Err(e) => {
                outcome.result = StepResult::from_error(&e);
                return;
            }
        };
        let total = items.len();
        let groups = plan_branches(items, &dynamic.distribution);
        info!(step = %owner.name, branches = total, groups = groups.len(), "Fanning out");

        let runs = groups
            .iter()
            .map(|group| self.run_branch_group(owner, dynamic, group, instance, data, cancel));
        let finished = futures::future::join_all(runs).await;

        let mut reports: Vec<(usize, BranchReport)> = Vec::with_capacity(total);
        let mut first_failure: Option<ErrorKind> = None;
        for (planned, result) in finished.into_iter().flatten() {
            let status = classify(&result);
            if status != StepStatus::Succeeded && first_failure.is_none() {
                first_failure = result.error_kind();
            }
            reports.push((
                planned.ordinal,
                BranchReport {
                    id: planned.item.id.clone(),
                    group: planned.group.clone(),
                    priority: planned.item.priority,
                    status,
                    message: result.message(),
                    payload: result.payload().cloned(),
                },
            ));
            outcome.branch_records.push(ExecutionRecord::new(
                format!("{}[{}]", owner.name, planned.item.id),
                status,
                result,
            ));
        }
        reports.sort_by_key(|(ordinal, _)| *ordinal);
        let failures = reports
            .iter()
            .filter(|(_, report)| report.status != StepStatus::Succeeded)
            .count();
        let reports: Vec<BranchReport> = reports.into_iter().map(|(_, report)| report).collect();

        if let Err(e) = outcome.outputs.insert(dynamic.results_key.clone(), &reports) {
            outcome.result = StepResult::from_error(&e);
            return;
        }
        if failures > 0 {
            warn!(step = %owner.name, failures, total, "Dynamic branches failed");
            outcome.result = StepResult::failure(
                first_failure.unwrap_or(ErrorKind::Internal),
                format!("{} of {} branches of '{}' failed", failures, total, owner.name),
            );
        }
    }

    async fn run_branch_group<'g>(
        &self,
        owner: &StepDefinition,
        dynamic: &DynamicBranches,
        group: &'g BranchGroup,
        instance: &FlowInstance,
        data: &DataBag,
        cancel: &CancellationToken,
    ) -> Vec<(&'g PlannedBranch, StepResult)> {
        let mut results = Vec::with_capacity(group.branches.len());
        for planned in &group.branches {
            let record_name = format!("{}[{}]", owner.name, planned.item.id);
            debug!(branch = %record_name, group = %planned.group, "Branch started");

            let mut branch_data = data.clone();
            branch_data.insert_value("item", planned.item.data.clone());
            branch_data.insert_value(
                "branch",
                json!({
                    "id": planned.item.id,
                    "group": planned.group,
                    "priority": planned.item.priority,
                }),
            );

            let executor = (dynamic.factory)(&planned.item);
            let ctx = StepContext::new(instance.id.clone(), record_name, branch_data, cancel.clone());
            results.push((planned, execute_body(executor, ctx, cancel).await));
        }
        results
    }

    fn apply_outcome(
        &self,
        definition: &FlowDefinition,
        instance: &mut FlowInstance,
        step: &StepDefinition,
        outcome: StepOutcome,
        launches: &mut Vec<ChildLaunch>,
    ) -> Result<Resolution, CoreError> {
        if let Some(request) = outcome.pause {
            // The step stays unrecorded so that its body runs again on resume
            instance.data.merge(outcome.outputs);
            info!(step = %step.name, reason = %request.reason, "Step requested pause");
            return Ok(Resolution::Pause(PauseState {
                step: step.name.clone(),
                reason: request.reason,
                payload: request.payload,
                paused_at: self.ctx.timer.now(),
                resume: request.resume,
                received: Vec::new(),
            }));
        }

        for record in outcome.branch_records {
            instance.record_step(record)?;
        }

        let status = classify(&outcome.result);
        let message = outcome.result.message();
        let kind = outcome.result.error_kind();
        instance.record_step(ExecutionRecord {
            step: step.name.clone(),
            status,
            result: outcome.result,
            idempotency_key: outcome.idempotency_key,
            outputs: outcome.outputs,
            jump_to: outcome.jump.clone(),
            recorded_at: Utc::now(),
        })?;

        if status == StepStatus::Succeeded {
            info!(step = %step.name, "Step succeeded");
            if let Some(target) = &outcome.jump {
                self.skip_to(definition, instance, &step.name, target)?;
            }
            for trigger in &step.triggers {
                if let Some(launch) =
                    self.ctx
                        .dispatcher
                        .prepare(&self.ctx.registry, instance, &step.name, trigger)
                {
                    launches.push(launch);
                }
            }
            return Ok(Resolution::Resolved);
        }

        let kind = kind.unwrap_or(ErrorKind::Internal);
        match step.flags.tier() {
            FailureTier::Critical => {
                error!(step = %step.name, ?kind, error = %message, "Critical step failed");
                Ok(Resolution::Critical(FlowFailure {
                    step: Some(step.name.clone()),
                    message,
                    kind,
                }))
            }
            FailureTier::AllowFailure => {
                warn!(step = %step.name, ?kind, error = %message, "Step failed, failure allowed");
                instance.data.insert(
                    format!("errors.{}", step.name),
                    &json!({ "message": message, "kind": kind }),
                )?;
                Ok(Resolution::Resolved)
            }
            FailureTier::Default => {
                warn!(step = %step.name, ?kind, error = %message, "Step failed, blocking dependents");
                Ok(Resolution::Resolved)
            }
        }
    }

    /// Returns whether the wavefront must stop
    fn settle(
        &self,
        definition: &FlowDefinition,
        instance: &mut FlowInstance,
        resolution: Resolution,
        cancel: &CancellationToken,
    ) -> Result<bool, CoreError> {
        match resolution {
            Resolution::Resolved => Ok(false),
            Resolution::Pause(state) => {
                instance.pause(state)?;
                Ok(true)
            }
            Resolution::Critical(failure) => {
                cancel.cancel();
                self.cancel_unstarted(definition, instance, "cancelled by critical failure")?;
                instance.fail(failure)?;
                Ok(true)
            }
        }
    }

    fn skip_to(
        &self,
        definition: &FlowDefinition,
        instance: &mut FlowInstance,
        from: &str,
        target: &str,
    ) -> Result<(), CoreError> {
        info!(from = %from, to = %target, "Jumping");
        for skipped in definition.steps_between(from, target) {
            if instance.step_status(&skipped.name).is_none() {
                instance.record_step(ExecutionRecord::new(
                    skipped.name.clone(),
                    StepStatus::Skipped,
                    StepResult::success(format!("skipped by jump from '{}' to '{}'", from, target)),
                ))?;
            }
        }
        Ok(())
    }

    fn block_dependents(
        &self,
        definition: &FlowDefinition,
        instance: &mut FlowInstance,
    ) -> Result<(), CoreError> {
        for step in definition.ordered_steps() {
            if instance.step_status(&step.name).is_some() {
                continue;
            }
            let blocker = step
                .after
                .iter()
                .find(|dep| is_blocking(definition, instance, dep));
            if let Some(dep) = blocker {
                let kind = instance
                    .records
                    .get(dep)
                    .and_then(|record| record.result.error_kind())
                    .unwrap_or(ErrorKind::Internal);
                debug!(step = %step.name, dependency = %dep, "Step blocked");
                instance.record_step(ExecutionRecord::new(
                    step.name.clone(),
                    StepStatus::Blocked,
                    StepResult::failure(kind, format!("blocked by failed dependency '{}'", dep)),
                ))?;
            }
        }
        Ok(())
    }

    fn cancel_unstarted(
        &self,
        definition: &FlowDefinition,
        instance: &mut FlowInstance,
        reason: &str,
    ) -> Result<(), CoreError> {
        for step in definition.ordered_steps() {
            if instance.step_status(&step.name).is_none() {
                instance.record_step(ExecutionRecord::new(
                    step.name.clone(),
                    StepStatus::Cancelled,
                    StepResult::failure(ErrorKind::Cancelled, reason),
                ))?;
            }
        }
        Ok(())
    }

    /// Completed when some root-to-sink path resolved without an unrecovered
    /// failure, Failed otherwise
    fn finish(&self, definition: &FlowDefinition, instance: &mut FlowInstance) -> Result<(), CoreError> {
        let mut path_ok: HashMap<&str, bool> = HashMap::new();
        for step in definition.ordered_steps() {
            let ok = is_resolved(definition, instance, &step.name)
                && step
                    .after
                    .iter()
                    .all(|dep| path_ok.get(dep.as_str()).copied().unwrap_or(false));
            path_ok.insert(step.name.as_str(), ok);
        }

        let completed = definition
            .sinks()
            .any(|sink| path_ok.get(sink.name.as_str()).copied().unwrap_or(false));
        if completed {
            let failed = instance
                .records
                .values()
                .filter(|record| record.status == StepStatus::Failed)
                .count();
            info!(failed_steps = failed, "Flow instance completed");
            return instance.complete();
        }

        let failure = instance
            .records
            .values()
            .filter(|record| record.status == StepStatus::Failed)
            .filter(|record| {
                definition
                    .step(&record.step)
                    .map(|step| !step.flags.allow_failure)
                    .unwrap_or(false)
            })
            .min_by_key(|record| record.recorded_at)
            .map(|record| FlowFailure {
                step: Some(record.step.clone()),
                message: record.result.message(),
                kind: record.result.error_kind().unwrap_or(ErrorKind::Internal),
            })
            .unwrap_or_else(|| FlowFailure {
                step: None,
                message: "no path to completion".to_string(),
                kind: ErrorKind::Internal,
            });
        warn!(step = ?failure.step, error = %failure.message, "Flow instance failed");
        instance.fail(failure)
    }

    async fn launch_child(&self, launch: ChildLaunch) {
        let ChildLaunch {
            definition,
            mut instance,
        } = launch;
        match self.ctx.persist(&mut instance).await {
            Ok(()) => self.spawn_drive(definition, instance),
            Err(e) => error!(
                child_instance_id = %instance.id,
                error = %e,
                "Failed to persist child flow instance"
            ),
        }
    }

    /// Re-drive a resumed or recovered instance
    pub(crate) fn resume_drive(&self, instance: FlowInstance) -> Result<(), CoreError> {
        let definition = self.ctx.registry.get(&instance.flow_id.0)?;
        self.spawn_drive(definition, instance);
        Ok(())
    }
}
