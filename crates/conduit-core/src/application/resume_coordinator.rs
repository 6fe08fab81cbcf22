//!
//! Pause/resume coordinator
//! Routes inbound events, elapsed timeouts and manual resumes to paused instances
//!

use crate::{
    application::flow_execution_service::{EngineContext, FlowExecutionService},
    domain::flow_instance::{FlowFailure, FlowInstance, FlowInstanceId, FlowStatus},
    domain::pause::{SignalEvaluation, TimeoutOutcome},
    domain::repository::InboundEvent,
    error::ErrorKind,
    CoreError,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Someone resuming a paused instance by hand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Actor identifier, recorded in the resume trigger
    pub id: String,
    /// Roles held by the actor
    pub roles: Vec<String>,
}

impl Actor {
    /// Create an actor
    pub fn new(id: impl Into<String>, roles: &[&str]) -> Self {
        Self {
            id: id.into(),
            roles: roles.iter().map(|role| role.to_string()).collect(),
        }
    }
}

/// Times an evaluation is re-applied after another process saved the instance first
const CONFLICT_RETRIES: usize = 5;

/// Pause/resume coordinator
///
/// Every change to a paused instance happens under a per-instance lock and
/// is saved with a version check, so concurrent deliveries for the same
/// instance resume it at most once. An evaluation that loses the versioned
/// save is applied again to the fresh state.
pub struct ResumeCoordinator {
    ctx: Arc<EngineContext>,
    executor: FlowExecutionService,
    locks: DashMap<FlowInstanceId, Arc<Mutex<()>>>,
}

impl ResumeCoordinator {
    pub(crate) fn new(ctx: Arc<EngineContext>, executor: FlowExecutionService) -> Self {
        Self {
            ctx,
            executor,
            locks: DashMap::new(),
        }
    }

    /// Offer an event to every instance paused on it; returns the resumed instances
    pub async fn deliver_event(
        &self,
        name: &str,
        payload: &Value,
    ) -> Result<Vec<FlowInstanceId>, CoreError> {
        let candidates = self.ctx.instances.find_awaiting_event(name).await?;
        if candidates.is_empty() {
            debug!(event = %name, "No paused instance awaits event");
            return Ok(Vec::new());
        }

        let mut resumed = Vec::new();
        for candidate in candidates {
            match self.offer_event(&candidate.id, name, payload).await {
                Ok(true) => resumed.push(candidate.id),
                Ok(false) => {}
                Err(CoreError::ConcurrencyConflict(message)) => {
                    warn!(flow_instance_id = %candidate.id, event = %name, %message, "Event dropped after repeated conflicts");
                }
                Err(e) => {
                    warn!(flow_instance_id = %candidate.id, event = %name, error = %e, "Event delivery failed");
                }
            }
        }
        Ok(resumed)
    }

    async fn offer_event(
        &self,
        id: &FlowInstanceId,
        name: &str,
        payload: &Value,
    ) -> Result<bool, CoreError> {
        self.evaluate(id, move || self.apply_event(id, name, payload)).await
    }

    async fn apply_event(
        &self,
        id: &FlowInstanceId,
        name: &str,
        payload: &Value,
    ) -> Result<bool, CoreError> {
        let mut instance = match self.load_paused(id).await? {
            Some(instance) => instance,
            None => return Ok(false),
        };
        let mut pause = match instance.pause.take() {
            Some(pause) => pause,
            None => return Ok(false),
        };
        let evaluation = pause.apply_event(name, payload, &mut instance.data);
        let step = pause.step.clone();
        instance.pause = Some(pause);

        match evaluation {
            SignalEvaluation::Ignored => Ok(false),
            SignalEvaluation::Recorded => {
                info!(flow_instance_id = %id, step = %step, event = %name, "Signal recorded");
                instance.update_timestamp();
                self.ctx.persist(&mut instance).await?;
                Ok(false)
            }
            SignalEvaluation::Satisfied => {
                info!(flow_instance_id = %id, step = %step, event = %name, "Signals satisfied, resuming");
                instance.resume(&format!("signals:{}", name))?;
                self.resume(instance).await?;
                Ok(true)
            }
        }
    }

    /// Apply every elapsed timeout; returns the instances that were resumed or failed
    pub async fn evaluate_timeouts(&self) -> Result<Vec<FlowInstanceId>, CoreError> {
        let now = self.ctx.timer.now();
        let paused = self
            .ctx
            .instances
            .list_instances(None, Some(FlowStatus::Paused))
            .await?;

        let mut affected = Vec::new();
        for candidate in paused {
            let due = candidate
                .pause
                .as_ref()
                .and_then(|pause| pause.due_elapsed(now))
                .is_some();
            if !due {
                continue;
            }

            let outcome = {
                let id = &candidate.id;
                self.evaluate(id, move || self.expire(id, now)).await
            };
            match outcome {
                Ok(true) => affected.push(candidate.id),
                Ok(false) => {}
                Err(e) => {
                    warn!(flow_instance_id = %candidate.id, error = %e, "Timeout evaluation failed");
                }
            }
        }
        Ok(affected)
    }

    async fn expire(&self, id: &FlowInstanceId, now: DateTime<Utc>) -> Result<bool, CoreError> {
        let mut instance = match self.load_paused(id).await? {
            Some(instance) => instance,
            None => return Ok(false),
        };
        let (step, elapsed) = match instance.pause.as_ref() {
            Some(pause) => match pause.due_elapsed(now) {
                Some(elapsed) => (pause.step.clone(), elapsed.clone()),
                None => return Ok(false),
            },
            None => return Ok(false),
        };

        match elapsed.outcome {
            TimeoutOutcome::Resume => {
                info!(flow_instance_id = %id, step = %step, flag = %elapsed.flag, "Pause timed out, resuming");
                instance.data.insert_value(elapsed.flag.clone(), Value::Bool(true));
                instance.resume("timeout")?;
                self.resume(instance).await?;
            }
            TimeoutOutcome::Fail => {
                warn!(flow_instance_id = %id, step = %step, "Pause timed out, failing instance");
                instance.data.insert_value(elapsed.flag.clone(), Value::Bool(true));
                instance.fail(FlowFailure {
                    step: Some(step.clone()),
                    message: format!(
                        "step '{}' waited longer than {}s",
                        step,
                        elapsed.after.as_secs()
                    ),
                    kind: ErrorKind::Timeout,
                })?;
                self.ctx.persist(&mut instance).await?;
            }
        }
        Ok(true)
    }

    /// Resume a paused instance on behalf of `actor`
    ///
    /// The pause must accept manual resumption and the actor must hold one of
    /// its roles; otherwise the instance stays paused and the call fails with
    /// `NotAuthorizedError`.
    pub async fn resume_manually(&self, id: &FlowInstanceId, actor: &Actor) -> Result<(), CoreError> {
        self.evaluate(id, move || self.apply_manual(id, actor)).await
    }

    async fn apply_manual(&self, id: &FlowInstanceId, actor: &Actor) -> Result<(), CoreError> {
        let mut instance = self
            .ctx
            .instances
            .find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::FlowInstanceNotFound(id.to_string()))?;
        if instance.status != FlowStatus::Paused {
            return Err(CoreError::FlowExecutionError(format!(
                "Cannot resume flow in state: {:?}",
                instance.status
            )));
        }

        let (step, flag) = {
            let pause = instance.pause.as_ref().ok_or_else(|| {
                CoreError::FlowExecutionError(format!("Instance {} has no pause state", id))
            })?;
            let manual = pause.manual().ok_or_else(|| {
                CoreError::NotAuthorizedError(format!(
                    "Step '{}' does not accept manual resumption",
                    pause.step
                ))
            })?;
            if !manual.permits(&actor.roles) {
                return Err(CoreError::NotAuthorizedError(format!(
                    "Actor '{}' holds none of the roles {:?} required to resume step '{}'",
                    actor.id, manual.roles, pause.step
                )));
            }
            (pause.step.clone(), manual.flag.clone())
        };

        info!(flow_instance_id = %id, step = %step, actor = %actor.id, "Manual resume");
        instance.data.insert_value(flag, Value::Bool(true));
        instance.resume(&format!("manual:{}", actor.id))?;
        self.resume(instance).await
    }

    /// Abort an instance this process is not driving
    ///
    /// A paused instance fails with `Cancelled`. If an event resumed it in
    /// this process while the abort waited for the lock, its token is
    /// cancelled instead. A Running instance driven elsewhere is failed in
    /// the store; its driver stops at its next save.
    pub(crate) async fn abort(&self, id: &FlowInstanceId, reason: &str) -> Result<(), CoreError> {
        self.evaluate(id, move || self.apply_abort(id, reason)).await
    }

    async fn apply_abort(&self, id: &FlowInstanceId, reason: &str) -> Result<(), CoreError> {
        let mut instance = self
            .ctx
            .instances
            .find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::FlowInstanceNotFound(id.to_string()))?;

        match instance.status {
            FlowStatus::Paused | FlowStatus::Pending => {}
            FlowStatus::Running => {
                if let Some(token) = self.ctx.running.get(id) {
                    info!(flow_instance_id = %id, reason = %reason, "Cancelling resumed flow instance");
                    token.cancel();
                    return Ok(());
                }
            }
            status => {
                return Err(CoreError::FlowExecutionError(format!(
                    "Cannot abort flow in state: {:?}",
                    status
                )))
            }
        }

        let step = instance.pause.as_ref().map(|pause| pause.step.clone());
        instance.fail(FlowFailure {
            step,
            message: reason.to_string(),
            kind: ErrorKind::Cancelled,
        })?;
        warn!(flow_instance_id = %id, reason = %reason, "Flow instance aborted");
        self.ctx.persist(&mut instance).await
    }

    /// Listen to the event bus and the timer until `shutdown` fires
    pub(crate) async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<InboundEvent>,
        shutdown: CancellationToken,
    ) {
        info!("Resume coordinator started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = self.deliver_event(&event.name, &event.payload).await {
                            warn!(event = %event.name, error = %e, "Failed to route event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Resume coordinator lagged behind the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event bus closed");
                        break;
                    }
                },
                _ = self.ctx.timer.tick() => {
                    if let Err(e) = self.evaluate_timeouts().await {
                        warn!(error = %e, "Failed to evaluate timeouts");
                    }
                }
            }
        }
        info!("Resume coordinator stopped");
    }

    async fn load_paused(&self, id: &FlowInstanceId) -> Result<Option<FlowInstance>, CoreError> {
        Ok(self
            .ctx
            .instances
            .find_by_id(id)
            .await?
            .filter(|instance| instance.status == FlowStatus::Paused))
    }

    /// Persist a resumed instance and hand it back to the scheduler
    async fn resume(&self, mut instance: FlowInstance) -> Result<(), CoreError> {
        self.ctx.persist(&mut instance).await?;
        self.executor.resume_drive(instance)
    }

    /// Run `apply` under the instance lock, again on a fresh load while it
    /// loses the versioned save
    async fn evaluate<T, F, Fut>(&self, id: &FlowInstanceId, mut apply: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let lock = self.lock_for(id);
        let mut attempt = 0;
        let outcome = loop {
            let outcome = {
                let _guard = lock.lock().await;
                apply().await
            };
            match outcome {
                Err(CoreError::ConcurrencyConflict(message)) if attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(flow_instance_id = %id, attempt, %message, "Instance changed concurrently, evaluating again");
                }
                outcome => break outcome,
            }
        };
        self.release_lock(id);
        outcome
    }

    fn lock_for(&self, id: &FlowInstanceId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn release_lock(&self, id: &FlowInstanceId) {
        self.locks
            .remove_if(id, |_, entry| Arc::strong_count(entry) <= 2);
    }
}
