//! Shared fixtures for the engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use conduit_core::{
    CoreError, DataBag, EngineConfig, ErrorKind, FlowEngine, FlowId, FlowInstance,
    FlowInstanceId, FlowInstanceRepository, FlowSnapshot, FlowStatus, StepDefinition,
    StepResult, Timer,
};
use conduit_state_inmemory::{InMemoryStateStoreProvider, ManualTimer};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for an instance to settle in tests
pub const SETTLE: Duration = Duration::from_secs(5);

/// Ordered log of executed step bodies
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("conduit_core=debug")
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        idempotency_poll_interval_ms: 5,
        idempotency_wait_timeout_ms: 5_000,
        ..EngineConfig::default()
    }
}

/// An engine on in-memory stores with a hand-driven clock
pub struct Harness {
    pub engine: FlowEngine,
    pub provider: InMemoryStateStoreProvider,
    pub timer: Arc<ManualTimer>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        init_tracing();
        let provider = InMemoryStateStoreProvider::new();
        let timer = Arc::new(ManualTimer::new());
        let engine = FlowEngine::new(config, provider.dependencies(timer.clone()));
        Self {
            engine,
            provider,
            timer,
        }
    }

    /// A second engine sharing this harness' stores, like a second process
    pub fn sibling(&self) -> FlowEngine {
        let timer: Arc<dyn Timer> = self.timer.clone();
        FlowEngine::new(test_config(), self.provider.dependencies(timer))
    }

    /// Another engine on the shared stores whose instance reads take `delay`,
    /// so concurrent evaluations read the same version before either saves
    pub fn slow_reader(&self, delay: Duration) -> FlowEngine {
        let timer: Arc<dyn Timer> = self.timer.clone();
        let mut deps = self.provider.dependencies(timer);
        deps.instances = Arc::new(SlowReads {
            inner: deps.instances,
            delay,
        });
        FlowEngine::new(test_config(), deps)
    }

    pub fn register(&self, definition: Result<conduit_core::FlowDefinition, CoreError>) {
        self.engine.register(definition.unwrap()).unwrap();
    }

    /// Start `flow` and wait until it completes, fails or pauses
    pub async fn run(&self, flow: &str, data: Value) -> FlowSnapshot {
        let id = self
            .engine
            .start(flow, DataBag::from_value(data))
            .await
            .unwrap();
        self.engine.wait_until_settled(&id, SETTLE).await.unwrap()
    }
}

/// Instance store whose `find_by_id` sleeps before reading
struct SlowReads {
    inner: Arc<dyn FlowInstanceRepository>,
    delay: Duration,
}

#[async_trait]
impl FlowInstanceRepository for SlowReads {
    async fn find_by_id(&self, id: &FlowInstanceId) -> Result<Option<FlowInstance>, CoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.find_by_id(id).await
    }

    async fn save(&self, instance: &FlowInstance) -> Result<u64, CoreError> {
        self.inner.save(instance).await
    }

    async fn delete(&self, id: &FlowInstanceId) -> Result<(), CoreError> {
        self.inner.delete(id).await
    }

    async fn find_awaiting_event(&self, event_name: &str) -> Result<Vec<FlowInstance>, CoreError> {
        self.inner.find_awaiting_event(event_name).await
    }

    async fn list_instances(
        &self,
        flow_id: Option<&FlowId>,
        status: Option<FlowStatus>,
    ) -> Result<Vec<FlowInstance>, CoreError> {
        self.inner.list_instances(flow_id, status).await
    }
}

/// Poll until the instance reaches `status`; for transitions made by the
/// background coordinator, which `wait_until_settled` cannot tell apart
/// from the pause that precedes them
pub async fn await_status(engine: &FlowEngine, id: &FlowInstanceId, status: FlowStatus) -> FlowSnapshot {
    let deadline = tokio::time::Instant::now() + SETTLE;
    loop {
        let snapshot = engine.query(id).await.unwrap();
        if snapshot.status == status {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "instance {} stuck in {:?}, expected {:?}",
            id,
            snapshot.status,
            status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().clone()
}

/// A step that logs its name and succeeds
pub fn recording(name: &str, journal: &Journal) -> StepDefinition {
    let journal = journal.clone();
    let label = name.to_string();
    StepDefinition::from_fn(name, move |_ctx| {
        let journal = journal.clone();
        let label = label.clone();
        async move {
            journal.lock().push(label.clone());
            Ok(StepResult::success(format!("{} done", label)))
        }
    })
}

/// A step that logs its name and fails with `kind`
pub fn failing(name: &str, kind: ErrorKind, journal: &Journal) -> StepDefinition {
    let journal = journal.clone();
    let label = name.to_string();
    StepDefinition::from_fn(name, move |_ctx| {
        let journal = journal.clone();
        let label = label.clone();
        async move {
            journal.lock().push(label.clone());
            Ok(StepResult::failure(kind, format!("{} failed", label)))
        }
    })
}

/// A step that waits until the flow is cancelled
pub fn hanging(name: &str) -> StepDefinition {
    StepDefinition::from_fn(name, |ctx| async move {
        ctx.cancellation_token().cancelled().await;
        Ok(StepResult::success("woke up"))
    })
}

pub fn after(mut step: StepDefinition, deps: &[&str]) -> StepDefinition {
    step.after = deps.iter().map(|dep| dep.to_string()).collect();
    step
}
