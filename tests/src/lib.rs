//! End-to-end scenario support for Conduit
//!
//! Fixture flows for the business transactions the engine drives (card
//! payments, multi-exchange order placement, subscription lifecycle),
//! provider doubles standing in for acquirers, exchanges and mailers, and
//! an engine harness on in-memory infrastructure with a hand-driven clock.

use anyhow::{bail, Context, Result};
use conduit_core::{
    DataBag, EngineConfig, FlowEngine, FlowInstanceId, FlowSnapshot, FlowStatus, Timer,
};
use conduit_state_inmemory::{InMemoryStateStoreProvider, ManualTimer};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub mod providers;

/// Upper bound for an instance to reach a status
pub const SETTLE: Duration = Duration::from_secs(5);

/// An engine on in-memory stores with a hand-driven clock
pub struct TestEngine {
    pub engine: FlowEngine,
    pub provider: InMemoryStateStoreProvider,
    pub timer: Arc<ManualTimer>,
}

impl TestEngine {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("conduit_core=info")
            .with_test_writer()
            .try_init();

        let provider = InMemoryStateStoreProvider::new();
        let timer = Arc::new(ManualTimer::new());
        let engine = FlowEngine::new(test_config(), provider.dependencies(timer.clone()));
        Self {
            engine,
            provider,
            timer,
        }
    }

    /// A second engine on the same stores, standing in for a restarted process
    pub fn restarted(&self) -> FlowEngine {
        let timer: Arc<dyn Timer> = self.timer.clone();
        FlowEngine::new(test_config(), self.provider.dependencies(timer))
    }

    /// Start `flow` and wait until it completes, fails or pauses
    pub async fn run(&self, flow: &str, data: Value) -> Result<FlowSnapshot> {
        let id = self
            .engine
            .start(flow, DataBag::from_value(data))
            .await
            .with_context(|| format!("Failed to start {}", flow))?;
        self.settle(&id).await
    }

    /// Wait until the instance completes, fails or pauses
    pub async fn settle(&self, id: &FlowInstanceId) -> Result<FlowSnapshot> {
        self.engine
            .wait_until_settled(id, SETTLE)
            .await
            .with_context(|| format!("Instance {} did not settle", id))
    }

    /// Poll until the instance reaches `status`
    pub async fn await_status(&self, id: &FlowInstanceId, status: FlowStatus) -> Result<FlowSnapshot> {
        let deadline = tokio::time::Instant::now() + SETTLE;
        loop {
            let snapshot = self.engine.query(id).await?;
            if snapshot.status == status {
                return Ok(snapshot);
            }
            if tokio::time::Instant::now() > deadline {
                bail!(
                    "Instance {} is {:?}, expected {:?}",
                    id,
                    snapshot.status,
                    status
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine configuration with short idempotency polling
pub fn test_config() -> EngineConfig {
    EngineConfig {
        idempotency_poll_interval_ms: 5,
        idempotency_wait_timeout_ms: 5_000,
        ..EngineConfig::default()
    }
}
