//! In-memory infrastructure for the Conduit engine
//!
//! This crate provides in-memory implementations of the ports defined in
//! conduit-core: flow instance and idempotency stores, a broadcast event bus
//! and timers. It is primarily useful for development, testing and single
//! process deployments where persistence is not required.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod event_bus;
pub mod repositories;
pub mod timer;

pub use event_bus::InMemoryEventBus;
pub use repositories::{IdempotencyEntry, InMemoryFlowInstanceRepository, InMemoryIdempotencyRepository};
pub use timer::{IntervalTimer, ManualTimer};

use conduit_core::{
    DomainEventHandler, EngineDependencies, FlowInstance, FlowInstanceRepository,
    IdempotencyRepository, Timer, TracingEventHandler,
};

/// Default capacity of the event bus channel
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Provider for in-memory stores
///
/// Repositories created by the same provider share their storage, so a
/// second engine built from the same provider sees the instances of the
/// first one, the way two processes would share a database.
pub struct InMemoryStateStoreProvider {
    // Shared storage for flow instances
    flow_instances: Arc<RwLock<HashMap<String, FlowInstance>>>,

    // Shared storage for idempotency claims and results
    idempotency: Arc<RwLock<HashMap<String, IdempotencyEntry>>>,

    event_bus: Arc<InMemoryEventBus>,
}

impl InMemoryStateStoreProvider {
    /// Create a new in-memory state store provider
    pub fn new() -> Self {
        Self::with_event_buffer(DEFAULT_EVENT_BUFFER)
    }

    /// Create a provider whose event bus buffers `capacity` events
    pub fn with_event_buffer(capacity: usize) -> Self {
        Self {
            flow_instances: Arc::new(RwLock::new(HashMap::new())),
            idempotency: Arc::new(RwLock::new(HashMap::new())),
            event_bus: Arc::new(InMemoryEventBus::new(capacity)),
        }
    }

    /// Create repositories sharing this provider's storage
    pub fn create_repositories(
        &self,
    ) -> (Arc<dyn FlowInstanceRepository>, Arc<dyn IdempotencyRepository>) {
        (
            Arc::new(InMemoryFlowInstanceRepository::new(self.flow_instances.clone())),
            Arc::new(InMemoryIdempotencyRepository::new(self.idempotency.clone())),
        )
    }

    /// The shared event bus
    pub fn event_bus(&self) -> Arc<InMemoryEventBus> {
        self.event_bus.clone()
    }

    /// Engine dependencies on this provider, logging domain events
    pub fn dependencies(&self, timer: Arc<dyn Timer>) -> EngineDependencies {
        self.dependencies_with_handler(timer, Arc::new(TracingEventHandler))
    }

    /// Engine dependencies on this provider with a custom event handler
    pub fn dependencies_with_handler(
        &self,
        timer: Arc<dyn Timer>,
        event_handler: Arc<dyn DomainEventHandler>,
    ) -> EngineDependencies {
        let (instances, idempotency) = self.create_repositories();
        EngineDependencies {
            instances,
            idempotency,
            event_bus: self.event_bus.clone(),
            timer,
            event_handler,
        }
    }
}

impl Default for InMemoryStateStoreProvider {
    fn default() -> Self {
        Self::new()
    }
}
