use async_trait::async_trait;
use conduit_core::{CoreError, EventBus, InboundEvent};
use tokio::sync::broadcast;
use tracing::debug;

/// Broadcast event bus living in the process
pub struct InMemoryEventBus {
    sender: broadcast::Sender<InboundEvent>,
}

impl InMemoryEventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: InboundEvent) -> Result<(), CoreError> {
        let name = event.name.clone();
        match self.sender.send(event) {
            Ok(receivers) => debug!(event = %name, receivers, "Event published"),
            // Nobody listens: the event is dropped, like a webhook nobody awaits
            Err(_) => debug!(event = %name, "Event published without subscribers"),
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.sender.subscribe()
    }
}
