use emuhost_protocol::SessionEvent;
use tokio::sync::broadcast;
use tracing::trace;

pub(crate) const DEFAULT_CAPACITY: usize = 256;

/// Fan-out of controller events to any number of subscribers.
///
/// Sending never blocks, so the worker thread and the UI thread can both
/// publish without a runtime.
#[derive(Clone)]
pub struct EventBroker {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBroker {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SessionEvent) {
        trace!(?event, "emit");
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
