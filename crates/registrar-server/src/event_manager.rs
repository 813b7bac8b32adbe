use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default channel depth; slow watchers beyond this observe a lag error.
const DEFAULT_CAPACITY: usize = 256;

// Fan-out of change notifications to any number of watchers
pub struct EventManager<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventManager<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    // Create a new subscription to events
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    // Publish an event. Fails only when nobody is listening.
    pub fn send(&self, event: T) -> Result<usize, broadcast::error::SendError<T>> {
        let receivers = self.tx.receiver_count();

        if receivers > 0 {
            let n = self.tx.send(event)?;
            trace!(receivers = n, "Event delivered");
            Ok(n)
        } else {
            debug!("No receivers for event");
            Err(broadcast::error::SendError(event))
        }
    }

    // Get the current receiver count
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Default for EventManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

// Clones share the same channel
impl<T> Clone for EventManager<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}
