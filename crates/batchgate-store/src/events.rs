//! Broadcast event channel.

use async_trait::async_trait;
use batchgate_core::clients::EventChannel;
use batchgate_core::{JobEvent, Result};
use tokio::sync::broadcast;
use tracing::trace;

/// Fans job events out to in-process subscribers.
///
/// Publishing never fails: with no subscribers the event is dropped, and a
/// subscriber that falls behind by more than `capacity` events skips ahead.
#[derive(Clone)]
pub struct BroadcastEventChannel {
    sender: broadcast::Sender<JobEvent>,
}

impl BroadcastEventChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventChannel for BroadcastEventChannel {
    async fn publish(&self, event: JobEvent) -> Result<()> {
        if self.sender.send(event).is_err() {
            trace!("No event subscribers");
        }
        Ok(())
    }
}
