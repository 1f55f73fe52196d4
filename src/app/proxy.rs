//! Defines an abstraction over the event sending mechanism.

use super::events::TreeEvent;
use tokio::sync::{broadcast, mpsc};

/// A trait that abstracts the sending of tree events.
/// This is "fire-and-forget" and doesn't return a result, simplifying its use.
pub trait EventProxy: Send + Sync + Clone + 'static {
    fn send_event(&self, event: TreeEvent);
}

/// Fan-out to any number of subscribers. A subscriber that falls behind skips
/// to the newest events, so it always ends up holding the latest snapshot.
impl EventProxy for broadcast::Sender<TreeEvent> {
    fn send_event(&self, event: TreeEvent) {
        if self.send(event).is_err() {
            tracing::debug!("No subscribers for tree event");
        }
    }
}

impl EventProxy for mpsc::UnboundedSender<TreeEvent> {
    fn send_event(&self, event: TreeEvent) {
        if let Err(e) = self.send(event) {
            tracing::warn!("Failed to deliver tree event: {}", e);
        }
    }
}
