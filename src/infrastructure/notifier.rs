use crate::domain::events::{Notification, TripEvent};
use crate::domain::ids::UserId;
use crate::domain::ports::Notifier;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn publish(&self, _topic: &UserId, _event: TripEvent) {}
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn publish(&self, topic: &UserId, event: TripEvent) {
        info!(topic = %topic, ?event, "notify");
    }
}

/// In-process publish/subscribe channel.
///
/// Delivery is at-most-once: with no subscribers, or a subscriber that
/// lags behind the buffer, events are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, topic: &UserId, event: TripEvent) {
        let notification = Notification {
            topic: topic.clone(),
            event,
        };
        if self.sender.send(notification).is_err() {
            debug!(topic = %topic, "no subscribers, notification dropped");
        }
    }
}
