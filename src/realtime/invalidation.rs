//! Named-group cache invalidation.
//!
//! The data layer that owns cached query results subscribes here and refetches
//! whatever is tagged with a group name it receives.

use tokio::sync::broadcast;

const INVALIDATION_CHANNEL_CAPACITY: usize = 256;

pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, group: &str);
}

#[derive(Debug, Clone)]
pub struct BroadcastInvalidator {
    sender: broadcast::Sender<String>,
}

impl Default for BroadcastInvalidator {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(INVALIDATION_CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl BroadcastInvalidator {
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

impl CacheInvalidator for BroadcastInvalidator {
    fn invalidate(&self, group: &str) {
        // No subscribers is fine: nothing is cached yet.
        if self.sender.send(group.to_string()).is_err() {
            tracing::trace!(group, "cache invalidation had no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fans_out_groups_to_every_subscriber() {
        let bridge = BroadcastInvalidator::default();
        let mut first = bridge.subscribe();
        let mut second = bridge.subscribe();

        bridge.invalidate("orders");
        bridge.invalidate("risk-alerts");

        assert_eq!(first.try_recv().ok().as_deref(), Some("orders"));
        assert_eq!(first.try_recv().ok().as_deref(), Some("risk-alerts"));
        assert_eq!(second.try_recv().ok().as_deref(), Some("orders"));
    }

    #[test]
    fn invalidating_without_subscribers_is_not_an_error() {
        let bridge = BroadcastInvalidator::default();
        bridge.invalidate("orders");

        let mut late = bridge.subscribe();
        assert!(late.try_recv().is_err());
    }
}
