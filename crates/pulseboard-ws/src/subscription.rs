//! Topic subscription tracking.
//!
//! The registry records which topics the local process is interested in.
//! Server-side subscription state does not survive a disconnect, so after
//! every successful (re)connection the full set is replayed, one subscribe
//! message per topic, after the outbound queue flush.
//!
//! Membership only: fan-out to multiple local listeners of the same topic
//! happens above this layer, in the event bus.

use crate::envelope::Envelope;
use parking_lot::RwLock;
use std::collections::BTreeSet;

/// Set of topics the client is subscribed to.
///
/// Backed by a `BTreeSet` so replay order is deterministic.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topics: RwLock<BTreeSet<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record interest in a topic. Returns `false` if already present.
    pub fn insert(&self, topic: String) -> bool {
        self.topics.write().insert(topic)
    }

    /// Drop interest in a topic. Returns `false` if it was not present.
    pub fn remove(&self, topic: &str) -> bool {
        self.topics.write().remove(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.read().contains(topic)
    }

    /// Current topics, sorted.
    pub fn snapshot(&self) -> Vec<String> {
        self.topics.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.topics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.read().is_empty()
    }

    /// One subscribe envelope per registered topic, in sorted order.
    pub fn replay_messages(&self) -> Vec<Envelope> {
        self.topics.read().iter().map(Envelope::subscribe).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.insert("alerts".to_string()));
        assert!(!registry.insert("alerts".to_string()));
        assert!(registry.contains("alerts"));

        assert!(registry.remove("alerts"));
        assert!(!registry.remove("alerts"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_replay_matches_snapshot() {
        let registry = SubscriptionRegistry::new();
        registry.insert("metrics".to_string());
        registry.insert("alerts".to_string());

        let replay = registry.replay_messages();
        assert_eq!(replay.len(), 2);
        // Sorted order: alerts before metrics.
        assert_eq!(replay[0], Envelope::subscribe("alerts"));
        assert_eq!(replay[1], Envelope::subscribe("metrics"));
        assert_eq!(registry.snapshot(), vec!["alerts", "metrics"]);
    }

    #[test]
    fn test_removed_topic_absent_from_replay() {
        let registry = SubscriptionRegistry::new();
        registry.insert("t".to_string());
        registry.remove("t");
        assert!(registry.replay_messages().is_empty());
    }
}
