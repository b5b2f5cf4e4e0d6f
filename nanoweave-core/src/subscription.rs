//! Topic prefix filters for subscriber sockets and contexts.
//!
//! A [`SubscriptionSet`] with no prefixes delivers nothing; the empty prefix
//! matches every topic.

use bytes::Bytes;

use crate::error::{Result, WeaveError};

/// A single topic prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Topic prefix (empty = subscribe to all)
    pub prefix: Bytes,
}

impl Subscription {
    /// Create a new subscription for a topic prefix
    #[must_use]
    pub const fn new(prefix: Bytes) -> Self {
        Self { prefix }
    }

    /// Check if this subscription matches a given topic
    #[must_use]
    pub fn matches(&self, topic: &[u8]) -> bool {
        topic.starts_with(&self.prefix)
    }
}

/// Ordered set of subscriptions, deduplicated by prefix.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    subscriptions: Vec<Subscription>,
}

impl SubscriptionSet {
    /// Create a new empty set
    #[must_use]
    pub const fn new() -> Self {
        Self {
            subscriptions: Vec::new(),
        }
    }

    /// Build a set from a list of prefixes.
    #[must_use]
    pub fn from_prefixes(prefixes: &[Bytes]) -> Self {
        let mut set = Self::new();
        set.replace(prefixes);
        set
    }

    /// Add a subscription. Subscribing twice is a no-op.
    pub fn subscribe(&mut self, prefix: Bytes) {
        if !self.subscriptions.iter().any(|s| s.prefix == prefix) {
            self.subscriptions.push(Subscription::new(prefix));
        }
    }

    /// Remove a subscription.
    ///
    /// Fails with `InvalidArgument` if the prefix was never subscribed.
    pub fn unsubscribe(&mut self, prefix: &[u8]) -> Result<()> {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.prefix != prefix);
        if self.subscriptions.len() == before {
            return Err(WeaveError::invalid_argument(format!(
                "not subscribed to {:?}",
                String::from_utf8_lossy(prefix)
            )));
        }
        Ok(())
    }

    /// Replace all subscriptions with `prefixes`.
    pub fn replace(&mut self, prefixes: &[Bytes]) {
        self.subscriptions.clear();
        for prefix in prefixes {
            self.subscribe(prefix.clone());
        }
    }

    /// Check if a topic matches any subscription
    ///
    /// Returns true if the topic should be delivered.
    #[must_use]
    pub fn matches(&self, topic: &[u8]) -> bool {
        self.subscriptions.iter().any(|s| s.matches(topic))
    }

    /// Current prefixes, in subscription order.
    #[must_use]
    pub fn prefixes(&self) -> Vec<Bytes> {
        self.subscriptions.iter().map(|s| s.prefix.clone()).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_subscription_matches() {
        let sub = Subscription::new(Bytes::from_static(b"topic."));

        assert!(sub.matches(b"topic.foo"));
        assert!(sub.matches(b"topic.bar"));
        assert!(!sub.matches(b"other.foo"));
        assert!(!sub.matches(b"topi"));
    }

    #[test]
    fn test_empty_prefix_matches_all() {
        let sub = Subscription::new(Bytes::new());

        assert!(sub.matches(b"anything"));
        assert!(sub.matches(b""));
    }

    #[test]
    fn test_empty_set_matches_nothing() {
        let set = SubscriptionSet::new();
        assert!(!set.matches(b"beep"));
        assert!(!set.matches(b""));
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let mut set = SubscriptionSet::new();
        set.subscribe(Bytes::from_static(b"beep"));
        set.subscribe(Bytes::from_static(b"beep"));
        assert_eq!(set.len(), 1);
        assert!(set.matches(b"beep boop"));
        assert!(!set.matches(b"hello"));

        set.unsubscribe(b"beep").unwrap();
        assert!(!set.matches(b"beep boop"));

        let err = set.unsubscribe(b"beep").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_replace_keeps_order() {
        let set = SubscriptionSet::from_prefixes(&[
            Bytes::from_static(b"beep"),
            Bytes::from_static(b"hello"),
        ]);
        assert!(set.matches(b"beep"));
        assert!(set.matches(b"hello world"));
        assert_eq!(
            set.prefixes(),
            vec![Bytes::from_static(b"beep"), Bytes::from_static(b"hello")]
        );
    }
}
