//! Subscription table and the "recently disconnected" grace set (§4.2
//! "Subscription table").
//!
//! Grounded on the same `HashMap`-of-sets shape the teacher uses for its
//! client registries in `src/ipc/mod.rs`, with a `BTreeSet` reverse index so
//! broadcast fan-out can iterate in the deterministic ascending-id order
//! §4.2's tie-break calls for.

use crate::message::{EndpointId, MessageId};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct SubscriptionTable {
    by_endpoint: HashMap<EndpointId, HashSet<MessageId>>,
    by_message: HashMap<MessageId, BTreeSet<EndpointId>>,
    recently_disconnected: HashMap<EndpointId, Instant>,
    grace: Duration,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_DISCONNECT_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            by_endpoint: HashMap::new(),
            by_message: HashMap::new(),
            recently_disconnected: HashMap::new(),
            grace,
        }
    }

    pub fn subscribe(&mut self, endpoint_id: EndpointId, message_id: MessageId) {
        self.recently_disconnected.remove(&endpoint_id);
        self.by_message.entry(message_id.clone()).or_default().insert(endpoint_id);
        self.by_endpoint.entry(endpoint_id).or_default().insert(message_id);
    }

    pub fn unsubscribe(&mut self, endpoint_id: EndpointId, message_id: &MessageId) {
        if let Some(set) = self.by_endpoint.get_mut(&endpoint_id) {
            set.remove(message_id);
        }
        if let Some(set) = self.by_message.get_mut(message_id) {
            set.remove(&endpoint_id);
        }
    }

    pub fn is_subscribed(&self, endpoint_id: EndpointId, message_id: &MessageId) -> bool {
        self.by_endpoint
            .get(&endpoint_id)
            .map(|set| set.contains(message_id))
            .unwrap_or(false)
    }

    pub fn subscriptions_of(&self, endpoint_id: EndpointId) -> Vec<MessageId> {
        self.by_endpoint
            .get(&endpoint_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscribers of `message_id`, in ascending endpoint-id order (§4.2 tie-break).
    pub fn subscribers_of(&self, message_id: &MessageId) -> impl Iterator<Item = EndpointId> + '_ {
        self.by_message.get(message_id).into_iter().flatten().copied()
    }

    /// Move all of an endpoint's subscriptions out and start its grace window.
    pub fn remove_endpoint(&mut self, endpoint_id: EndpointId, now: Instant) {
        if let Some(ids) = self.by_endpoint.remove(&endpoint_id) {
            for id in ids {
                if let Some(set) = self.by_message.get_mut(&id) {
                    set.remove(&endpoint_id);
                }
            }
        }
        self.recently_disconnected.insert(endpoint_id, now);
    }

    pub fn is_recently_disconnected(&self, endpoint_id: EndpointId, now: Instant) -> bool {
        self.recently_disconnected
            .get(&endpoint_id)
            .map(|since| now.duration_since(*since) < self.grace)
            .unwrap_or(false)
    }

    /// Drop grace entries past their window; called once per router tick.
    pub fn purge_expired(&mut self, now: Instant) {
        self.recently_disconnected.retain(|_, since| now.duration_since(*since) < self.grace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(method: &'static str) -> MessageId {
        MessageId::new("eagiTest", method)
    }

    #[test]
    fn subscribe_and_unsubscribe_round_trip() {
        let mut table = SubscriptionTable::new();
        table.subscribe(EndpointId(1), id("a"));
        table.subscribe(EndpointId(2), id("a"));
        assert!(table.is_subscribed(EndpointId(1), &id("a")));
        assert_eq!(table.subscribers_of(&id("a")).collect::<Vec<_>>(), vec![EndpointId(1), EndpointId(2)]);

        table.unsubscribe(EndpointId(1), &id("a"));
        assert!(!table.is_subscribed(EndpointId(1), &id("a")));
        assert_eq!(table.subscribers_of(&id("a")).collect::<Vec<_>>(), vec![EndpointId(2)]);
    }

    #[test]
    fn subscribers_are_returned_in_ascending_endpoint_order() {
        let mut table = SubscriptionTable::new();
        table.subscribe(EndpointId(9), id("a"));
        table.subscribe(EndpointId(2), id("a"));
        table.subscribe(EndpointId(5), id("a"));
        assert_eq!(
            table.subscribers_of(&id("a")).collect::<Vec<_>>(),
            vec![EndpointId(2), EndpointId(5), EndpointId(9)]
        );
    }

    #[test]
    fn disconnect_starts_grace_window_and_clears_subscriptions() {
        let mut table = SubscriptionTable::new();
        table.subscribe(EndpointId(1), id("a"));
        let now = Instant::now();
        table.remove_endpoint(EndpointId(1), now);

        assert!(!table.is_subscribed(EndpointId(1), &id("a")));
        assert!(table.subscribers_of(&id("a")).next().is_none());
        assert!(table.is_recently_disconnected(EndpointId(1), now));
    }

    #[test]
    fn grace_window_expires_and_resubscribing_clears_it() {
        let mut table = SubscriptionTable::with_grace(Duration::from_millis(10));
        let t0 = Instant::now();
        table.remove_endpoint(EndpointId(1), t0);
        assert!(table.is_recently_disconnected(EndpointId(1), t0));

        let later = t0 + Duration::from_millis(50);
        assert!(!table.is_recently_disconnected(EndpointId(1), later));

        table.remove_endpoint(EndpointId(2), t0);
        table.subscribe(EndpointId(2), id("a"));
        assert!(!table.is_recently_disconnected(EndpointId(2), t0));
    }

    #[test]
    fn purge_expired_drops_stale_grace_entries() {
        let mut table = SubscriptionTable::with_grace(Duration::from_millis(10));
        let t0 = Instant::now();
        table.remove_endpoint(EndpointId(1), t0);
        table.purge_expired(t0 + Duration::from_millis(50));
        assert!(!table.is_recently_disconnected(EndpointId(1), t0 + Duration::from_millis(50)));
    }
}
