//! Typed inbound queue registry: one queue per subscribed `message_id`,
//! refcounted so that several in-process subscribers of the same endpoint
//! can share one subscription without the router seeing duplicate
//! subscribe/unsubscribe traffic.

use crate::message::{Message, MessageId};
use std::collections::{HashMap, VecDeque};

struct Slot {
    queue: VecDeque<Message>,
    refcount: usize,
}

/// Per-message-id inbound queues for one endpoint.
#[derive(Default)]
pub struct Inbox {
    slots: HashMap<MessageId, Slot>,
}

impl Inbox {
    pub fn new() -> Self {
        Self { slots: HashMap::new() }
    }

    /// Register interest in `id`. Returns `true` if this was the first
    /// registration (the caller should tell the router), `false` if it only
    /// bumped an existing refcount.
    pub fn subscribe(&mut self, id: MessageId) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.refcount += 1;
                false
            }
            None => {
                self.slots.insert(id, Slot { queue: VecDeque::new(), refcount: 1 });
                true
            }
        }
    }

    /// Drop one registration. Returns `true` if the refcount reached zero
    /// and the queue was removed (the caller should tell the router).
    pub fn unsubscribe(&mut self, id: &MessageId) -> bool {
        let Some(slot) = self.slots.get_mut(id) else { return false };
        slot.refcount = slot.refcount.saturating_sub(1);
        if slot.refcount == 0 {
            self.slots.remove(id);
            true
        } else {
            false
        }
    }

    pub fn is_subscribed(&self, id: &MessageId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn subscribed_ids(&self) -> impl Iterator<Item = &MessageId> {
        self.slots.keys()
    }

    /// Route an inbound message into its queue. Silently dropped if nobody
    /// is subscribed to its id (mirrors §8's unsubscribe invariant).
    pub fn deliver(&mut self, message: Message) {
        if let Some(slot) = self.slots.get_mut(&message.message_id) {
            slot.queue.push_back(message);
        }
    }

    /// Pop and hand one queued message for `id` to `handler`. Returns
    /// whether a message was available.
    pub fn process_one<F: FnOnce(Message)>(&mut self, id: &MessageId, handler: F) -> bool {
        let Some(slot) = self.slots.get_mut(id) else { return false };
        match slot.queue.pop_front() {
            Some(message) => {
                handler(message);
                true
            }
            None => false,
        }
    }

    /// Drain every queued message for `id` into `handler`. Returns the count
    /// processed.
    pub fn process_all<F: FnMut(Message)>(&mut self, id: &MessageId, mut handler: F) -> usize {
        let Some(slot) = self.slots.get_mut(id) else { return 0 };
        let mut count = 0;
        while let Some(message) = slot.queue.pop_front() {
            handler(message);
            count += 1;
        }
        count
    }

    /// Drain every queued message across every subscribed id into `handler`.
    /// Returns the total count processed.
    pub fn process_everything<F: FnMut(Message)>(&mut self, mut handler: F) -> usize {
        let mut count = 0;
        for slot in self.slots.values_mut() {
            while let Some(message) = slot.queue.pop_front() {
                handler(message);
                count += 1;
            }
        }
        count
    }
}
