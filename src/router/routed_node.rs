//! A single accepted connection once it has cleared the pending handshake
//! (§4.2 "Pending-connection staging", step 3).
//!
//! Grounded on the teacher's `src/ipc/mod.rs` `ConnectionId`-keyed client
//! tracking (accept loop storing one state struct per connected client) and
//! generalized with the allow/block-list firewall and `maybe_router` flag
//! §4.2 calls for.

use crate::connection::Connection;
use crate::message::{EndpointId, MessageId, ProcessInstanceId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// One routing node: the connection plus the router's bookkeeping about it.
pub struct RoutedNode {
    pub connection: Box<dyn Connection>,
    pub id: EndpointId,
    /// Cleared permanently once a "not-a-router" marker arrives from this peer.
    maybe_router: AtomicBool,
    /// Set when a "bye-bye" was observed or the connection went unusable;
    /// the router tears this node down on its next tick.
    disconnect_requested: AtomicBool,
    /// Non-empty allow-list means "admit only these ids". Empty means "admit
    /// everything not otherwise blocked".
    allow_list: Mutex<HashSet<MessageId>>,
    block_list: Mutex<HashSet<MessageId>>,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub last_activity: Instant,
}

impl RoutedNode {
    pub fn new(connection: Box<dyn Connection>, id: EndpointId) -> Self {
        Self {
            connection,
            id,
            maybe_router: AtomicBool::new(true),
            disconnect_requested: AtomicBool::new(false),
            allow_list: Mutex::new(HashSet::new()),
            block_list: Mutex::new(HashSet::new()),
            process_instance_id: None,
            last_activity: Instant::now(),
        }
    }

    pub fn maybe_router(&self) -> bool {
        self.maybe_router.load(Ordering::Relaxed)
    }

    pub fn mark_not_a_router(&self) {
        self.maybe_router.store(false, Ordering::Relaxed);
    }

    pub fn request_disconnect(&self) {
        self.disconnect_requested.store(true, Ordering::Relaxed);
    }

    pub fn disconnect_requested(&self) -> bool {
        self.disconnect_requested.load(Ordering::Relaxed) || !self.connection.is_usable()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// §4.2 forwarding step 5/6: "allow-list admits the id and the
    /// block-list does not reject it". An empty allow-list admits anything.
    pub fn admits(&self, message_id: &MessageId) -> bool {
        if self.block_list.lock().contains(message_id) {
            return false;
        }
        let allow = self.allow_list.lock();
        allow.is_empty() || allow.contains(message_id)
    }

    pub fn add_allow(&self, ids: impl IntoIterator<Item = MessageId>) {
        self.allow_list.lock().extend(ids);
    }

    pub fn clear_allow(&self) {
        self.allow_list.lock().clear();
    }

    pub fn add_block(&self, ids: impl IntoIterator<Item = MessageId>) {
        self.block_list.lock().extend(ids);
    }

    pub fn clear_block(&self) {
        self.block_list.lock().clear();
    }
}
