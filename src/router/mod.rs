//! The routing fabric (§4.2): accepts connections, runs the handshake that
//! promotes them to routed nodes, and forwards messages between them
//! according to target id, subscription, and filter-list rules.
//!
//! Grounded on the teacher's per-client `HashMap` tracking in
//! `src/ipc/mod.rs` (its UDS/TCP transports already key connection state by
//! a connection id) and its `Arc`/`Mutex`-guarded shared run-state in
//! `src/benchmark.rs`, generalized into the forwarding algorithm §4.2 spells
//! out.

pub mod pending;
pub mod routed_node;
pub mod stats;
pub mod subscriptions;
pub mod worker;

use crate::blob::io::{SourceIo, TargetIo};
use crate::blob::{BlobManipulator, BlobOptions};
use crate::connection::acceptor::Acceptor;
use crate::connection::Connection;
use crate::message::{special, EndpointId, Message, MessageId, Priority};
use anyhow::Result;
use pending::PendingConnection;
use routed_node::RoutedNode;
use stats::RouterStats;
use std::time::{Duration, Instant};
use subscriptions::SubscriptionTable;
use tracing::{debug, warn};
use worker::ExecutionMode;

const FETCH_BATCH: usize = 64;

/// A disjoint range of endpoint ids this router is free to allocate from
/// (§3 "Routers allocate endpoint ids from a disjoint per-router sub-range").
#[derive(Debug, Clone, Copy)]
pub struct IdRange {
    pub base: u64,
    pub end: u64,
}

impl IdRange {
    pub fn new(base: u64, end: u64) -> Self {
        assert!(base > 0, "id 0 is reserved for broadcast");
        assert!(base < end, "id range must be non-empty");
        Self { base, end }
    }
}

/// One tick's aggregate result (§4.1/§4.2 "work_done" convention).
pub type WorkDone = bool;

pub struct Router {
    nodes: std::collections::BTreeMap<EndpointId, RoutedNode>,
    pending: Vec<PendingConnection>,
    acceptors: Vec<Acceptor>,
    parent: Option<Box<dyn Connection>>,
    subscriptions: SubscriptionTable,
    stats: RouterStats,
    blob: BlobManipulator,
    id_range: IdRange,
    next_id: u64,
    password: Option<String>,
    execution_mode: ExecutionMode,
    pending_timeout: Duration,
    flow_info_period: Duration,
    last_flow_info: Instant,
    max_data_size: usize,
}

impl Router {
    /// Sentinel ingress id for messages fetched from the parent-router uplink
    /// (§4.2/§9: the uplink is a relation, not an entry in `nodes`, so it
    /// needs its own identity for the "exclude ingress" and "don't bounce
    /// back up the way it came" rules to apply to it too).
    const PARENT_INGRESS: EndpointId = EndpointId(u64::MAX);

    pub fn new(id_range: IdRange) -> Self {
        Self {
            nodes: std::collections::BTreeMap::new(),
            pending: Vec::new(),
            acceptors: Vec::new(),
            parent: None,
            subscriptions: SubscriptionTable::new(),
            stats: RouterStats::new(),
            blob: BlobManipulator::new(),
            next_id: id_range.base,
            id_range,
            password: None,
            execution_mode: ExecutionMode::default(),
            pending_timeout: pending::DEFAULT_PENDING_TIMEOUT,
            flow_info_period: stats::DEFAULT_FLOW_INFO_PERIOD,
            last_flow_info: Instant::now(),
            max_data_size: 1 << 20,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Install a passive listener; accepted connections enter the pending
    /// staging area on the next `update`.
    pub fn add_acceptor(&mut self, acceptor: Acceptor) {
        self.acceptors.push(acceptor);
    }

    /// Install a parent-router uplink. Targeted messages this router can't
    /// resolve locally are forwarded up it; its own broadcasts and
    /// subscriptions are treated like those of any other attached node.
    pub fn add_connection(&mut self, connection: Box<dyn Connection>) {
        self.parent = Some(connection);
    }

    /// Accept one already-established connection straight into pending
    /// staging, bypassing `acceptors` (used for in-process wiring, where the
    /// embedding process hands the router its half of a pair directly).
    pub fn add_pending_connection(&mut self, connection: Box<dyn Connection>) {
        self.pending.push(PendingConnection::new(connection));
    }

    fn allocate_id(&mut self) -> EndpointId {
        let id = self.next_id;
        self.next_id = if self.next_id + 1 >= self.id_range.end {
            self.id_range.base
        } else {
            self.next_id + 1
        };
        EndpointId(id)
    }

    /// Feed an externally observed message age into the flow-info aggregator.
    pub fn update_message_age(&self, age: Duration) {
        self.stats.record_age(age, Instant::now());
    }

    pub fn push_outgoing_blob(
        &mut self,
        message_id: MessageId,
        source_id: EndpointId,
        target_id: EndpointId,
        target_blob_id: u64,
        source_io: Box<dyn SourceIo>,
        max_time: Duration,
        options: BlobOptions,
        priority: Priority,
    ) -> u64 {
        self.blob.push_outgoing(message_id, source_id, target_id, target_blob_id, source_io, max_time, options, priority)
    }

    pub fn expect_incoming_blob(
        &mut self,
        message_id: MessageId,
        source_id: EndpointId,
        target_blob_id: u64,
        target_io: Box<dyn TargetIo>,
        max_time: Duration,
    ) -> bool {
        self.blob.expect_incoming(message_id, source_id, target_blob_id, target_io, max_time)
    }

    /// One maintenance+routing tick. Returns whether any forward progress
    /// was made.
    pub async fn update(&mut self) -> Result<WorkDone> {
        let mut work_done = false;
        work_done |= self.accept_new_connections().await?;
        work_done |= self.drive_pending().await?;
        work_done |= self.reap_dead_nodes();

        let mut fetched = self.fetch_all_nodes().await?;
        if let Some(parent) = self.parent.as_mut() {
            for message in parent.fetch_messages(FETCH_BATCH).await? {
                fetched.push((Self::PARENT_INGRESS, message));
            }
        }
        if !fetched.is_empty() {
            work_done = true;
        }

        let mut outbound: std::collections::BTreeMap<EndpointId, Vec<Message>> = std::collections::BTreeMap::new();
        let mut to_parent: Vec<Message> = Vec::new();

        for (ingress, message) in fetched {
            self.route_one(ingress, message, &mut outbound, &mut to_parent);
        }

        work_done |= self.drive_blob(&mut outbound);
        work_done |= self.maybe_emit_flow_info(&mut outbound);

        self.subscriptions.purge_expired(Instant::now());

        if self.flush_outbound(outbound).await? {
            work_done = true;
        }
        if self.flush_to_parent(to_parent).await? {
            work_done = true;
        }
        if let Some(parent) = self.parent.as_mut() {
            if parent.update().await? {
                work_done = true;
            }
        }
        Ok(work_done)
    }

    /// TCP acceptors can hand out any number of connections over their
    /// lifetime; a local-IPC acceptor names a single POSIX message queue and
    /// is consumed the moment that queue is created (§6 "local-IPC: a
    /// filesystem path or identifier" — there is no repeated accept step).
    async fn accept_new_connections(&mut self) -> Result<WorkDone> {
        let mut work_done = false;
        let mut consumed = Vec::new();
        let max_data_size = self.max_data_size;

        for (index, acceptor) in self.acceptors.iter().enumerate() {
            match acceptor {
                Acceptor::Tcp(_) => {
                    while let Some(connection) = acceptor.try_accept_tcp().await? {
                        self.pending.push(PendingConnection::new(Box::new(connection)));
                        work_done = true;
                    }
                }
                Acceptor::LocalIpc { .. } => {
                    let connection = acceptor.local_ipc(max_data_size)?;
                    self.pending.push(PendingConnection::new(Box::new(connection)));
                    consumed.push(index);
                    work_done = true;
                }
            }
        }
        for index in consumed.into_iter().rev() {
            self.acceptors.remove(index);
        }
        Ok(work_done)
    }

    async fn drive_pending(&mut self) -> Result<WorkDone> {
        let mut work_done = false;
        let now = Instant::now();
        let mut still_pending = Vec::with_capacity(self.pending.len());
        let password = self.password.clone();
        let pending_list = std::mem::take(&mut self.pending);

        for mut candidate in pending_list {
            if candidate.is_expired(now, self.pending_timeout) {
                debug!("pending connection timed out before completing the handshake");
                continue;
            }

            for message in candidate.connection.fetch_messages(FETCH_BATCH).await? {
                work_done = true;
                // The closure is only invoked for a `requestId` message; an
                // `annEndptId` claims its own preconfigured id instead.
                if let Some(reply) = candidate.observe(&message, || self.allocate_id()) {
                    candidate.connection.send(reply).await?;
                }
            }

            if let Some(challenge) = candidate.maybe_request_password(password.as_deref(), now) {
                candidate.connection.send(challenge).await?;
                work_done = true;
            }

            if candidate.is_ready() {
                if let Some(id) = candidate.claimed_id() {
                    let PendingConnection { connection, .. } = candidate;
                    self.nodes.insert(id, RoutedNode::new(connection, id));
                    work_done = true;
                    continue;
                }
            }
            still_pending.push(candidate);
        }
        self.pending = still_pending;
        Ok(work_done)
    }

    fn reap_dead_nodes(&mut self) -> WorkDone {
        let dead: Vec<EndpointId> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.disconnect_requested())
            .map(|(id, _)| *id)
            .collect();
        let any = !dead.is_empty();
        for id in dead {
            if let Some(mut node) = self.nodes.remove(&id) {
                node.connection.cleanup();
            }
            self.subscriptions.remove_endpoint(id, Instant::now());
        }
        any
    }

    /// Fetches from every attached connection, dispatched per `execution_mode`
    /// (§4.2 "Worker model": one work-unit per connection per tick, barrier
    /// at end of tick, or everything inline on a single task).
    async fn fetch_all_nodes(&mut self) -> Result<Vec<(EndpointId, Message)>> {
        let ids: Vec<EndpointId> = self.nodes.keys().copied().collect();
        let mut connections = Vec::with_capacity(ids.len());
        for id in &ids {
            let node = self.nodes.get_mut(id).expect("id came from this map's own keys");
            connections.push(std::mem::replace(&mut node.connection, Box::new(worker::NullConnection)));
        }

        let results = worker::fetch_all(self.execution_mode, connections, FETCH_BATCH).await;

        let mut out = Vec::new();
        for (id, (result, connection)) in ids.into_iter().zip(results) {
            let Some(node) = self.nodes.get_mut(&id) else { continue };
            node.connection = connection;
            match result {
                Ok(messages) => {
                    if !messages.is_empty() {
                        node.touch();
                    }
                    out.extend(messages.into_iter().map(|message| (id, message)));
                }
                Err(error) => {
                    warn!("fetch from node {:?} failed: {}", id, error);
                    node.request_disconnect();
                }
            }
        }
        Ok(out)
    }

    /// §4.2 "Forwarding algorithm", steps 1-6.
    fn route_one(
        &mut self,
        ingress: EndpointId,
        mut message: Message,
        outbound: &mut std::collections::BTreeMap<EndpointId, Vec<Message>>,
        to_parent: &mut Vec<Message>,
    ) {
        if message.is_hop_ceiling_exceeded() {
            self.stats.record_dropped();
            return;
        }
        if message.is_too_old() {
            self.stats.record_dropped();
            return;
        }
        self.stats.record_age(message.age(), Instant::now());
        if !message.bump_hop() {
            self.stats.record_dropped();
            return;
        }

        if message.message_id.is_special() {
            self.handle_special(ingress, message, outbound, to_parent);
            return;
        }

        if message.is_broadcast() {
            self.forward_broadcast(ingress, message, outbound, to_parent);
            return;
        }

        if !self.try_forward_targeted(ingress, message, outbound, to_parent) {
            self.stats.record_dropped();
        }
    }

    /// Forward `message` to its `target_id` the way step 5 of the
    /// forwarding algorithm does: to an attached node (subject to its
    /// filter lists), up to the parent router, or silently if the target
    /// is recently disconnected. Returns `false` when `target_id` names
    /// neither an attached node nor anything the parent might resolve —
    /// i.e., the message is addressed to the router itself, which callers
    /// other than the plain targeted path (e.g. the blob branch of
    /// `handle_special`) use to decide whether to consume it locally.
    fn try_forward_targeted(
        &mut self,
        ingress: EndpointId,
        message: Message,
        outbound: &mut std::collections::BTreeMap<EndpointId, Vec<Message>>,
        to_parent: &mut Vec<Message>,
    ) -> bool {
        let target = message.target_id;
        if let Some(node) = self.nodes.get(&target) {
            if node.admits(&message.message_id) {
                outbound.entry(target).or_default().push(message);
                self.stats.record_forwarded();
            } else {
                self.stats.record_dropped();
            }
            return true;
        }
        if self.subscriptions.is_recently_disconnected(target, Instant::now()) {
            return true;
        }
        if ingress != Self::PARENT_INGRESS && self.parent.is_some() {
            to_parent.push(message);
            self.stats.record_forwarded();
            return true;
        }
        false
    }

    fn forward_broadcast(
        &mut self,
        ingress: EndpointId,
        message: Message,
        outbound: &mut std::collections::BTreeMap<EndpointId, Vec<Message>>,
        to_parent: &mut Vec<Message>,
    ) {
        let mut targets: Vec<EndpointId> = self.subscriptions.subscribers_of(&message.message_id).collect();
        for (&id, node) in self.nodes.iter() {
            if node.maybe_router() && !targets.contains(&id) {
                targets.push(id);
            }
        }
        targets.sort();
        targets.dedup();

        let mut forwarded_once = false;
        for id in targets {
            if id == ingress {
                continue;
            }
            let Some(node) = self.nodes.get(&id) else { continue };
            if !node.admits(&message.message_id) {
                continue;
            }
            outbound.entry(id).or_default().push(message.clone());
            forwarded_once = true;
        }
        if ingress != Self::PARENT_INGRESS && self.parent.is_some() {
            to_parent.push(message);
            forwarded_once = true;
        }
        if forwarded_once {
            self.stats.record_forwarded();
        } else {
            self.stats.record_dropped();
        }
    }

    /// Bus-internal control traffic handled by the router itself (§4.2 step 4).
    fn handle_special(
        &mut self,
        ingress: EndpointId,
        message: Message,
        outbound: &mut std::collections::BTreeMap<EndpointId, Vec<Message>>,
        to_parent: &mut Vec<Message>,
    ) {
        let id = &message.message_id;

        if *id == special::still_alive() {
            if let Some(node) = self.nodes.get_mut(&ingress) {
                node.touch();
            }
            // §9 Open Question: routers don't relay liveness beacons upward.
            return;
        }
        if *id == special::bye_bye_endpoint() || *id == special::bye_bye_router() || *id == special::bye_bye_bridge() {
            if let Some(node) = self.nodes.get(&ingress) {
                node.request_disconnect();
            }
            return;
        }
        if *id == special::not_a_router() {
            if let Some(node) = self.nodes.get(&ingress) {
                node.mark_not_a_router();
            }
            return;
        }
        if *id == special::subscribes_to() {
            if let Ok(subscribed) = bincode::deserialize::<MessageId>(&message.payload) {
                self.subscriptions.subscribe(ingress, subscribed);
            }
            return;
        }
        if *id == special::unsubscribes_from() {
            if let Ok(unsubscribed) = bincode::deserialize::<MessageId>(&message.payload) {
                self.subscriptions.unsubscribe(ingress, &unsubscribed);
            }
            return;
        }
        if *id == special::query_subscriptions() {
            let list = self.subscriptions.subscriptions_of(ingress);
            if let Ok(payload) = bincode::serialize(&list) {
                let reply = message.reply(special::query_subscriptions(), EndpointId::BROADCAST, payload);
                outbound.entry(ingress).or_default().push(reply);
            }
            return;
        }
        if *id == special::query_subscriber() {
            if let Ok(queried) = bincode::deserialize::<MessageId>(&message.payload) {
                let subscribed = self.subscriptions.is_subscribed(ingress, &queried);
                let reply_id = if subscribed { special::query_subscriber() } else { special::not_subscribed_to() };
                let reply = message.reply(reply_id, EndpointId::BROADCAST, message.payload.clone());
                outbound.entry(ingress).or_default().push(reply);
            }
            return;
        }
        if *id == special::clear_allow_list() {
            if let Some(node) = self.nodes.get(&ingress) {
                node.clear_allow();
            }
            return;
        }
        if *id == special::message_allow_list() {
            if let (Some(node), Ok(ids)) = (self.nodes.get(&ingress), bincode::deserialize::<Vec<MessageId>>(&message.payload)) {
                node.add_allow(ids);
            }
            return;
        }
        if *id == special::clear_block_list() {
            if let Some(node) = self.nodes.get(&ingress) {
                node.clear_block();
            }
            return;
        }
        if *id == special::message_block_list() {
            if let (Some(node), Ok(ids)) = (self.nodes.get(&ingress), bincode::deserialize::<Vec<MessageId>>(&message.payload)) {
                node.add_block(ids);
            }
            return;
        }
        if self.blob.owns(id) {
            // A fragment/resend is only ours to consume when it is
            // addressed to the router itself (the router's own
            // `BlobManipulator` is for router-originated transfers, §4.2).
            // Anything naming an attached node, the parent, or a
            // recently-disconnected id is routed exactly like any other
            // targeted message instead of being handed to `self.blob`,
            // otherwise a pass-through fragment from A to B never reaches B.
            if self.try_forward_targeted(ingress, message.clone(), outbound, to_parent) {
                return;
            }
            let result = if *id == special::blob_fragment() {
                self.blob.process_incoming(&message)
            } else {
                self.blob.process_resend(&message)
            };
            if let Err(error) = result {
                warn!("malformed blob control message from {:?}: {}", ingress, error);
                self.stats.record_decode_error();
            }
            return;
        }
        if *id == special::ping() {
            let reply = message.reply(special::pong(), EndpointId::BROADCAST, message.payload.clone());
            if ingress == Self::PARENT_INGRESS {
                to_parent.push(reply);
            } else {
                outbound.entry(ingress).or_default().push(reply);
            }
            return;
        }

        debug!("no router-level handler for special message {}, forwarding as-is", id);
        if message.is_broadcast() {
            for (&target, node) in self.nodes.iter() {
                if target != ingress && node.admits(id) {
                    outbound.entry(target).or_default().push(message.clone());
                }
            }
        } else if self.nodes.contains_key(&message.target_id) {
            outbound.entry(message.target_id).or_default().push(message);
        }
    }

    fn drive_blob(&mut self, outbound: &mut std::collections::BTreeMap<EndpointId, Vec<Message>>) -> WorkDone {
        let max_data_size = self.max_data_size;
        let mut work_done = false;

        let plan = std::cell::RefCell::new(Vec::new());
        if self
            .blob
            .update(
                |m| {
                    plan.borrow_mut().push(m);
                    Ok(true)
                },
                max_data_size,
            )
            .unwrap_or(false)
        {
            work_done = true;
        }
        if self
            .blob
            .process_outgoing(
                |m| {
                    plan.borrow_mut().push(m);
                    Ok(true)
                },
                max_data_size,
                8,
            )
            .unwrap_or(0)
            > 0
        {
            work_done = true;
        }
        for message in plan.into_inner() {
            let target = message.target_id;
            if self.nodes.contains_key(&target) {
                outbound.entry(target).or_default().push(message);
            }
        }
        if self.blob.handle_complete() > 0 {
            work_done = true;
        }
        work_done
    }

    fn maybe_emit_flow_info(&mut self, outbound: &mut std::collections::BTreeMap<EndpointId, Vec<Message>>) -> WorkDone {
        let now = Instant::now();
        if now.duration_since(self.last_flow_info) < self.flow_info_period {
            return false;
        }
        self.last_flow_info = now;
        let avg = self.stats.avg_age_ms(now);
        let Ok(payload) = bincode::serialize(&avg) else { return false };
        for &id in self.nodes.keys() {
            let message = Message::new(special::message_flow_info(), EndpointId::BROADCAST, id, Priority::Low, payload.clone());
            outbound.entry(id).or_default().push(message);
        }
        true
    }

    async fn flush_outbound(&mut self, outbound: std::collections::BTreeMap<EndpointId, Vec<Message>>) -> Result<WorkDone> {
        let mut work_done = false;
        for (id, messages) in outbound {
            let Some(node) = self.nodes.get_mut(&id) else { continue };
            for message in messages {
                match node.connection.send(message).await {
                    Ok(true) => work_done = true,
                    Ok(false) => break,
                    Err(error) => {
                        warn!("send to node {:?} failed: {}", id, error);
                        node.request_disconnect();
                        break;
                    }
                }
            }
        }
        Ok(work_done)
    }

    async fn flush_to_parent(&mut self, messages: Vec<Message>) -> Result<WorkDone> {
        let mut work_done = false;
        if let Some(parent) = self.parent.as_mut() {
            for message in messages {
                match parent.send(message).await {
                    Ok(sent) => work_done |= sent,
                    Err(error) => {
                        warn!("send to parent router failed: {}", error);
                        break;
                    }
                }
            }
        }
        Ok(work_done)
    }

    /// §4.2 "Teardown": say goodbye on every connection, then drop them.
    pub async fn finish(&mut self) {
        for (_, node) in self.nodes.iter_mut() {
            let bye = Message::new(special::bye_bye_router(), EndpointId::BROADCAST, node.id, Priority::High, vec![]);
            let _ = node.connection.send(bye).await;
            node.connection.cleanup();
        }
        if let Some(parent) = self.parent.as_mut() {
            let bye = Message::new(special::bye_bye_router(), EndpointId::BROADCAST, EndpointId::BROADCAST, Priority::High, vec![]);
            let _ = parent.send(bye).await;
            parent.cleanup();
        }
    }
}
