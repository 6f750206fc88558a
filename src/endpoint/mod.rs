//! C2 — Endpoint state machine: identity acquisition, special-message
//! dispatch, and the typed inbound/outbound queues (§4.1).
//!
//! Grounded on the teacher's `TransportState` enum shape (`Uninitialized` →
//! `Initializing` → `Connected` → `Disconnected`/`Error`), reused here as the
//! model for the endpoint's own identity states, and on
//! `src/ipc/unix_domain_socket.rs`'s read/write loop for draining a queue
//! into a connection each tick.

pub mod inbox;
pub mod outbox;

use crate::blob::io::{SourceIo, TargetIo};
use crate::blob::BlobManipulator;
use crate::connection::Connection;
use crate::message::{process_instance_id, special, EndpointId, Message, MessageId, Priority, ProcessInstanceId};
use crate::signal::Signal;
use anyhow::Result;
use inbox::Inbox;
use outbox::Outbox;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Default delay before an unconfigured endpoint asks its router for an id.
pub const DEFAULT_NO_ID_TIMEOUT: Duration = Duration::from_secs(3);
/// Default period between liveness beacons once usable.
pub const DEFAULT_ALIVE_NOTIFY_PERIOD: Duration = Duration::from_secs(30);
/// How many inbound frames one `update()` call drains from the connection.
const FETCH_BATCH: usize = 64;

/// Identity-acquisition state (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentityState {
    Unconfigured,
    Requesting,
    PreconfiguredAnnounced,
    Usable,
}

/// A lightweight snapshot of an endpoint's own state, returned in reply to
/// topology/stats queries (§4.1 "special-message handling").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    pub id: Option<u64>,
    pub subscribed: Vec<MessageId>,
    pub avg_msg_age_ms: Option<u64>,
}

/// A bus-attached participant: owns exactly one [`Connection`], drives its
/// own identity and special-message handling, and exposes typed
/// post/subscribe/process operations to application code.
pub struct Endpoint {
    connection: Box<dyn Connection>,
    id: Option<EndpointId>,
    preconfigured_id: Option<EndpointId>,
    state: IdentityState,
    process_instance_id: ProcessInstanceId,
    inbox: Inbox,
    outbox: Outbox,
    blob: BlobManipulator,
    no_id_timeout: Duration,
    alive_notify_period: Duration,
    last_request_attempt: Option<Instant>,
    last_still_alive: Option<Instant>,
    had_working_connection: bool,
    avg_msg_age: Option<Duration>,
    flow_warning: bool,
    /// `connection_established(has_id)`, fired on attach and on recovery.
    pub connection_established: Signal<bool>,
    /// Fired once per loss, before any recovery.
    pub connection_lost: Signal<()>,
    /// Fired once, the moment `id` becomes `Some`.
    pub id_assigned: Signal<EndpointId>,
}

impl Endpoint {
    /// `connection_established`/`connection_lost` only fire from inside
    /// [`Endpoint::update`], never here — a caller that subscribes right
    /// after construction (the expected usage, per §8 scenario 6) must not
    /// miss the initial "established" signal to a race with the
    /// constructor's own emission.
    pub fn new(connection: Box<dyn Connection>, preconfigured_id: Option<EndpointId>) -> Self {
        let state = if preconfigured_id.is_some() { IdentityState::PreconfiguredAnnounced } else { IdentityState::Unconfigured };
        Self {
            connection,
            id: preconfigured_id,
            preconfigured_id,
            state,
            process_instance_id: process_instance_id(),
            inbox: Inbox::new(),
            outbox: Outbox::new(),
            blob: BlobManipulator::new(),
            no_id_timeout: DEFAULT_NO_ID_TIMEOUT,
            alive_notify_period: DEFAULT_ALIVE_NOTIFY_PERIOD,
            last_request_attempt: None,
            last_still_alive: None,
            had_working_connection: false,
            avg_msg_age: None,
            flow_warning: false,
            connection_established: Signal::new(),
            connection_lost: Signal::new(),
            id_assigned: Signal::new(),
        }
    }

    pub fn with_no_id_timeout(mut self, timeout: Duration) -> Self {
        self.no_id_timeout = timeout;
        self
    }

    pub fn with_alive_notify_period(mut self, period: Duration) -> Self {
        self.alive_notify_period = period;
        self
    }

    /// Override how long the BLOB manipulator waits for progress before
    /// re-requesting missing fragments (§4.3, [`BlobManipulator::with_resend_idle`]).
    pub fn with_blob_resend_idle(mut self, idle: Duration) -> Self {
        self.blob = self.blob.with_resend_idle(idle);
        self
    }

    pub fn get_id(&self) -> Option<EndpointId> {
        self.id
    }

    pub fn is_usable(&self) -> bool {
        self.state == IdentityState::Usable || self.state == IdentityState::PreconfiguredAnnounced
    }

    fn source_id(&self) -> EndpointId {
        self.id.unwrap_or(EndpointId::BROADCAST)
    }

    fn enqueue(&mut self, message: Message) -> bool {
        self.outbox.push(message);
        true
    }

    /// Enqueue a message addressed to `target_id`.
    pub fn post(&mut self, target_id: EndpointId, message_id: MessageId, priority: Priority, payload: Vec<u8>) -> bool {
        let message = Message::new(message_id, self.source_id(), target_id, priority, payload);
        self.enqueue(message)
    }

    /// Enqueue a broadcast message.
    pub fn broadcast(&mut self, message_id: MessageId, priority: Priority, payload: Vec<u8>) -> bool {
        self.post(EndpointId::BROADCAST, message_id, priority, payload)
    }

    /// Build a reply to `original` that copies its sequence number and
    /// swaps source/target, per §4.1.
    pub fn respond_to(&mut self, original: &Message, message_id: MessageId, payload: Vec<u8>) -> bool {
        let reply = original.reply(message_id, self.source_id(), payload);
        self.enqueue(reply)
    }

    /// Register interest in `message_id`; tells the router unless another
    /// in-process subscriber already registered it.
    pub fn subscribe(&mut self, message_id: MessageId) -> bool {
        let is_new = self.inbox.subscribe(message_id.clone());
        if is_new {
            let payload = bincode::serialize(&message_id).unwrap_or_default();
            self.post(EndpointId::BROADCAST, special::subscribes_to(), Priority::Normal, payload);
        }
        is_new
    }

    /// Withdraw interest in `message_id`; tells the router once the last
    /// in-process subscriber drops off.
    pub fn unsubscribe(&mut self, message_id: &MessageId) -> bool {
        let cleared = self.inbox.unsubscribe(message_id);
        if cleared {
            let payload = bincode::serialize(message_id).unwrap_or_default();
            self.post(EndpointId::BROADCAST, special::unsubscribes_from(), Priority::Normal, payload);
        }
        cleared
    }

    pub fn process_one<F: FnOnce(Message)>(&mut self, message_id: &MessageId, handler: F) -> bool {
        self.inbox.process_one(message_id, handler)
    }

    pub fn process_all<F: FnMut(Message)>(&mut self, message_id: &MessageId, handler: F) -> usize {
        self.inbox.process_all(message_id, handler)
    }

    pub fn process_everything<F: FnMut(Message)>(&mut self, handler: F) -> usize {
        self.inbox.process_everything(handler)
    }

    /// Begin sending `source_io`'s bytes as a BLOB to `target_id`.
    #[allow(clippy::too_many_arguments)]
    pub fn push_outgoing_blob(
        &mut self,
        message_id: MessageId,
        target_id: EndpointId,
        target_blob_id: u64,
        source_io: Box<dyn SourceIo>,
        max_time: Duration,
        options: crate::blob::fragment::BlobOptions,
        priority: Priority,
    ) -> u64 {
        self.blob.push_outgoing(message_id, self.source_id(), target_id, target_blob_id, source_io, max_time, options, priority)
    }

    /// Register interest in an incoming BLOB under `target_blob_id`.
    pub fn expect_incoming_blob(&mut self, message_id: MessageId, source_id: EndpointId, target_blob_id: u64, target_io: Box<dyn TargetIo>, max_time: Duration) -> bool {
        self.blob.expect_incoming(message_id, source_id, target_blob_id, target_io, max_time)
    }

    /// Gracefully detach: say goodbye, then release the connection.
    pub async fn finish(&mut self) {
        let message = Message::new(special::bye_bye_endpoint(), self.source_id(), EndpointId::BROADCAST, Priority::High, Vec::new());
        let _ = self.connection.send(message).await;
        self.connection.cleanup();
    }

    /// Run one bounded iteration of the endpoint's state machine. Returns
    /// whether any forward progress was made.
    pub async fn update(&mut self) -> Result<bool> {
        let mut work_done = false;

        let usable_now = self.connection.is_usable();
        if usable_now && !self.had_working_connection {
            self.had_working_connection = true;
            self.connection_established.emit(&self.id.is_some());
            work_done = true;
        } else if !usable_now && self.had_working_connection {
            self.had_working_connection = false;
            self.connection_lost.emit(&());
            work_done = true;
        }
        if !usable_now {
            return Ok(work_done);
        }

        work_done |= self.drive_identity().await?;

        let inbound = self.connection.fetch_messages(FETCH_BATCH).await?;
        for message in inbound {
            self.dispatch(message);
            work_done = true;
        }

        let max_data_size = self.connection.max_data_size();
        if self.blob.update(|m| { self.outbox.push(m); Ok(true) }, max_data_size)? {
            work_done = true;
        }
        let pacing = self.blob_pacing_batch();
        let sent = self.blob.process_outgoing(|m| { self.outbox.push(m); Ok(true) }, max_data_size, pacing)?;
        if sent > 0 {
            work_done = true;
        }
        if self.blob.handle_complete() > 0 {
            work_done = true;
        }
        let mut delivered = Vec::new();
        self.blob.fetch_all(|m| delivered.push(m));
        let finished_notices = delivered.len();
        for message in delivered {
            self.inbox.deliver(message);
        }
        if finished_notices > 0 {
            work_done = true;
        }

        if self.is_usable() {
            let now = Instant::now();
            let due = self.last_still_alive.map(|t| now.duration_since(t) >= self.alive_notify_period).unwrap_or(true);
            if due {
                let payload = Vec::new();
                let mut message = Message::new(special::still_alive(), self.source_id(), EndpointId::BROADCAST, Priority::Low, payload);
                message.sequence_no = self.process_instance_id.0;
                self.outbox.push(message);
                self.last_still_alive = Some(now);
                work_done = true;
            }
        }

        work_done |= self.drain_outbox().await?;
        if self.connection.update().await? {
            work_done = true;
        }

        Ok(work_done)
    }

    async fn drive_identity(&mut self) -> Result<bool> {
        let mut work_done = false;
        match self.state {
            IdentityState::Unconfigured => {
                let now = Instant::now();
                let due = self.last_request_attempt.map(|t| now.duration_since(t) >= self.no_id_timeout).unwrap_or(true);
                if due {
                    let payload = bincode::serialize(&Option::<u64>::None).unwrap_or_default();
                    let message = Message::new(special::request_id(), EndpointId::BROADCAST, EndpointId::BROADCAST, Priority::High, payload);
                    self.outbox.push(message);
                    self.last_request_attempt = Some(now);
                    self.state = IdentityState::Requesting;
                    work_done = true;
                }
            }
            IdentityState::PreconfiguredAnnounced => {
                if self.last_request_attempt.is_none() {
                    let id = self.preconfigured_id.unwrap();
                    let payload = bincode::serialize(&Some(id.0)).unwrap_or_default();
                    let message = Message::new(special::announce_id(), id, EndpointId::BROADCAST, Priority::High, payload);
                    self.outbox.push(message);
                    self.last_request_attempt = Some(Instant::now());
                    work_done = true;
                }
            }
            IdentityState::Requesting | IdentityState::Usable => {}
        }
        Ok(work_done)
    }

    fn dispatch(&mut self, message: Message) {
        if message.message_id.is_special() {
            self.dispatch_special(message);
        } else {
            self.inbox.deliver(message);
        }
    }

    fn dispatch_special(&mut self, message: Message) {
        let id = &message.message_id;
        if *id == special::assign_id() {
            self.accept_id(message.target_id, false);
        } else if *id == special::confirm_id() {
            self.accept_id(message.target_id, true);
        } else if self.blob.owns(id) {
            if *id == special::blob_fragment() {
                let _ = self.blob.process_incoming(&message);
            } else {
                let _ = self.blob.process_resend(&message);
            }
        } else if *id == special::message_flow_info() {
            self.handle_flow_info(&message);
        } else if *id == special::topology_query() || *id == special::stats_query() {
            self.reply_with_snapshot(&message);
        } else if *id == special::query_subscriptions() {
            self.reply_with_subscriptions(&message);
        } else if *id == special::query_subscriber() {
            self.reply_with_subscriber_check(&message);
        } else if *id == special::endpoint_cert_query() {
            self.respond_to(&message, special::endpoint_cert_pem(), Vec::new());
        } else if *id == special::endpoint_sign_nonce() {
            // No real cryptography in the core (§1 non-goal); round-trip the
            // nonce opaquely rather than signing it.
            self.respond_to(&message, special::endpoint_nonce_signed(), message.payload.clone());
        } else if *id == special::endpoint_cert_pem()
            || *id == special::router_cert_pem()
            || *id == special::endpoint_nonce_signed()
        {
            debug!("dropping unsolicited {} at endpoint", id);
        } else {
            debug!("endpoint has no handler for special message {}", id);
        }
    }

    fn accept_id(&mut self, candidate: EndpointId, is_confirmation: bool) {
        if is_confirmation {
            match self.preconfigured_id {
                Some(expected) if expected == candidate => {
                    self.state = IdentityState::Usable;
                }
                Some(_expected) => {
                    error!("router confirmed id {} but endpoint already has a different preconfigured id; ignoring", candidate);
                }
                None => {
                    error!("received confirm-id with no preconfigured id set; ignoring");
                }
            }
            return;
        }
        self.id = Some(candidate);
        self.state = IdentityState::Usable;
        self.id_assigned.emit(&candidate);
    }

    fn handle_flow_info(&mut self, message: &Message) {
        let Ok(avg_ms) = bincode::deserialize::<u64>(&message.payload) else { return };
        let avg = Duration::from_millis(avg_ms);
        self.avg_msg_age = Some(avg);
        // Hysteresis (§9): enter the warning state at a higher bound than the
        // one that clears it, so pacing doesn't oscillate around one threshold.
        const WARN_ENTER_MS: u64 = 500;
        const WARN_CLEAR_MS: u64 = 200;
        if !self.flow_warning && avg_ms >= WARN_ENTER_MS {
            self.flow_warning = true;
            warn!("average message age {}ms crossed the pacing warning threshold", avg_ms);
        } else if self.flow_warning && avg_ms <= WARN_CLEAR_MS {
            self.flow_warning = false;
            debug!("average message age {}ms back below the pacing warning threshold", avg_ms);
        }
    }

    /// Larger batches when the bus is lightly loaded, smaller when it's not
    /// (§9 "Flow-info feedback loop").
    pub fn blob_pacing_batch(&self) -> usize {
        match self.avg_msg_age {
            None => 4,
            Some(age) if age < Duration::from_millis(50) => 16,
            Some(age) if age < Duration::from_millis(200) => 8,
            Some(_) => 2,
        }
    }

    fn reply_with_snapshot(&mut self, message: &Message) {
        let snapshot = EndpointSnapshot {
            id: self.id.map(|i| i.0),
            subscribed: self.inbox.subscribed_ids().cloned().collect(),
            avg_msg_age_ms: self.avg_msg_age.map(|d| d.as_millis() as u64),
        };
        let payload = bincode::serialize(&snapshot).unwrap_or_default();
        let reply_id = if message.message_id == special::topology_query() { special::topology_endpoint() } else { special::stats_endpoint() };
        self.respond_to(message, reply_id, payload);
    }

    fn reply_with_subscriptions(&mut self, message: &Message) {
        let ids: Vec<MessageId> = self.inbox.subscribed_ids().cloned().collect();
        let payload = bincode::serialize(&ids).unwrap_or_default();
        self.respond_to(message, special::query_subscriptions(), payload);
    }

    fn reply_with_subscriber_check(&mut self, message: &Message) {
        let Ok(queried) = bincode::deserialize::<MessageId>(&message.payload) else { return };
        let subscribed = self.inbox.is_subscribed(&queried);
        let payload = bincode::serialize(&queried).unwrap_or_default();
        let reply_id = if subscribed { special::subscribes_to() } else { special::not_subscribed_to() };
        self.respond_to(message, reply_id, payload);
    }

    async fn drain_outbox(&mut self) -> Result<bool> {
        let mut work_done = false;
        while let Some(message) = self.outbox.pop_next() {
            if self.connection.send(message.clone()).await? {
                work_done = true;
            } else {
                self.outbox.requeue_front(message);
                break;
            }
        }
        Ok(work_done)
    }
}
