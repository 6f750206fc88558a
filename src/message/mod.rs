//! Shared message framing: identifiers, priority ordering, and the message
//! header carried on every connection.
//!
//! This is the data model every other module (`connection`, `endpoint`,
//! `router`, `blob`) builds on. Nothing in here knows about transports or
//! routing; it only defines what a message *is*.

pub mod codec;
pub mod special;

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use uuid::Uuid;

/// Hard ceiling on `hop_count`; a message observed past this is dropped.
pub const HOP_COUNT_CEILING: u16 = 64;

/// One quarter-second of age, expressed in milliseconds, for `age_quarter_seconds`.
pub const AGE_QUARTER_SECOND_MS: u64 = 250;

/// Opaque endpoint identifier. Zero is reserved for broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub u64);

impl EndpointId {
    /// The reserved broadcast target.
    pub const BROADCAST: EndpointId = EndpointId(0);

    /// Gate for "is this a usable, non-broadcast id".
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Assigned once per process lifetime; lets a peer detect re-launch of an
/// endpoint that kept the same `EndpointId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessInstanceId(pub u64);

static PROCESS_INSTANCE_ID: OnceLock<ProcessInstanceId> = OnceLock::new();

/// The process-wide singleton instance id, established on first use and
/// read-only thereafter (per §9 "Global process state").
pub fn process_instance_id() -> ProcessInstanceId {
    *PROCESS_INSTANCE_ID.get_or_init(|| {
        let raw = Uuid::new_v4().as_u128() as u64;
        // Never collide with the sentinel value callers might use for "unknown".
        ProcessInstanceId(raw | 1)
    })
}

/// A symbolic `(class, method)` pair identifying a message's meaning.
///
/// Equality and hashing are on the pair. Messages whose class is
/// [`special::CLASS`] are bus-internal control traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub class: Cow<'static, str>,
    pub method: Cow<'static, str>,
}

impl MessageId {
    pub fn new(class: impl Into<Cow<'static, str>>, method: impl Into<Cow<'static, str>>) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
        }
    }

    /// True if this id belongs to the bus-internal class.
    pub fn is_special(&self) -> bool {
        self.class == special::CLASS
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class, self.method)
    }
}

/// Delivery priority. Ordering follows declaration order: idle is the lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Idle,
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// How long a message at this priority may age before it's "too old".
    ///
    /// High and Critical never go stale (Open Question 1: the more defensive
    /// of the two branches observed in the source is the one we keep).
    pub fn too_old_after(self) -> Option<Duration> {
        match self {
            Priority::Idle => Some(Duration::from_secs(10)),
            Priority::Low => Some(Duration::from_secs(20)),
            Priority::Normal => Some(Duration::from_secs(30)),
            Priority::High | Priority::Critical => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Verification/encryption state carried alongside a message.
///
/// The core never performs real cryptography (out of scope per §1); these
/// flags are round-tripped opaquely and cleared by the core on a failed
/// verification stub rather than causing the message to be dropped (§7).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoFlags {
    pub encrypted: bool,
    pub signed: bool,
    pub verified: bool,
}

/// A single message header plus opaque payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub source_id: EndpointId,
    pub target_id: EndpointId,
    pub sequence_no: u64,
    pub priority: Priority,
    /// Age in quarter-second units, saturating, additive across hops.
    pub age_quarter_seconds: u32,
    /// Monotonically increased on every forward.
    pub hop_count: u16,
    pub serializer_id: u8,
    pub crypto_flags: CryptoFlags,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(
        message_id: MessageId,
        source_id: EndpointId,
        target_id: EndpointId,
        priority: Priority,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_id,
            source_id,
            target_id,
            sequence_no: 0,
            priority,
            age_quarter_seconds: 0,
            hop_count: 0,
            serializer_id: 0,
            crypto_flags: CryptoFlags::default(),
            payload,
        }
    }

    /// Increment `hop_count`, saturating. Returns `false` if the ceiling is
    /// now exceeded and the message should be dropped by the caller.
    pub fn bump_hop(&mut self) -> bool {
        self.hop_count = self.hop_count.saturating_add(1);
        self.hop_count <= HOP_COUNT_CEILING
    }

    pub fn is_hop_ceiling_exceeded(&self) -> bool {
        self.hop_count > HOP_COUNT_CEILING
    }

    /// Add elapsed time to the message's accumulated age, saturating.
    pub fn add_age(&mut self, elapsed: Duration) {
        let quarters = (elapsed.as_millis() / AGE_QUARTER_SECOND_MS as u128).min(u32::MAX as u128) as u32;
        self.age_quarter_seconds = self.age_quarter_seconds.saturating_add(quarters);
    }

    pub fn age(&self) -> Duration {
        Duration::from_millis(self.age_quarter_seconds as u64 * AGE_QUARTER_SECOND_MS)
    }

    pub fn is_too_old(&self) -> bool {
        match self.priority.too_old_after() {
            Some(limit) => self.age() > limit,
            None => false,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_id == EndpointId::BROADCAST
    }

    /// Build a reply that copies the triggering message's sequence number
    /// and swaps source/target, as `Endpoint::respond_to` needs.
    pub fn reply(&self, message_id: MessageId, source_id: EndpointId, payload: Vec<u8>) -> Message {
        let mut reply = Message::new(message_id, source_id, self.source_id, self.priority, payload);
        reply.sequence_no = self.sequence_no;
        reply
    }
}
