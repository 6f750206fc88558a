//! Connection abstraction: a byte-oriented duplex over which framed
//! [`Message`]s travel, generalized from the teacher's `IpcTransport` trait
//! (`src/ipc/mod.rs`) into the capability set §9 calls for:
//! `{send, fetch_messages, update, is_usable, max_data_size, kind, type_id,
//! cleanup}`.

pub mod acceptor;
pub mod in_process;
pub mod local_mqueue;
pub mod mqtt_bridge;
pub mod remote;
pub mod stdio_tunnel;

use crate::message::Message;
use anyhow::Result;
use async_trait::async_trait;

/// Which concrete transport a connection uses. Endpoints and routers treat
/// this as informational only — it never changes forwarding semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Shared in-memory queue pair, for endpoints in the same process as
    /// their router.
    InProcess,
    /// OS-mediated local IPC (POSIX message queue).
    LocalIpc,
    /// Network-capable stream or datagram transport.
    Remote,
    /// Base64-over-stdio bridge for subprocess tunneling.
    StdioTunnel,
    /// MQTT broker bridge.
    MqttBridge,
}

/// A connection's capability set.
///
/// No method may block indefinitely (§5): `send` and `fetch_messages` are
/// single-pass, non-blocking operations that report transient refusal/empty
/// reads rather than waiting. `update` performs at most one bounded unit of
/// housekeeping (reconnect attempts, flushing internal buffers) and reports
/// whether it did anything, for the embedding loop's work-done bookkeeping.
#[async_trait]
pub trait Connection: Send {
    /// Maximum payload size this connection can carry in one message.
    fn max_data_size(&self) -> usize;

    /// Attempt to send one message. `Ok(false)` means transient backpressure
    /// (e.g. an internal buffer is full) — the caller should re-enqueue and
    /// retry on the next tick. `Err` is reserved for unrecoverable transport
    /// failure, which also flips [`Connection::is_usable`] to `false`.
    async fn send(&mut self, message: Message) -> Result<bool>;

    /// Drain up to `max` already-available inbound messages without waiting
    /// for more to arrive.
    async fn fetch_messages(&mut self, max: usize) -> Result<Vec<Message>>;

    /// Perform one bounded unit of connection-level housekeeping. Returns
    /// whether any forward progress was made.
    async fn update(&mut self) -> Result<bool>;

    /// Whether this connection currently believes it can carry traffic.
    fn is_usable(&self) -> bool;

    fn kind(&self) -> ConnectionKind;

    /// A short, stable, human-readable identifier for logging.
    fn type_id(&self) -> &'static str;

    /// Release any OS-level resources. Idempotent.
    fn cleanup(&mut self);
}
