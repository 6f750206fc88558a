//! # meshbus
//!
//! A process-to-process message bus: an overlay that lets cooperating
//! endpoints exchange typed, addressed, priority-ordered messages through
//! routers, with a separate fragmented-transfer path for large byte
//! sequences ("BLOBs").
//!
//! Three subsystems make up the core:
//! - [`router`] — the routing fabric (C1): accepts connections, runs the
//!   pending-connection handshake, forwards messages by id/subscription.
//! - [`endpoint`] — the endpoint state machine (C2): identity acquisition,
//!   special-message dispatch, typed inbound/outbound queues.
//! - [`blob`] — the BLOB manipulator (C3): fragmentation, reassembly, and
//!   resend-driven recovery for transfers larger than one message.
//!
//! [`message`] defines the shared wire format these three build on;
//! [`connection`] is the pluggable transport abstraction underneath all of
//! them.

pub mod blob;
pub mod cli;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod message;
pub mod router;
pub mod signal;

pub use blob::BlobManipulator;
pub use config::BusConfig;
pub use connection::Connection;
pub use endpoint::Endpoint;
pub use message::{EndpointId, Message, MessageId, Priority};
pub use router::{IdRange, Router};

/// The current version of the message bus crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
