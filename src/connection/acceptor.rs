//! Address-scheme connection factory (§6): parses a bus address string into
//! a concrete connection kind, and listens for inbound connections of the
//! schemes that support being dialed into (TCP, local IPC).
//!
//! Grounded on the teacher's `IpcMechanism` enum and its `from(&Args)`
//! parsing in `src/cli.rs`, generalized from "pick one mechanism for this
//! whole run" into "parse one address at a time", since a router accepts
//! connections across several schemes concurrently.

use super::local_mqueue::LocalMqueueConnection;
use super::remote::{TcpConnection, TcpListenerConnection};
use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;

/// The default TCP port routers listen on when an address omits one.
pub const DEFAULT_ROUTER_PORT: u16 = 34912;

/// A parsed bus address, ready to be dialed or listened on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// No transport at all: the endpoint lives in the same process as its
    /// router and is wired up with [`crate::connection::in_process::in_process_pair`].
    InProcess,
    /// A POSIX message queue name, e.g. `local:/meshbus_router`.
    LocalIpc(String),
    /// An IPv4/IPv6 socket address, defaulting to [`DEFAULT_ROUTER_PORT`]
    /// when the address omits a port, e.g. `192.0.2.10` or `192.0.2.10:9000`.
    Tcp(SocketAddr),
    /// An MQTT broker address, e.g. `mqtt://broker.example:1883`.
    Mqtt { host: String, port: u16 },
}

impl Address {
    /// Parse a bus address string.
    ///
    /// Recognized schemes:
    /// - `direct` or empty: [`Address::InProcess`]
    /// - `local:<name>`: [`Address::LocalIpc`]
    /// - `mqtt://<host>[:<port>]`: [`Address::Mqtt`]
    /// - anything else: parsed as an IPv4/IPv6 host, with [`DEFAULT_ROUTER_PORT`]
    ///   assumed if no `:port` suffix is present
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() || spec == "direct" {
            return Ok(Address::InProcess);
        }
        if let Some(name) = spec.strip_prefix("local:") {
            if name.is_empty() {
                return Err(anyhow!("local address is missing a queue name"));
            }
            return Ok(Address::LocalIpc(name.to_string()));
        }
        if let Some(rest) = spec.strip_prefix("mqtt://") {
            let (host, port) = match rest.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), port.parse().context("parsing mqtt port")?),
                None => (rest.to_string(), 1883),
            };
            if host.is_empty() {
                return Err(anyhow!("mqtt address is missing a host"));
            }
            return Ok(Address::Mqtt { host, port });
        }

        let with_port = if spec.contains(':') && !spec.starts_with('[') {
            spec.to_string()
        } else if spec.contains(':') {
            spec.to_string() // bracketed IPv6 with explicit port
        } else {
            format!("{}:{}", spec, DEFAULT_ROUTER_PORT)
        };
        let addr = with_port
            .parse::<SocketAddr>()
            .with_context(|| format!("'{}' is not a recognized bus address", spec))?;
        Ok(Address::Tcp(addr))
    }
}

/// Listens for inbound connections of the schemes that support being dialed
/// into from elsewhere. MQTT and in-process addresses are excluded: MQTT
/// has no accept step (every peer just publishes/subscribes), and
/// in-process pairs are wired up directly by the owning process.
pub enum Acceptor {
    Tcp(TcpListenerConnection),
    LocalIpc { name: String, max_data_size: i64 },
}

impl Acceptor {
    pub async fn bind(address: &Address, max_data_size: usize) -> Result<Self> {
        match address {
            Address::Tcp(addr) => Ok(Acceptor::Tcp(TcpListenerConnection::bind(*addr, max_data_size).await?)),
            Address::LocalIpc(name) => {
                // Binding here only validates the name is usable; the queue
                // itself is created lazily on first `accept` since POSIX
                // mqueues have no separate listen/accept distinction.
                Ok(Acceptor::LocalIpc { name: name.clone(), max_data_size: max_data_size as i64 })
            }
            Address::InProcess => Err(anyhow!("in-process addresses are wired up directly, not accepted")),
            Address::Mqtt { .. } => Err(anyhow!("mqtt bridges have no accept step")),
        }
    }

    pub async fn try_accept_tcp(&self) -> Result<Option<TcpConnection>> {
        match self {
            Acceptor::Tcp(listener) => listener.try_accept().await,
            _ => Err(anyhow!("not a tcp acceptor")),
        }
    }

    pub fn local_ipc(&self, max_data_size: usize) -> Result<LocalMqueueConnection> {
        match self {
            Acceptor::LocalIpc { name, .. } => LocalMqueueConnection::create(name, max_data_size, 10),
            _ => Err(anyhow!("not a local-ipc acceptor")),
        }
    }
}
