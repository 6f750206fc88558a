//! Configuration loading for the bus's ambient stack (§6 "Configuration
//! keys"): an optional TOML file layered under CLI flags, falling back to
//! the defaults named throughout §5/§8.
//!
//! Grounded on the teacher's `BenchmarkConfiguration::from(&Args)` pattern
//! (`src/cli.rs`) of converting CLI args into an internal config struct,
//! generalized here to also read a TOML file first so CLI flags can
//! override it. `toml` is new relative to the teacher, grounded in the
//! pack's `thin-edge.io` manifest (see DESIGN.md).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::connection::acceptor::DEFAULT_ROUTER_PORT;
use crate::endpoint::{DEFAULT_ALIVE_NOTIFY_PERIOD, DEFAULT_NO_ID_TIMEOUT};
use crate::router::pending::DEFAULT_PENDING_TIMEOUT;

/// The fully-resolved configuration the binary runs with, after layering
/// an optional TOML file under whatever CLI flags were given.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// `msgbus.router.address` — addresses this process's router listens
    /// on, or dials (for a bridge/child router), parsed with
    /// [`crate::connection::acceptor::Address::parse`] by the caller.
    pub router_addresses: Vec<String>,
    /// `msgbus.router.password`.
    pub router_password: Option<String>,
    /// `msgbus.endpoint.no_id_timeout`.
    pub no_id_timeout: Duration,
    /// `msgbus.endpoint.alive_notify_period`.
    pub alive_notify_period: Duration,
    /// `msgbus.bridge.mqtt_broker`, as `host:port`.
    pub mqtt_broker: Option<String>,
    /// Per-router pending-connection handshake timeout; not a named §6 key,
    /// kept here so a config file can override the §5 default for testing.
    pub pending_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            router_addresses: vec![format!("0.0.0.0:{}", DEFAULT_ROUTER_PORT)],
            router_password: None,
            no_id_timeout: DEFAULT_NO_ID_TIMEOUT,
            alive_notify_period: DEFAULT_ALIVE_NOTIFY_PERIOD,
            mqtt_broker: None,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
        }
    }
}

/// Raw shape of the optional TOML config file. Every field is optional so a
/// file can set just the keys it cares about; anything absent falls back to
/// [`BusConfig::default`].
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    msgbus: Option<MsgBusSection>,
}

#[derive(Debug, Default, Deserialize)]
struct MsgBusSection {
    router: Option<RouterSection>,
    endpoint: Option<EndpointSection>,
    bridge: Option<BridgeSection>,
}

#[derive(Debug, Default, Deserialize)]
struct RouterSection {
    address: Option<Vec<String>>,
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EndpointSection {
    no_id_timeout_secs: Option<u64>,
    alive_notify_period_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BridgeSection {
    mqtt_broker: Option<String>,
}

impl BusConfig {
    /// Load from a TOML file, falling back to [`BusConfig::default`] for
    /// any key the file doesn't set.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let file: FileConfig = toml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(Self::default().layer_file(file))
    }

    fn layer_file(mut self, file: FileConfig) -> Self {
        let Some(msgbus) = file.msgbus else { return self };
        if let Some(router) = msgbus.router {
            if let Some(address) = router.address {
                self.router_addresses = address;
            }
            if router.password.is_some() {
                self.router_password = router.password;
            }
        }
        if let Some(endpoint) = msgbus.endpoint {
            if let Some(secs) = endpoint.no_id_timeout_secs {
                self.no_id_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = endpoint.alive_notify_period_secs {
                self.alive_notify_period = Duration::from_secs(secs);
            }
        }
        if let Some(bridge) = msgbus.bridge {
            if bridge.mqtt_broker.is_some() {
                self.mqtt_broker = bridge.mqtt_broker;
            }
        }
        self
    }

    /// Layer CLI-provided overrides on top, highest priority.
    pub fn with_cli_overrides(
        mut self,
        router_addresses: Vec<String>,
        router_password: Option<String>,
        no_id_timeout: Option<Duration>,
        alive_notify_period: Option<Duration>,
        mqtt_broker: Option<String>,
    ) -> Self {
        if !router_addresses.is_empty() {
            self.router_addresses = router_addresses;
        }
        if router_password.is_some() {
            self.router_password = router_password;
        }
        if let Some(t) = no_id_timeout {
            self.no_id_timeout = t;
        }
        if let Some(t) = alive_notify_period {
            self.alive_notify_period = t;
        }
        if mqtt_broker.is_some() {
            self.mqtt_broker = mqtt_broker;
        }
        self
    }
}
