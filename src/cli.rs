//! # Command-Line Interface Module
//!
//! Command-line argument parsing for the `meshbus` binary, in the teacher's
//! `clap`-derive style (`styles()` helper, grouped help text). The binary is
//! ambient scaffolding for manually exercising the bus primitives — it does
//! not implement a ping/resource/shutdown *service* on top of them, per §1's
//! non-goals.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, Subcommand,
};
use std::path::PathBuf;
use std::time::Duration;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// meshbus — a process-to-process message bus.
///
/// Wires a router and a handful of endpoints together for manual exercising
/// of the routing fabric, endpoint state machine, and BLOB transfer path.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short = 'v', long, action = clap::ArgAction::Count, help_heading = "Logging")]
    pub verbose: u8,

    /// Suppress the colorized stdout log; the detailed log file still runs
    /// at the configured verbosity.
    #[arg(long, help_heading = "Logging")]
    pub quiet: bool,

    /// Where the detailed log file goes. Pass "stderr" to log there instead
    /// of a rolling file.
    #[arg(long, help_heading = "Logging")]
    pub log_file: Option<String>,

    /// Optional TOML config file with `msgbus.*` keys (§6); CLI flags below
    /// override whatever it sets.
    #[arg(long, help_heading = "Configuration")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a standalone router, listening on one or more addresses.
    Router(RouterArgs),
    /// In-process demo: a router plus two endpoints exchanging a ping/pong
    /// (spec §8 scenario 1).
    DemoPing,
    /// In-process demo: a 16 MiB zero-filled BLOB transfer between two
    /// endpoints attached to one router (spec §8 scenario 3).
    DemoBlob,
}

#[derive(Parser, Debug, Clone)]
pub struct RouterArgs {
    /// Addresses to listen on (repeatable). Accepts the schemes from §6:
    /// `direct`, `local:<name>`, `host[:port]`, `mqtt://host[:port]`.
    #[arg(short = 'l', long = "listen", num_args = 1.., default_values_t = vec!["0.0.0.0:34912".to_string()])]
    pub listen: Vec<String>,

    /// Require pending connections to prove knowledge of this password
    /// before being promoted to routed nodes (§4.2).
    #[arg(long)]
    pub password: Option<String>,

    /// Lower end of this router's endpoint-id allocation range (§3).
    #[arg(long, default_value_t = 1)]
    pub id_base: u64,

    /// Upper end (exclusive) of this router's endpoint-id allocation range.
    #[arg(long, default_value_t = 100_000)]
    pub id_end: u64,
}

/// Parse a human-readable duration like `"10s"`, `"5m"`, `"1h"`.
///
/// Grounded on the teacher's `parse_duration` (`src/cli.rs`), kept for any
/// future subcommand that wants a duration flag; unused today but not yet
/// dead since it is exercised directly by its own tests below.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (digits, unit) = value
        .find(|c: char| !c.is_ascii_digit())
        .map(|idx| value.split_at(idx))
        .unwrap_or((value, "s"));
    let amount: u64 = digits.parse().map_err(|_| format!("'{}' is not a valid duration", value))?;
    let seconds = match unit {
        "s" | "" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        other => return Err(format!("unrecognized duration unit '{}'", other)),
    };
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_seconds() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn parses_minutes_and_hours() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_duration("10x").is_err());
    }
}
