//! # meshbus — Binary Entry Point
//!
//! Thin ambient scaffolding around the library crate: parses CLI args,
//! configures logging, then either runs a standalone router or drives one of
//! the in-process demos straight off the bus primitives (`router`,
//! `endpoint`, `blob`). This mirrors how the teacher's `main.rs`/`cli.rs`
//! drive its `IpcTransport` primitives, generalized from "run one benchmark
//! mechanism" to "wire up a bus topology".

use anyhow::{Context, Result};
use clap::Parser;
use meshbus::blob::fragment::BlobOptions;
use meshbus::blob::io::SourceIo;
use meshbus::blob::stream_io::StreamIo;
use meshbus::cli::{Args, Command, RouterArgs};
use meshbus::config::BusConfig;
use meshbus::connection::acceptor::{Acceptor, Address};
use meshbus::connection::in_process::in_process_pair;
use meshbus::message::MessageId;
use meshbus::{Endpoint, IdRange, Priority, Router};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;
use logging::ColorizedFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_log_layer;
    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("meshbus.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "meshbus.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry().with(detailed_log_layer).with(stdout_log).init();
    let _log_guard = guard;

    let config = match args.config.as_deref() {
        Some(path) => BusConfig::from_file(path)?,
        None => BusConfig::default(),
    };

    info!("starting meshbus");
    match args.command.clone() {
        Command::Router(router_args) => run_router(&config, &router_args).await,
        Command::DemoPing => run_demo_ping().await,
        Command::DemoBlob => run_demo_blob().await,
    }
}

/// Run a standalone router until interrupted, accepting on every configured
/// address (§4.2, §6 "Acceptor address schemes").
async fn run_router(config: &BusConfig, router_args: &RouterArgs) -> Result<()> {
    let id_range = IdRange::new(router_args.id_base, router_args.id_end);
    let mut router = Router::new(id_range);
    if let Some(password) = router_args.password.as_deref().or(config.router_password.as_deref()) {
        router = router.with_password(password);
    }

    let addresses = if router_args.listen.is_empty() { &config.router_addresses } else { &router_args.listen };
    for raw in addresses {
        let address = Address::parse(raw).with_context(|| format!("parsing listen address '{}'", raw))?;
        if address == Address::InProcess {
            info!("skipping 'direct' listen address; in-process endpoints are wired up by the embedding process, not accepted");
            continue;
        }
        match Acceptor::bind(&address, 1 << 20).await {
            Ok(acceptor) => {
                info!("router listening on {}", raw);
                router.add_acceptor(acceptor);
            }
            Err(error) => error!("failed to bind listen address '{}': {}", raw, error),
        }
    }

    info!("router running; press ctrl-c to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            result = router.update() => {
                if !result? {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
    router.finish().await;
    info!("router stopped");
    Ok(())
}

/// Spec §8 scenario 1: router R with a direct acceptor; endpoints A and B
/// attach through R; A pings B, B pongs back.
async fn run_demo_ping() -> Result<()> {
    let mut router = Router::new(IdRange::new(1, 1000));
    let (a_router_side, a_endpoint_side) = in_process_pair(1 << 16);
    let (b_router_side, b_endpoint_side) = in_process_pair(1 << 16);
    router.add_pending_connection(Box::new(a_router_side));
    router.add_pending_connection(Box::new(b_router_side));

    let mut endpoint_a = Endpoint::new(Box::new(a_endpoint_side), None);
    let mut endpoint_b = Endpoint::new(Box::new(b_endpoint_side), None);

    for _ in 0..20 {
        router.update().await?;
        endpoint_a.update().await?;
        endpoint_b.update().await?;
        if endpoint_a.get_id().is_some() && endpoint_b.get_id().is_some() {
            break;
        }
    }
    let (a_id, b_id) = match (endpoint_a.get_id(), endpoint_b.get_id()) {
        (Some(a), Some(b)) => (a, b),
        _ => anyhow::bail!("endpoints did not acquire ids in time"),
    };
    info!("endpoint A = {}, endpoint B = {}", a_id, b_id);

    let ping_id = MessageId::new("eagiTest", "ping");
    let pong_id = MessageId::new("eagiTest", "pong");
    endpoint_b.subscribe(ping_id.clone());
    endpoint_a.subscribe(pong_id.clone());
    endpoint_a.post(b_id, ping_id.clone(), Priority::Normal, vec![]);

    let pong_received = Arc::new(Mutex::new(false));
    for _ in 0..20 {
        endpoint_a.update().await?;
        router.update().await?;
        endpoint_b.update().await?;
        endpoint_b.process_one(&ping_id, |message| {
            info!("B received ping from {}", message.source_id);
        });
        endpoint_b.post(a_id, pong_id.clone(), Priority::Normal, vec![]);
        router.update().await?;
        endpoint_a.update().await?;
        let received = pong_received.clone();
        endpoint_a.process_one(&pong_id, move |_| *received.lock().unwrap() = true);
        if *pong_received.lock().unwrap() {
            break;
        }
    }
    if *pong_received.lock().unwrap() {
        info!("ping/pong round trip complete");
    } else {
        anyhow::bail!("did not observe a pong in time");
    }
    endpoint_a.finish().await;
    endpoint_b.finish().await;
    router.finish().await;
    Ok(())
}

struct ZeroSource {
    total_size: u64,
}

impl SourceIo for ZeroSource {
    fn fetch_fragment(&mut self, _offset: u64, dst: &mut [u8]) -> Result<usize> {
        dst.fill(0);
        Ok(dst.len())
    }
    fn is_at_eod(&self, offset: u64) -> bool {
        offset >= self.total_size
    }
    fn total_size(&self) -> u64 {
        self.total_size
    }
}

/// Spec §8 scenario 3: a 16 MiB zero-filled BLOB sent from A to B.
async fn run_demo_blob() -> Result<()> {
    const TOTAL_SIZE: u64 = 16 * 1024 * 1024;
    const MAX_DATA_SIZE: usize = 4096;

    let mut router = Router::new(IdRange::new(1, 1000));
    let (a_router_side, a_endpoint_side) = in_process_pair(MAX_DATA_SIZE);
    let (b_router_side, b_endpoint_side) = in_process_pair(MAX_DATA_SIZE);
    router.add_pending_connection(Box::new(a_router_side));
    router.add_pending_connection(Box::new(b_router_side));

    let mut endpoint_a = Endpoint::new(Box::new(a_endpoint_side), None);
    let mut endpoint_b = Endpoint::new(Box::new(b_endpoint_side), None);
    for _ in 0..20 {
        router.update().await?;
        endpoint_a.update().await?;
        endpoint_b.update().await?;
        if endpoint_a.get_id().is_some() && endpoint_b.get_id().is_some() {
            break;
        }
    }
    let (a_id, b_id) = match (endpoint_a.get_id(), endpoint_b.get_id()) {
        (Some(a), Some(b)) => (a, b),
        _ => anyhow::bail!("endpoints did not acquire ids in time"),
    };

    let blob_id = MessageId::new("eagiTest", "blob");
    let finished = Arc::new(Mutex::new(false));
    let mut stream_io = StreamIo::new(TOTAL_SIZE);
    let finished_flag = finished.clone();
    stream_io.finished.subscribe(move |_: &()| *finished_flag.lock().unwrap() = true);
    endpoint_b.expect_incoming_blob(blob_id.clone(), a_id, 1, Box::new(stream_io), Duration::from_secs(60));
    endpoint_a.push_outgoing_blob(blob_id, b_id, 1, Box::new(ZeroSource { total_size: TOTAL_SIZE }), Duration::from_secs(60), BlobOptions::default(), Priority::Idle);

    info!("sending 16 MiB BLOB...");
    for _ in 0..20_000 {
        endpoint_a.update().await?;
        router.update().await?;
        endpoint_b.update().await?;
        if *finished.lock().unwrap() {
            break;
        }
    }
    if *finished.lock().unwrap() {
        info!("blob transfer complete");
    } else {
        anyhow::bail!("blob transfer did not complete in time");
    }
    endpoint_a.finish().await;
    endpoint_b.finish().await;
    router.finish().await;
    Ok(())
}
