//! Execution mode for the router's per-connection I/O (§4.2 "Worker model",
//! §5 "Scheduling").
//!
//! Grounded on `src/coordination.rs`'s shared-state-behind-a-lock pattern for
//! coordinating concurrent workers, generalized to the "one work-unit per
//! connection per tick, barrier at end of tick" shape §4.2 describes. A
//! connection is briefly swapped out for a [`NullConnection`] placeholder
//! while a spawned task owns it, and swapped back once the tick's
//! [`tokio::task::JoinSet`] drains — `Router::update` never observes the
//! placeholder.

use crate::connection::{Connection, ConnectionKind};
use crate::message::Message;
use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinSet;

/// How the router drives per-connection fetch work each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Everything happens inline, one connection after another.
    SingleTask,
    /// Each connection's fetch work runs as its own tokio task; the tick
    /// waits for all of them (the "barrier") before moving on.
    WorkerPool { workers: usize },
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::SingleTask
    }
}

/// Inert stand-in for a connection that's temporarily out on loan to a
/// spawned task. Never observed by routing logic; any call on it would be a
/// bug, so it simply reports "nothing to do" rather than panicking.
pub struct NullConnection;

#[async_trait]
impl Connection for NullConnection {
    fn max_data_size(&self) -> usize {
        0
    }

    async fn send(&mut self, _message: Message) -> Result<bool> {
        Ok(false)
    }

    async fn fetch_messages(&mut self, _max: usize) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn update(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn is_usable(&self) -> bool {
        false
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::InProcess
    }

    fn type_id(&self) -> &'static str {
        "null"
    }

    fn cleanup(&mut self) {}
}

/// Fetch up to `batch` messages from each of `connections`, in the order
/// given, under the requested execution mode. Each output slot holds
/// `(original index, result, the connection handed back)`.
pub async fn fetch_all(
    mode: ExecutionMode,
    connections: Vec<Box<dyn Connection>>,
    batch: usize,
) -> Vec<(Result<Vec<Message>>, Box<dyn Connection>)> {
    match mode {
        ExecutionMode::SingleTask => {
            let mut out = Vec::with_capacity(connections.len());
            for mut connection in connections {
                let result = connection.fetch_messages(batch).await;
                out.push((result, connection));
            }
            out
        }
        ExecutionMode::WorkerPool { workers } => fetch_pooled(connections, batch, workers.max(1)).await,
    }
}

async fn fetch_pooled(
    connections: Vec<Box<dyn Connection>>,
    batch: usize,
    workers: usize,
) -> Vec<(Result<Vec<Message>>, Box<dyn Connection>)> {
    let total = connections.len();
    let mut results: Vec<Option<(Result<Vec<Message>>, Box<dyn Connection>)>> = Vec::with_capacity(total);
    results.resize_with(total, || None);

    let mut pending = connections.into_iter().enumerate();
    let mut set: JoinSet<(usize, Result<Vec<Message>>, Box<dyn Connection>)> = JoinSet::new();

    for _ in 0..workers {
        if let Some((idx, mut connection)) = pending.next() {
            set.spawn(async move {
                let result = connection.fetch_messages(batch).await;
                (idx, result, connection)
            });
        }
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, result, connection)) => results[idx] = Some((result, connection)),
            Err(_join_error) => continue,
        }
        if let Some((idx, mut connection)) = pending.next() {
            set.spawn(async move {
                let result = connection.fetch_messages(batch).await;
                (idx, result, connection)
            });
        }
    }

    results
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| (Ok(Vec::new()), Box::new(NullConnection))))
        .collect()
}
