//! Stdio-tunnel connection kind: frames bridged over a child process's
//! stdin/stdout as base64-encoded lines, for subprocess transports that
//! have no socket of their own.
//!
//! Grounded on the teacher's coordination layer, which shells out to a
//! remote host over a pipe and reads line-oriented output on a dedicated
//! thread (`src/coordination.rs`); the double-buffer here generalizes that
//! into a `std::sync::{Mutex, Condvar}` handoff bridged into `tokio` via
//! `spawn_blocking`, per §5's note that the tunnel uses OS threads rather
//! than the async runtime for its I/O loop.

use super::{Connection, ConnectionKind};
use crate::message::codec::{BincodeCodec, MessageCodec};
use crate::message::Message;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

struct Shared {
    inbound: Mutex<VecDeque<Message>>,
    inbound_ready: Condvar,
    alive: Mutex<bool>,
}

impl Shared {
    fn new() -> Self {
        Self {
            inbound: Mutex::new(VecDeque::new()),
            inbound_ready: Condvar::new(),
            alive: Mutex::new(true),
        }
    }

    fn mark_dead(&self) {
        *self.alive.lock().unwrap() = false;
        self.inbound_ready.notify_all();
    }

    fn is_alive(&self) -> bool {
        *self.alive.lock().unwrap()
    }
}

/// A connection that frames messages as base64 lines over a pair of
/// `Read`/`Write` handles (typically a child process's stdout/stdin).
///
/// The reader runs on its own OS thread, pushing decoded frames into a
/// shared deque guarded by a condvar; `fetch_messages` drains it without
/// blocking the async runtime.
pub struct StdioTunnelConnection {
    writer: Box<dyn Write + Send>,
    shared: Arc<Shared>,
    reader_handle: Option<JoinHandle<()>>,
    max_data_size: usize,
    codec: BincodeCodec,
}

impl StdioTunnelConnection {
    pub fn new<R, W>(reader: R, writer: W, max_data_size: usize) -> Self
    where
        R: std::io::Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let shared = Arc::new(Shared::new());
        let reader_handle = {
            let shared = shared.clone();
            std::thread::spawn(move || Self::reader_loop(reader, shared))
        };
        Self {
            writer: Box::new(writer),
            shared,
            reader_handle: Some(reader_handle),
            max_data_size,
            codec: BincodeCodec,
        }
    }

    fn reader_loop(reader: impl std::io::Read, shared: Arc<Shared>) {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next() {
                Some(Ok(line)) => {
                    let Ok(bytes) = BASE64.decode(line.trim()) else {
                        continue;
                    };
                    let codec = BincodeCodec;
                    let Ok(message) = codec.decode(&bytes) else {
                        continue;
                    };
                    shared.inbound.lock().unwrap().push_back(message);
                    shared.inbound_ready.notify_one();
                }
                Some(Err(_)) | None => break,
            }
        }
        shared.mark_dead();
    }
}

#[async_trait]
impl Connection for StdioTunnelConnection {
    fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    async fn send(&mut self, message: Message) -> Result<bool> {
        if !self.is_usable() {
            return Ok(false);
        }
        let bytes = self.codec.encode(&message)?;
        if bytes.len() > self.max_data_size {
            return Err(anyhow!("message of {} bytes exceeds tunnel max {}", bytes.len(), self.max_data_size));
        }
        let mut line = BASE64.encode(&bytes);
        line.push('\n');
        self.writer.write_all(line.as_bytes()).context("writing to stdio tunnel")?;
        self.writer.flush().context("flushing stdio tunnel")?;
        Ok(true)
    }

    async fn fetch_messages(&mut self, max: usize) -> Result<Vec<Message>> {
        let mut inbound = self.shared.inbound.lock().unwrap();
        let drained = inbound.drain(..inbound.len().min(max)).collect();
        Ok(drained)
    }

    async fn update(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn is_usable(&self) -> bool {
        self.shared.is_alive()
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::StdioTunnel
    }

    fn type_id(&self) -> &'static str {
        "stdio-tunnel"
    }

    fn cleanup(&mut self) {
        self.shared.mark_dead();
        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EndpointId, MessageId, Priority};
    use std::io::Cursor;

    #[tokio::test]
    async fn decodes_a_line_written_by_a_peer() {
        let codec = BincodeCodec;
        let message = Message::new(MessageId::new("eagiTest", "ping"), EndpointId(1), EndpointId(2), Priority::Normal, vec![4, 5, 6]);
        let bytes = codec.encode(&message).unwrap();
        let mut line = BASE64.encode(&bytes);
        line.push('\n');

        let reader = Cursor::new(line.into_bytes());
        let writer = Vec::new();
        let mut conn = StdioTunnelConnection::new(reader, writer, 65536);

        let mut received = Vec::new();
        for _ in 0..50 {
            received = conn.fetch_messages(10).await.unwrap();
            if !received.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn eof_on_reader_marks_connection_unusable() {
        let reader = Cursor::new(Vec::new());
        let writer = Vec::new();
        let conn = StdioTunnelConnection::new(reader, writer, 65536);

        let mut alive = conn.is_usable();
        for _ in 0..50 {
            alive = conn.is_usable();
            if !alive {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!alive);
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let reader = Cursor::new(Vec::new());
        let writer = Vec::new();
        let mut conn = StdioTunnelConnection::new(reader, writer, 4);
        let message = Message::new(MessageId::new("eagiTest", "ping"), EndpointId(1), EndpointId(2), Priority::Normal, vec![1; 100]);
        assert!(conn.send(message).await.is_err());
    }
}
