//! Local inter-process connection kind, backed by a POSIX message queue.
//!
//! Grounded on the teacher's `src/ipc/posix_message_queue.rs`: same
//! `O_NONBLOCK` + `nix::mqueue` calls, same creator-vs-opener cleanup
//! discipline. Unlike the teacher's benchmark transport (which retries with
//! backoff *inside* one `send`/`receive` call until it succeeds), a bus
//! connection's `send`/`fetch_messages` are single-pass per §5 — the
//! owning endpoint or router supplies the retry loop across ticks.

use super::{Connection, ConnectionKind};
use crate::message::codec::{BincodeCodec, MessageCodec};
use crate::message::Message;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::mqueue::{mq_close, mq_open, mq_receive, mq_send, mq_unlink, MQ_OFlag, MqAttr, MqdT};
use nix::sys::stat::Mode;
use tracing::{debug, warn};

/// A connection backed by a single bidirectional POSIX message queue.
///
/// POSIX message queues preserve message boundaries, so each `mq_send`
/// carries exactly one encoded [`Message`].
pub struct LocalMqueueConnection {
    mqd: Option<MqdT>,
    name: String,
    owns_queue: bool,
    max_data_size: usize,
    usable: bool,
    codec: BincodeCodec,
}

impl LocalMqueueConnection {
    /// Create (and own) a new named queue. Only the creator unlinks it on
    /// cleanup.
    pub fn create(name: &str, max_data_size: usize, queue_depth: i64) -> Result<Self> {
        let attr = MqAttr::new(0, queue_depth, max_data_size as i64, 0);
        let mqd = mq_open(
            name,
            MQ_OFlag::O_CREAT | MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK,
            Mode::S_IRUSR | Mode::S_IWUSR,
            Some(&attr),
        )
        .map_err(|e| anyhow!("mq_open (create) '{}' failed: {}", name, e))?;

        debug!("created posix message queue '{}'", name);
        Ok(Self {
            mqd: Some(mqd),
            name: name.to_string(),
            owns_queue: true,
            max_data_size,
            usable: true,
            codec: BincodeCodec,
        })
    }

    /// Open a queue created elsewhere (e.g. by a peer acting as server).
    pub fn open(name: &str, max_data_size: usize) -> Result<Self> {
        let mqd = mq_open(name, MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK, Mode::empty(), None)
            .map_err(|e| anyhow!("mq_open (open) '{}' failed: {}", name, e))?;

        Ok(Self {
            mqd: Some(mqd),
            name: name.to_string(),
            owns_queue: false,
            max_data_size,
            usable: true,
            codec: BincodeCodec,
        })
    }
}

#[async_trait]
impl Connection for LocalMqueueConnection {
    fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    async fn send(&mut self, message: Message) -> Result<bool> {
        if !self.usable {
            return Ok(false);
        }
        let Some(mqd) = self.mqd.as_ref() else {
            return Ok(false);
        };
        let bytes = self.codec.encode(&message)?;
        if bytes.len() > self.max_data_size {
            return Err(anyhow!(
                "message of {} bytes exceeds queue message size {}",
                bytes.len(),
                self.max_data_size
            ));
        }
        match mq_send(mqd, &bytes, message.priority as u32) {
            Ok(()) => Ok(true),
            Err(Errno::EAGAIN) => Ok(false),
            Err(e) => {
                self.usable = false;
                warn!("mq_send on '{}' failed: {}", self.name, e);
                Err(anyhow!("mq_send on '{}' failed: {}", self.name, e))
            }
        }
    }

    async fn fetch_messages(&mut self, max: usize) -> Result<Vec<Message>> {
        if !self.usable {
            return Ok(Vec::new());
        }
        let Some(mqd) = self.mqd.as_ref() else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        let mut buffer = vec![0u8; self.max_data_size];
        for _ in 0..max {
            match mq_receive(mqd, &mut buffer, &mut 0) {
                Ok(len) => match self.codec.decode(&buffer[..len]) {
                    Ok(message) => out.push(message),
                    Err(e) => debug!("dropping undecodable frame on queue '{}': {}", self.name, e),
                },
                Err(Errno::EAGAIN) => break,
                Err(e) => {
                    self.usable = false;
                    warn!("mq_receive on '{}' failed: {}", self.name, e);
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn update(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::LocalIpc
    }

    fn type_id(&self) -> &'static str {
        "posix-mqueue"
    }

    fn cleanup(&mut self) {
        if let Some(mqd) = self.mqd.take() {
            let _ = mq_close(mqd);
        }
        if self.owns_queue {
            let _ = mq_unlink(self.name.as_str());
        }
        self.usable = false;
    }
}

impl Drop for LocalMqueueConnection {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EndpointId, MessageId, Priority};

    fn unique_queue_name(tag: &str) -> String {
        format!("/meshbus_test_{}_{}", tag, std::process::id())
    }

    #[tokio::test]
    #[ignore = "requires a POSIX mqueue filesystem (not available in every sandbox)"]
    async fn create_send_receive_roundtrip() {
        let name = unique_queue_name("roundtrip");
        let mut server = LocalMqueueConnection::create(&name, 8192, 10).unwrap();
        let mut client = LocalMqueueConnection::open(&name, 8192).unwrap();

        let message = Message::new(
            MessageId::new("eagiTest", "ping"),
            EndpointId(1),
            EndpointId(2),
            Priority::Normal,
            vec![9, 9, 9],
        );
        assert!(client.send(message).await.unwrap());

        let received = server.fetch_messages(1).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, vec![9, 9, 9]);

        server.cleanup();
    }

    #[tokio::test]
    #[ignore = "requires a POSIX mqueue filesystem (not available in every sandbox)"]
    async fn fetch_on_empty_queue_returns_empty_not_blocking() {
        let name = unique_queue_name("empty");
        let mut server = LocalMqueueConnection::create(&name, 8192, 10).unwrap();
        let received = server.fetch_messages(5).await.unwrap();
        assert!(received.is_empty());
        server.cleanup();
    }
}
