//! In-process connection kind: a shared queue pair for endpoints attached to
//! a router living in the same address space.
//!
//! Grounded on the teacher's `crossbeam` dependency (present in
//! `Cargo.toml` but unused by any of its own transports); here it becomes
//! the actual in-process transport spec.md calls for.

use super::{Connection, ConnectionKind};
use crate::message::Message;
use anyhow::Result;
use async_trait::async_trait;
use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One end of an in-process connection pair.
pub struct InProcessConnection {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    usable: Arc<AtomicBool>,
    max_data_size: usize,
}

/// Create a connected pair, as when a router accepts an in-process endpoint.
pub fn in_process_pair(max_data_size: usize) -> (InProcessConnection, InProcessConnection) {
    let (tx_a, rx_a) = unbounded();
    let (tx_b, rx_b) = unbounded();
    let usable = Arc::new(AtomicBool::new(true));
    (
        InProcessConnection {
            tx: tx_a,
            rx: rx_b,
            usable: usable.clone(),
            max_data_size,
        },
        InProcessConnection {
            tx: tx_b,
            rx: rx_a,
            usable,
            max_data_size,
        },
    )
}

impl InProcessConnection {
    /// Test/demo hook: both ends of a pair share one usability flag, so
    /// toggling it here simulates the link going down and recovering
    /// (spec §8 scenario 6).
    pub fn set_usable(&self, usable: bool) {
        self.usable.store(usable, Ordering::SeqCst);
    }

    /// A cloneable handle onto the shared usability flag, so a caller can
    /// retain the ability to toggle the link after the connection itself
    /// has been boxed and handed off (e.g. to a `Router` or `Endpoint`).
    pub fn usable_handle(&self) -> InProcessUsableHandle {
        InProcessUsableHandle(self.usable.clone())
    }
}

/// See [`InProcessConnection::usable_handle`].
#[derive(Clone)]
pub struct InProcessUsableHandle(Arc<AtomicBool>);

impl InProcessUsableHandle {
    pub fn set_usable(&self, usable: bool) {
        self.0.store(usable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for InProcessConnection {
    fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    async fn send(&mut self, message: Message) -> Result<bool> {
        if !self.is_usable() {
            return Ok(false);
        }
        if message.payload.len() > self.max_data_size {
            return Ok(false);
        }
        Ok(self.tx.try_send(message).is_ok())
    }

    async fn fetch_messages(&mut self, max: usize) -> Result<Vec<Message>> {
        if !self.is_usable() {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(max.min(16));
        for _ in 0..max {
            match self.rx.try_recv() {
                Ok(message) => out.push(message),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.usable.store(false, Ordering::SeqCst);
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
        self.usable.load(Ordering::SeqCst)
    }

    fn kind(&self) -> ConnectionKind {
        ConnectionKind::InProcess
    }

    fn type_id(&self) -> &'static str {
        "in-process"
    }

    fn cleanup(&mut self) {
        self.usable.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EndpointId, MessageId, Priority};

    fn msg() -> Message {
        Message::new(MessageId::new("x", "y"), EndpointId(1), EndpointId(2), Priority::Normal, vec![1, 2, 3])
    }

    #[tokio::test]
    async fn delivers_across_the_pair() {
        let (mut a, mut b) = in_process_pair(4096);
        assert!(a.send(msg()).await.unwrap());
        let received = b.fetch_messages(10).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn fetch_messages_respects_max() {
        let (mut a, mut b) = in_process_pair(4096);
        for _ in 0..5 {
            assert!(a.send(msg()).await.unwrap());
        }
        let first_batch = b.fetch_messages(3).await.unwrap();
        assert_eq!(first_batch.len(), 3);
        let second_batch = b.fetch_messages(10).await.unwrap();
        assert_eq!(second_batch.len(), 2);
    }

    #[tokio::test]
    async fn toggling_usable_blocks_send_and_fetch() {
        let (mut a, mut b) = in_process_pair(4096);
        a.set_usable(false);
        assert!(!a.send(msg()).await.unwrap());
        assert!(b.fetch_messages(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_payload_is_refused_not_errored() {
        let (mut a, _b) = in_process_pair(2);
        assert!(!a.send(msg()).await.unwrap());
    }
}
