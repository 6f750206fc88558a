//! C3 — BLOB manipulator: fragments one logical byte sequence into many
//! bounded-size messages and reassembles them on the other side, with
//! resend-driven recovery from loss (§4.3).
//!
//! No direct teacher analogue; the error-handling idiom (`anyhow`, `debug!`/
//! `warn!` on protocol faults, no panics on malformed input) follows the
//! rest of the crate's connection layer.

pub mod chunk_io;
pub mod fragment;
pub mod intervals;
pub mod io;
pub mod stream_io;

use crate::message::{special, EndpointId, Message, MessageId, Priority};
use fragment::{BlobOptions, Fragment, FragmentHeader};
use intervals::IntervalSet;
use io::{PreparationStatus, SourceIo, TargetIo};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default per-step preparation timeout (§3).
pub const DEFAULT_PREPARE_STEP: Duration = Duration::from_secs(5);
/// Default linger window after completion, to absorb duplicate fragments (§3).
pub const DEFAULT_LINGER_TIME: Duration = Duration::from_secs(15);
/// Idle threshold before the receiver emits a resend request.
///
/// §3 names a "per-step" timer family (prepare: 5s, linger: 15s) but does
/// not give this one its own default; the literal scenario in §8 configures
/// a short 1s value for its own test. We reuse the prepare-step default as
/// the bus-wide default and let callers override it per manipulator, noting
/// this as a judgment call in the grounding ledger rather than inventing an
/// unstated constant silently.
pub const DEFAULT_RESEND_IDLE: Duration = DEFAULT_PREPARE_STEP;

/// A request enumerating the byte ranges a receiver is still missing,
/// carried as the payload of a `blobResend` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResendRequest {
    source_blob_id: u64,
    target_blob_id: u64,
    missing: Vec<(u64, u64)>,
}

struct OutgoingBlob {
    target_blob_id: u64,
    message_id: MessageId,
    source_id: EndpointId,
    target_id: EndpointId,
    source_io: Box<dyn SourceIo>,
    total_size: u64,
    options: BlobOptions,
    priority: Priority,
    todo_parts: IntervalSet,
    prepare_progress: f32,
    prepare_status: PreparationStatus,
    created_at: Instant,
    max_time: Duration,
}

struct IncomingBlob {
    /// The peer's own local id for this transfer, learned from the first
    /// fragment and echoed back in resend requests.
    peer_source_blob_id: Option<u64>,
    message_id: MessageId,
    source_id: EndpointId,
    target_id: EndpointId,
    target_io: Box<dyn TargetIo>,
    total_size: Option<u64>,
    done_parts: IntervalSet,
    finished: bool,
    last_activity: Instant,
    created_at: Instant,
    max_time: Duration,
}

/// Completion notice queued for [`BlobManipulator::fetch_all`]. The bytes
/// themselves have already reached the caller through the target-IO's own
/// signals (`stream_io`/`chunk_io`); this is just the "a BLOB finished"
/// event represented as an ordinary message for uniform dispatch.
struct FinishedNotice {
    message_id: MessageId,
    source_id: EndpointId,
    target_id: EndpointId,
}

/// Drives fragmentation of outgoing BLOBs and reassembly of incoming ones.
pub struct BlobManipulator {
    fragment_message_id: MessageId,
    resend_message_id: MessageId,
    next_source_blob_id: u64,
    outgoing: HashMap<u64, OutgoingBlob>,
    incoming: HashMap<u64, IncomingBlob>,
    completed_linger: HashMap<u64, Instant>,
    pending_notices: Vec<FinishedNotice>,
    prepare_step_timeout: Duration,
    linger_time: Duration,
    resend_idle_timeout: Duration,
}

impl Default for BlobManipulator {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobManipulator {
    pub fn new() -> Self {
        Self {
            fragment_message_id: special::blob_fragment(),
            resend_message_id: special::blob_resend(),
            next_source_blob_id: 1,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            completed_linger: HashMap::new(),
            pending_notices: Vec::new(),
            prepare_step_timeout: DEFAULT_PREPARE_STEP,
            linger_time: DEFAULT_LINGER_TIME,
            resend_idle_timeout: DEFAULT_RESEND_IDLE,
        }
    }

    pub fn with_resend_idle(mut self, idle: Duration) -> Self {
        self.resend_idle_timeout = idle;
        self
    }

    /// True if `message_id` is one this manipulator's fragment/resend
    /// traffic uses, so an owner can route incoming messages here.
    pub fn owns(&self, message_id: &MessageId) -> bool {
        *message_id == self.fragment_message_id || *message_id == self.resend_message_id
    }

    /// Begin sending `source_io`'s bytes as a BLOB. Returns the freshly
    /// allocated local `source_blob_id`.
    #[allow(clippy::too_many_arguments)]
    pub fn push_outgoing(
        &mut self,
        message_id: MessageId,
        source_id: EndpointId,
        target_id: EndpointId,
        target_blob_id: u64,
        source_io: Box<dyn SourceIo>,
        max_time: Duration,
        options: BlobOptions,
        priority: Priority,
    ) -> u64 {
        let source_blob_id = self.next_source_blob_id;
        self.next_source_blob_id += 1;
        let total_size = source_io.total_size();
        self.outgoing.insert(
            source_blob_id,
            OutgoingBlob {
                target_blob_id,
                message_id,
                source_id,
                target_id,
                source_io,
                total_size,
                options,
                priority,
                todo_parts: IntervalSet::new(),
                prepare_progress: 0.0,
                prepare_status: PreparationStatus::Working,
                created_at: Instant::now(),
                max_time,
            },
        );
        source_blob_id
    }

    /// Register interest in an incoming BLOB the caller expects to receive
    /// under `target_blob_id`. Returns `false` if already expecting one
    /// under that id.
    pub fn expect_incoming(
        &mut self,
        message_id: MessageId,
        source_id: EndpointId,
        target_blob_id: u64,
        target_io: Box<dyn TargetIo>,
        max_time: Duration,
    ) -> bool {
        if self.incoming.contains_key(&target_blob_id) {
            return false;
        }
        self.incoming.insert(
            target_blob_id,
            IncomingBlob {
                peer_source_blob_id: None,
                message_id,
                source_id,
                target_id: EndpointId::BROADCAST,
                target_io,
                total_size: None,
                done_parts: IntervalSet::new(),
                finished: false,
                last_activity: Instant::now(),
                created_at: Instant::now(),
                max_time,
            },
        );
        true
    }

    /// Handle one received `blobFrgmnt` message.
    pub fn process_incoming(&mut self, message: &Message) -> Result<bool> {
        let fragment = Fragment::decode(&message.payload)?;
        let header = &fragment.header;

        if !self.incoming.contains_key(&header.target_blob_id) {
            if self.completed_linger.contains_key(&header.target_blob_id) {
                debug!("dropping duplicate fragment for lingering blob {}", header.target_blob_id);
                return Ok(true);
            }
            debug!("fragment for unexpected blob {} dropped", header.target_blob_id);
            return Ok(false);
        }
        let blob = self.incoming.get_mut(&header.target_blob_id).unwrap();

        if blob.peer_source_blob_id.is_none() {
            blob.peer_source_blob_id = Some(header.source_blob_id);
        }
        match blob.total_size {
            Some(existing) if existing != header.total_size => {
                warn!("blob {} total_size changed mid-transfer, dropping fragment", header.target_blob_id);
                return Ok(false);
            }
            None => blob.total_size = Some(header.total_size),
            _ => {}
        }
        let total_size = blob.total_size.unwrap();

        let begin = header.offset;
        let end = begin + fragment.bytes.len() as u64;

        // Split [begin, end) against the already-merged intervals: any
        // sub-range that overlaps existing bytes is verified via
        // `check_stored` rather than blindly restored (§4.3 Reassembly step
        // 1) — fragment boundaries can shift between an original send and a
        // resend using a different `max_data_size`, so a fragment can be
        // *partially* new and partially a repeat of already-stored bytes.
        let mut new_ranges: Vec<(u64, u64)> = Vec::new();
        let mut cursor = begin;
        for existing in blob.done_parts.as_slice() {
            if existing.end <= cursor {
                continue;
            }
            if existing.begin >= end {
                break;
            }
            let overlap_begin = existing.begin.max(cursor);
            let overlap_end = existing.end.min(end);
            if overlap_begin > cursor {
                new_ranges.push((cursor, overlap_begin));
            }
            if overlap_begin < overlap_end {
                let slice = &fragment.bytes[(overlap_begin - begin) as usize..(overlap_end - begin) as usize];
                if !blob.target_io.check_stored(overlap_begin, slice) {
                    warn!(
                        "fragment at [{},{}) for blob {} disagrees with stored bytes",
                        overlap_begin, overlap_end, header.target_blob_id
                    );
                    return Ok(false);
                }
            }
            cursor = overlap_end;
        }
        if cursor < end {
            new_ranges.push((cursor, end));
        }

        if new_ranges.is_empty() {
            blob.last_activity = Instant::now();
            return Ok(true);
        }

        for (new_begin, new_end) in new_ranges {
            let slice = &fragment.bytes[(new_begin - begin) as usize..(new_end - begin) as usize];
            if !blob.target_io.store_fragment(new_begin, slice)? {
                debug!("target-io rejected fragment at [{},{}) for blob {}", new_begin, new_end, header.target_blob_id);
                return Ok(false);
            }
            blob.done_parts.merge(new_begin, new_end);
        }
        blob.last_activity = Instant::now();

        if blob.done_parts.is_complete(total_size) {
            blob.finished = true;
        }
        Ok(true)
    }

    /// Handle one received `blobResend` message on the sending side.
    pub fn process_resend(&mut self, message: &Message) -> Result<bool> {
        let request: ResendRequest = bincode::deserialize(&message.payload)
            .map_err(|e| anyhow!("malformed resend request: {}", e))?;
        let Some(blob) = self.outgoing.get_mut(&request.source_blob_id) else {
            debug!("resend request for unknown outgoing blob {}", request.source_blob_id);
            return Ok(false);
        };
        for (begin, end) in request.missing {
            blob.todo_parts.merge(begin, end);
        }
        Ok(true)
    }

    /// Drive preparation of outgoing BLOBs, emit resend requests for idle
    /// incoming BLOBs, and reap anything past its timeout. Returns whether
    /// any of that did something.
    pub fn update<F>(&mut self, mut send_fn: F, _max_message_size: usize) -> Result<bool>
    where
        F: FnMut(Message) -> Result<bool>,
    {
        let mut work_done = false;
        let now = Instant::now();

        let mut expired_outgoing = Vec::new();
        for (&id, blob) in self.outgoing.iter_mut() {
            if blob.prepare_status == PreparationStatus::Working {
                let (progress, status) = blob.source_io.prepare();
                blob.prepare_progress = progress;
                blob.prepare_status = status;
                work_done = true;
                match status {
                    PreparationStatus::Finished => {
                        blob.todo_parts = IntervalSet::new();
                        blob.todo_parts.merge(0, blob.total_size);
                    }
                    PreparationStatus::Failed => {
                        warn!("preparation failed for outgoing blob {}", id);
                        expired_outgoing.push(id);
                    }
                    PreparationStatus::Working => {}
                }
            }
            if now.duration_since(blob.created_at) > blob.max_time {
                expired_outgoing.push(id);
            }
        }
        for id in expired_outgoing {
            self.outgoing.remove(&id);
            work_done = true;
        }

        let mut expired_incoming = Vec::new();
        let mut resend_requests = Vec::new();
        for (&id, blob) in self.incoming.iter_mut() {
            if blob.finished {
                continue;
            }
            if now.duration_since(blob.created_at) > blob.max_time {
                expired_incoming.push(id);
                continue;
            }
            if let Some(total_size) = blob.total_size {
                if now.duration_since(blob.last_activity) > self.resend_idle_timeout {
                    let missing = blob.done_parts.missing(total_size);
                    if !missing.is_empty() {
                        resend_requests.push((
                            id,
                            blob.peer_source_blob_id,
                            blob.source_id,
                            missing.into_iter().map(|i| (i.begin, i.end)).collect::<Vec<_>>(),
                        ));
                        blob.last_activity = now;
                    }
                }
            }
        }
        for id in expired_incoming {
            if let Some(mut blob) = self.incoming.remove(&id) {
                blob.target_io.handle_cancelled();
                work_done = true;
            }
        }
        for (target_blob_id, peer_source_blob_id, source_id, missing) in resend_requests {
            let Some(peer_source_blob_id) = peer_source_blob_id else { continue };
            let request = ResendRequest { source_blob_id: peer_source_blob_id, target_blob_id, missing };
            let payload = bincode::serialize(&request)?;
            let message = Message::new(self.resend_message_id.clone(), EndpointId::BROADCAST, source_id, Priority::High, payload);
            if send_fn(message)? {
                work_done = true;
            }
        }

        let linger_time = self.linger_time;
        self.completed_linger.retain(|_, completed_at| now.duration_since(*completed_at) <= linger_time);

        Ok(work_done)
    }

    /// Send up to `max_messages` fragments total across all outgoing BLOBs.
    /// Returns the number actually sent.
    pub fn process_outgoing<F>(&mut self, mut send_fn: F, max_data_size: usize, max_messages: usize) -> Result<usize>
    where
        F: FnMut(Message) -> Result<bool>,
    {
        let mut sent = 0usize;
        let mut ids: Vec<u64> = self.outgoing.keys().copied().collect();
        ids.sort_unstable();

        'outer: for id in ids {
            loop {
                if sent >= max_messages {
                    break 'outer;
                }
                let blob = self.outgoing.get_mut(&id).unwrap();
                let Some(interval) = blob.todo_parts.as_slice().first().copied() else { break };
                let len = (interval.len() as usize).min(max_data_size.max(1));
                let mut buf = vec![0u8; len];
                let n = blob.source_io.fetch_fragment(interval.begin, &mut buf)?;
                buf.truncate(n);

                let header = FragmentHeader {
                    source_blob_id: id,
                    target_blob_id: blob.target_blob_id,
                    offset: interval.begin,
                    total_size: blob.total_size,
                    carried_message_id: blob.message_id.clone(),
                    options: if interval.begin == 0 { Some(blob.options) } else { None },
                };
                let fragment = Fragment { header, bytes: buf };
                let payload = fragment.encode()?;
                let message = Message::new(self.fragment_message_id.clone(), blob.source_id, blob.target_id, blob.priority, payload);

                if send_fn(message)? {
                    blob.todo_parts.remove(interval.begin, interval.begin + n as u64);
                    sent += 1;
                } else {
                    break 'outer;
                }
            }
        }
        Ok(sent)
    }

    /// Fire `handle_finished` on the target-IO of every BLOB that completed
    /// since the last call, moving them into the duplicate-absorbing linger
    /// window. Returns the count delivered.
    pub fn handle_complete(&mut self) -> usize {
        let finished_ids: Vec<u64> = self.incoming.iter().filter(|(_, b)| b.finished).map(|(&id, _)| id).collect();
        let mut count = 0;
        for id in finished_ids {
            if let Some(mut blob) = self.incoming.remove(&id) {
                blob.target_io.handle_finished();
                self.completed_linger.insert(id, Instant::now());
                self.pending_notices.push(FinishedNotice {
                    message_id: blob.message_id,
                    source_id: blob.source_id,
                    target_id: blob.target_id,
                });
                count += 1;
            }
        }
        count
    }

    /// Drain completion notices queued by [`BlobManipulator::handle_complete`]
    /// as ordinary messages for upstream dispatch. Returns the count.
    pub fn fetch_all<F: FnMut(Message)>(&mut self, mut handler: F) -> usize {
        let count = self.pending_notices.len();
        for notice in self.pending_notices.drain(..) {
            handler(Message::new(notice.message_id, notice.source_id, notice.target_id, Priority::Normal, Vec::new()));
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::io::BufferPool;
    use std::sync::{Arc, Mutex};

    struct ZeroSource {
        total_size: u64,
    }

    impl SourceIo for ZeroSource {
        fn fetch_fragment(&mut self, _offset: u64, dst: &mut [u8]) -> Result<usize> {
            for b in dst.iter_mut() {
                *b = 0;
            }
            Ok(dst.len())
        }
        fn is_at_eod(&self, offset: u64) -> bool {
            offset >= self.total_size
        }
        fn total_size(&self) -> u64 {
            self.total_size
        }
    }

    struct RecordingTarget {
        buffer: Vec<u8>,
        finished: Arc<Mutex<usize>>,
    }

    impl TargetIo for RecordingTarget {
        fn store_fragment(&mut self, offset: u64, data: &[u8]) -> Result<bool> {
            let end = offset as usize + data.len();
            if end > self.buffer.len() {
                return Ok(false);
            }
            self.buffer[offset as usize..end].copy_from_slice(data);
            Ok(true)
        }
        fn check_stored(&self, offset: u64, data: &[u8]) -> bool {
            let end = offset as usize + data.len();
            end <= self.buffer.len() && &self.buffer[offset as usize..end] == data
        }
        fn handle_finished(&mut self) {
            *self.finished.lock().unwrap() += 1;
        }
        fn handle_cancelled(&mut self) {}
    }

    fn drive_outgoing_prepare(manipulator: &mut BlobManipulator) {
        manipulator.update(|_| Ok(true), 4096).unwrap();
    }

    #[test]
    fn full_roundtrip_delivers_exact_bytes_and_fires_finished_once() {
        let total_size = 16 * 1024;
        let mut sender = BlobManipulator::new();
        let mut receiver = BlobManipulator::new();

        let source_blob_id = sender.push_outgoing(
            MessageId::new("eagiTest", "blob"),
            EndpointId(1),
            EndpointId(2),
            42,
            Box::new(ZeroSource { total_size }),
            Duration::from_secs(30),
            BlobOptions::default(),
            Priority::Normal,
        );
        drive_outgoing_prepare(&mut sender);

        let finished_count = Arc::new(Mutex::new(0));
        receiver.expect_incoming(
            MessageId::new("eagiTest", "blob"),
            EndpointId(1),
            42,
            Box::new(RecordingTarget { buffer: vec![0u8; total_size as usize], finished: finished_count.clone() }),
            Duration::from_secs(30),
        );

        let mut in_flight = Vec::new();
        loop {
            let sent = sender
                .process_outgoing(
                    |message| {
                        in_flight.push(message);
                        Ok(true)
                    },
                    4096,
                    1,
                )
                .unwrap();
            if sent == 0 {
                break;
            }
        }
        assert_eq!(in_flight.len(), (total_size as usize) / 4096);

        for message in in_flight {
            assert!(receiver.process_incoming(&message).unwrap());
        }
        assert_eq!(receiver.handle_complete(), 1);
        assert_eq!(*finished_count.lock().unwrap(), 1);

        let mut notices = 0;
        receiver.fetch_all(|_| notices += 1);
        assert_eq!(notices, 1);
    }

    #[test]
    fn lossy_transfer_recovers_via_resend() {
        let total_size = 5 * 10; // five 10-byte fragments
        let mut sender = BlobManipulator::new().with_resend_idle(Duration::from_millis(1));
        let mut receiver = BlobManipulator::new().with_resend_idle(Duration::from_millis(1));

        struct Counting {
            counter: u8,
        }
        impl SourceIo for Counting {
            fn fetch_fragment(&mut self, offset: u64, dst: &mut [u8]) -> Result<usize> {
                for b in dst.iter_mut() {
                    *b = (offset as u8).wrapping_add(self.counter);
                }
                Ok(dst.len())
            }
            fn is_at_eod(&self, offset: u64) -> bool {
                offset >= 50
            }
            fn total_size(&self) -> u64 {
                50
            }
        }

        sender.push_outgoing(
            MessageId::new("eagiTest", "blob"),
            EndpointId(1),
            EndpointId(2),
            7,
            Box::new(Counting { counter: 0 }),
            Duration::from_secs(30),
            BlobOptions::default(),
            Priority::Normal,
        );
        drive_outgoing_prepare(&mut sender);

        let finished_count = Arc::new(Mutex::new(0));
        receiver.expect_incoming(
            MessageId::new("eagiTest", "blob"),
            EndpointId(1),
            7,
            Box::new(RecordingTarget { buffer: vec![0u8; total_size], finished: finished_count.clone() }),
            Duration::from_secs(30),
        );

        let mut fragments = Vec::new();
        loop {
            let sent = sender.process_outgoing(|m| { fragments.push(m); Ok(true) }, 10, 1).unwrap();
            if sent == 0 {
                break;
            }
        }
        assert_eq!(fragments.len(), 5);
        // drop the third fragment on the way to the receiver
        fragments.remove(2);
        for message in &fragments {
            receiver.process_incoming(message).unwrap();
        }
        assert_eq!(*finished_count.lock().unwrap(), 0);

        std::thread::sleep(Duration::from_millis(5));
        let mut resend_requests = Vec::new();
        receiver.update(|m| { resend_requests.push(m); Ok(true) }, 4096).unwrap();
        assert_eq!(resend_requests.len(), 1);

        for request in &resend_requests {
            sender.process_resend(request).unwrap();
        }
        loop {
            let sent = sender.process_outgoing(|m| { fragments.push(m); Ok(true) }, 10, 1).unwrap();
            if sent == 0 {
                break;
            }
        }
        for message in fragments.iter().skip(5) {
            receiver.process_incoming(message).unwrap();
        }

        assert_eq!(receiver.handle_complete(), 1);
        assert_eq!(*finished_count.lock().unwrap(), 1);
    }

    #[test]
    fn blob_fragment_for_unexpected_blob_is_dropped_not_errored() {
        let mut receiver = BlobManipulator::new();
        let fragment = Fragment {
            header: FragmentHeader {
                source_blob_id: 1,
                target_blob_id: 999,
                offset: 0,
                total_size: 10,
                carried_message_id: MessageId::new("x", "y"),
                options: None,
            },
            bytes: vec![0; 10],
        };
        let message = Message::new(special::blob_fragment(), EndpointId(1), EndpointId(2), Priority::Normal, fragment.encode().unwrap());
        assert!(!receiver.process_incoming(&message).unwrap());
    }

    #[test]
    fn duplicate_registration_for_the_same_target_blob_id_is_rejected() {
        let mut receiver = BlobManipulator::new();
        let finished = Arc::new(Mutex::new(0));
        assert!(receiver.expect_incoming(
            MessageId::new("x", "y"),
            EndpointId(1),
            5,
            Box::new(RecordingTarget { buffer: vec![0; 10], finished: finished.clone() }),
            Duration::from_secs(1)
        ));
        assert!(!receiver.expect_incoming(
            MessageId::new("x", "y"),
            EndpointId(1),
            5,
            Box::new(RecordingTarget { buffer: vec![0; 10], finished }),
            Duration::from_secs(1)
        ));
    }

    #[test]
    fn buffer_pool_is_reachable_from_target_io_implementations() {
        let mut pool = BufferPool::new(8);
        let buf = pool.acquire();
        pool.release(buf);
    }
}
