//! Spec §8 scenario 3: a 16 MiB BLOB sent end-to-end through a router between
//! two endpoints, reassembled byte-for-byte on the receiving side.

use meshbus::blob::fragment::BlobOptions;
use meshbus::blob::io::SourceIo;
use meshbus::blob::stream_io::StreamIo;
use meshbus::connection::in_process::in_process_pair;
use meshbus::message::{MessageId, Priority};
use meshbus::{Endpoint, IdRange, Router};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Deterministic byte source: `offset % 256`, so the receiver can check
/// exact content rather than just length.
struct PatternSource {
    total_size: u64,
}

impl SourceIo for PatternSource {
    fn fetch_fragment(&mut self, offset: u64, dst: &mut [u8]) -> anyhow::Result<usize> {
        for (i, b) in dst.iter_mut().enumerate() {
            *b = ((offset + i as u64) % 256) as u8;
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

#[tokio::test]
async fn sixteen_mebibyte_blob_transfers_intact() {
    const TOTAL_SIZE: u64 = 16 * 1024 * 1024;
    const MAX_DATA_SIZE: usize = 8192;

    let mut router = Router::new(IdRange::new(1, 1000));
    let (a_router_side, a_endpoint_side) = in_process_pair(MAX_DATA_SIZE);
    let (b_router_side, b_endpoint_side) = in_process_pair(MAX_DATA_SIZE);
    router.add_pending_connection(Box::new(a_router_side));
    router.add_pending_connection(Box::new(b_router_side));

    let mut endpoint_a = Endpoint::new(Box::new(a_endpoint_side), None);
    let mut endpoint_b = Endpoint::new(Box::new(b_endpoint_side), None);
    for _ in 0..20 {
        router.update().await.unwrap();
        endpoint_a.update().await.unwrap();
        endpoint_b.update().await.unwrap();
        if endpoint_a.get_id().is_some() && endpoint_b.get_id().is_some() {
            break;
        }
    }
    let a_id = endpoint_a.get_id().unwrap();
    let b_id = endpoint_b.get_id().unwrap();

    let blob_id = MessageId::new("eagiTest", "blob");
    let received = Arc::new(Mutex::new(Vec::new()));
    let received_for_signal = received.clone();
    let finished = Arc::new(Mutex::new(false));
    let finished_for_signal = finished.clone();

    let mut stream_io = StreamIo::new(TOTAL_SIZE);
    stream_io.data_appended.subscribe(move |chunk: &Vec<u8>| {
        received_for_signal.lock().unwrap().extend_from_slice(chunk);
    });
    stream_io.finished.subscribe(move |_: &()| *finished_for_signal.lock().unwrap() = true);

    endpoint_b.expect_incoming_blob(blob_id.clone(), a_id, 1, Box::new(stream_io), Duration::from_secs(60));
    endpoint_a.push_outgoing_blob(
        blob_id,
        b_id,
        1,
        Box::new(PatternSource { total_size: TOTAL_SIZE }),
        Duration::from_secs(60),
        BlobOptions::default(),
        Priority::Idle,
    );

    for _ in 0..20_000 {
        endpoint_a.update().await.unwrap();
        router.update().await.unwrap();
        endpoint_b.update().await.unwrap();
        if *finished.lock().unwrap() {
            break;
        }
    }
    assert!(*finished.lock().unwrap(), "blob transfer did not complete");

    let bytes = received.lock().unwrap();
    assert_eq!(bytes.len(), TOTAL_SIZE as usize);
    assert!(bytes.iter().enumerate().all(|(i, b)| *b == (i % 256) as u8));
}
