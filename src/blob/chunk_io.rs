//! `chunk_io` target-IO: buffers the whole BLOB and delivers it once, on
//! completion, partitioned into fixed-size chunks (§4.3, §8 "Chunk-IO law").

use super::io::{BufferPool, PreparationStatus, TargetIo};
use crate::signal::Signal;
use anyhow::{anyhow, Result};

/// Target-IO that accumulates the whole BLOB and emits it as a single batch
/// of fixed-size chunks once complete.
pub struct ChunkIo {
    buffer: Vec<u8>,
    total_size: u64,
    chunk_size: usize,
    pool: BufferPool,
    /// Fires once, with the completed BLOB split into `chunk_size` pieces
    /// (the last may be short).
    pub data_appended: Signal<Vec<Vec<u8>>>,
    pub finished: Signal<()>,
    pub cancelled: Signal<()>,
}

impl ChunkIo {
    pub fn new(total_size: u64, chunk_size: usize) -> Self {
        Self {
            buffer: vec![0u8; total_size as usize],
            total_size,
            chunk_size: chunk_size.max(1),
            pool: BufferPool::new(chunk_size.max(1)),
            data_appended: Signal::new(),
            finished: Signal::new(),
            cancelled: Signal::new(),
        }
    }
}

impl TargetIo for ChunkIo {
    fn store_fragment(&mut self, offset: u64, data: &[u8]) -> Result<bool> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| anyhow!("fragment offset overflows"))?;
        if end > self.total_size {
            return Ok(false);
        }
        self.buffer[offset as usize..end as usize].copy_from_slice(data);
        Ok(true)
    }

    fn check_stored(&self, offset: u64, data: &[u8]) -> bool {
        let end = offset as usize + data.len();
        if end > self.buffer.len() {
            return false;
        }
        &self.buffer[offset as usize..end] == data
    }

    fn handle_finished(&mut self) {
        let chunk_count = (self.buffer.len() + self.chunk_size - 1) / self.chunk_size;
        let mut chunks = Vec::with_capacity(chunk_count);
        for window in self.buffer.chunks(self.chunk_size) {
            let mut chunk = self.pool.acquire();
            chunk.truncate(window.len());
            chunk.copy_from_slice(window);
            chunks.push(chunk);
        }
        self.data_appended.emit(&chunks);
        self.finished.emit(&());
    }

    fn handle_cancelled(&mut self) {
        self.cancelled.emit(&());
    }

    fn handle_prepared(&mut self, _progress: f32, _status: PreparationStatus) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn emits_one_batch_of_chunks_matching_ceil_division() {
        let mut io = ChunkIo::new(10, 4);
        io.store_fragment(0, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap();

        let batches: Arc<Mutex<Vec<Vec<Vec<u8>>>>> = Arc::new(Mutex::new(Vec::new()));
        let batches_clone = batches.clone();
        io.data_appended.subscribe(move |chunks: &Vec<Vec<u8>>| batches_clone.lock().unwrap().push(chunks.clone()));

        io.handle_finished();

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let chunks = &batches[0];
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], vec![1, 2, 3, 4]);
        assert_eq!(chunks[1], vec![5, 6, 7, 8]);
        assert_eq!(chunks[2], vec![9, 10]);
    }

    #[test]
    fn concatenated_chunks_equal_the_original_bytes() {
        let original: Vec<u8> = (0..=255u8).collect();
        let mut io = ChunkIo::new(original.len() as u64, 37);
        io.store_fragment(0, &original).unwrap();

        let batches: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let batches_clone = batches.clone();
        io.data_appended.subscribe(move |chunks: &Vec<Vec<u8>>| {
            *batches_clone.lock().unwrap() = chunks.concat();
        });

        io.handle_finished();
        assert_eq!(*batches.lock().unwrap(), original);
    }
}
