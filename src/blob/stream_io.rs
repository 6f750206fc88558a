//! `stream_io` target-IO: delivers the BLOB's bytes incrementally, as each
//! in-order prefix becomes contiguous from offset 0 (§4.3).

use super::intervals::IntervalSet;
use super::io::{PreparationStatus, TargetIo};
use crate::signal::Signal;
use anyhow::{anyhow, Result};

/// Target-IO that streams out each newly-contiguous prefix as soon as it
/// forms, rather than waiting for the whole BLOB to complete.
pub struct StreamIo {
    buffer: Vec<u8>,
    stored: IntervalSet,
    delivered_up_to: u64,
    total_size: u64,
    /// Fires with the newly-available contiguous bytes.
    pub data_appended: Signal<Vec<u8>>,
    pub finished: Signal<()>,
    pub cancelled: Signal<()>,
}

impl StreamIo {
    pub fn new(total_size: u64) -> Self {
        Self {
            buffer: vec![0u8; total_size as usize],
            stored: IntervalSet::new(),
            delivered_up_to: 0,
            total_size,
            data_appended: Signal::new(),
            finished: Signal::new(),
            cancelled: Signal::new(),
        }
    }
}

impl TargetIo for StreamIo {
    fn store_fragment(&mut self, offset: u64, data: &[u8]) -> Result<bool> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| anyhow!("fragment offset overflows"))?;
        if end > self.total_size {
            return Ok(false);
        }
        self.buffer[offset as usize..end as usize].copy_from_slice(data);
        self.stored.merge(offset, end);

        if let Some(first) = self.stored.as_slice().first() {
            if first.begin == 0 && first.end > self.delivered_up_to {
                let new_up_to = first.end;
                let chunk = self.buffer[self.delivered_up_to as usize..new_up_to as usize].to_vec();
                self.data_appended.emit(&chunk);
                self.delivered_up_to = new_up_to;
            }
        }
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
        self.finished.emit(&());
    }

    fn handle_cancelled(&mut self) {
        self.cancelled.emit(&());
    }

    fn handle_prepared(&mut self, _progress: f32, _status: PreparationStatus) {}
}
