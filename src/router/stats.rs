//! Forwarding statistics and the flow-info aggregator (§4.2 "Statistics and
//! flow info").
//!
//! Grounded on `src/metrics.rs`'s windowed-sample approach to latency
//! aggregation, simplified down to the one number the bus itself consumes
//! (`avg_msg_age_ms`, broadcast to endpoints for BLOB pacing) rather than the
//! teacher's full percentile suite.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How long a message-age sample stays in the sliding window.
const SAMPLE_WINDOW: Duration = Duration::from_secs(10);
/// Cap on retained samples regardless of age, so a burst can't grow unbounded.
const MAX_SAMPLES: usize = 4096;

/// Default period between "flow-info" broadcasts (§4.2).
pub const DEFAULT_FLOW_INFO_PERIOD: Duration = Duration::from_secs(2);

pub struct RouterStats {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    decode_errors: AtomicU64,
    age_samples: Mutex<VecDeque<(Instant, Duration)>>,
}

impl Default for RouterStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterStats {
    pub fn new() -> Self {
        Self {
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            age_samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// Feed one observed message age into the sliding window (also the
    /// public entry point for `Router::update_message_age`).
    pub fn record_age(&self, age: Duration, now: Instant) {
        let mut samples = self.age_samples.lock();
        samples.push_back((now, age));
        while samples.len() > MAX_SAMPLES {
            samples.pop_front();
        }
        while let Some((when, _)) = samples.front() {
            if now.duration_since(*when) > SAMPLE_WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn avg_age_ms(&self, now: Instant) -> u64 {
        let mut samples = self.age_samples.lock();
        while let Some((when, _)) = samples.front() {
            if now.duration_since(*when) > SAMPLE_WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
        if samples.is_empty() {
            return 0;
        }
        let total: u128 = samples.iter().map(|(_, age)| age.as_millis()).sum();
        (total / samples.len() as u128) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let stats = RouterStats::new();
        stats.record_forwarded();
        stats.record_forwarded();
        stats.record_dropped();
        stats.record_decode_error();
        assert_eq!(stats.forwarded(), 2);
        assert_eq!(stats.dropped(), 1);
        assert_eq!(stats.decode_errors(), 1);
    }

    #[test]
    fn avg_age_reflects_recent_samples_only() {
        let stats = RouterStats::new();
        let t0 = Instant::now();
        stats.record_age(Duration::from_millis(100), t0);
        stats.record_age(Duration::from_millis(300), t0);
        assert_eq!(stats.avg_age_ms(t0), 200);

        let later = t0 + SAMPLE_WINDOW + Duration::from_secs(1);
        assert_eq!(stats.avg_age_ms(later), 0);
    }

    #[test]
    fn empty_window_reports_zero() {
        let stats = RouterStats::new();
        assert_eq!(stats.avg_age_ms(Instant::now()), 0);
    }
}
