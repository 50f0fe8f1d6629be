//! Time-ordered ring buffer shared by the wear, phone, and behavior
//! channels. Samples are kept sorted by timestamp; out-of-order arrivals
//! are inserted in place rather than appended, and anything older than
//! the buffer's retention window is dropped on insert.

/// Anything the buffer can order and evict by wall-clock time.
pub trait Timestamped {
    fn timestamp_ms(&self) -> i64;
}

/// Fixed-retention, timestamp-ordered sample buffer.
///
/// Sized for the largest window a channel serves (24h); shorter-window
/// queries simply slice the tail that falls in range.
pub struct RingBuffer<T> {
    retention_ms: i64,
    samples: Vec<T>,
}

impl<T: Timestamped> RingBuffer<T> {
    pub fn new(retention_ms: i64) -> Self {
        Self {
            retention_ms,
            samples: Vec::new(),
        }
    }

    /// Insert a sample in timestamp order, then evict anything older than
    /// `retention_ms` relative to the newest sample now in the buffer.
    pub fn insert(&mut self, sample: T) {
        let ts = sample.timestamp_ms();
        let pos = self
            .samples
            .binary_search_by_key(&ts, |s| s.timestamp_ms())
            .unwrap_or_else(|p| p);
        self.samples.insert(pos, sample);
        self.evict_stale();
    }

    fn evict_stale(&mut self) {
        let newest = match self.samples.last() {
            Some(s) => s.timestamp_ms(),
            None => return,
        };
        let cutoff = newest - self.retention_ms;
        let first_keep = self
            .samples
            .partition_point(|s| s.timestamp_ms() < cutoff);
        if first_keep > 0 {
            self.samples.drain(0..first_keep);
        }
    }

    /// Samples with `timestamp_ms` in `[now - window_ms, now]`, oldest first.
    pub fn window(&self, now_ms: i64, window_ms: i64) -> &[T] {
        let lower = now_ms - window_ms;
        let start = self.samples.partition_point(|s| s.timestamp_ms() < lower);
        let end = self
            .samples
            .partition_point(|s| s.timestamp_ms() <= now_ms);
        &self.samples[start..end]
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
