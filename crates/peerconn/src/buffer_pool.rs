//! Read buffer recycling keyed by capacity class.
//!
//! Buffers are filed under power-of-two size classes so that a buffer
//! released after a read of any length can serve a later request of the
//! same class. A buffer is classified by its *capacity*, never its length:
//! release it with the capacity it was handed out with.

use std::sync::Mutex;

use once_cell::sync::Lazy;
use serde::Deserialize;
use tracing::debug;

/// Number of size classes: 2^0 through 2^32 bytes.
const NUM_CLASSES: usize = 33;

/// Configuration for a [`BufferPool`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Maximum number of idle buffers kept per size class
    pub max_buffers_per_class: usize,

    /// Buffers with a larger class are never pooled
    pub max_class_bytes: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_buffers_per_class: 64,
            max_class_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Statistics about buffer pool usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub allocations: u64,
    pub reuses: u64,
    pub releases: u64,
    pub discarded: u64,
}

/// Anything that accepts released buffers under a capacity class.
pub trait BufferSink {
    /// Take ownership of `buf`, filed under class `class` (log2 of a size).
    fn put(&self, class: u32, buf: Vec<u8>);
}

/// Shared pool of reusable byte buffers.
pub struct BufferPool {
    config: BufferPoolConfig,
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
    stats: Mutex<BufferPoolStats>,
}

static GLOBAL_POOL: Lazy<BufferPool> = Lazy::new(|| BufferPool::new(BufferPoolConfig::default()));

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Self {
        Self {
            config,
            classes: (0..NUM_CLASSES).map(|_| Mutex::new(Vec::new())).collect(),
            stats: Mutex::new(BufferPoolStats::default()),
        }
    }

    /// The process-wide pool used by [`release_buffer`].
    pub fn global() -> &'static BufferPool {
        &GLOBAL_POOL
    }

    /// Get a zeroed buffer of length `len`, reusing a pooled allocation of
    /// the matching class when one is idle.
    pub fn get(&self, len: usize) -> Vec<u8> {
        let class = class_for_request(len);
        let pooled = class.and_then(|c| self.pop(c));

        match pooled {
            Some(mut buf) => {
                buf.clear();
                buf.resize(len, 0);
                self.update_stats(|s| s.reuses += 1);
                buf
            }
            None => {
                let capacity = class.map_or(len, |c| 1usize << c);
                let mut buf = Vec::with_capacity(capacity);
                buf.resize(len, 0);
                self.update_stats(|s| s.allocations += 1);
                buf
            }
        }
    }

    /// Release a buffer back to the pool.
    pub fn put(&self, buf: Vec<u8>) {
        match class_for_capacity(buf.capacity()) {
            Some(class) => BufferSink::put(self, class, buf),
            None => self.update_stats(|s| s.discarded += 1),
        }
    }

    /// Number of idle buffers filed under `class`.
    pub fn idle_count(&self, class: u32) -> usize {
        self.classes
            .get(class as usize)
            .map_or(0, |slot| match slot.lock() {
                Ok(bufs) => bufs.len(),
                Err(poisoned) => poisoned.into_inner().len(),
            })
    }

    /// Get current statistics about pool usage.
    pub fn stats(&self) -> BufferPoolStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn pop(&self, class: u32) -> Option<Vec<u8>> {
        let slot = self.classes.get(class as usize)?;
        match slot.lock() {
            Ok(mut bufs) => bufs.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut BufferPoolStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

impl BufferSink for BufferPool {
    fn put(&self, class: u32, buf: Vec<u8>) {
        let too_big = (1usize << class.min(usize::BITS - 1)) > self.config.max_class_bytes;
        let Some(slot) = self.classes.get(class as usize).filter(|_| !too_big) else {
            self.update_stats(|s| s.discarded += 1);
            return;
        };

        let kept = {
            let mut bufs = match slot.lock() {
                Ok(bufs) => bufs,
                Err(poisoned) => poisoned.into_inner(),
            };
            if bufs.len() < self.config.max_buffers_per_class {
                bufs.push(buf);
                true
            } else {
                false
            }
        };

        self.update_stats(|s| {
            if kept {
                s.releases += 1;
            } else {
                s.discarded += 1;
            }
        });
    }
}

/// Return a read buffer to the process-wide pool.
///
/// The buffer must carry the capacity it was obtained with; it is filed
/// under the largest power of two not above that capacity.
pub fn release_buffer(buf: Vec<u8>) {
    debug!(capacity = buf.capacity(), len = buf.len(), "releasing buffer");
    BufferPool::global().put(buf);
}

/// Return a read buffer to `sink`, classified by capacity.
pub fn release_buffer_to(sink: &impl BufferSink, buf: Vec<u8>) {
    if let Some(class) = class_for_capacity(buf.capacity()) {
        sink.put(class, buf);
    }
}

/// Class that can serve a request of `len` bytes: ceil(log2(len)).
fn class_for_request(len: usize) -> Option<u32> {
    let class = len.checked_next_power_of_two()?.trailing_zeros();
    ((class as usize) < NUM_CLASSES).then_some(class)
}

/// Class a buffer of `capacity` belongs to: floor(log2(capacity)).
fn class_for_capacity(capacity: usize) -> Option<u32> {
    if capacity == 0 {
        return None;
    }
    let class = usize::BITS - 1 - capacity.leading_zeros();
    ((class as usize) < NUM_CLASSES).then_some(class)
}
