use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// Number of slots in every moving-average window.
pub const WINDOW_SLOTS: usize = 5;

/// A fixed-size ring of samples with a running sum.
///
/// Slots are atomics so the hot consume path can rotate the window without a
/// lock; concurrent updates to the same VM's window are tolerated the same
/// way the rest of the per-VM accounting tolerates them (last writer wins,
/// the sum self-corrects within one full rotation).
#[derive(Debug)]
pub struct SampleWindow {
    slots: [AtomicI64; WINDOW_SLOTS],
    index: AtomicUsize,
    sum: AtomicI64,
}

impl Default for SampleWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleWindow {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicI64::new(0)),
            index: AtomicUsize::new(0),
            sum: AtomicI64::new(0),
        }
    }

    /// Zero every slot and the running sum.
    pub fn reset(&self) {
        for slot in &self.slots {
            slot.store(0, Ordering::Relaxed);
        }
        self.index.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
    }

    /// Fill every slot with `value`, as if the window had observed a steady
    /// stream of it.
    pub fn seed(&self, value: i64) {
        for slot in &self.slots {
            slot.store(value, Ordering::Relaxed);
        }
        self.index.store(0, Ordering::Relaxed);
        self.sum.store(value * WINDOW_SLOTS as i64, Ordering::Relaxed);
    }

    /// Evict the oldest slot, install `sample` in its place, and keep the
    /// running sum consistent. Advances the ring index.
    pub fn rotate(&self, sample: i64) {
        let k = self.index.load(Ordering::Relaxed);
        let old = self.slots[k].swap(sample, Ordering::Relaxed);
        self.sum.fetch_sub(old, Ordering::Relaxed);
        self.sum.fetch_add(sample, Ordering::Relaxed);
        self.index.store((k + 1) % WINDOW_SLOTS, Ordering::Relaxed);
    }

    /// Replace the oldest slot with `value` and return `value - old`, the
    /// delta a caller folds into its own accumulator. Advances the ring
    /// index without touching the running sum.
    pub fn shift(&self, value: i64) -> i64 {
        let k = self.index.load(Ordering::Relaxed);
        let old = self.slots[k].swap(value, Ordering::Relaxed);
        self.index.store((k + 1) % WINDOW_SLOTS, Ordering::Relaxed);
        value - old
    }

    /// Sum over the whole window.
    pub fn sum(&self) -> i64 {
        self.sum.load(Ordering::Relaxed)
    }
}

/// Microseconds since the first call in this process, on the monotonic clock.
pub fn monotonic_micros() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as i64
}
