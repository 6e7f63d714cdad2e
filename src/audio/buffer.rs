//! Capture buffer: gain-adjusted hand-off between the capture thread and readers
//!
//! The buffer owns a fixed pool of pre-allocated blocks that circulate between
//! two lock-free queues:
//!
//! ```text
//!            write_with (capture thread)                 read (caller)
//!  free ──► staging ──gain──► filled ─────────────────────► AudioBlock
//!   ▲                           │ DropOldest reclaims oldest     │
//!   └───────────────────────────┘                  fresh block ──┘ (allocated by reader)
//! ```
//!
//! The writer never allocates as long as incoming blocks fit the configured
//! block length. Gain is read once per block, so a block is always scaled by a
//! single gain value and is never touched again once published.

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Gain-adjusted block of interleaved samples
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioBlock {
    /// Interleaved samples (f32)
    pub samples: Vec<f32>,
    /// Number of channels
    pub channels: u16,
    /// Write sequence number, starting at 0 for each buffer
    pub sequence: u64,
    /// Gain that was applied to this block
    pub gain: f32,
}

impl AudioBlock {
    /// Empty block with room for `len` samples
    pub fn with_capacity(len: usize, channels: u16) -> Self {
        Self {
            samples: Vec::with_capacity(len),
            channels,
            sequence: 0,
            gain: 1.0,
        }
    }

    /// Number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Block duration in microseconds
    pub fn duration_us(&self, sample_rate: u32) -> u64 {
        (self.frames() as u64 * 1_000_000) / sample_rate.max(1) as u64
    }
}

/// Linear gain shared between the caller and the capture thread
///
/// Stored as f32 bits in an atomic so the capture thread reads it without
/// locking.
#[derive(Debug)]
pub struct Gain(AtomicU32);

impl Gain {
    pub fn new(multiplier: f32) -> Self {
        Self(AtomicU32::new(sanitize_gain(multiplier).unwrap_or(1.0).to_bits()))
    }

    /// Current multiplier
    #[inline]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Set the multiplier. Negative values clamp to 0.0; NaN and infinities
    /// are ignored. Returns the value actually stored.
    pub fn set(&self, multiplier: f32) -> f32 {
        match sanitize_gain(multiplier) {
            Some(value) => {
                self.0.store(value.to_bits(), Ordering::Release);
                value
            }
            None => {
                tracing::warn!("Ignoring non-finite gain {}", multiplier);
                self.get()
            }
        }
    }
}

impl Default for Gain {
    fn default() -> Self {
        Self::new(1.0)
    }
}

fn sanitize_gain(multiplier: f32) -> Option<f32> {
    multiplier.is_finite().then(|| multiplier.max(0.0))
}

/// What the writer does when every slot holds unread data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest unread block (capture never waits)
    #[default]
    DropOldest,
    /// Wait up to the configured timeout for a reader, then drop the new block
    BlockProducer,
}

/// Result of a single write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored without loss
    Stored,
    /// Stored after discarding the oldest unread block
    DroppedOldest,
    /// Not stored; the buffer stayed full
    DroppedNewest,
}

/// Fixed-capacity ring of gain-adjusted audio blocks
pub struct CaptureBuffer {
    /// Published blocks, oldest first
    filled: ArrayQueue<AudioBlock>,
    /// Empty blocks ready for the writer
    free: ArrayQueue<AudioBlock>,
    /// Spare block for the writer. Only swapped in and out under the lock,
    /// never filled or inspected while it is held.
    staging: Mutex<AudioBlock>,
    gain: Arc<Gain>,
    policy: OverflowPolicy,
    block_timeout: Duration,
    block_len: usize,
    channels: u16,
    next_sequence: AtomicU64,
    overflow_count: AtomicUsize,
    written_count: AtomicU64,
}

impl CaptureBuffer {
    /// Create a buffer holding up to `capacity` blocks of `block_len` samples.
    ///
    /// All storage is allocated here. `capacity` is clamped to at least 1.
    pub fn new(
        capacity: usize,
        block_len: usize,
        channels: u16,
        policy: OverflowPolicy,
        block_timeout: Duration,
        gain: Arc<Gain>,
    ) -> Self {
        let capacity = capacity.max(1);
        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = free.push(AudioBlock::with_capacity(block_len, channels));
        }

        Self {
            filled: ArrayQueue::new(capacity),
            free,
            staging: Mutex::new(AudioBlock::with_capacity(block_len, channels)),
            gain,
            policy,
            block_timeout,
            block_len,
            channels,
            next_sequence: AtomicU64::new(0),
            overflow_count: AtomicUsize::new(0),
            written_count: AtomicU64::new(0),
        }
    }

    /// Store a raw block after applying the current gain
    pub fn write(&self, raw: &[f32]) -> WriteOutcome {
        self.write_with(raw, |_| ())
    }

    /// Apply gain to `raw`, hand the gain-adjusted block to `inspect`, then
    /// publish it.
    ///
    /// Capture thread only: there must be a single writer. `inspect` sees the
    /// block even when the overflow policy ends up dropping it.
    pub fn write_with<F>(&self, raw: &[f32], inspect: F) -> WriteOutcome
    where
        F: FnOnce(&AudioBlock),
    {
        // An empty placeholder is left behind; `Vec::new` does not allocate
        let mut staging = std::mem::take(&mut *self.staging.lock());

        let gain = self.gain.get();
        staging.samples.clear();
        staging.samples.extend(raw.iter().map(|s| s * gain));
        staging.gain = gain;
        staging.channels = self.channels;
        staging.sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);

        inspect(&staging);

        let (empty, outcome) = match self.free.pop() {
            Some(block) => (Some(block), WriteOutcome::Stored),
            None => match self.policy {
                OverflowPolicy::DropOldest => match self.filled.pop() {
                    Some(oldest) => (Some(oldest), WriteOutcome::DroppedOldest),
                    None => (None, WriteOutcome::DroppedNewest),
                },
                OverflowPolicy::BlockProducer => match self.wait_for_free() {
                    Some(block) => (Some(block), WriteOutcome::Stored),
                    None => (None, WriteOutcome::DroppedNewest),
                },
            },
        };

        if outcome != WriteOutcome::Stored {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(mut block) = empty {
            std::mem::swap(&mut staging, &mut block);
            // Room is guaranteed: `block` came out of `free` or `filled`
            if self.filled.push(block).is_ok() {
                self.written_count.fetch_add(1, Ordering::Relaxed);
            }
        }

        *self.staging.lock() = staging;
        outcome
    }

    /// Spin with backoff until a reader frees a slot or the timeout expires
    fn wait_for_free(&self) -> Option<AudioBlock> {
        let deadline = Instant::now() + self.block_timeout;
        let backoff = Backoff::new();
        loop {
            if let Some(block) = self.free.pop() {
                return Some(block);
            }
            if Instant::now() >= deadline {
                return None;
            }
            backoff.snooze();
        }
    }

    /// Take the oldest unread block, or `None` if nothing is buffered.
    ///
    /// Never waits. The slot is refilled with a newly allocated block, so
    /// allocation happens here rather than on the capture thread.
    pub fn read(&self) -> Option<AudioBlock> {
        let block = self.filled.pop()?;
        let _ = self
            .free
            .push(AudioBlock::with_capacity(self.block_len, self.channels));
        Some(block)
    }

    /// Set the gain applied to subsequent writes
    pub fn set_gain(&self, multiplier: f32) -> f32 {
        self.gain.set(multiplier)
    }

    /// Gain that the next write will use
    pub fn gain(&self) -> f32 {
        self.gain.get()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.filled.is_empty()
    }

    /// Check if buffer is full
    pub fn is_full(&self) -> bool {
        self.filled.is_full()
    }

    /// Number of unread blocks
    pub fn len(&self) -> usize {
        self.filled.len()
    }

    /// Capacity in blocks
    pub fn capacity(&self) -> usize {
        self.filled.capacity()
    }

    /// Samples per block
    pub fn block_len(&self) -> usize {
        self.block_len
    }

    /// Overwrite policy
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Blocks lost to overflow
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Blocks published
    pub fn written_count(&self) -> u64 {
        self.written_count.load(Ordering::Relaxed)
    }

    /// Reset statistics
    pub fn reset_stats(&self) {
        self.overflow_count.store(0, Ordering::Relaxed);
        self.written_count.store(0, Ordering::Relaxed);
    }

    /// Get fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.len() as f32 / self.capacity() as f32
    }
}

/// Thread-safe handle to a capture buffer
pub type SharedCaptureBuffer = Arc<CaptureBuffer>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::level_meter::AudioMeter;

    fn buffer(capacity: usize, policy: OverflowPolicy) -> CaptureBuffer {
        CaptureBuffer::new(
            capacity,
            4,
            1,
            policy,
            Duration::from_millis(5),
            Arc::new(Gain::default()),
        )
    }

    #[test]
    fn test_staging_unlocked_during_inspect() {
        let buffer = buffer(2, OverflowPolicy::DropOldest);
        let mut unlocked = false;
        buffer.write_with(&[0.5; 4], |block| {
            assert_eq!(block.samples, vec![0.5; 4]);
            unlocked = buffer.staging.try_lock().is_some();
        });
        assert!(unlocked);

        // Spare block is back in place and keeps its preallocated storage
        assert!(buffer.staging.lock().samples.capacity() >= 4);
        assert_eq!(buffer.read().unwrap().samples, vec![0.5; 4]);
    }

    #[test]
    fn test_fifo_order() {
        let buffer = buffer(4, OverflowPolicy::DropOldest);

        assert_eq!(buffer.write(&[0.0; 4]), WriteOutcome::Stored);
        assert_eq!(buffer.write(&[1.0; 4]), WriteOutcome::Stored);
        assert_eq!(buffer.len(), 2);

        let first = buffer.read().unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(first.samples, vec![0.0; 4]);

        let second = buffer.read().unwrap();
        assert_eq!(second.sequence, 1);
        assert_eq!(second.samples, vec![1.0; 4]);

        assert!(buffer.read().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drop_oldest_on_overflow() {
        let buffer = buffer(3, OverflowPolicy::DropOldest);

        for i in 0..5 {
            buffer.write(&[i as f32; 4]);
        }
        assert_eq!(buffer.overflow_count(), 2);
        assert!(buffer.is_full());

        // Blocks 0 and 1 dropped; 2, 3, 4 intact and in order
        for expected in 2..5u64 {
            let block = buffer.read().unwrap();
            assert_eq!(block.sequence, expected);
            assert_eq!(block.samples, vec![expected as f32; 4]);
        }
        assert!(buffer.read().is_none());
    }

    #[test]
    fn test_block_producer_drops_newest_after_timeout() {
        let buffer = buffer(2, OverflowPolicy::BlockProducer);

        buffer.write(&[1.0; 4]);
        buffer.write(&[2.0; 4]);
        assert_eq!(buffer.write(&[3.0; 4]), WriteOutcome::DroppedNewest);
        assert_eq!(buffer.overflow_count(), 1);

        assert_eq!(buffer.read().unwrap().samples, vec![1.0; 4]);
        assert_eq!(buffer.read().unwrap().samples, vec![2.0; 4]);
        assert!(buffer.read().is_none());
    }

    #[test]
    fn test_block_producer_resumes_when_reader_frees_slot() {
        let buffer = Arc::new(CaptureBuffer::new(
            1,
            4,
            1,
            OverflowPolicy::BlockProducer,
            Duration::from_secs(5),
            Arc::new(Gain::default()),
        ));
        buffer.write(&[1.0; 4]);

        let reader = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                buffer.read()
            })
        };

        assert_eq!(buffer.write(&[2.0; 4]), WriteOutcome::Stored);
        assert_eq!(reader.join().unwrap().unwrap().samples, vec![1.0; 4]);
        assert_eq!(buffer.read().unwrap().samples, vec![2.0; 4]);
    }

    #[test]
    fn test_gain_fixed_at_write_time() {
        let buffer = buffer(4, OverflowPolicy::DropOldest);

        buffer.set_gain(2.0);
        buffer.write(&[0.25; 4]);
        buffer.set_gain(0.5);
        buffer.write(&[0.25; 4]);

        let first = buffer.read().unwrap();
        assert_eq!(first.samples, vec![0.5; 4]);
        assert_eq!(first.gain, 2.0);

        let second = buffer.read().unwrap();
        assert_eq!(second.samples, vec![0.125; 4]);
        assert_eq!(second.gain, 0.5);
    }

    #[test]
    fn test_gain_sanitized() {
        let gain = Gain::new(1.0);
        assert_eq!(gain.set(-3.0), 0.0);
        assert_eq!(gain.set(f32::NAN), 0.0);
        assert_eq!(gain.set(1.5), 1.5);
        assert_eq!(gain.set(f32::INFINITY), 1.5);
    }

    #[test]
    fn test_inspect_sees_gained_block_even_when_dropped() {
        let buffer = buffer(1, OverflowPolicy::BlockProducer);
        buffer.set_gain(3.0);
        buffer.write(&[0.1; 4]);

        let mut seen = None;
        let outcome = buffer.write_with(&[0.2; 4], |block| seen = Some(block.clone()));

        assert_eq!(outcome, WriteOutcome::DroppedNewest);
        let seen = seen.unwrap();
        assert_eq!(seen.sequence, 1);
        assert!((seen.samples[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_unity_gain_leaves_levels_unchanged() {
        let buffer = buffer(2, OverflowPolicy::DropOldest);
        let raw: Vec<f32> = vec![0.3, -0.2, 0.1, -0.05];
        let now = Instant::now();

        let direct = AudioMeter::new().process(&raw, now);
        buffer.set_gain(1.0);
        let mut gained = None;
        buffer.write_with(&raw, |block| gained = Some(AudioMeter::new().process(&block.samples, now)));

        assert_eq!(gained.unwrap(), direct);
    }

    #[test]
    fn test_doubling_gain_adds_six_db() {
        let buffer = buffer(2, OverflowPolicy::DropOldest);
        let raw: Vec<f32> = vec![0.1, -0.2, 0.15, -0.05];
        let now = Instant::now();

        buffer.set_gain(0.5);
        let mut low = None;
        buffer.write_with(&raw, |block| low = Some(AudioMeter::new().process(&block.samples, now)));
        buffer.set_gain(1.0);
        let mut high = None;
        buffer.write_with(&raw, |block| high = Some(AudioMeter::new().process(&block.samples, now)));

        let (low, high) = (low.unwrap(), high.unwrap());
        let six_db = 20.0 * 2.0f32.log10();
        assert!((high.rms_db - low.rms_db - six_db).abs() < 1e-3);
        assert!((high.peak_db - low.peak_db - six_db).abs() < 1e-3);
    }

    #[test]
    fn test_concurrent_reader_sees_no_duplicates() {
        let buffer = Arc::new(buffer(8, OverflowPolicy::DropOldest));
        let total = 2_000u64;

        let writer = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                for i in 0..total {
                    buffer.write(&[i as f32; 4]);
                }
            })
        };

        let mut last: Option<u64> = None;
        let mut received = 0u64;
        loop {
            if let Some(block) = buffer.read() {
                // Each block is internally consistent and strictly newer
                assert!(block.samples.iter().all(|s| *s == block.sequence as f32));
                if let Some(prev) = last {
                    assert!(block.sequence > prev);
                }
                last = Some(block.sequence);
                received += 1;
            } else if writer.is_finished() && buffer.is_empty() {
                break;
            }
        }
        writer.join().unwrap();

        assert_eq!(received + buffer.overflow_count() as u64, total);
    }
}
