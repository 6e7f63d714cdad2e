//! Audio source: device capture with gain, metering and consumer delivery
//!
//! ## Execution contexts
//!
//! - **Caller context**: `start`, `stop`, `set_gain`, `set_callback`, `read`.
//! - **Capture context**: the driver's callback thread. For every block it
//!   applies gain (via [`CaptureBuffer::write_with`]), meters it and invokes
//!   the consumer callback synchronously.
//!
//! The capture context never logs, never waits on a lock held by the caller
//! and never allocates in steady state. Consumer failures (an `Err` return or
//! a panic) are caught there and pushed onto a bounded event channel, see
//! [`AudioSource::check_errors`].
//!
//! ## Consumer obligation
//!
//! The consumer callback runs on the capture thread and there is no hand-off
//! to a worker. A slow callback stalls the driver, which then drops or
//! glitches input. Keep it short: copy what you need and return.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::audio::buffer::{AudioBlock, CaptureBuffer, Gain, SharedCaptureBuffer};
use crate::audio::host::{AudioHost, CpalHost, DeviceId, InputStream, RawBlockHandler, StreamErrorHandler};
use crate::audio::level_meter::{AudioMeter, Level, LevelMeterParams};
use crate::config::{validate_meter, CaptureConfig};
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::error::AudioError;

/// Error a consumer callback may return
pub type ConsumerError = Box<dyn StdError + Send + Sync>;

/// Return type of a consumer callback
pub type ConsumerResult = Result<(), ConsumerError>;

/// Receives every captured block together with its level.
///
/// Called on the capture thread, one block at a time.
pub trait BlockConsumer: Send + Sync {
    fn on_block(&self, block: &AudioBlock, level: Level) -> ConsumerResult;
}

impl<F> BlockConsumer for F
where
    F: Fn(&AudioBlock, Level) -> ConsumerResult + Send + Sync,
{
    fn on_block(&self, block: &AudioBlock, level: Level) -> ConsumerResult {
        self(block, level)
    }
}

/// Something that went wrong inside the capture context
#[derive(Debug)]
pub enum CaptureEvent {
    /// The consumer returned an error for this block
    CallbackFailed { sequence: u64, error: ConsumerError },
    /// The consumer panicked on this block
    CallbackPanicked { sequence: u64, message: String },
    /// The driver reported a stream error
    StreamError(AudioError),
}

impl fmt::Display for CaptureEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureEvent::CallbackFailed { sequence, error } => {
                write!(f, "consumer callback failed on block {}: {}", sequence, error)
            }
            CaptureEvent::CallbackPanicked { sequence, message } => {
                write!(f, "consumer callback panicked on block {}: {}", sequence, message)
            }
            CaptureEvent::StreamError(e) => write!(f, "{}", e),
        }
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    Running,
}

/// Counters for one source, cumulative across runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Blocks metered and offered to the consumer
    pub blocks_delivered: u64,
    /// Blocks on which the consumer failed or panicked
    pub callback_errors: u64,
    /// Events lost because the event channel was full
    pub dropped_events: u64,
    /// Blocks lost to capture buffer overflow in the current run
    pub overflows: usize,
    /// Unread blocks in the capture buffer
    pub buffered: usize,
}

#[derive(Default)]
struct Counters {
    blocks_delivered: AtomicU64,
    callback_errors: AtomicU64,
    dropped_events: AtomicU64,
}

type SharedConsumer = Arc<dyn BlockConsumer>;

#[derive(Default)]
struct SlotContents {
    current: Option<SharedConsumer>,
    /// Consumer the capture thread stopped using, released by the caller
    retired: Option<SharedConsumer>,
}

/// Registered consumer plus a generation so the capture thread can tell when
/// it changed without locking
#[derive(Default)]
struct CallbackSlot {
    contents: Mutex<SlotContents>,
    generation: AtomicU64,
}

impl CallbackSlot {
    fn replace(&self, consumer: Option<SharedConsumer>) {
        let (previous, retired) = {
            let mut contents = self.contents.lock();
            let previous = std::mem::replace(&mut contents.current, consumer);
            self.generation.fetch_add(1, Ordering::Release);
            (previous, contents.retired.take())
        };
        // Dropped here, outside the lock and off the capture thread
        drop(previous);
        drop(retired);
    }
}

/// Capture-thread copy of the consumer
struct CallbackCache {
    generation: u64,
    consumer: Option<SharedConsumer>,
}

impl CallbackCache {
    fn new() -> Self {
        Self {
            generation: u64::MAX,
            consumer: None,
        }
    }

    /// Current consumer. Picks up a replacement when the slot lock is free;
    /// otherwise keeps the previous one for this block.
    fn current(&mut self, slot: &CallbackSlot) -> Option<&dyn BlockConsumer> {
        if slot.generation.load(Ordering::Acquire) != self.generation {
            if let Some(mut contents) = slot.contents.try_lock() {
                // Re-read under the lock so the generation matches `current`
                let generation = slot.generation.load(Ordering::Acquire);
                let previous = std::mem::replace(&mut self.consumer, contents.current.clone());
                // The caller drains `retired` on every replace, so at most one
                // consumer is parked here between replacements
                if previous.is_some() {
                    contents.retired = previous;
                }
                self.generation = generation;
            }
        }
        self.consumer.as_deref()
    }
}

/// Assembles driver chunks of any length into blocks of exactly `block_len`
/// samples. Storage is allocated once.
pub struct Reblocker {
    pending: Vec<f32>,
    block_len: usize,
}

impl Reblocker {
    pub fn new(block_len: usize) -> Self {
        let block_len = block_len.max(1);
        Self {
            pending: Vec::with_capacity(block_len),
            block_len,
        }
    }

    /// Feed `data`, calling `emit` once per completed block
    pub fn push<F>(&mut self, mut data: &[f32], mut emit: F)
    where
        F: FnMut(&[f32]),
    {
        while !data.is_empty() {
            if self.pending.is_empty() && data.len() >= self.block_len {
                let (block, rest) = data.split_at(self.block_len);
                emit(block);
                data = rest;
                continue;
            }

            let take = (self.block_len - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.pending.len() == self.block_len {
                emit(self.pending.as_slice());
                self.pending.clear();
            }
        }
    }

    /// Samples waiting for a complete block
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

struct RunningCapture {
    stream: Box<dyn InputStream>,
    buffer: SharedCaptureBuffer,
    device: DeviceId,
}

/// Captures from one input device and delivers metered blocks
pub struct AudioSource {
    host: Arc<dyn AudioHost>,
    config: CaptureConfig,
    meter: LevelMeterParams,
    gain: Arc<Gain>,
    callback: Arc<CallbackSlot>,
    counters: Arc<Counters>,
    events_tx: Sender<CaptureEvent>,
    events_rx: Receiver<CaptureEvent>,
    running: Option<RunningCapture>,
}

impl AudioSource {
    /// Source on the shared cpal host
    pub fn new(config: CaptureConfig, meter: LevelMeterParams) -> Self {
        Self::with_host(CpalHost::acquire(), config, meter)
    }

    /// Source on any audio host
    pub fn with_host(host: Arc<dyn AudioHost>, config: CaptureConfig, meter: LevelMeterParams) -> Self {
        let (events_tx, events_rx) = bounded(EVENT_CHANNEL_CAPACITY);
        Self {
            host,
            gain: Arc::new(Gain::new(config.gain)),
            config,
            meter,
            callback: Arc::new(CallbackSlot::default()),
            counters: Arc::new(Counters::default()),
            events_tx,
            events_rx,
            running: None,
        }
    }

    /// Open `device` and start capturing
    pub fn start(&mut self, device: DeviceId) -> Result<(), AudioError> {
        if self.running.is_some() {
            return Err(AudioError::DoubleStart);
        }
        self.config.validate()?;
        validate_meter(&self.meter)?;

        let buffer = Arc::new(CaptureBuffer::new(
            self.config.buffer_blocks,
            self.config.block_len(),
            self.config.channels,
            self.config.overflow,
            self.config.block_timeout(),
            self.gain.clone(),
        ));

        let on_block = self.capture_handler(buffer.clone());
        let on_error = self.stream_error_handler();

        let stream = self
            .host
            .open_input(&device, self.config.stream_spec(), on_block, on_error)
            .map_err(|e| {
                tracing::error!("Error starting audio stream on {}: {}", device, e);
                e
            })?;

        tracing::info!(
            "Audio capture started on {} ({} Hz, {} ch, {} frames/block)",
            device,
            self.config.sample_rate,
            self.config.channels,
            self.config.block_size
        );

        self.running = Some(RunningCapture {
            stream,
            buffer,
            device,
        });
        Ok(())
    }

    /// Build the per-block path that runs in the capture context
    fn capture_handler(&self, buffer: SharedCaptureBuffer) -> RawBlockHandler {
        let mut reblocker = Reblocker::new(self.config.block_len());
        let mut meter = AudioMeter::with_params(self.meter);
        let mut cache = CallbackCache::new();
        let slot = self.callback.clone();
        let counters = self.counters.clone();
        let events = self.events_tx.clone();

        Box::new(move |data: &[f32]| {
            reblocker.push(data, |samples| {
                let now = Instant::now();
                let consumer = cache.current(&slot);

                buffer.write_with(samples, |block| {
                    let level = meter.process(&block.samples, now);
                    counters.blocks_delivered.fetch_add(1, Ordering::Relaxed);

                    if let Some(consumer) = consumer {
                        if let Some(event) = deliver(consumer, block, level) {
                            counters.callback_errors.fetch_add(1, Ordering::Relaxed);
                            if events.try_send(event).is_err() {
                                counters.dropped_events.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                });
            });
        })
    }

    fn stream_error_handler(&self) -> StreamErrorHandler {
        let events = self.events_tx.clone();
        let counters = self.counters.clone();
        Box::new(move |err| {
            if events.try_send(CaptureEvent::StreamError(err)).is_err() {
                counters.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        })
    }

    /// Stop capturing and release the device. A no-op when idle.
    ///
    /// Waits up to the configured teardown timeout. On timeout the source is
    /// still returned to idle but the device resources are leaked.
    pub fn stop(&mut self) -> Result<(), AudioError> {
        let Some(running) = self.running.take() else {
            tracing::debug!("stop() on idle audio source");
            return Ok(());
        };

        let RunningCapture { stream, buffer, device } = running;
        let result = stream.close(self.config.teardown_timeout());
        match &result {
            Ok(()) => tracing::info!(
                "Audio capture stopped on {} ({} overflows)",
                device,
                buffer.overflow_count()
            ),
            Err(e) => tracing::error!("Audio capture on {} did not stop cleanly: {}", device, e),
        }
        result
    }

    /// Replace the consumer callback. Takes effect from the next block; an
    /// invocation already in progress finishes with the old callback.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&AudioBlock, Level) -> ConsumerResult + Send + Sync + 'static,
    {
        self.callback.replace(Some(Arc::new(callback)));
    }

    /// Register a consumer object
    pub fn set_consumer(&self, consumer: Arc<dyn BlockConsumer>) {
        self.callback.replace(Some(consumer));
    }

    /// Stop delivering blocks to any consumer
    pub fn clear_callback(&self) {
        self.callback.replace(None);
    }

    /// Set the input gain. Valid in any state; applies from the next block.
    pub fn set_gain(&self, multiplier: f32) {
        let applied = self.gain.set(multiplier);
        tracing::debug!("Input gain set to {}", applied);
    }

    /// Current input gain
    pub fn gain(&self) -> f32 {
        self.gain.get()
    }

    /// Take the oldest unread block from the capture buffer
    pub fn read(&self) -> Option<AudioBlock> {
        self.running.as_ref()?.buffer.read()
    }

    pub fn state(&self) -> SourceState {
        if self.running.is_some() {
            SourceState::Running
        } else {
            SourceState::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Device currently open
    pub fn device(&self) -> Option<&DeviceId> {
        self.running.as_ref().map(|r| &r.device)
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Replace the configuration. Only allowed while idle.
    pub fn set_config(&mut self, config: CaptureConfig) -> Result<(), AudioError> {
        if self.running.is_some() {
            return Err(AudioError::InvalidConfiguration(
                "configuration cannot change while running".into(),
            ));
        }
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Next pending capture event, if any
    pub fn check_errors(&self) -> Option<CaptureEvent> {
        self.events_rx.try_recv().ok()
    }

    /// Receiver for capture events
    pub fn events(&self) -> Receiver<CaptureEvent> {
        self.events_rx.clone()
    }

    pub fn stats(&self) -> SourceStats {
        let (overflows, buffered) = self
            .running
            .as_ref()
            .map(|r| (r.buffer.overflow_count(), r.buffer.len()))
            .unwrap_or((0, 0));

        SourceStats {
            blocks_delivered: self.counters.blocks_delivered.load(Ordering::Relaxed),
            callback_errors: self.counters.callback_errors.load(Ordering::Relaxed),
            dropped_events: self.counters.dropped_events.load(Ordering::Relaxed),
            overflows,
            buffered,
        }
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!("Error stopping audio source on drop: {}", e);
        }
    }
}

/// Invoke the consumer, converting failure into an event
fn deliver(consumer: &dyn BlockConsumer, block: &AudioBlock, level: Level) -> Option<CaptureEvent> {
    match panic::catch_unwind(AssertUnwindSafe(|| consumer.on_block(block, level))) {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(CaptureEvent::CallbackFailed {
            sequence: block.sequence,
            error,
        }),
        Err(payload) => Some(CaptureEvent::CallbackPanicked {
            sequence: block.sequence,
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
