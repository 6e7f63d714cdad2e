//! Default values shared by configuration and the audio pipeline

/// Default capture sample rate in Hz
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Default number of input channels
pub const DEFAULT_CHANNELS: u16 = 1;

/// Default frames per delivered block
pub const DEFAULT_BLOCK_SIZE: u32 = 1024;

/// Default capture buffer capacity in blocks (~1 s at the defaults above)
pub const DEFAULT_BUFFER_BLOCKS: usize = 43;

/// Default input gain (linear)
pub const DEFAULT_GAIN: f32 = 1.0;

/// Default peak hold time in seconds
pub const DEFAULT_PEAK_HOLD_SECS: f32 = 1.0;

/// How long `stop()` waits for the device to release
pub const DEFAULT_TEARDOWN_TIMEOUT_MS: u64 = 2_000;

/// How long a blocking producer waits for a free slot before dropping
pub const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 10;

/// How long `start()` waits for the device to come up
pub const DEVICE_OPEN_TIMEOUT_MS: u64 = 5_000;

/// Amplitude floor used for decibel conversion
pub const AMPLITUDE_FLOOR: f32 = 1e-10;

/// Decibel value reported for silence (`20 * log10(AMPLITUDE_FLOOR)`)
pub const DB_FLOOR: f32 = -200.0;

/// Capacity of the capture event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 64;
