//! Audio subsystem
//!
//! Capture, gain, hand-off buffering and level metering.

pub mod buffer;
pub mod db;
pub mod device;
pub mod host;
pub mod level_meter;
pub mod source;

pub use buffer::{AudioBlock, CaptureBuffer, Gain, OverflowPolicy, SharedCaptureBuffer, WriteOutcome};
pub use db::{db_to_linear, linear_to_db};
pub use device::DeviceDirectory;
pub use host::{AudioDevice, AudioHost, CpalHost, DeviceId, InputStream, StreamSpec};
pub use level_meter::{AudioMeter, Level, LevelMeterParams, MeterState, PeakDecay};
pub use source::{AudioSource, BlockConsumer, CaptureEvent, ConsumerResult, SourceState, SourceStats};
