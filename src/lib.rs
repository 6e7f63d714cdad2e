//! Capture Meter
//!
//! Live audio capture with gain control, a real-time hand-off buffer and
//! RMS/peak level metering.
//!
//! ## Pipeline
//!
//! ```text
//! driver thread ──► Reblocker ──► CaptureBuffer::write_with ──► AudioMeter::process
//!                                        │                             │
//!                                        ▼                             ▼
//!                              ring of gained blocks        consumer callback(block, level)
//!                                        │
//!                                        ▼
//!                              AudioSource::read (caller context)
//! ```

pub mod audio;
pub mod config;
pub mod constants;
pub mod error;

pub use error::{AudioError, Error, Result};
