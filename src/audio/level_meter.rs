//! RMS / peak level meter with peak hold
//!
//! Each [`AudioMeter`] owns its own [`MeterState`] and is driven from a single
//! thread (the capture context in an [`crate::audio::AudioSource`]).
//! `process` takes `&mut self`; sharing one meter across threads requires
//! external synchronization.
//!
//! ## Peak hold
//!
//! The held peak follows the loudest sample seen. A new, louder peak resets the
//! hold deadline to `now + peak_hold`. Once the deadline has passed the held
//! peak moves toward the instantaneous peak of each block according to
//! [`PeakDecay`]:
//!
//! - `Snap` (default): jump straight to the instantaneous peak
//! - `Linear`: fall at a fixed rate in dB per second
//! - `Exponential`: approach the instantaneous peak with time constant `release_ms`
//!
//! Decay time is measured from the later of the hold deadline and the previous
//! block, so results depend only on the timestamps passed in.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::audio::db::{db_to_linear, linear_to_db};
use crate::constants::{DB_FLOOR, DEFAULT_PEAK_HOLD_SECS};

/// What the held peak does once the hold time has expired
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PeakDecay {
    /// Replace the held peak with the current block's peak
    Snap,
    /// Fall by `db_per_sec` decibels per second
    Linear { db_per_sec: f32 },
    /// Exponential approach with the given time constant
    Exponential { release_ms: f32 },
}

impl Default for PeakDecay {
    fn default() -> Self {
        PeakDecay::Snap
    }
}

/// Meter parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelMeterParams {
    /// Time to hold a peak before it starts to decay, in seconds
    pub peak_hold_secs: f32,

    /// Decay policy after the hold expires
    pub decay: PeakDecay,
}

impl Default for LevelMeterParams {
    fn default() -> Self {
        Self {
            peak_hold_secs: DEFAULT_PEAK_HOLD_SECS,
            decay: PeakDecay::Snap,
        }
    }
}

impl LevelMeterParams {
    /// Hold time as a `Duration`. Negative or non-finite values mean no hold;
    /// values too large for a `Duration` saturate.
    pub fn hold_duration(&self) -> Duration {
        if !self.peak_hold_secs.is_finite() || self.peak_hold_secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f32(self.peak_hold_secs).unwrap_or(Duration::MAX)
    }
}

/// One metering result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Level {
    pub rms_db: f32,
    pub peak_db: f32,
}

impl Level {
    /// Level reported before any audio has been seen
    pub const SILENCE: Level = Level {
        rms_db: DB_FLOOR,
        peak_db: DB_FLOOR,
    };
}

impl From<Level> for (f32, f32) {
    fn from(level: Level) -> Self {
        (level.rms_db, level.peak_db)
    }
}

/// Mutable metering state, one per meter
#[derive(Debug, Clone, Copy)]
pub struct MeterState {
    /// Held peak amplitude (linear)
    pub peak_hold_value: f32,
    /// When the current hold expires; `None` while nothing is held or when
    /// the hold lasts past the end of representable time
    pub peak_hold_deadline: Option<Instant>,
    /// Timestamp of the last non-empty block
    pub last_update: Option<Instant>,
    /// Linear RMS of the last non-empty block
    pub last_rms: f32,
}

impl Default for MeterState {
    fn default() -> Self {
        Self {
            peak_hold_value: 0.0,
            peak_hold_deadline: None,
            last_update: None,
            last_rms: 0.0,
        }
    }
}

/// RMS and peak meter
#[derive(Debug, Clone)]
pub struct AudioMeter {
    params: LevelMeterParams,
    hold: Duration,
    state: MeterState,
}

impl AudioMeter {
    /// Create a meter with default parameters
    pub fn new() -> Self {
        Self::with_params(LevelMeterParams::default())
    }

    /// Create a meter with the given parameters
    pub fn with_params(params: LevelMeterParams) -> Self {
        Self {
            hold: params.hold_duration(),
            params,
            state: MeterState::default(),
        }
    }

    /// Measure one block of samples.
    ///
    /// Total over any finite block: an empty block leaves the state untouched
    /// and reports silence for RMS with the current held peak.
    pub fn process(&mut self, samples: &[f32], now: Instant) -> Level {
        if samples.is_empty() {
            return Level {
                rms_db: DB_FLOOR,
                peak_db: linear_to_db(self.state.peak_hold_value),
            };
        }

        let rms = rms(samples);
        let peak = peak(samples);

        let state = &mut self.state;
        if peak > state.peak_hold_value {
            state.peak_hold_value = peak;
            state.peak_hold_deadline = now.checked_add(self.hold);
        } else if state.peak_hold_deadline.map_or(false, |deadline| now >= deadline) {
            state.peak_hold_value = decay_peak(
                self.params.decay,
                state.peak_hold_value,
                peak,
                decay_elapsed(state.peak_hold_deadline, state.last_update, now),
            );
        }

        state.last_rms = rms;
        state.last_update = Some(now);

        self.levels_db()
    }

    /// Last computed levels in dB, without processing anything
    pub fn levels_db(&self) -> Level {
        Level {
            rms_db: linear_to_db(self.state.last_rms),
            peak_db: linear_to_db(self.state.peak_hold_value),
        }
    }

    /// Current meter state
    pub fn state(&self) -> &MeterState {
        &self.state
    }

    /// Parameters this meter was built with
    pub fn params(&self) -> &LevelMeterParams {
        &self.params
    }

    /// Forget all history
    pub fn reset(&mut self) {
        self.state = MeterState::default();
    }
}

impl Default for AudioMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Linear RMS of a non-empty block, accumulated in f64
#[inline]
pub fn rms(samples: &[f32]) -> f32 {
    let sum_sq: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// Maximum absolute sample value
#[inline]
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
}

/// Time over which decay applies: since the hold expired or the previous
/// block, whichever is later
fn decay_elapsed(deadline: Option<Instant>, last_update: Option<Instant>, now: Instant) -> Duration {
    let since = match (deadline, last_update) {
        (Some(d), Some(u)) => d.max(u),
        (Some(d), None) => d,
        (None, Some(u)) => u,
        (None, None) => return Duration::ZERO,
    };
    now.saturating_duration_since(since)
}

fn decay_peak(decay: PeakDecay, held: f32, current: f32, elapsed: Duration) -> f32 {
    let decayed = match decay {
        PeakDecay::Snap => return current,
        PeakDecay::Linear { db_per_sec } => {
            let held_db = linear_to_db(held) - db_per_sec.max(0.0) * elapsed.as_secs_f32();
            db_to_linear(held_db)
        }
        PeakDecay::Exponential { release_ms } => {
            let alpha = compute_alpha(elapsed.as_secs_f32() * 1000.0, release_ms);
            held + (current - held) * alpha
        }
    };
    decayed.max(current)
}

/// Smoothing coefficient for a one-pole filter
///
/// alpha = 1 - e^(-dt/tau)
#[inline]
fn compute_alpha(delta_ms: f32, time_constant_ms: f32) -> f32 {
    if time_constant_ms <= 0.0 {
        return 1.0;
    }
    1.0 - (-delta_ms / time_constant_ms).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_compute_alpha() {
        // At delta = tau alpha is about 0.632
        let alpha = compute_alpha(100.0, 100.0);
        assert!((alpha - 0.632).abs() < 0.01);

        assert!(compute_alpha(1.0, 100.0) < 0.02);
        assert!(compute_alpha(1000.0, 100.0) > 0.99);
        assert_eq!(compute_alpha(5.0, 0.0), 1.0);
    }

    #[test]
    fn test_full_scale_sine() {
        // 1 kHz at 48 kHz: 480 samples is exactly ten periods
        let samples: Vec<f32> = (0..480)
            .map(|i| (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / 48_000.0).sin())
            .collect();

        let mut meter = AudioMeter::new();
        let level = meter.process(&samples, Instant::now());

        assert!(level.peak_db.abs() < 0.1, "peak {}", level.peak_db);
        assert!((level.rms_db + 3.0).abs() < 0.2, "rms {}", level.rms_db);
    }

    #[test]
    fn test_empty_block_keeps_peak() {
        let mut meter = AudioMeter::new();
        let t0 = Instant::now();
        meter.process(&[0.5; 64], t0);

        let level = meter.process(&[], t0 + ms(10));
        assert_eq!(level.rms_db, DB_FLOOR);
        assert!((level.peak_db - linear_to_db(0.5)).abs() < 1e-4);
        assert_eq!(meter.state().last_update, Some(t0));
    }

    #[test]
    fn test_peak_holds_then_snaps() {
        let mut meter = AudioMeter::with_params(LevelMeterParams {
            peak_hold_secs: 1.0,
            decay: PeakDecay::Snap,
        });
        let t0 = Instant::now();

        meter.process(&[0.8; 32], t0);
        let held = meter.process(&[0.1; 32], t0 + ms(500));
        assert!((held.peak_db - linear_to_db(0.8)).abs() < 1e-4);

        let expired = meter.process(&[0.1; 32], t0 + ms(1000));
        assert!((expired.peak_db - linear_to_db(0.1)).abs() < 1e-4);
    }

    #[test]
    fn test_louder_peak_restarts_hold() {
        let mut meter = AudioMeter::new();
        let t0 = Instant::now();

        meter.process(&[0.3; 16], t0);
        meter.process(&[0.6; 16], t0 + ms(900));
        // 1.2 s after the first peak but only 0.3 s after the second
        let level = meter.process(&[0.1; 16], t0 + ms(1200));
        assert!((level.peak_db - linear_to_db(0.6)).abs() < 1e-4);
    }

    #[test]
    fn test_linear_decay() {
        let mut meter = AudioMeter::with_params(LevelMeterParams {
            peak_hold_secs: 0.5,
            decay: PeakDecay::Linear { db_per_sec: 20.0 },
        });
        let t0 = Instant::now();

        meter.process(&[1.0; 16], t0);
        // Hold expires at 0.5 s, then 0.25 s of decay at 20 dB/s
        let level = meter.process(&[0.001; 16], t0 + ms(750));
        assert!((level.peak_db + 5.0).abs() < 1e-2, "peak {}", level.peak_db);

        let level = meter.process(&[0.001; 16], t0 + ms(1000));
        assert!((level.peak_db + 10.0).abs() < 1e-2, "peak {}", level.peak_db);

        // Never below the block's own peak
        let level = meter.process(&[0.5; 16], t0 + ms(60_000));
        assert!((level.peak_db - linear_to_db(0.5)).abs() < 1e-3);
    }

    #[test]
    fn test_exponential_decay() {
        let mut meter = AudioMeter::with_params(LevelMeterParams {
            peak_hold_secs: 0.0,
            decay: PeakDecay::Exponential { release_ms: 100.0 },
        });
        let t0 = Instant::now();

        meter.process(&[1.0; 16], t0);
        meter.process(&[0.0; 16], t0 + ms(100));
        let held = meter.state().peak_hold_value;
        // One time constant: 1 - 0.632
        assert!((held - 0.368).abs() < 0.01, "held {}", held);
    }

    #[test]
    fn test_hold_duration_saturates() {
        let params = |secs| LevelMeterParams {
            peak_hold_secs: secs,
            decay: PeakDecay::Snap,
        };
        assert_eq!(params(1.0e30).hold_duration(), Duration::MAX);
        assert_eq!(params(-1.0).hold_duration(), Duration::ZERO);
        assert_eq!(params(f32::NAN).hold_duration(), Duration::ZERO);
        assert_eq!(params(0.25).hold_duration(), ms(250));
    }

    #[test]
    fn test_very_long_hold_never_expires() {
        for secs in [1.0e19f32, 1.0e30] {
            let mut meter = AudioMeter::with_params(LevelMeterParams {
                peak_hold_secs: secs,
                decay: PeakDecay::Snap,
            });
            let t0 = Instant::now();

            meter.process(&[0.8; 8], t0);
            let level = meter.process(&[0.1; 8], t0 + ms(1));
            assert!(
                (level.peak_db - linear_to_db(0.8)).abs() < 1e-4,
                "hold of {} s: peak {}",
                secs,
                level.peak_db
            );

            // A louder block still raises the held peak
            let level = meter.process(&[0.9; 8], t0 + ms(2));
            assert!((level.peak_db - linear_to_db(0.9)).abs() < 1e-4);
        }
    }

    #[test]
    fn test_reset() {
        let mut meter = AudioMeter::new();
        meter.process(&[0.9; 8], Instant::now());
        meter.reset();
        assert_eq!(meter.levels_db(), Level::SILENCE);
    }

    proptest! {
        #[test]
        fn prop_silence_is_floor(len in 1usize..4096) {
            let mut meter = AudioMeter::new();
            let level = meter.process(&vec![0.0; len], Instant::now());
            prop_assert!((level.rms_db - DB_FLOOR).abs() < 1e-3);
            prop_assert!((level.peak_db - DB_FLOOR).abs() < 1e-3);
        }

        #[test]
        fn prop_constant_amplitude(a in 0.001f32..=1.0, len in 1usize..2048, negative in any::<bool>()) {
            let value = if negative { -a } else { a };
            let mut meter = AudioMeter::new();
            let level = meter.process(&vec![value; len], Instant::now());
            let expected = 20.0 * a.log10();
            prop_assert!((level.rms_db - expected).abs() < 1e-3);
            prop_assert!((level.peak_db - expected).abs() < 1e-3);
        }

        #[test]
        fn prop_peak_hold_monotonic(amps in prop::collection::vec(0.0f32..=1.0, 1..50)) {
            // Every block lands inside the hold window
            let mut meter = AudioMeter::with_params(LevelMeterParams {
                peak_hold_secs: 10.0,
                decay: PeakDecay::Snap,
            });
            let t0 = Instant::now();
            let mut max_seen = 0.0f32;
            let mut last_db = f32::NEG_INFINITY;

            for (i, a) in amps.iter().enumerate() {
                max_seen = max_seen.max(*a);
                let level = meter.process(&[*a; 8], t0 + ms(i as u64 * 10));
                prop_assert!(level.peak_db >= last_db);
                prop_assert!((level.peak_db - linear_to_db(max_seen)).abs() < 1e-4);
                last_db = level.peak_db;
            }
        }
    }
}
