//! Linear amplitude / decibel conversion.

use crate::constants::AMPLITUDE_FLOOR;

/// Convert linear amplitude to dBFS.
///
/// Amplitudes at or below [`AMPLITUDE_FLOOR`] (including zero and negative
/// values) map to [`crate::constants::DB_FLOOR`].
#[inline]
pub fn linear_to_db(amplitude: f32) -> f32 {
    20.0 * amplitude.max(AMPLITUDE_FLOOR).log10()
}

/// Convert dBFS to linear amplitude.
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DB_FLOOR;

    #[test]
    fn test_silence_maps_to_floor() {
        assert!((linear_to_db(0.0) - DB_FLOOR).abs() < 1e-3);
        assert!((linear_to_db(-0.5) - DB_FLOOR).abs() < 1e-3);
        assert!(linear_to_db(0.0).is_finite());
    }

    #[test]
    fn test_reference_points() {
        assert!(linear_to_db(1.0).abs() < 1e-6);
        assert!((linear_to_db(0.5) + 6.0206).abs() < 1e-3);
        assert!((linear_to_db(2.0) - 6.0206).abs() < 1e-3);
    }

    #[test]
    fn test_db_to_linear_inverts() {
        for db in [-60.0f32, -12.0, -3.0, 0.0, 6.0] {
            assert!((linear_to_db(db_to_linear(db)) - db).abs() < 1e-3);
        }
    }
}
