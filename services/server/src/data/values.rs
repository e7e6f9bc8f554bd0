//! Value clamping shared by every write path.
//!
//! The `timeseries.value` column is a single-precision REAL; values beyond
//! its range would fail the insert, and NaN/infinity cannot be serialized
//! back out to API clients.

/// The largest finite magnitude a single-precision float can hold,
/// (2 − 2⁻²³) × 2¹²⁷.
pub const MAX_ABS_REAL_VALUE: f64 = f32::MAX as f64;

/// NaN and infinities become `None`.
pub fn validate_float(value: Option<f64>) -> Option<f64> {
    match value {
        Some(v) if v.is_finite() => Some(v),
        _ => None,
    }
}

/// Clamp a value into the storable REAL range; NaN/∞ become `None`.
pub fn prevent_real_overflow(value: Option<f64>) -> Option<f64> {
    let value = validate_float(value)?;
    if value.abs() > MAX_ABS_REAL_VALUE {
        Some(if value > 0.0 {
            MAX_ABS_REAL_VALUE
        } else {
            -MAX_ABS_REAL_VALUE
        })
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_and_infinities_become_null() {
        assert_eq!(prevent_real_overflow(Some(f64::NAN)), None);
        assert_eq!(prevent_real_overflow(Some(f64::INFINITY)), None);
        assert_eq!(prevent_real_overflow(Some(f64::NEG_INFINITY)), None);
        assert_eq!(prevent_real_overflow(None), None);
    }

    #[test]
    fn magnitudes_beyond_single_precision_are_clamped_with_sign() {
        assert_eq!(prevent_real_overflow(Some(f64::MAX)), Some(MAX_ABS_REAL_VALUE));
        assert_eq!(
            prevent_real_overflow(Some(-1.7976931348623157e308)),
            Some(-MAX_ABS_REAL_VALUE)
        );
    }

    #[test]
    fn representable_values_pass_through() {
        assert_eq!(prevent_real_overflow(Some(21.5)), Some(21.5));
        assert_eq!(prevent_real_overflow(Some(0.0)), Some(0.0));
        assert_eq!(prevent_real_overflow(Some(-MAX_ABS_REAL_VALUE)), Some(-MAX_ABS_REAL_VALUE));
    }

    #[test]
    fn boolean_and_integer_inputs_are_plain_floats() {
        // Upstream converts bools/ints to their float equivalents before
        // they reach this layer; spot-check those floats survive.
        assert_eq!(prevent_real_overflow(Some(1.0)), Some(1.0));
        assert_eq!(prevent_real_overflow(Some(0.0)), Some(0.0));
        assert_eq!(prevent_real_overflow(Some(42.0)), Some(42.0));
    }
}
