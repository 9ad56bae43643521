//! Fixed-point conversion between embedding floats and the share domain.

/// Decimal digits kept when scaling floats.
pub const PRECISION: u32 = 7;

/// `10^PRECISION`.
pub const SCALING_FACTOR: f64 = 10_000_000.0;

/// Scales `value` by `10^PRECISION`, rounding half away from zero.
pub fn to_fixed_point(value: f64) -> i64 {
    (value * SCALING_FACTOR).round() as i64
}

/// Inverse of [`to_fixed_point`].
pub fn from_fixed_point(value: i64) -> f64 {
    value as f64 / SCALING_FACTOR
}

/// Converts a whole vector.
pub fn encode_vector(values: &[f32]) -> Vec<i64> {
    values.iter().map(|v| to_fixed_point(f64::from(*v))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_nearest_symmetrically() {
        assert_eq!(to_fixed_point(0.000_000_06), 1);
        assert_eq!(to_fixed_point(-0.000_000_06), -1);
        assert_eq!(to_fixed_point(0.000_000_04), 0);
        assert_eq!(to_fixed_point(-0.000_000_04), 0);
        assert_eq!(to_fixed_point(1.25), 12_500_000);
    }

    #[test]
    fn round_trip_stays_within_half_ulp() {
        let tolerance = 0.5 / SCALING_FACTOR + f64::EPSILON;
        for x in [0.0, 1.0, -1.0, 0.123_456_789, -0.987_654_321, 12.345_678_91] {
            let back = from_fixed_point(to_fixed_point(x));
            assert!((back - x).abs() <= tolerance, "{x} -> {back}");
        }
    }
}
