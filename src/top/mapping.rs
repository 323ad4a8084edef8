//! Numeric mapping shared by every analog top.

/// Linearly maps `value` from `[in_lo, in_hi]` onto `[out_lo, out_hi]`,
/// clamping the result to the output range instead of extrapolating.
#[must_use]
pub fn clamp_map(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64 {
    let mapped = out_lo + (value - in_lo) * (out_hi - out_lo) / (in_hi - in_lo);
    let (lo, hi) = if out_lo <= out_hi {
        (out_lo, out_hi)
    } else {
        (out_hi, out_lo)
    };
    mapped.clamp(lo, hi)
}
