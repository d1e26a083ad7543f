//! Common time/period helpers and fixed-point quantizers for molder_core.

/// Number of microseconds in one second.
pub const MICROS_PER_SEC: u64 = 1_000_000;
/// Number of milliseconds in one second.
pub const MILLIS_PER_SEC: u64 = 1_000;

/// Compute the period in microseconds for a given rate in Hz.
/// - Clamps `hz` to at least 1 to avoid division by zero.
/// - Ensures result is at least 1 microsecond.
#[inline]
pub fn period_us(hz: u32) -> u64 {
    (MICROS_PER_SEC / u64::from(hz.max(1))).max(1)
}

/// Compute the period in milliseconds for a given rate in Hz.
#[inline]
pub fn period_ms(hz: u32) -> u64 {
    (MILLIS_PER_SEC / u64::from(hz.max(1))).max(1)
}

/// Quantize a floating-point value with a scale factor to i32, rounding to
/// nearest and clamping to the i32 range. Non-finite values map to 0.
#[inline]
fn quantize_scaled_i32(x: f32, scale: f32) -> i32 {
    if !x.is_finite() {
        return 0;
    }
    let scaled = (x * scale).round();
    if scaled >= i32::MAX as f32 {
        i32::MAX
    } else if scaled <= i32::MIN as f32 {
        i32::MIN
    } else {
        scaled as i32
    }
}

/// Pressure in bar to integer centibar (1 cbar = 0.01 bar).
///
/// The phase state machine compares pressures every tick; keeping those
/// comparisons in one integer unit avoids per-tick floating-point
/// threshold drift, the same way the dosing loop ran on centigrams.
#[inline]
pub fn to_cbar(bar: f32) -> i32 {
    quantize_scaled_i32(bar, 100.0)
}

/// Position in mm to integer micrometers.
#[inline]
pub fn to_um(mm: f32) -> i32 {
    quantize_scaled_i32(mm, 1000.0)
}

/// Integer centibar back to bar, for reporting.
#[inline]
pub fn cbar_to_bar(cbar: i32) -> f32 {
    (cbar as f32) / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_helpers_clamp() {
        assert_eq!(period_us(1000), 1000);
        assert_eq!(period_us(0), MICROS_PER_SEC);
        assert_eq!(period_ms(5), 200);
        assert_eq!(period_ms(u32::MAX), 1);
    }

    #[test]
    fn quantizers_round_and_saturate() {
        assert_eq!(to_cbar(450.004), 45_000);
        assert_eq!(to_cbar(450.006), 45_001);
        assert_eq!(to_um(30.0), 30_000);
        assert_eq!(to_cbar(f32::NAN), 0);
        assert_eq!(to_cbar(f32::INFINITY), 0);
        assert_eq!(to_um(3.0e7), i32::MAX);
    }
}
