//! Checked numeric conversions for raster geometry.
//!
//! Image dimensions are assumed to stay far below 2^53, so `usize -> f64`
//! conversions are done with plain `as` casts elsewhere. The conversions here
//! are the ones that can actually fail: float pixel coordinates that may be
//! negative or NaN, and sizes headed into 32-bit TIFF fields.

use crate::error::{Error, Result};

/// Convert a `usize` to `u32` for TIFF fields.
///
/// # Errors
/// Returns a conversion error if the value exceeds `u32::MAX`.
#[inline]
pub fn usize_to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::conversion(format!("value {value} exceeds u32 maximum")))
}

/// Convert a `u32` read from a TIFF header to `usize`.
#[inline]
#[must_use]
pub fn u32_to_usize(value: u32) -> usize {
    // usize is at least 32 bits on every supported target
    value as usize
}

/// Convert a float coordinate to an index in `0..max_value`, or `None` when it
/// falls outside (negative, NaN, or past the end).
#[inline]
#[must_use]
pub fn f64_to_pixel_index(value: f64, max_value: usize) -> Option<usize> {
    if value.is_nan() || value < 0.0 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let index = value as usize;
    (index < max_value).then_some(index)
}

/// Clamp a signed pixel offset into `0..max_value`.
#[inline]
#[must_use]
pub fn clamp_index(value: i64, max_value: usize) -> usize {
    if value <= 0 {
        return 0;
    }
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let index = value as usize;
    index.min(max_value.saturating_sub(1))
}

/// `ceil(value / divisor)` for sizes.
#[inline]
#[must_use]
pub fn ceil_div(value: usize, divisor: usize) -> usize {
    value.div_ceil(divisor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usize_to_u32() {
        assert_eq!(usize_to_u32(512).unwrap(), 512);
        #[cfg(target_pointer_width = "64")]
        assert!(usize_to_u32(usize::MAX).is_err());
    }

    #[test]
    fn test_f64_to_pixel_index() {
        assert_eq!(f64_to_pixel_index(0.0, 100), Some(0));
        assert_eq!(f64_to_pixel_index(99.9, 100), Some(99));
        assert_eq!(f64_to_pixel_index(100.0, 100), None);
        assert_eq!(f64_to_pixel_index(-0.1, 100), None);
        assert_eq!(f64_to_pixel_index(f64::NAN, 100), None);
    }

    #[test]
    fn test_clamp_index() {
        assert_eq!(clamp_index(-5, 10), 0);
        assert_eq!(clamp_index(4, 10), 4);
        assert_eq!(clamp_index(42, 10), 9);
    }

    #[test]
    fn test_ceil_div() {
        assert_eq!(ceil_div(100, 64), 2);
        assert_eq!(ceil_div(128, 64), 2);
        assert_eq!(ceil_div(1, 2), 1);
    }
}
