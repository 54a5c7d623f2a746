use simba::simd::{SimdValue, WideBoolF32x4, WideF32x4};

use crate::geometry::{SimdFloatType, SimdMaskType, WorldVector4};

pub trait SimbaWorkarounds: SimdValue {
    fn is_nan(self) -> Self::SimdBool;

    fn infinity() -> Self;
    fn neg_infinity() -> Self;
}

impl SimbaWorkarounds for WideF32x4 {
    #[inline(always)]
    fn is_nan(self) -> Self::SimdBool {
        WideBoolF32x4(self.0.is_nan())
    }

    #[inline(always)]
    fn infinity() -> Self {
        Self::splat(f32::INFINITY)
    }

    #[inline(always)]
    fn neg_infinity() -> Self {
        Self::splat(f32::NEG_INFINITY)
    }
}

/// Lane-wise minimum, result is unspecified if any of the inputs is NaN.
#[inline(always)]
pub fn fast_min(a: SimdFloatType, b: SimdFloatType) -> SimdFloatType {
    WideF32x4(a.0.fast_min(b.0))
}

/// Lane-wise maximum, result is unspecified if any of the inputs is NaN.
#[inline(always)]
pub fn fast_max(a: SimdFloatType, b: SimdFloatType) -> SimdFloatType {
    WideF32x4(a.0.fast_max(b.0))
}

#[inline(always)]
pub fn from_lanes(values: [f32; 4]) -> SimdFloatType {
    WideF32x4(wide::f32x4::from(values))
}

/// Bit i is set if lane i of the mask is true
#[inline(always)]
pub fn lane_mask(mask: SimdMaskType) -> u32 {
    wide::f32x4::move_mask(mask.0) as u32
}

pub fn fma_dot(a: &WorldVector4, b: &WorldVector4) -> SimdFloatType {
    WideF32x4(a.z.0.mul_add(b.z.0, a.y.0.mul_add(b.y.0, a.x.0 * b.x.0)))
}
