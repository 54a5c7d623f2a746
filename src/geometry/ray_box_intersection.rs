use simba::simd::SimdValue;

use crate::{
    geometry::{QuadRay, WorldBox4},
    util::simba::{SimbaWorkarounds as _, fast_max, fast_min},
};

use super::SimdFloatType;

pub trait RayIntersectionExt {
    type DistanceType;
    /// Calculate first and last ray intersection with the box
    fn intersect(&self, ray: &QuadRay) -> (Self::DistanceType, Self::DistanceType);
}

impl RayIntersectionExt for WorldBox4 {
    type DistanceType = SimdFloatType;

    /// Calculates ray intersection with the box pack, without clamping to the ray's range.
    /// Returns entry and exit distance along the ray, ray intersects if entry <= exit.
    /// Empty boxes (min > max) never intersect.
    fn intersect(&self, ray: &QuadRay) -> (SimdFloatType, SimdFloatType) {
        let corners = [&self.min, &self.max];

        let slab = |axis: usize| {
            let sign = ray.signs[axis];
            let origin = ray.origin[axis];
            let inv_direction = ray.inv_direction[axis];

            // NaN when the ray lies in the slab plane and is parallel to it,
            // the ray is then inside the slab along this axis.
            let near = (corners[sign][axis] - origin) * inv_direction;
            let far = (corners[1 - sign][axis] - origin) * inv_direction;
            (
                SimdFloatType::neg_infinity().select(near.is_nan(), near),
                SimdFloatType::infinity().select(far.is_nan(), far),
            )
        };

        let (near_x, far_x) = slab(0);
        let (near_y, far_y) = slab(1);
        let (near_z, far_z) = slab(2);

        (
            fast_max(near_x, fast_max(near_y, near_z)),
            fast_min(far_x, fast_min(far_y, far_z)),
        )
    }
}
