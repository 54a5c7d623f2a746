mod aabb;
mod ray_box_intersection;
mod ray_triangle_intersection;
mod triangle;

pub use aabb::AABB;
pub use ray_box_intersection::RayIntersectionExt;
pub use ray_triangle_intersection::TrianglePack4;
pub use triangle::{BarycentricCoordinates, Triangle};

use nalgebra::{Point3, Vector3};
use simba::simd::{SimdValue as _, WideBoolF32x4, WideF32x4};

pub type FloatType = f32;
pub type SimdFloatType = WideF32x4;
pub type SimdMaskType = WideBoolF32x4;

/// Number of lanes of `SimdFloatType`, also the arity of the tree nodes.
pub const SIMD_LANES: usize = 4;

/// Relative growth applied to primitive bounding boxes before building.
pub const BOX_RELATIVE_EPSILON: FloatType = 1e-5;
/// Minimal absolute growth applied to primitive bounding boxes before building.
pub const BOX_MIN_EPSILON: FloatType = 1e-9;

pub type WorldPoint = Point3<FloatType>;
pub type WorldVector = Vector3<FloatType>;
pub type WorldBox = AABB<WorldPoint>;
pub type WorldPoint4 = Point3<SimdFloatType>;
pub type WorldVector4 = Vector3<SimdFloatType>;
pub type WorldBox4 = AABB<WorldPoint4>;

#[derive(Copy, Clone, Debug)]
pub struct Ray {
    pub origin: WorldPoint,
    /// Direction of the ray, not necessarily normalized.
    /// Distances along the ray are measured in multiples of its length.
    pub direction: WorldVector,

    /// Hits closer than this are ignored
    pub min_t: FloatType,
    /// Hits further than this are ignored
    pub max_t: FloatType,
}

impl Ray {
    pub fn new(origin: WorldPoint, direction: WorldVector) -> Ray {
        Ray {
            origin,
            direction,
            min_t: 0.0,
            max_t: FloatType::INFINITY,
        }
    }

    pub fn with_range(self, min_t: FloatType, max_t: FloatType) -> Ray {
        Ray {
            min_t,
            max_t,
            ..self
        }
    }

    pub fn point_at(&self, t: FloatType) -> WorldPoint {
        self.origin + self.direction * t
    }

    /// Componentwise inverse of the ray direction
    /// Zeros in direction get turned into positive infinity regardless of the sign of the zero
    pub fn inv_direction(&self) -> WorldVector {
        self.direction
            .map(|x| if x == 0.0 { FloatType::INFINITY } else { 1.0 / x })
    }
}

/// Ray broadcast to all SIMD lanes, prepared for testing four boxes or four triangles at once.
#[derive(Copy, Clone, Debug)]
pub struct QuadRay {
    pub origin: WorldPoint4,
    pub direction: WorldVector4,
    pub inv_direction: WorldVector4,

    /// Per axis 1 if the inverse direction is negative, 0 otherwise.
    /// Selects which box corner is the entry plane of the slab.
    pub signs: [usize; 3],

    pub min_t: SimdFloatType,
    pub max_t: SimdFloatType,
}

impl QuadRay {
    pub fn new(ray: &Ray) -> QuadRay {
        let inv_direction = ray.inv_direction();

        QuadRay {
            origin: ray.origin.map(SimdFloatType::splat),
            direction: ray.direction.map(SimdFloatType::splat),
            inv_direction: inv_direction.map(SimdFloatType::splat),
            signs: [0, 1, 2].map(|axis| (inv_direction[axis] < 0.0) as usize),
            min_t: SimdFloatType::splat(ray.min_t),
            max_t: SimdFloatType::splat(ray.max_t),
        }
    }

    /// Shrink the accepted range after a hit was found at distance `t`.
    pub fn set_max_t(&mut self, t: FloatType) {
        self.max_t = SimdFloatType::splat(t);
    }
}
