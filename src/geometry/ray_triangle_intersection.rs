use crate::{
    geometry::{QuadRay, SimdFloatType, SimdMaskType},
    util::simba::{fma_dot, from_lanes},
};

use simba::simd::{SimdPartialOrd as _, SimdValue};

use super::{BarycentricCoordinates, Triangle, WorldPoint, WorldPoint4, WorldVector4};

/// Four triangles stored transposed, each as its first vertex and the two edges leaving it.
#[derive(Copy, Clone, Debug)]
pub struct TrianglePack4 {
    pub origin: WorldPoint4,
    pub edge1: WorldVector4,
    pub edge2: WorldVector4,
}

impl TrianglePack4 {
    pub fn from_triangles(triangles: &[Triangle<WorldPoint>; 4]) -> TrianglePack4 {
        let vertex = |i: usize| {
            let points = triangles.map(|t| t[i]);
            WorldPoint4::new(
                from_lanes(points.map(|p| p.x)),
                from_lanes(points.map(|p| p.y)),
                from_lanes(points.map(|p| p.z)),
            )
        };
        let origin = vertex(0);

        TrianglePack4 {
            origin,
            edge1: vertex(1) - origin,
            edge2: vertex(2) - origin,
        }
    }

    /// Recover the triangle stored in one lane.
    pub fn extract(&self, lane: usize) -> Triangle<WorldPoint> {
        let origin = self.origin.map(|x| x.extract(lane));
        Triangle::new(
            origin,
            origin + self.edge1.map(|x| x.extract(lane)),
            origin + self.edge2.map(|x| x.extract(lane)),
        )
    }

    /// Calculates ray intersection with the (two sided) triangle pack.
    /// Returns mask of valid intersections strictly inside the ray's (min_t, max_t) range,
    /// distance along ray, and barycentric uv coordinates.
    /// Adapted from https://en.wikipedia.org/wiki/M%C3%B6ller%E2%80%93Trumbore_intersection_algorithm#Rust_implementation
    pub fn intersect(
        &self,
        ray: &QuadRay,
    ) -> (
        SimdMaskType,
        SimdFloatType,
        BarycentricCoordinates<SimdFloatType>,
    ) {
        let ray_cross_e2 = ray.direction.cross(&self.edge2);
        let det = fma_dot(&self.edge1, &ray_cross_e2);

        let inv_det = SimdFloatType::ONE / det; // May be infinite
        let s = ray.origin - self.origin;
        let u = inv_det * fma_dot(&s, &ray_cross_e2);

        let s_cross_e1 = s.cross(&self.edge1);
        let v = inv_det * fma_dot(&ray.direction, &s_cross_e1);
        let t = inv_det * fma_dot(&self.edge2, &s_cross_e1);

        let mask = det.simd_ne(SimdFloatType::ZERO)
            & u.simd_ge(SimdFloatType::ZERO)
            & v.simd_ge(SimdFloatType::ZERO)
            & (u + v).simd_le(SimdFloatType::ONE)
            & t.simd_gt(ray.min_t)
            & t.simd_lt(ray.max_t);
        (mask, t, BarycentricCoordinates { u, v })
    }
}
