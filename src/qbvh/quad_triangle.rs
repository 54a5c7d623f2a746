use std::array;

use assert2::debug_assert;
use simba::simd::SimdValue as _;

use crate::{
    geometry::{BarycentricCoordinates, FloatType, QuadRay, TrianglePack4},
    mesh::{TriangleIdx, TriangleMesh},
    util::{bit_iter, simba::lane_mask},
};

/// Up to four triangles packed for a single SIMD intersection test.
/// Unused lanes repeat the last real triangle.
#[derive(Clone, Debug)]
pub struct QuadTriangle {
    geometry: TrianglePack4,
    triangles: [TriangleIdx; 4],
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct LeafHit {
    pub t: FloatType,
    pub uv: BarycentricCoordinates<FloatType>,
    pub triangle: TriangleIdx,
}

impl QuadTriangle {
    pub fn new(mesh: &TriangleMesh, triangles: [TriangleIdx; 4]) -> QuadTriangle {
        QuadTriangle {
            geometry: TrianglePack4::from_triangles(&triangles.map(|i| mesh.triangle(i))),
            triangles,
        }
    }

    /// Pack one to four triangles, repeating the last one in unused lanes.
    /// Callers hand over non-empty `chunks(4)` slices.
    pub(crate) fn from_chunk(mesh: &TriangleMesh, chunk: &[TriangleIdx]) -> QuadTriangle {
        debug_assert!((1..=4).contains(&chunk.len()));
        let last = chunk[chunk.len() - 1];
        QuadTriangle::new(
            mesh,
            array::from_fn(|i| chunk.get(i).copied().unwrap_or(last)),
        )
    }

    pub fn geometry(&self) -> &TrianglePack4 {
        &self.geometry
    }

    pub fn triangles(&self) -> &[TriangleIdx; 4] {
        &self.triangles
    }

    /// Number of lanes holding a distinct triangle, the rest is padding
    pub fn used_lanes(&self) -> usize {
        1 + self
            .triangles
            .windows(2)
            .filter(|pair| pair[0] != pair[1])
            .count()
    }

    /// Nearest hit among the four triangles within the ray's range.
    /// Equally distant hits resolve to the lower lane.
    pub(crate) fn intersect(&self, ray: &QuadRay) -> Option<LeafHit> {
        let (mask, t, uv) = self.geometry.intersect(ray);

        let mut best: Option<LeafHit> = None;
        for i in bit_iter(lane_mask(mask)) {
            let t = t.extract(i);
            if best.is_none_or(|best| t < best.t) {
                best = Some(LeafHit {
                    t,
                    uv: uv.extract(i),
                    triangle: self.triangles[i],
                });
            }
        }

        best
    }
}
