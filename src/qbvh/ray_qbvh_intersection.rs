use assert2::debug_assert;
use simba::simd::SimdPartialOrd as _;

use super::{CompressedNodeLink, LeafHit, NodeIdx, NodeLink, Qbvh, QbvhNode};
use crate::{
    accelerator::{Accelerator, RayHit},
    geometry::{QuadRay, Ray, RayIntersectionExt as _, WorldBox},
    util::{bit_iter, simba::lane_mask},
};

/// Traversal stack, kept between queries to avoid reallocating it for every ray.
#[derive(Clone, Debug, Default)]
#[repr(transparent)]
pub struct StackCache {
    stack: Vec<CompressedNodeLink>,
}

impl Qbvh {
    /// Find the nearest intersection of the ray with the mesh within `(ray.min_t, ray.max_t)`.
    pub fn intersect(&self, ray: &Ray) -> Option<RayHit> {
        self.intersect_with_stack(ray, &mut StackCache::default())
    }

    pub fn intersect_with_stack(&self, ray: &Ray, stack: &mut StackCache) -> Option<RayHit> {
        debug_assert!(stack.stack.is_empty());
        stack
            .stack
            .push(CompressedNodeLink::new_inner(NodeIdx::from_raw(0)));

        let mut ray = QuadRay::new(ray);
        let mut best: Option<LeafHit> = None;

        while let Some(link) = stack.stack.pop() {
            match link.decode() {
                NodeLink::Null => continue,
                NodeLink::Inner { index } => {
                    stack.stack.extend(self.nodes[index].intersect(&ray));
                }
                NodeLink::Leaf { quads } => {
                    for quad in &self.quads[quads.into_range()] {
                        // Only hits closer than the current best pass the range test
                        if let Some(hit) = quad.intersect(&ray) {
                            ray.set_max_t(hit.t);
                            best = Some(hit);
                        }
                    }
                }
            }
        }

        best.map(|hit| RayHit::new(hit, &self.mesh))
    }
}

impl Accelerator for Qbvh {
    fn intersect(&self, ray: &Ray) -> Option<RayHit> {
        Qbvh::intersect(self, ray)
    }

    fn bounding_box(&self) -> WorldBox {
        Qbvh::bounding_box(self)
    }
}

impl QbvhNode {
    /// Intersect this node's children with a ray.
    /// Returns links of children whose box overlaps the ray's current range, in slot order.
    fn intersect(&self, ray: &QuadRay) -> impl Iterator<Item = CompressedNodeLink> {
        let (t1, t2) = self.child_bounds.intersect(ray);
        let t1 = t1.simd_max(ray.min_t);
        let t2 = t2.simd_min(ray.max_t);
        bit_iter(lane_mask(t1.simd_le(t2))).map(move |i| self.child_links[i])
    }
}
