use std::array;

use assert2::debug_assert;
use index_vec::IndexVec;
use itertools::Itertools as _;
use log::{info, warn};
use ordered_float::OrderedFloat;

use crate::{
    geometry::{FloatType, SIMD_LANES, WorldBox, WorldPoint},
    mesh::{MergedMesh, TriangleIdx, TriangleMesh},
};

use super::{
    BIN_COUNT, BuildError, CompressedNodeLink, MAX_DEPTH, MAX_LEAF_PRIMITIVES, MAX_TRIANGLES,
    NodeIdx, NodeLink, Qbvh, QbvhNode, QbvhParams, QuadIdx, QuadTriangle,
};

index_vec::define_index_type! {
    struct PendingLeafIdx = u32;
    MAX_INDEX = CompressedNodeLink::MAX_LEAF_INDEX as usize;
    IMPL_RAW_CONVERSIONS = true;
}

/// Leaf recorded during the build, before its quads are emitted.
/// Range into the permutation array.
#[derive(Copy, Clone, Debug)]
struct PendingLeaf {
    start: usize,
    count: usize,
}

#[derive(Copy, Clone, Debug)]
struct Bin {
    count: usize,
    bounds: WorldBox,
}

impl Default for Bin {
    fn default() -> Self {
        Bin {
            count: 0,
            bounds: WorldBox::empty(),
        }
    }
}

impl Bin {
    fn merge(&self, other: &Bin) -> Bin {
        Bin {
            count: self.count + other.count,
            bounds: self.bounds.union(&other.bounds),
        }
    }

    fn cost(&self) -> FloatType {
        self.bounds.surface_area() * self.count as FloatType
    }
}

struct Builder<'a> {
    params: &'a QbvhParams,
    boxes: &'a IndexVec<TriangleIdx, WorldBox>,
    centroids: &'a IndexVec<TriangleIdx, WorldPoint>,

    nodes: IndexVec<NodeIdx, QbvhNode>,
    pending_leaves: IndexVec<PendingLeafIdx, PendingLeaf>,
    quads: IndexVec<QuadIdx, QuadTriangle>,
    quad_count: usize,
    max_depth: usize,
}

impl Qbvh {
    pub fn build(params: &QbvhParams, mesh: MergedMesh) -> Result<Qbvh, BuildError> {
        let triangle_count = mesh.mesh().triangle_count();
        if triangle_count > MAX_TRIANGLES {
            return Err(BuildError::TooManyTriangles {
                count: triangle_count,
            });
        }

        let boxes: IndexVec<TriangleIdx, WorldBox> = mesh
            .mesh()
            .triangles()
            .indices()
            .map(|i| mesh.mesh().triangle(i).bounding_box().expand_by_epsilon())
            .collect();
        let centroids: IndexVec<TriangleIdx, WorldPoint> =
            boxes.iter().map(|b| b.center()).collect();

        let bounding_box = boxes
            .iter()
            .fold(WorldBox::empty(), |acc, b| acc.union(b));
        let centroid_box = centroids
            .iter()
            .fold(WorldBox::empty(), |acc, c| acc.union_point(c));

        let estimated_nodes = estimate_node_count(triangle_count, params.max_prims_per_leaf);
        info!(
            "Building QBVH, primitives: {}, initial nodes: {}",
            triangle_count, estimated_nodes
        );

        let mut builder = Builder {
            params,
            boxes: &boxes,
            centroids: &centroids,
            nodes: IndexVec::with_capacity(estimated_nodes),
            pending_leaves: IndexVec::new(),
            quads: IndexVec::new(),
            quad_count: 0,
            max_depth: 0,
        };

        let mut indices: Vec<TriangleIdx> = mesh.mesh().triangles().indices().collect();
        builder.build_tree(&mut indices, 0, &bounding_box, &centroid_box, None, 0, 0);

        builder.quads.raw.reserve_exact(builder.quad_count);
        builder.preswizzle(NodeIdx::from_raw(0), &indices, mesh.mesh());
        debug_assert!(builder.quads.len() == builder.quad_count);

        info!(
            "QBVH completed with {}/{} nodes, {} kB",
            builder.nodes.len(),
            estimated_nodes,
            builder.nodes.len() * size_of::<QbvhNode>() / 1024
        );
        info!("QBVH QuadTriangle count: {}", builder.quads.len());
        info!("QBVH max depth: {}", builder.max_depth);

        Ok(Qbvh {
            bounding_box,
            nodes: builder.nodes,
            quads: builder.quads,
            mesh,
            max_depth: builder.max_depth,
        })
    }
}

impl Builder<'_> {
    /// Recursively split `indices` (located at `start` in the permutation array) and record
    /// the result in child `slot` of `parent`.
    #[allow(clippy::too_many_arguments)]
    fn build_tree(
        &mut self,
        indices: &mut [TriangleIdx],
        start: usize,
        node_box: &WorldBox,
        centroid_box: &WorldBox,
        parent: Option<NodeIdx>,
        slot: usize,
        depth: usize,
    ) {
        self.max_depth = self.max_depth.max(depth);

        if depth > MAX_DEPTH || indices.len() <= self.params.max_prims_per_leaf {
            if depth > MAX_DEPTH {
                warn!(
                    "Maximum recursion depth reached while building QBVH, forcing a leaf with {} primitives",
                    indices.len()
                );
            }
            self.create_temp_leaf(parent, slot, indices, start, node_box, depth);
            return;
        }

        let axis = centroid_box.max_extent_axis();
        let k0 = centroid_box.min[axis];
        let extent = centroid_box.max[axis] - k0;
        let k1 = BIN_COUNT as FloatType / extent;
        if k1.is_infinite() {
            // All centroids coincide along the longest axis, there is nothing to split
            self.create_temp_leaf(parent, slot, indices, start, node_box, depth);
            return;
        }

        let split = self.find_split(indices, axis, k0, k1, extent);

        // Partition, accumulating the boxes of both sides
        let mut left_box = WorldBox::empty();
        let mut left_centroids = WorldBox::empty();
        let mut right_box = WorldBox::empty();
        let mut right_centroids = WorldBox::empty();
        let mut l = 0;
        let mut r = indices.len();
        while l < r {
            let i = indices[l];
            let centroid = &self.centroids[i];
            if centroid[axis] <= split {
                left_box = left_box.union(&self.boxes[i]);
                left_centroids = left_centroids.union_point(centroid);
                l += 1;
            } else {
                right_box = right_box.union(&self.boxes[i]);
                right_centroids = right_centroids.union_point(centroid);
                r -= 1;
                indices.swap(l, r);
            }
        }

        // A node is created every other level, odd levels fill the parent's remaining slots
        let (node, left_slot, right_slot) = match (depth % 2, parent) {
            (1, Some(parent)) => (parent, slot, slot + 1),
            _ => (self.create_intermediate_node(parent, slot, node_box), 0, 2),
        };

        let (left, right) = indices.split_at_mut(l);
        self.build_tree(
            left,
            start,
            &left_box,
            &left_centroids,
            Some(node),
            left_slot,
            depth + 1,
        );
        self.build_tree(
            right,
            start + l,
            &right_box,
            &right_centroids,
            Some(node),
            right_slot,
            depth + 1,
        );
    }

    /// Bin centroids along `axis` and return the split coordinate with the lowest SAH cost.
    fn find_split(
        &self,
        indices: &[TriangleIdx],
        axis: usize,
        k0: FloatType,
        k1: FloatType,
        extent: FloatType,
    ) -> FloatType {
        let step = if indices.len() < self.params.full_sweep_threshold {
            1
        } else {
            self.params.skip_factor
        };

        let mut bins = [Bin::default(); BIN_COUNT];
        for &i in indices.iter().step_by(step) {
            let bin = ((k1 * (self.centroids[i][axis] - k0)) as usize).min(BIN_COUNT - 1);
            bins[bin].count += 1;
            bins[bin].bounds = bins[bin].bounds.union(&self.boxes[i]);
        }

        // left[i] covers bins 0..=i, right[i] covers bins i..
        let mut left = [Bin::default(); BIN_COUNT];
        let mut right = [Bin::default(); BIN_COUNT];
        left[0] = bins[0];
        right[BIN_COUNT - 1] = bins[BIN_COUNT - 1];
        for i in 1..BIN_COUNT {
            left[i] = left[i - 1].merge(&bins[i]);
            let j = BIN_COUNT - 1 - i;
            right[j] = right[j + 1].merge(&bins[j]);
        }

        let costs: [FloatType; BIN_COUNT - 1] = array::from_fn(|i| {
            if left[i].count == 0 || right[i + 1].count == 0 {
                FloatType::INFINITY
            } else {
                left[i].cost() + right[i + 1].cost()
            }
        });

        match costs.iter().position_min_by_key(|cost| OrderedFloat(**cost)) {
            Some(bin) if costs[bin].is_finite() => {
                k0 + (bin + 1) as FloatType * extent / BIN_COUNT as FloatType
            }
            _ => k0,
        }
    }

    /// Push a new empty node and link it from `(parent, slot)`
    fn create_intermediate_node(
        &mut self,
        parent: Option<NodeIdx>,
        slot: usize,
        node_box: &WorldBox,
    ) -> NodeIdx {
        let index = self.nodes.push(QbvhNode::default());
        if let Some(parent) = parent {
            self.nodes[parent].set_child(slot, node_box, CompressedNodeLink::new_inner(index));
        }
        index
    }

    /// Record `indices` as a leaf in `(parent, slot)`.
    /// The link gets the final quad count but refers to a pending leaf until `preswizzle` runs.
    fn create_temp_leaf(
        &mut self,
        parent: Option<NodeIdx>,
        slot: usize,
        indices: &[TriangleIdx],
        start: usize,
        node_box: &WorldBox,
        depth: usize,
    ) {
        let parent = match parent {
            Some(parent) => parent,
            None => {
                // The whole tree is a single leaf
                debug_assert!(self.nodes.is_empty());
                self.nodes.push(QbvhNode::default())
            }
        };

        if indices.is_empty() {
            return;
        }

        if indices.len() > MAX_LEAF_PRIMITIVES {
            warn!(
                "QBVH unable to handle geometry, {} primitives in a single leaf, splitting by count",
                indices.len()
            );
            self.split_by_count(parent, slot, indices, start, node_box, depth);
            return;
        }

        let quads = indices.len().div_ceil(SIMD_LANES);
        let pending = self.pending_leaves.push(PendingLeaf {
            start,
            count: indices.len(),
        });
        self.quad_count += quads;
        self.nodes[parent].set_child(
            slot,
            node_box,
            CompressedNodeLink::new_leaf_raw(pending.raw(), quads as u32),
        );
    }

    /// Spread a leaf too large for a single link over a new node, four equal parts.
    fn split_by_count(
        &mut self,
        parent: NodeIdx,
        slot: usize,
        indices: &[TriangleIdx],
        start: usize,
        node_box: &WorldBox,
        depth: usize,
    ) {
        let node = self.create_intermediate_node(Some(parent), slot, node_box);
        self.max_depth = self.max_depth.max(depth + 1);

        let len = indices.len();
        for part in 0..4 {
            let begin = part * len / 4;
            let end = (part + 1) * len / 4;
            let part_indices = &indices[begin..end];
            let part_box = part_indices
                .iter()
                .fold(WorldBox::empty(), |acc, i| acc.union(&self.boxes[*i]));
            self.create_temp_leaf(
                Some(node),
                part,
                part_indices,
                start + begin,
                &part_box,
                depth + 1,
            );
        }
    }

    /// Replace pending leaf links with final quad ranges, emitting the quads in traversal order.
    fn preswizzle(&mut self, node: NodeIdx, indices: &[TriangleIdx], mesh: &TriangleMesh) {
        for slot in 0..4 {
            match self.nodes[node].child_links[slot].decode() {
                NodeLink::Null => {}
                NodeLink::Inner { index } => self.preswizzle(index, indices, mesh),
                NodeLink::Leaf { quads } => {
                    // Build time leaves carry the pending leaf ordinal in place of the first quad
                    let pending = PendingLeafIdx::from_raw(quads.first.raw());
                    let PendingLeaf { start, count } = self.pending_leaves[pending];
                    let first = self.quads.next_idx();

                    for chunk in indices[start..start + count].chunks(SIMD_LANES) {
                        self.quads.push(QuadTriangle::from_chunk(mesh, chunk));
                    }

                    debug_assert!(self.quads.len() - first.index() == quads.count as usize);
                    self.nodes[node].child_links[slot] =
                        CompressedNodeLink::new_leaf(first, quads.count);
                }
            }
        }
    }
}

/// Initial node capacity, node count of a tree with full leaves and full nodes
fn estimate_node_count(triangle_count: usize, max_prims_per_leaf: usize) -> usize {
    let mut count = 1;
    let mut layer = triangle_count.div_ceil(max_prims_per_leaf).div_ceil(4);
    while layer > 1 {
        count += layer;
        layer = layer.div_ceil(4);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Accelerator, BruteForce,
        geometry::{Ray, Triangle, WorldVector},
        mesh::{TriangleMesh, tests::random_triangle_soup},
        qbvh::QuadIdxRange,
    };
    use assert2::{assert, let_assert};
    use test_case::test_case;
    use simba::simd::SimdValue as _;

    fn build(mesh: TriangleMesh, params: &QbvhParams) -> Qbvh {
        Qbvh::build(params, MergedMesh::from_single(mesh)).unwrap()
    }

    /// All leaf ranges reachable from the root, depth first
    fn leaves(qbvh: &Qbvh) -> Vec<QuadIdxRange> {
        let mut result = Vec::new();
        let mut stack = vec![NodeIdx::from_raw(0)];
        while let Some(node) = stack.pop() {
            for link in qbvh.nodes[node].child_links.iter() {
                match link.decode() {
                    NodeLink::Null => {}
                    NodeLink::Inner { index } => stack.push(index),
                    NodeLink::Leaf { quads } => result.push(quads),
                }
            }
        }
        result
    }

    /// Triangles of a leaf with the padding lanes removed
    fn leaf_triangles(qbvh: &Qbvh, quads: QuadIdxRange) -> Vec<TriangleIdx> {
        qbvh.quads[quads.into_range()]
            .iter()
            .flat_map(|q| q.triangles()[..q.used_lanes()].to_vec())
            .collect()
    }

    fn check_structure(qbvh: &Qbvh, max_leaf: usize) {
        let triangle_count = qbvh.mesh().mesh().triangle_count();
        let mut seen = vec![0usize; triangle_count];

        for quads in leaves(qbvh) {
            let triangles = leaf_triangles(qbvh, quads);
            assert!(!triangles.is_empty());
            assert!(triangles.len() <= max_leaf);
            assert!(quads.count as usize == triangles.len().div_ceil(4));

            // Padding repeats the leaf's own last triangle
            let last_quad = &qbvh.quads[quads.first + (quads.count as usize - 1)];
            let used = last_quad.used_lanes();
            let last = last_quad.triangles()[used - 1];
            assert!(last == *triangles.last().unwrap());
            assert!(last_quad.triangles()[used..].iter().all(|t| *t == last));

            for t in triangles {
                seen[t.index()] += 1;
            }
        }

        assert!(seen.iter().all(|count| *count == 1), "{seen:?}");
        assert!(leaves(qbvh).iter().map(|q| q.count as usize).sum::<usize>() == qbvh.quads.len());
    }

    #[test]
    fn empty_mesh() {
        let qbvh = build(TriangleMesh::default(), &QbvhParams::default());
        assert!(qbvh.nodes.len() == 1);
        assert!(qbvh.quads.is_empty());
        assert!(qbvh.nodes[NodeIdx::from_raw(0)].child_links.iter().all(CompressedNodeLink::is_null));
    }

    #[test]
    fn single_leaf_tree_synthesizes_root() {
        let qbvh = build(random_triangle_soup(3, 10.0, 1), &QbvhParams::default());
        assert!(qbvh.nodes.len() == 1);
        assert!(qbvh.quads.len() == 1);
        let_assert!(NodeLink::Leaf { quads } = qbvh.nodes[NodeIdx::from_raw(0)].child_links[0].decode());
        assert!(quads == QuadIdxRange::new(0u32.into(), 1));
        assert!(qbvh.quads[QuadIdx::from_raw(0)].used_lanes() == 3);
        check_structure(&qbvh, 4);
    }

    #[test_case(1, 16, 1)]
    #[test_case(4, 16, 1)]
    #[test_case(7, 16, 1)]
    #[test_case(4, 16, 3)]
    #[test_case(64, 16, 1)]
    #[test_case(2, 100, 2)]
    fn every_triangle_in_exactly_one_leaf(
        max_prims_per_leaf: usize,
        full_sweep_threshold: usize,
        skip_factor: usize,
    ) {
        let params = QbvhParams::builder()
            .max_prims_per_leaf(max_prims_per_leaf)
            .full_sweep_threshold(full_sweep_threshold)
            .skip_factor(skip_factor)
            .build()
            .unwrap();
        let qbvh = build(random_triangle_soup(500, 100.0, 42), &params);
        check_structure(&qbvh, max_prims_per_leaf);
        assert!(qbvh.max_depth() <= MAX_DEPTH + 1);
    }

    #[test]
    fn child_boxes_enclose_their_triangles() {
        let qbvh = build(random_triangle_soup(200, 50.0, 7), &QbvhParams::default());
        for node in qbvh.nodes.iter() {
            for slot in 0..4 {
                let bounds = node.child_bounds.extract(slot);
                if let NodeLink::Leaf { quads } = node.child_links[slot].decode() {
                    for t in leaf_triangles(&qbvh, quads) {
                        let triangle_box = qbvh.mesh().mesh().triangle(t).bounding_box();
                        assert!(bounds.contains_box(&triangle_box));
                    }
                }
            }
        }
        for b in qbvh.mesh().mesh().vertices() {
            assert!(qbvh.bounding_box().contains_box(&WorldBox::new(*b, *b)));
        }
    }

    #[test]
    fn inner_slots_use_node_pairs() {
        // Nodes are only created on even levels, the root takes the grandchildren
        // of both of its splits
        let qbvh = build(random_triangle_soup(100, 100.0, 3), &QbvhParams::default());
        let root = &qbvh.nodes[NodeIdx::from_raw(0)];
        assert!(root.child_links.iter().filter(|link| !link.is_null()).count() >= 3);
        assert!(qbvh.nodes.len() < 100);
    }

    /// Many triangles sharing a single centroid can never be split
    #[test]
    fn coincident_centroids_split_by_count() {
        let vertices = vec![
            WorldPoint::new(0.0, 0.0, 0.0),
            WorldPoint::new(1.0, 0.0, 0.0),
            WorldPoint::new(0.0, 1.0, 0.0),
        ];
        let triangles = vec![Triangle::new(0u32.into(), 1u32.into(), 2u32.into()); 300];
        let mesh = TriangleMesh::new(vertices, triangles).unwrap();

        let qbvh = build(mesh, &QbvhParams::default());
        check_structure(&qbvh, MAX_LEAF_PRIMITIVES);
        assert!(qbvh.quads.len() >= 300 / 4);
    }

    /// Zero area triangles stacked on a line, so the centroid box only has one axis
    #[test]
    fn degenerate_triangles_on_a_line() {
        let mut vertices = Vec::new();
        let mut triangles = Vec::new();
        for i in 0..100u32 {
            let p = WorldPoint::new(i as f32 * 0.01, 0.0, 0.0);
            vertices.extend([p, p, p + WorldVector::new(0.001, 0.0, 0.0)]);
            triangles.push(Triangle::new((3 * i).into(), (3 * i + 1).into(), (3 * i + 2).into()));
        }
        let mesh = TriangleMesh::new(vertices, triangles).unwrap();

        let qbvh = build(mesh, &QbvhParams::default());
        check_structure(&qbvh, 4);
    }

    /// Binning a single sampled primitive leaves every split cost infinite, so each level
    /// only peels off the triangle with the lowest centroid and the depth cap has to stop it
    #[test]
    fn depth_cap_forces_leaf() {
        let mut vertices = Vec::new();
        let mut triangles = Vec::new();
        for i in 0..200u32 {
            let p = WorldPoint::new(i as f32, 0.0, 0.0);
            vertices.extend([
                p,
                p + WorldVector::new(0.5, 0.0, 0.0),
                p + WorldVector::new(0.0, 0.5, 0.0),
            ]);
            triangles.push(Triangle::new((3 * i).into(), (3 * i + 1).into(), (3 * i + 2).into()));
        }
        let mesh = TriangleMesh::new(vertices, triangles).unwrap();
        let params = QbvhParams::builder()
            .max_prims_per_leaf(1)
            .full_sweep_threshold(0)
            .skip_factor(1000)
            .build()
            .unwrap();

        let qbvh = build(mesh.clone(), &params);
        assert!(qbvh.max_depth() > MAX_DEPTH);
        check_structure(&qbvh, MAX_LEAF_PRIMITIVES);

        let reference = BruteForce::new(MergedMesh::from_single(mesh));
        for i in 0..200 {
            let ray = Ray::new(
                WorldPoint::new(i as f32 + 0.1, 0.1, -1.0),
                WorldVector::new(0.0, 0.0, 1.0),
            );
            let hit = qbvh.intersect(&ray);
            assert!(hit.is_some());
            assert!(hit == reference.intersect(&ray));
        }
    }

    #[test_case(0, 4, 1)]
    #[test_case(4, 4, 1)]
    #[test_case(16, 4, 1)]
    #[test_case(17, 4, 3)]
    #[test_case(1000, 4, 1 + 63 + 16 + 4)]
    fn node_estimate(triangles: usize, max_prims_per_leaf: usize, expected: usize) {
        assert!(estimate_node_count(triangles, max_prims_per_leaf) == expected);
    }
}
