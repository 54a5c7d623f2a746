//! Reference intersector testing every triangle of the mesh.

use crate::{
    accelerator::{Accelerator, RayHit},
    geometry::{QuadRay, Ray, SIMD_LANES, WorldBox},
    mesh::{MergedMesh, TriangleIdx},
    qbvh::QuadTriangle,
};

/// All triangles of a mesh packed four at a time in index order, no hierarchy.
/// Shares the triangle test with the tree so both report bit-identical distances.
#[derive(Clone, Debug)]
pub struct BruteForce {
    quads: Vec<QuadTriangle>,
    mesh: MergedMesh,
}

impl BruteForce {
    pub fn new(mesh: MergedMesh) -> BruteForce {
        let indices: Vec<TriangleIdx> = mesh.mesh().triangles().indices().collect();
        let quads = indices
            .chunks(SIMD_LANES)
            .map(|chunk| QuadTriangle::from_chunk(mesh.mesh(), chunk))
            .collect();

        BruteForce { quads, mesh }
    }

    pub fn mesh(&self) -> &MergedMesh {
        &self.mesh
    }
}

impl Accelerator for BruteForce {
    fn intersect(&self, ray: &Ray) -> Option<RayHit> {
        let mut quad_ray = QuadRay::new(ray);
        let mut best = None;
        for quad in &self.quads {
            if let Some(hit) = quad.intersect(&quad_ray) {
                quad_ray.set_max_t(hit.t);
                best = Some(hit);
            }
        }

        best.map(|hit| RayHit::new(hit, &self.mesh))
    }

    fn bounding_box(&self) -> WorldBox {
        self.mesh.mesh().bounding_box()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        geometry::{WorldPoint, WorldVector},
        mesh::{TriangleMesh, tests::random_triangle_soup},
    };
    use assert2::{assert, let_assert};

    #[test]
    fn empty_mesh_never_hits() {
        let brute_force = BruteForce::new(MergedMesh::from_single(TriangleMesh::default()));
        let ray = Ray::new(WorldPoint::origin(), WorldVector::new(0.0, 0.0, 1.0));
        assert!(brute_force.intersect(&ray).is_none());
        assert!(brute_force.bounding_box().is_empty());
    }

    #[test]
    fn nearest_of_stacked_triangles() {
        // Ten triangles stacked along z, shuffled order
        let mut vertices = Vec::new();
        let mut triangles = Vec::new();
        for (i, z) in [7.0, 3.0, 9.0, 1.5, 4.0, 8.0, 2.0, 6.0, 5.0, 10.0]
            .into_iter()
            .enumerate()
        {
            vertices.extend([
                WorldPoint::new(-1.0, -1.0, z),
                WorldPoint::new(1.0, -1.0, z),
                WorldPoint::new(0.0, 1.0, z),
            ]);
            let base = 3 * i as u32;
            triangles.push(crate::geometry::Triangle::new(
                base.into(),
                (base + 1).into(),
                (base + 2).into(),
            ));
        }
        let mesh = TriangleMesh::new(vertices, triangles).unwrap();
        let brute_force = BruteForce::new(MergedMesh::from_single(mesh));

        let ray = Ray::new(WorldPoint::origin(), WorldVector::new(0.0, 0.0, 1.0));
        let_assert!(Some(hit) = brute_force.intersect(&ray));
        assert!(hit.t == 1.5);
        assert!(hit.triangle_index == TriangleIdx::from(3u32));

        let_assert!(Some(hit) = brute_force.intersect(&ray.with_range(5.5, 100.0)));
        assert!(hit.t == 6.0);
        assert!(hit.triangle_index == TriangleIdx::from(7u32));
    }

    #[test]
    fn bounding_box_covers_mesh() {
        let mesh = random_triangle_soup(50, 10.0, 3);
        let expected = mesh.bounding_box();
        let brute_force = BruteForce::new(MergedMesh::from_single(mesh));
        assert!(brute_force.bounding_box() == expected);
    }
}
