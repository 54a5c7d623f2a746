//! Common query interface and the lazily initialized QBVH front end.

use log::info;
use thiserror::Error;

use crate::{
    geometry::{BarycentricCoordinates, FloatType, Ray, WorldBox},
    mesh::{MergedMesh, MeshIdx, TriangleIdx, TriangleMesh},
    qbvh::{BuildError, LeafHit, Qbvh, QbvhParams, StackCache},
};

/// Something that finds the nearest ray/triangle intersection.
pub trait Accelerator {
    fn intersect(&self, ray: &Ray) -> Option<RayHit>;
    fn bounding_box(&self) -> WorldBox;
}

/// Nearest intersection found along a ray
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RayHit {
    /// Distance along the ray, in multiples of the direction's length
    pub t: FloatType,
    /// Barycentric coordinates of the hit, weights of the second and third vertex
    pub uv: BarycentricCoordinates<FloatType>,
    /// Index into the merged mesh
    pub triangle_index: TriangleIdx,
    /// Which of the input meshes the triangle came from
    pub mesh_index: MeshIdx,
    /// Index of the triangle within its input mesh
    pub mesh_triangle_index: TriangleIdx,
}

impl RayHit {
    pub(crate) fn new(hit: LeafHit, mesh: &MergedMesh) -> RayHit {
        let (mesh_index, mesh_triangle_index) = mesh.provenance(hit.triangle);
        RayHit {
            t: hit.t,
            uv: hit.uv,
            triangle_index: hit.triangle,
            mesh_index,
            mesh_triangle_index,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccelError {
    #[error("Accelerator is already initialized")]
    AlreadyInitialized,

    #[error("Accelerator was not initialized")]
    NotInitialized,

    #[error(transparent)]
    Build(#[from] BuildError),
}

/// QBVH that is configured first and gets its geometry later, exactly once.
#[derive(Clone, Debug)]
pub struct QbvhAccel {
    params: QbvhParams,
    qbvh: Option<Qbvh>,
}

impl QbvhAccel {
    pub fn new(params: QbvhParams) -> QbvhAccel {
        QbvhAccel { params, qbvh: None }
    }

    /// Merge the meshes and build the tree over them.
    /// The totals are what the caller expects the meshes to contain and must match exactly.
    pub fn init(
        &mut self,
        meshes: &[TriangleMesh],
        total_vertex_count: usize,
        total_triangle_count: usize,
    ) -> Result<(), AccelError> {
        if self.qbvh.is_some() {
            return Err(AccelError::AlreadyInitialized);
        }

        let vertex_count: usize = meshes.iter().map(TriangleMesh::vertex_count).sum();
        if vertex_count != total_vertex_count {
            return Err(BuildError::VertexCountMismatch {
                expected: total_vertex_count,
                actual: vertex_count,
            }
            .into());
        }
        let triangle_count: usize = meshes.iter().map(TriangleMesh::triangle_count).sum();
        if triangle_count != total_triangle_count {
            return Err(BuildError::TriangleCountMismatch {
                expected: total_triangle_count,
                actual: triangle_count,
            }
            .into());
        }

        let merged = MergedMesh::merge(meshes).map_err(BuildError::from)?;
        self.finish_init(merged)
    }

    /// Build the tree over a single, already merged mesh.
    pub fn init_mesh(&mut self, mesh: TriangleMesh) -> Result<(), AccelError> {
        if self.qbvh.is_some() {
            return Err(AccelError::AlreadyInitialized);
        }
        self.finish_init(MergedMesh::from_single(mesh))
    }

    fn finish_init(&mut self, mesh: MergedMesh) -> Result<(), AccelError> {
        let qbvh = Qbvh::build(&self.params, mesh)?;
        info!("Accelerator initialized, bounding box {:?}", qbvh.bounding_box());
        self.qbvh = Some(qbvh);
        Ok(())
    }

    pub fn params(&self) -> &QbvhParams {
        &self.params
    }

    pub fn is_initialized(&self) -> bool {
        self.qbvh.is_some()
    }

    pub fn qbvh(&self) -> Result<&Qbvh, AccelError> {
        self.qbvh.as_ref().ok_or(AccelError::NotInitialized)
    }

    pub fn intersect(&self, ray: &Ray) -> Result<Option<RayHit>, AccelError> {
        Ok(self.qbvh()?.intersect(ray))
    }

    pub fn intersect_with_stack(
        &self,
        ray: &Ray,
        stack: &mut StackCache,
    ) -> Result<Option<RayHit>, AccelError> {
        Ok(self.qbvh()?.intersect_with_stack(ray, stack))
    }

    pub fn bounding_box(&self) -> Result<WorldBox, AccelError> {
        Ok(self.qbvh()?.bounding_box())
    }
}
