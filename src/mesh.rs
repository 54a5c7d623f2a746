//! Indexed triangle meshes and their merge into the single mesh the accelerator is built over.

use std::{fs, path::Path};

use index_vec::IndexVec;
use indexmap::IndexMap;
use log::{info, warn};
use thiserror::Error;

use crate::geometry::{Triangle, WorldBox, WorldPoint};

index_vec::define_index_type! {
    pub struct VertexIdx = u32;
    IMPL_RAW_CONVERSIONS = true;
}

index_vec::define_index_type! {
    pub struct TriangleIdx = u32;
    IMPL_RAW_CONVERSIONS = true;
}

index_vec::define_index_type! {
    pub struct MeshIdx = u32;
    IMPL_RAW_CONVERSIONS = true;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MeshError {
    #[error("Triangle {triangle} references vertex {vertex}, but the mesh only has {vertex_count} vertices")]
    VertexOutOfRange {
        triangle: usize,
        vertex: usize,
        vertex_count: usize,
    },

    #[error("Mesh has {0} vertices, more than can be indexed")]
    TooManyVertices(usize),

    #[error("Mesh has {0} triangles, more than can be indexed")]
    TooManyTriangles(usize),
}

#[derive(Debug, Error)]
pub enum ObjOpenError {
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse file: {0}")]
    ParseError(#[from] wavefront_obj::ParseError),

    #[error("Invalid mesh in object {name:?}: {source}")]
    MeshError { name: String, source: MeshError },
}

/// Vertex positions and triangles indexing into them.
/// Indices are always valid.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TriangleMesh {
    vertices: IndexVec<VertexIdx, WorldPoint>,
    triangles: IndexVec<TriangleIdx, Triangle<VertexIdx>>,
}

impl TriangleMesh {
    pub fn new(
        vertices: Vec<WorldPoint>,
        triangles: Vec<Triangle<VertexIdx>>,
    ) -> Result<TriangleMesh, MeshError> {
        if vertices.len() > VertexIdx::MAX_INDEX {
            return Err(MeshError::TooManyVertices(vertices.len()));
        }
        if triangles.len() > TriangleIdx::MAX_INDEX {
            return Err(MeshError::TooManyTriangles(triangles.len()));
        }

        for (i, triangle) in triangles.iter().enumerate() {
            if let Some(vertex) = triangle.iter().find(|v| v.index() >= vertices.len()) {
                return Err(MeshError::VertexOutOfRange {
                    triangle: i,
                    vertex: vertex.index(),
                    vertex_count: vertices.len(),
                });
            }
        }

        Ok(TriangleMesh {
            vertices: IndexVec::from_vec(vertices),
            triangles: IndexVec::from_vec(triangles),
        })
    }

    /// Load all objects from an OBJ file, one mesh per object.
    pub fn load_obj(p: impl AsRef<Path>) -> Result<Vec<TriangleMesh>, ObjOpenError> {
        let content = fs::read_to_string(p)?;
        Self::parse_obj(content)
    }

    pub fn parse_obj(content: impl Into<String>) -> Result<Vec<TriangleMesh>, ObjOpenError> {
        let parsed = wavefront_obj::obj::parse(content.into())?;
        parsed.objects.into_iter().map(Self::from_obj_object).collect()
    }

    fn from_obj_object(o: wavefront_obj::obj::Object) -> Result<TriangleMesh, ObjOpenError> {
        let mut triangles = Vec::new();
        // Only positions are used, texture and normal indices are ignored, so shared
        // positions collapse into one vertex.
        let mut vertices = IndexMap::new();
        let mut skipped = 0usize;

        for geometry in o.geometry {
            for shape in geometry.shapes {
                let wavefront_obj::obj::Primitive::Triangle(a, b, c) = shape.primitive else {
                    skipped += 1;
                    continue;
                };

                let mut handle_vertex = |vtindex: (usize, Option<usize>, Option<usize>)| {
                    let entry = vertices.entry(vtindex.0);
                    let index = entry.index();
                    entry.or_insert_with(|| {
                        let vertex = &o.vertices[vtindex.0];
                        WorldPoint::new(vertex.x as f32, vertex.y as f32, vertex.z as f32)
                    });
                    VertexIdx::from_usize(index)
                };

                let a = handle_vertex(a);
                let b = handle_vertex(b);
                let c = handle_vertex(c);

                triangles.push(Triangle::new(a, b, c));
            }
        }

        if skipped > 0 {
            warn!("Object {:?}: skipped {} non-triangle primitives", o.name, skipped);
        }

        TriangleMesh::new(vertices.into_values().collect(), triangles)
            .map_err(|source| ObjOpenError::MeshError { name: o.name, source })
    }

    pub fn vertices(&self) -> &IndexVec<VertexIdx, WorldPoint> {
        &self.vertices
    }

    pub fn triangles(&self) -> &IndexVec<TriangleIdx, Triangle<VertexIdx>> {
        &self.triangles
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    /// Vertex positions of a single triangle
    pub fn triangle(&self, index: TriangleIdx) -> Triangle<WorldPoint> {
        self.triangles[index].map(|v| self.vertices[*v])
    }

    pub fn bounding_box(&self) -> WorldBox {
        WorldBox::from_points(self.vertices.iter()).unwrap_or_else(WorldBox::empty)
    }
}

/// All meshes of a scene concatenated into one, remembering where each triangle came from.
#[derive(Clone, Debug, Default)]
pub struct MergedMesh {
    mesh: TriangleMesh,
    mesh_indices: IndexVec<TriangleIdx, MeshIdx>,
    mesh_triangle_indices: IndexVec<TriangleIdx, TriangleIdx>,
}

impl MergedMesh {
    pub fn merge(meshes: &[TriangleMesh]) -> Result<MergedMesh, MeshError> {
        let vertex_count: usize = meshes.iter().map(TriangleMesh::vertex_count).sum();
        let triangle_count: usize = meshes.iter().map(TriangleMesh::triangle_count).sum();
        if vertex_count > VertexIdx::MAX_INDEX {
            return Err(MeshError::TooManyVertices(vertex_count));
        }
        if triangle_count > TriangleIdx::MAX_INDEX {
            return Err(MeshError::TooManyTriangles(triangle_count));
        }

        let mut merged = MergedMesh {
            mesh: TriangleMesh {
                vertices: IndexVec::with_capacity(vertex_count),
                triangles: IndexVec::with_capacity(triangle_count),
            },
            mesh_indices: IndexVec::with_capacity(triangle_count),
            mesh_triangle_indices: IndexVec::with_capacity(triangle_count),
        };

        for (mesh_index, mesh) in meshes.iter().enumerate() {
            let vertex_offset = merged.mesh.vertices.len();
            merged.mesh.vertices.extend(mesh.vertices.iter().copied());
            merged.mesh.triangles.extend(
                mesh.triangles
                    .iter()
                    .map(|t| t.map(|v| VertexIdx::from_usize(v.index() + vertex_offset))),
            );
            merged
                .mesh_indices
                .extend(std::iter::repeat_n(MeshIdx::from_usize(mesh_index), mesh.triangle_count()));
            merged
                .mesh_triangle_indices
                .extend(mesh.triangles.indices());
        }

        info!(
            "Merged {} meshes: {} vertices, {} triangles",
            meshes.len(),
            vertex_count,
            triangle_count
        );

        Ok(merged)
    }

    pub fn from_single(mesh: TriangleMesh) -> MergedMesh {
        let triangle_count = mesh.triangle_count();
        MergedMesh {
            mesh_indices: IndexVec::from_vec(vec![MeshIdx::from_raw(0); triangle_count]),
            mesh_triangle_indices: mesh.triangles.indices().collect(),
            mesh,
        }
    }

    pub fn mesh(&self) -> &TriangleMesh {
        &self.mesh
    }

    /// Index of the source mesh and index of the triangle within it
    pub fn provenance(&self, triangle: TriangleIdx) -> (MeshIdx, TriangleIdx) {
        (
            self.mesh_indices[triangle],
            self.mesh_triangle_indices[triangle],
        )
    }
}
