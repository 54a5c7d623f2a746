//! Four-wide bounding volume hierarchy over a merged triangle mesh.
//!
//! Every node holds four child boxes in SIMD lanes and four child links. Leaves are not
//! separate nodes, a leaf link points directly to a range of `QuadTriangle`s, each holding up
//! to four triangles tested at once.

mod building;
mod gpu_mirror;
mod printing;
mod quad_triangle;
mod ray_qbvh_intersection;

use bon::bon;
use index_vec::IndexVec;
use simba::simd::SimdValue as _;
use thiserror::Error;

use crate::{
    geometry::{SIMD_LANES, WorldBox, WorldBox4},
    mesh::{MergedMesh, MeshError},
};

pub use gpu_mirror::{
    DeviceDescription, DeviceType, GpuMirror, GpuNode, GpuQuadTriangle, Image2d, KernelCompiler,
    KernelDefine, MirrorError, MirrorSettings, MirrorStorage,
};
pub use printing::{QbvhStatistics, TreeDump};
pub use quad_triangle::QuadTriangle;
pub(crate) use quad_triangle::LeafHit;
pub use ray_qbvh_intersection::StackCache;

/// Recursion depth after which the builder stops splitting and forces a leaf
pub const MAX_DEPTH: usize = 64;
/// Number of buckets along the split axis used to estimate the SAH cost
pub const BIN_COUNT: usize = 8;
/// Largest number of triangles a single leaf link can reference
pub const MAX_LEAF_PRIMITIVES: usize = SIMD_LANES * CompressedNodeLink::MAX_COUNT as usize;

/// Most triangles a tree can hold, every triangle may end up in its own quad
pub const MAX_TRIANGLES: usize = CompressedNodeLink::MAX_LEAF_INDEX as usize + 1;

#[derive(Clone, Debug)]
pub struct Qbvh {
    bounding_box: WorldBox,
    nodes: IndexVec<NodeIdx, QbvhNode>,
    quads: IndexVec<QuadIdx, QuadTriangle>,
    mesh: MergedMesh,
    max_depth: usize,
}

impl Qbvh {
    pub fn bounding_box(&self) -> WorldBox {
        self.bounding_box
    }

    pub fn nodes(&self) -> &IndexVec<NodeIdx, QbvhNode> {
        &self.nodes
    }

    pub fn quads(&self) -> &IndexVec<QuadIdx, QuadTriangle> {
        &self.quads
    }

    pub fn mesh(&self) -> &MergedMesh {
        &self.mesh
    }

    /// Deepest recursion level reached while building
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}

#[derive(Clone, Debug)]
pub struct QbvhNode {
    child_bounds: WorldBox4,
    child_links: [CompressedNodeLink; 4],
}

impl QbvhNode {
    pub fn child_bounds(&self) -> &WorldBox4 {
        &self.child_bounds
    }

    pub fn child_links(&self) -> &[CompressedNodeLink; 4] {
        &self.child_links
    }

    fn set_child(&mut self, slot: usize, bounds: &WorldBox, link: CompressedNodeLink) {
        self.child_bounds.replace(slot, *bounds);
        self.child_links[slot] = link;
    }
}

impl Default for QbvhNode {
    fn default() -> Self {
        QbvhNode {
            child_bounds: WorldBox4::splat(WorldBox::empty()),
            child_links: [CompressedNodeLink::NULL; 4],
        }
    }
}

/// Child reference packed into 32 bits.
///
/// - `0xffff_ffff`: empty slot
/// - high bit clear: index of an inner node
/// - high bit set: leaf, bits 27..31 hold quad count - 1, bits 0..27 the first quad index
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CompressedNodeLink(u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeLink {
    Null,
    Inner { index: NodeIdx },
    Leaf { quads: QuadIdxRange },
}

impl CompressedNodeLink {
    const LEAF_FLAG: u32 = 0x8000_0000;
    const COUNT_SHIFT: u32 = 27;
    const COUNT_MASK: u32 = 0xf;
    const INDEX_MASK: u32 = (1 << Self::COUNT_SHIFT) - 1;
    const NULL_VALUE: u32 = u32::MAX;

    pub const MAX_INNER_INDEX: u32 = !Self::LEAF_FLAG;
    /// One less than the index mask, a full leaf at the mask would read as NULL
    pub const MAX_LEAF_INDEX: u32 = Self::INDEX_MASK - 1;
    pub const MIN_COUNT: u32 = 1;
    pub const MAX_COUNT: u32 = Self::COUNT_MASK + 1;

    pub const NULL: Self = Self(Self::NULL_VALUE);

    /// Create a new leaf link, panics if index or count are out of range
    pub fn new_leaf(first: QuadIdx, count: u32) -> Self {
        Self::new_leaf_raw(first.raw(), count)
    }

    /// Create a new inner node link, panics if index is out of range
    pub fn new_inner(index: NodeIdx) -> Self {
        assert!(index.raw() <= Self::MAX_INNER_INDEX);
        Self(index.raw())
    }

    fn new_leaf_raw(first: u32, count: u32) -> Self {
        assert!(count >= Self::MIN_COUNT);
        assert!(count <= Self::MAX_COUNT);
        assert!(first <= Self::MAX_LEAF_INDEX);
        Self(Self::LEAF_FLAG | ((count - 1) << Self::COUNT_SHIFT) | first)
    }

    pub fn decode(&self) -> NodeLink {
        if self.is_null() {
            NodeLink::Null
        } else if self.0 & Self::LEAF_FLAG == 0 {
            NodeLink::Inner {
                index: NodeIdx::from_raw_unchecked(self.0),
            }
        } else {
            NodeLink::Leaf {
                quads: QuadIdxRange::new(
                    QuadIdx::from_raw_unchecked(self.0 & Self::INDEX_MASK),
                    ((self.0 >> Self::COUNT_SHIFT) & Self::COUNT_MASK) + 1,
                ),
            }
        }
    }

    pub fn is_null(&self) -> bool {
        self.0 == Self::NULL_VALUE
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl Default for CompressedNodeLink {
    fn default() -> Self {
        Self::NULL
    }
}

impl std::fmt::Debug for CompressedNodeLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLink")
            .field("0", &format_args!("{:#010x}", self.0))
            .field("<decoded>", &self.decode())
            .finish()
    }
}

index_vec::define_index_type! {
    pub struct NodeIdx = u32;
    MAX_INDEX = CompressedNodeLink::MAX_INNER_INDEX as usize;
    IMPL_RAW_CONVERSIONS = true;
}

index_vec::define_index_type! {
    pub struct QuadIdx = u32;
    MAX_INDEX = CompressedNodeLink::MAX_LEAF_INDEX as usize;
    IMPL_RAW_CONVERSIONS = true;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QuadIdxRange {
    pub first: QuadIdx,
    pub count: u32,
}

impl QuadIdxRange {
    pub fn new(first: QuadIdx, count: u32) -> QuadIdxRange {
        QuadIdxRange { first, count }
    }

    pub fn into_range(self) -> std::ops::Range<QuadIdx> {
        self.first..(self.first + self.count as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = QuadIdx> {
        let first = self.first.raw();
        (first..first + self.count).map(QuadIdx::from)
    }
}

/// Build configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QbvhParams {
    max_prims_per_leaf: usize,
    full_sweep_threshold: usize,
    skip_factor: usize,
}

#[bon]
impl QbvhParams {
    /// - `max_prims_per_leaf`: ranges this small become leaves, 1 to 64
    /// - `full_sweep_threshold`: ranges shorter than this bin every primitive
    /// - `skip_factor`: larger ranges bin only every n-th primitive
    #[builder]
    pub fn new(
        #[builder(default = 4)] max_prims_per_leaf: usize,
        #[builder(default = 16)] full_sweep_threshold: usize,
        #[builder(default = 1)] skip_factor: usize,
    ) -> Result<Self, ParamsError> {
        if !(1..=MAX_LEAF_PRIMITIVES).contains(&max_prims_per_leaf) {
            return Err(ParamsError::MaxPrimsPerLeaf(max_prims_per_leaf));
        }
        if skip_factor == 0 {
            return Err(ParamsError::ZeroSkipFactor);
        }

        Ok(QbvhParams {
            max_prims_per_leaf,
            full_sweep_threshold,
            skip_factor,
        })
    }
}

impl QbvhParams {
    pub fn max_prims_per_leaf(&self) -> usize {
        self.max_prims_per_leaf
    }

    pub fn full_sweep_threshold(&self) -> usize {
        self.full_sweep_threshold
    }

    pub fn skip_factor(&self) -> usize {
        self.skip_factor
    }
}

impl Default for QbvhParams {
    fn default() -> Self {
        QbvhParams {
            max_prims_per_leaf: 4,
            full_sweep_threshold: 16,
            skip_factor: 1,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamsError {
    #[error("max_prims_per_leaf must be between 1 and {max}, got {0}", max = MAX_LEAF_PRIMITIVES)]
    MaxPrimsPerLeaf(usize),

    #[error("skip_factor must be at least 1")]
    ZeroSkipFactor,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("Expected {expected} vertices in total, meshes have {actual}")]
    VertexCountMismatch { expected: usize, actual: usize },

    #[error("Expected {expected} triangles in total, meshes have {actual}")]
    TriangleCountMismatch { expected: usize, actual: usize },

    #[error("Mesh has {count} triangles, at most {max} are supported", max = MAX_TRIANGLES)]
    TooManyTriangles { count: usize },

    #[error(transparent)]
    Mesh(#[from] MeshError),
}
