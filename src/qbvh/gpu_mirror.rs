//! Device side copy of a built tree.
//!
//! The tree is either uploaded as two linear buffers holding the nodes and quads with their host
//! memory layout, or, on GPUs with image support, as two RGBA u32 images. In the image form a
//! node takes 7 texels and a quad takes 10, child links are rewritten to texel coordinates.

use std::{array, fmt};

use bytemuck::{Pod, Zeroable};
use log::{debug, warn};
use simba::simd::SimdValue as _;
use thiserror::Error;

use crate::{
    geometry::{SimdFloatType, WorldPoint4, WorldVector4},
    util::round_up,
};

use super::{CompressedNodeLink, NodeLink, Qbvh, QbvhNode, QuadTriangle};

/// Texels per node in image storage
pub const NODE_TEXELS: usize = 7;
/// Texels per quad triangle in image storage
pub const QUAD_TEXELS: usize = 10;
/// Node image row length limit, texel x / 7 must stay below the link's high bit
pub const MAX_NODE_IMAGE_WIDTH: usize = 0x7fff;
/// Quad image row length limit, texel x / 10 must fit the 11 bits left in a leaf link
pub const MAX_QUAD_IMAGE_WIDTH: usize = 20470;
/// Texel y coordinates are stored in 16 bits
pub const MAX_IMAGE_HEIGHT: usize = 0x10000;
/// Work group size used when the device doesn't force one and the compiler suggests more
pub const MAX_WORK_GROUP_SIZE: usize = 256;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Accelerator,
}

/// Capabilities of the device the tree is uploaded to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescription {
    pub name: String,
    pub device_type: DeviceType,
    pub image_support: bool,
    pub image2d_max_width: usize,
    pub image2d_max_height: usize,
    pub force_work_group_size: Option<usize>,
    /// Bytes of work group local memory
    pub local_mem_size: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorSettings {
    /// Entries of the fixed size traversal stack each work item keeps in local memory
    pub stack_size: usize,
    pub disable_image_storage: bool,
}

impl Default for MirrorSettings {
    fn default() -> Self {
        MirrorSettings {
            stack_size: 24,
            disable_image_storage: false,
        }
    }
}

/// Preprocessor define passed to the kernel compiler
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelDefine {
    pub name: String,
    pub value: Option<String>,
}

impl KernelDefine {
    pub fn flag(name: &str) -> KernelDefine {
        KernelDefine {
            name: name.to_owned(),
            value: None,
        }
    }

    pub fn value(name: &str, value: impl ToString) -> KernelDefine {
        KernelDefine {
            name: name.to_owned(),
            value: Some(value.to_string()),
        }
    }
}

impl fmt::Display for KernelDefine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "-D {}={}", self.name, value),
            None => write!(f, "-D {}", self.name),
        }
    }
}

/// Builds the traversal kernel for a device.
pub trait KernelCompiler {
    /// Returns the work group size the compiled kernel supports, or the build log on failure.
    fn compile(&self, device: &DeviceDescription, defines: &[KernelDefine])
    -> Result<usize, String>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MirrorError {
    #[error("QBVH kernel compilation failed on device {device}:\n{log}")]
    KernelBuild { device: String, log: String },

    #[error(
        "Not enough local memory on device {device} for QBVH stack: {required} bytes needed, \
        {available} available (reduce the work group size or the stack size)"
    )]
    InsufficientLocalMemory {
        device: String,
        required: usize,
        available: usize,
    },
}

/// Node with the host layout: boxes as `[min|max][x|y|z][lane]`, then the four child links.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct GpuNode {
    pub bboxes: [[[f32; 4]; 3]; 2],
    pub children: [u32; 4],
}

/// Quad triangle with the host layout: three transposed vectors, then the triangle indices.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct GpuQuadTriangle {
    pub origin: [[f32; 4]; 3],
    pub edge1: [[f32; 4]; 3],
    pub edge2: [[f32; 4]; 3],
    pub primitives: [u32; 4],
}

fn lanes(x: &SimdFloatType) -> [f32; 4] {
    array::from_fn(|i| x.extract(i))
}

fn point_lanes(p: &WorldPoint4) -> [[f32; 4]; 3] {
    [lanes(&p.x), lanes(&p.y), lanes(&p.z)]
}

fn vector_lanes(v: &WorldVector4) -> [[f32; 4]; 3] {
    [lanes(&v.x), lanes(&v.y), lanes(&v.z)]
}

impl From<&QbvhNode> for GpuNode {
    fn from(node: &QbvhNode) -> Self {
        GpuNode {
            bboxes: [
                point_lanes(&node.child_bounds.min),
                point_lanes(&node.child_bounds.max),
            ],
            children: node.child_links.map(|link| link.raw()),
        }
    }
}

impl From<&QuadTriangle> for GpuQuadTriangle {
    fn from(quad: &QuadTriangle) -> Self {
        let geometry = quad.geometry();
        GpuQuadTriangle {
            origin: point_lanes(&geometry.origin),
            edge1: vector_lanes(&geometry.edge1),
            edge2: vector_lanes(&geometry.edge2),
            primitives: quad.triangles().map(|i| i.raw()),
        }
    }
}

/// RGBA u32 image, row major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image2d {
    pub width: usize,
    pub height: usize,
    pub texels: Vec<[u32; 4]>,
}

impl Image2d {
    fn new(width: usize, height: usize) -> Image2d {
        Image2d {
            width,
            height,
            texels: vec![[0; 4]; width * height],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.texels)
    }
}

#[derive(Clone, Debug)]
pub enum MirrorStorage {
    Buffers {
        nodes: Vec<GpuNode>,
        quads: Vec<GpuQuadTriangle>,
    },
    Images {
        nodes: Image2d,
        quads: Image2d,
    },
}

impl MirrorStorage {
    pub fn is_image(&self) -> bool {
        matches!(self, MirrorStorage::Images { .. })
    }

    /// Node and quad data as they are uploaded
    pub fn as_bytes(&self) -> (&[u8], &[u8]) {
        match self {
            MirrorStorage::Buffers { nodes, quads } => {
                (bytemuck::cast_slice(nodes), bytemuck::cast_slice(quads))
            }
            MirrorStorage::Images { nodes, quads } => (nodes.as_bytes(), quads.as_bytes()),
        }
    }
}

/// Tree data laid out for a device, with the launch configuration of its kernel.
#[derive(Clone, Debug)]
pub struct GpuMirror {
    storage: MirrorStorage,
    defines: Vec<KernelDefine>,
    work_group_size: usize,
    stack_size: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct ImageSize {
    width: usize,
    height: usize,
}

impl ImageSize {
    /// Roughly square image holding `count` items of `stride` texels, rows hold whole items
    fn for_items(count: usize, stride: usize, max_width: usize) -> ImageSize {
        let pixels = count * stride;
        let side = (pixels as f64).sqrt() as u32;
        let width = (round_up(side, stride as u32) as usize)
            .min(max_width)
            .max(stride);
        ImageSize {
            width,
            height: pixels.div_ceil(width).max(1),
        }
    }

    fn fits(&self, device: &DeviceDescription) -> bool {
        self.width <= device.image2d_max_width
            && self.height <= device.image2d_max_height
            && self.height <= MAX_IMAGE_HEIGHT
    }
}

impl GpuMirror {
    pub fn new(
        qbvh: &Qbvh,
        device: &DeviceDescription,
        compiler: &impl KernelCompiler,
        settings: &MirrorSettings,
    ) -> Result<GpuMirror, MirrorError> {
        debug!(
            "[{}] QBVH max. stack size: {}",
            device.name, settings.stack_size
        );
        // Each node on the path may leave up to 3 siblings on the stack
        let node_levels = qbvh.max_depth() / 2 + 1;
        if settings.stack_size < 3 * node_levels + 1 {
            warn!(
                "[{}] QBVH stack size {} may be too small for tree depth {}",
                device.name,
                settings.stack_size,
                qbvh.max_depth()
            );
        }

        let storage = match image_layout(qbvh, device, settings) {
            Some((node_size, quad_size)) => MirrorStorage::Images {
                nodes: node_image(qbvh, node_size, quad_size),
                quads: quad_image(qbvh, quad_size),
            },
            None => {
                let nodes: Vec<GpuNode> = qbvh.nodes.iter().map(GpuNode::from).collect();
                let quads: Vec<GpuQuadTriangle> =
                    qbvh.quads.iter().map(GpuQuadTriangle::from).collect();
                debug!(
                    "[{}] QBVH buffer size: {} kB, QuadTriangle buffer size: {} kB",
                    device.name,
                    size_of_val(nodes.as_slice()) / 1024,
                    size_of_val(quads.as_slice()) / 1024
                );
                MirrorStorage::Buffers { nodes, quads }
            }
        };

        let mut defines = Vec::new();
        if storage.is_image() {
            defines.push(KernelDefine::flag("USE_IMAGE_STORAGE"));
        }
        defines.push(KernelDefine::value("QBVH_STACK_SIZE", settings.stack_size));

        let suggested = compiler
            .compile(device, &defines)
            .map_err(|log| MirrorError::KernelBuild {
                device: device.name.clone(),
                log,
            })?;
        let work_group_size = device
            .force_work_group_size
            .unwrap_or(suggested.min(MAX_WORK_GROUP_SIZE));
        debug!(
            "[{}] QBVH kernel work group size: {} (suggested {})",
            device.name, work_group_size, suggested
        );

        let required = settings.stack_size * work_group_size * size_of::<u32>();
        if required > device.local_mem_size {
            return Err(MirrorError::InsufficientLocalMemory {
                device: device.name.clone(),
                required,
                available: device.local_mem_size,
            });
        }

        Ok(GpuMirror {
            storage,
            defines,
            work_group_size,
            stack_size: settings.stack_size,
        })
    }

    pub fn storage(&self) -> &MirrorStorage {
        &self.storage
    }

    pub fn defines(&self) -> &[KernelDefine] {
        &self.defines
    }

    /// Defines formatted as compiler command line options
    pub fn compiler_options(&self) -> String {
        self.defines.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(" ")
    }

    pub fn work_group_size(&self) -> usize {
        self.work_group_size
    }

    /// Bytes of local memory the kernel needs per work group for its stacks
    pub fn local_stack_bytes(&self) -> usize {
        self.stack_size * self.work_group_size * size_of::<u32>()
    }
}

/// Image sizes for nodes and quads, or None if the tree has to use linear buffers
fn image_layout(
    qbvh: &Qbvh,
    device: &DeviceDescription,
    settings: &MirrorSettings,
) -> Option<(ImageSize, ImageSize)> {
    if settings.disable_image_storage {
        debug!("[{}] QBVH image storage disabled", device.name);
        return None;
    }
    if !device.image_support || device.device_type != DeviceType::Gpu {
        debug!("[{}] Image support is not available", device.name);
        return None;
    }

    let node_size = ImageSize::for_items(qbvh.nodes.len(), NODE_TEXELS, MAX_NODE_IMAGE_WIDTH);
    let quad_size = ImageSize::for_items(qbvh.quads.len(), QUAD_TEXELS, MAX_QUAD_IMAGE_WIDTH);
    debug!(
        "[{}] Max. image size: {}x{}, QBVH node image: {}x{}, QuadTriangle image: {}x{}",
        device.name,
        device.image2d_max_width,
        device.image2d_max_height,
        node_size.width,
        node_size.height,
        quad_size.width,
        quad_size.height
    );

    if !node_size.fits(device) || !quad_size.fits(device) {
        debug!("[{}] Max. image size is too small", device.name);
        return None;
    }

    debug!("[{}] Using image storage for QBVH", device.name);
    Some((node_size, quad_size))
}

/// Position of texel `pixel` in a row major image of the given width
fn texel_coordinates(pixel: usize, width: usize, stride: usize) -> u32 {
    let x = (pixel % width) / stride;
    let y = pixel / width;
    ((x as u32) << 16) | y as u32
}

fn image_link(link: CompressedNodeLink, node_width: usize, quad_width: usize) -> u32 {
    match link.decode() {
        NodeLink::Null => link.raw(),
        NodeLink::Inner { index } => {
            texel_coordinates(index.index() * NODE_TEXELS, node_width, NODE_TEXELS)
        }
        NodeLink::Leaf { quads } => {
            let coordinates =
                texel_coordinates(quads.first.index() * QUAD_TEXELS, quad_width, QUAD_TEXELS);
            0x8000_0000 | (((quads.count - 1) & 0xf) << 27) | (coordinates & 0x07ff_ffff)
        }
    }
}

fn node_image(qbvh: &Qbvh, size: ImageSize, quad_size: ImageSize) -> Image2d {
    let mut image = Image2d::new(size.width, size.height);
    for (node, texels) in qbvh
        .nodes
        .iter()
        .zip(image.texels.chunks_exact_mut(NODE_TEXELS))
    {
        let mut gpu_node = GpuNode::from(node);
        gpu_node.children = node
            .child_links
            .map(|link| image_link(link, size.width, quad_size.width));
        texels.copy_from_slice(&bytemuck::cast::<_, [[u32; 4]; NODE_TEXELS]>(gpu_node));
    }
    image
}

fn quad_image(qbvh: &Qbvh, size: ImageSize) -> Image2d {
    let mut image = Image2d::new(size.width, size.height);
    for (quad, texels) in qbvh
        .quads
        .iter()
        .zip(image.texels.chunks_exact_mut(QUAD_TEXELS))
    {
        let gpu_quad = GpuQuadTriangle::from(quad);
        texels.copy_from_slice(&bytemuck::cast::<_, [[u32; 4]; QUAD_TEXELS]>(gpu_quad));
    }
    image
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::{
        mesh::{MergedMesh, tests::random_triangle_soup},
        qbvh::{NodeIdx, QbvhParams, QuadIdx},
    };
    use assert2::{assert, check, let_assert};
    use test_case::test_case;

    /// Compiler returning a fixed result, remembering the defines it was called with
    struct MockCompiler {
        result: Result<usize, String>,
        defines: RefCell<Vec<KernelDefine>>,
    }

    impl MockCompiler {
        fn new(result: Result<usize, String>) -> MockCompiler {
            MockCompiler {
                result,
                defines: RefCell::new(Vec::new()),
            }
        }
    }

    impl KernelCompiler for MockCompiler {
        fn compile(
            &self,
            _device: &DeviceDescription,
            defines: &[KernelDefine],
        ) -> Result<usize, String> {
            *self.defines.borrow_mut() = defines.to_vec();
            self.result.clone()
        }
    }

    fn gpu() -> DeviceDescription {
        DeviceDescription {
            name: "Test GPU".to_owned(),
            device_type: DeviceType::Gpu,
            image_support: true,
            image2d_max_width: 16384,
            image2d_max_height: 16384,
            force_work_group_size: None,
            local_mem_size: 48 * 1024,
        }
    }

    fn qbvh(triangles: usize) -> Qbvh {
        Qbvh::build(
            &QbvhParams::default(),
            MergedMesh::from_single(random_triangle_soup(triangles, 50.0, 17)),
        )
        .unwrap()
    }

    fn mirror(qbvh: &Qbvh, device: &DeviceDescription, settings: &MirrorSettings) -> GpuMirror {
        GpuMirror::new(qbvh, device, &MockCompiler::new(Ok(64)), settings).unwrap()
    }

    #[test]
    fn host_layout_sizes() {
        assert!(size_of::<GpuNode>() == 112);
        assert!(size_of::<GpuQuadTriangle>() == 160);
        assert!(size_of::<GpuNode>() == NODE_TEXELS * 16);
        assert!(size_of::<GpuQuadTriangle>() == QUAD_TEXELS * 16);
    }

    #[test]
    fn buffers_match_tree() {
        let qbvh = qbvh(100);
        let settings = MirrorSettings {
            disable_image_storage: true,
            ..MirrorSettings::default()
        };
        let mirror = mirror(&qbvh, &gpu(), &settings);

        let_assert!(MirrorStorage::Buffers { nodes, quads } = mirror.storage());
        assert!(nodes.len() == qbvh.nodes().len());
        assert!(quads.len() == qbvh.quads().len());

        let root = &qbvh.nodes()[NodeIdx::from_raw(0)];
        check!(nodes[0].children == root.child_links().map(|l| l.raw()));
        check!(nodes[0].bboxes[0][1][2] == root.child_bounds().extract(2).min.y);
        let quad = &qbvh.quads()[QuadIdx::from_raw(3)];
        check!(quads[3].primitives == quad.triangles().map(|t| t.raw()));

        let (node_bytes, quad_bytes) = mirror.storage().as_bytes();
        check!(node_bytes.len() == 112 * nodes.len());
        check!(quad_bytes.len() == 160 * quads.len());
        check!(mirror.compiler_options() == "-D QBVH_STACK_SIZE=24");
    }

    #[test_case(true, DeviceType::Gpu, true; "disabled")]
    #[test_case(false, DeviceType::Cpu, true; "cpu device")]
    #[test_case(false, DeviceType::Gpu, false; "no image support")]
    fn falls_back_to_buffers(disable: bool, device_type: DeviceType, image_support: bool) {
        let qbvh = qbvh(50);
        let device = DeviceDescription {
            device_type,
            image_support,
            ..gpu()
        };
        let settings = MirrorSettings {
            disable_image_storage: disable,
            ..MirrorSettings::default()
        };
        let mirror = mirror(&qbvh, &device, &settings);
        assert!(!mirror.storage().is_image());
        assert!(
            !mirror
                .defines()
                .contains(&KernelDefine::flag("USE_IMAGE_STORAGE"))
        );
    }

    #[test]
    fn too_small_image_falls_back_to_buffers() {
        let qbvh = qbvh(2000);
        let device = DeviceDescription {
            image2d_max_width: 64,
            image2d_max_height: 64,
            ..gpu()
        };
        let mirror = mirror(&qbvh, &device, &MirrorSettings::default());
        assert!(!mirror.storage().is_image());
    }

    #[test]
    fn image_layout_dimensions() {
        let qbvh = qbvh(1000);
        let mirror = mirror(&qbvh, &gpu(), &MirrorSettings::default());

        let_assert!(MirrorStorage::Images { nodes, quads } = mirror.storage());
        check!(nodes.width % NODE_TEXELS == 0);
        check!(quads.width % QUAD_TEXELS == 0);
        check!(nodes.width * nodes.height >= qbvh.nodes().len() * NODE_TEXELS);
        check!(quads.width * quads.height >= qbvh.quads().len() * QUAD_TEXELS);
        check!(nodes.texels.len() == nodes.width * nodes.height);
        check!(mirror.compiler_options() == "-D USE_IMAGE_STORAGE -D QBVH_STACK_SIZE=24");
    }

    #[test_case(0, 7, 0x7fff, 7, 1)]
    #[test_case(1, 7, 0x7fff, 7, 1)]
    #[test_case(100, 7, 0x7fff, 28, 25)]
    #[test_case(10, 10, 20470, 10, 10)]
    #[test_case(100_000_000, 10, 20470, 20470, 48852)]
    fn image_sizes(count: usize, stride: usize, max_width: usize, width: usize, height: usize) {
        let size = ImageSize::for_items(count, stride, max_width);
        assert!(size == ImageSize { width, height });
    }

    /// Decode a texel coordinate link back to an item index
    fn item_index(coordinates: u32, width: usize, stride: usize) -> usize {
        let x = (coordinates >> 16) as usize * stride;
        let y = (coordinates & 0xffff) as usize;
        (y * width + x) / stride
    }

    #[test]
    fn image_links_point_at_texels() {
        let qbvh = qbvh(1000);
        let mirror = mirror(&qbvh, &gpu(), &MirrorSettings::default());
        let_assert!(MirrorStorage::Images { nodes, quads } = mirror.storage());

        for (i, node) in qbvh.nodes().iter().enumerate() {
            let texels = &nodes.texels[i * NODE_TEXELS..(i + 1) * NODE_TEXELS];
            // Boxes are copied unchanged
            let expected: [[u32; 4]; NODE_TEXELS] = bytemuck::cast(GpuNode::from(node));
            assert!(texels[..6] == expected[..6]);

            for (slot, link) in node.child_links().iter().enumerate() {
                let encoded = texels[6][slot];
                match link.decode() {
                    NodeLink::Null => assert!(encoded == u32::MAX),
                    NodeLink::Inner { index } => {
                        assert!(encoded & 0x8000_0000 == 0);
                        assert!(item_index(encoded, nodes.width, NODE_TEXELS) == index.index());
                    }
                    NodeLink::Leaf { quads: range } => {
                        assert!(encoded & 0x8000_0000 != 0);
                        assert!((encoded >> 27) & 0xf == range.count - 1);
                        let first = item_index(encoded & 0x07ff_ffff, quads.width, QUAD_TEXELS);
                        assert!(first == range.first.index());
                    }
                }
            }
        }

        let quad = GpuQuadTriangle::from(&qbvh.quads()[QuadIdx::from_raw(5)]);
        let expected: [[u32; 4]; QUAD_TEXELS] = bytemuck::cast(quad);
        assert!(quads.texels[50..60] == expected);
    }

    #[test_case(None, 64, 64)]
    #[test_case(None, 1024, 256)]
    #[test_case(Some(32), 1024, 32)]
    #[test_case(Some(512), 64, 512)]
    fn work_group_size(forced: Option<usize>, suggested: usize, expected: usize) {
        let qbvh = qbvh(10);
        let device = DeviceDescription {
            force_work_group_size: forced,
            local_mem_size: 1 << 20,
            ..gpu()
        };
        let compiler = MockCompiler::new(Ok(suggested));
        let mirror = GpuMirror::new(&qbvh, &device, &compiler, &MirrorSettings::default()).unwrap();
        assert!(mirror.work_group_size() == expected);
        assert!(mirror.local_stack_bytes() == 24 * expected * 4);
    }

    #[test]
    fn insufficient_local_memory() {
        let qbvh = qbvh(10);
        let device = DeviceDescription {
            local_mem_size: 16 * 1024,
            ..gpu()
        };
        let settings = MirrorSettings {
            stack_size: 64,
            ..MirrorSettings::default()
        };
        let compiler = MockCompiler::new(Ok(256));
        let result = GpuMirror::new(&qbvh, &device, &compiler, &settings);
        let_assert!(
            Err(MirrorError::InsufficientLocalMemory {
                required: 65536,
                available: 16384,
                ..
            }) = result
        );
    }

    #[test]
    fn kernel_build_failure() {
        let qbvh = qbvh(10);
        let compiler = MockCompiler::new(Err("syntax error".to_owned()));
        let result = GpuMirror::new(&qbvh, &gpu(), &compiler, &MirrorSettings::default());
        let_assert!(Err(MirrorError::KernelBuild { device, log }) = result);
        assert!(device == "Test GPU");
        assert!(log == "syntax error");
        assert!(
            *compiler.defines.borrow()
                == vec![
                    KernelDefine::flag("USE_IMAGE_STORAGE"),
                    KernelDefine::value("QBVH_STACK_SIZE", 24)
                ]
        );
    }
}
