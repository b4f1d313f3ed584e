//! Backend-agnostic resource descriptors and flag sets.

use bitflags::bitflags;

use crate::backend::traits::{BufferHandle, ImageHandle, RenderPassHandle, ResourceLayoutHandle};

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        /// Buffer can be the source of a copy.
        const TRANSFER_SRC = 1 << 4;
        /// Buffer can be the destination of a copy or fill.
        const TRANSFER_DST = 1 << 5;
    }
}

bitflags! {
    /// Memory property flags requested for a buffer allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryProperties: u32 {
        const DEVICE_LOCAL = 1 << 0;
        const HOST_VISIBLE = 1 << 1;
        const HOST_COHERENT = 1 << 2;
    }
}

bitflags! {
    /// Pipeline stages used by barriers and timestamp writes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const VERTEX_SHADER = 1 << 1;
        const FRAGMENT_SHADER = 1 << 2;
        const EARLY_FRAGMENT_TESTS = 1 << 3;
        const LATE_FRAGMENT_TESTS = 1 << 4;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 5;
        const COMPUTE_SHADER = 1 << 6;
        const TRANSFER = 1 << 7;
        const BOTTOM_OF_PIPE = 1 << 8;
        const HOST = 1 << 9;
    }
}

bitflags! {
    /// Memory access types covered by a barrier.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const UNIFORM_READ = 1 << 0;
        const SHADER_READ = 1 << 1;
        const SHADER_WRITE = 1 << 2;
        const TRANSFER_READ = 1 << 3;
        const TRANSFER_WRITE = 1 << 4;
        const HOST_WRITE = 1 << 5;
        const MEMORY_READ = 1 << 6;
        const MEMORY_WRITE = 1 << 7;
        const COLOR_ATTACHMENT_WRITE = 1 << 8;
        const DEPTH_STENCIL_ATTACHMENT_WRITE = 1 << 9;
    }
}

bitflags! {
    /// Shader stages a resource binding is visible to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

bitflags! {
    /// Usage flags for images.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const COLOR_ATTACHMENT = 1 << 0;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 1;
        const SAMPLED = 1 << 2;
        const TRANSFER_SRC = 1 << 3;
    }
}

/// How a buffer is shared between queue families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SharingMode {
    /// Owned by one queue family at a time; cross-family use needs ownership transfer.
    #[default]
    Exclusive,
    /// Accessible from every listed queue family without ownership transfer.
    Concurrent,
}

/// Descriptor for creating a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryProperties,
    pub sharing: SharingMode,
}

impl BufferDescriptor {
    /// Device-local buffer with exclusive sharing.
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
            memory: MemoryProperties::DEVICE_LOCAL,
            sharing: SharingMode::Exclusive,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_memory(mut self, memory: MemoryProperties) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_sharing(mut self, sharing: SharingMode) -> Self {
        self.sharing = sharing;
        self
    }

    /// Whether the CPU can map this buffer.
    pub fn is_host_visible(&self) -> bool {
        self.memory.contains(MemoryProperties::HOST_VISIBLE)
    }
}

/// The three logical submission queues, in submission order.
///
/// `EarlyGraphics` and `Graphics` share the graphics queue family and may map to
/// the same hardware queue; they are separate submissions so that compute work
/// can be scheduled between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubmitQueue {
    EarlyGraphics = 0,
    Compute = 1,
    Graphics = 2,
}

impl SubmitQueue {
    pub const COUNT: usize = 3;
    pub const ALL: [SubmitQueue; 3] = [
        SubmitQueue::EarlyGraphics,
        SubmitQueue::Compute,
        SubmitQueue::Graphics,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            SubmitQueue::EarlyGraphics => "early-graphics",
            SubmitQueue::Compute => "compute",
            SubmitQueue::Graphics => "graphics",
        }
    }

    /// Queue family this submission queue executes on.
    pub fn family(self, families: &QueueFamilies) -> u32 {
        match self {
            SubmitQueue::Compute => families.compute,
            SubmitQueue::EarlyGraphics | SubmitQueue::Graphics => families.graphics,
        }
    }

    /// Stage at which a submission waits for the previous one in the chain.
    pub fn wait_stage(self) -> PipelineStages {
        match self {
            SubmitQueue::Compute => PipelineStages::COMPUTE_SHADER,
            _ => PipelineStages::FRAGMENT_SHADER,
        }
    }
}

/// Queue family indices of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
}

impl QueueFamilies {
    /// Whether graphics and compute run on different families.
    pub fn is_split(&self) -> bool {
        self.graphics != self.compute
    }

    /// Family index list used for concurrent sharing.
    pub fn unique(&self) -> Vec<u32> {
        if self.is_split() {
            vec![self.graphics, self.compute]
        } else {
            vec![self.graphics]
        }
    }
}

/// Properties of the device the core needs to know about.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceCapabilities {
    pub queue_families: QueueFamilies,
    /// Nanoseconds per timestamp tick.
    pub timestamp_period_ns: f32,
    /// Alignment of flush ranges for non-coherent memory.
    pub non_coherent_atom_size: u64,
}

/// A memory barrier on a buffer range.
///
/// Queue family fields are `None` for ordinary barriers. An ownership transfer
/// is a pair of barriers with both families set: a release recorded on the
/// source queue and a matching acquire recorded on the destination queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferBarrier {
    pub buffer: BufferHandle,
    pub offset: u64,
    /// `None` covers the rest of the buffer.
    pub size: Option<u64>,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub src_queue_family: Option<u32>,
    pub dst_queue_family: Option<u32>,
}

impl BufferBarrier {
    pub fn is_ownership_transfer(&self) -> bool {
        matches!(
            (self.src_queue_family, self.dst_queue_family),
            (Some(src), Some(dst)) if src != dst
        )
    }
}

/// Texel and attachment formats the core uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba16Float,
    Rgba32Float,
    R32Uint,
    Depth32Float,
}

impl Format {
    pub fn is_depth(self) -> bool {
        matches!(self, Format::Depth32Float)
    }

    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Format::Rgba8Unorm | Format::Bgra8Unorm | Format::R32Uint | Format::Depth32Float => 4,
            Format::Rgba16Float => 8,
            Format::Rgba32Float => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Descriptor for creating a 2D image (render target).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageDescriptor {
    pub label: Option<String>,
    pub extent: Extent2D,
    pub format: Format,
    pub usage: ImageUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Store,
    DontCare,
}

/// Image layouts an attachment moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    ColorAttachment,
    DepthStencilAttachment,
    ShaderReadOnly,
    TransferSrc,
    Present,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentDescription {
    pub format: Format,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub initial_layout: ImageLayout,
    pub final_layout: ImageLayout,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SubpassDescription {
    /// Indices into the render pass attachments.
    pub color_attachments: Vec<u32>,
    pub depth_attachment: Option<u32>,
}

/// Subpass index used for dependencies outside the render pass.
pub const SUBPASS_EXTERNAL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubpassDependency {
    pub src_subpass: u32,
    pub dst_subpass: u32,
    pub src_stages: PipelineStages,
    pub dst_stages: PipelineStages,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
}

/// Descriptor for creating a render pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RenderPassDescriptor {
    pub label: Option<String>,
    pub attachments: Vec<AttachmentDescription>,
    pub subpasses: Vec<SubpassDescription>,
    pub dependencies: Vec<SubpassDependency>,
}

/// Descriptor for creating a framebuffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FramebufferDescriptor {
    pub label: Option<String>,
    pub render_pass: RenderPassHandle,
    pub attachments: Vec<ImageHandle>,
    pub extent: Extent2D,
}

/// Clear value for one attachment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    Depth(f32),
}

/// Kind of resource bound at a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    UniformBuffer,
    StorageBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceLayoutEntry {
    pub binding: u32,
    pub kind: BindingKind,
    pub stages: ShaderStages,
}

/// Layout of one resource set (descriptor set).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ResourceLayoutDescriptor {
    pub label: Option<String>,
    pub entries: Vec<ResourceLayoutEntry>,
}

impl ResourceLayoutDescriptor {
    pub fn entry(&self, binding: u32) -> Option<&ResourceLayoutEntry> {
        self.entries.iter().find(|e| e.binding == binding)
    }
}

/// A buffer range bound at a slot of a resource set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferBinding {
    pub binding: u32,
    pub buffer: BufferHandle,
    pub offset: u64,
    /// `None` binds to the end of the buffer.
    pub size: Option<u64>,
}

impl BufferBinding {
    pub fn whole(binding: u32, buffer: BufferHandle) -> Self {
        Self {
            binding,
            buffer,
            offset: 0,
            size: None,
        }
    }
}

/// Descriptor for creating a resource set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceSetDescriptor {
    pub label: Option<String>,
    pub layout: ResourceLayoutHandle,
    pub buffers: Vec<BufferBinding>,
}

/// WGSL program and the entry point a pipeline stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderProgram {
    pub label: &'static str,
    pub source: &'static str,
    pub entry_point: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComputePipelineDescriptor {
    pub label: Option<String>,
    pub program: ShaderProgram,
    pub layouts: Vec<ResourceLayoutHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
    Float32x4,
}

impl VertexFormat {
    pub fn size(self) -> u32 {
        match self {
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// Position and normal, both `vec3<f32>`.
    pub fn position_normal() -> Self {
        Self {
            stride: 24,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float32x3,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: VertexFormat::Float32x3,
                    offset: 12,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineDescriptor {
    pub label: Option<String>,
    pub vertex: ShaderProgram,
    pub fragment: ShaderProgram,
    pub vertex_layout: VertexLayout,
    pub layouts: Vec<ResourceLayoutHandle>,
    pub render_pass: RenderPassHandle,
    pub subpass: u32,
    pub color_attachment_count: u32,
    pub depth_test: bool,
    pub depth_write: bool,
    pub alpha_blend: bool,
    /// Size of the vertex-stage push constant block in bytes.
    pub push_constant_size: u32,
}

/// Copy raw bytes read back from a buffer into typed values.
///
/// Read-back byte vectors carry no alignment guarantee, so values are read
/// unaligned. Trailing bytes that do not fill a whole value are ignored.
pub fn pod_vec_from_bytes<T: bytemuck::Pod>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}
