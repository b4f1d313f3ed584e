//! Core backend abstraction traits
//!
//! The renderer talks to the GPU only through [`GraphicsBackend`]. Both the
//! software backend and the Vulkan backend implement it.

use crate::backend::command::CommandList;
use crate::backend::types::*;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create image: {0}")]
    ImageCreationFailed(String),
    #[error("Failed to create render pass: {0}")]
    RenderPassCreationFailed(String),
    #[error("Failed to create framebuffer: {0}")]
    FramebufferCreationFailed(String),
    #[error("Failed to create resource set: {0}")]
    ResourceSetCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to compile shader: {0}")]
    ShaderCompilationFailed(String),
    #[error("Failed to create query pool: {0}")]
    QueryPoolCreationFailed(String),
    #[error("Invalid {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u64 },
    #[error("Buffer access out of range: offset {offset} + size {size} exceeds {capacity}")]
    OutOfRange { offset: u64, size: u64, capacity: u64 },
    #[error("Buffer {0} is not host visible")]
    NotHostVisible(u64),
    #[error("Submission failed: {0}")]
    SubmitFailed(String),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a 2D image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub(crate) u64);

/// Handle to a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassHandle(pub(crate) u64);

/// Handle to a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferHandle(pub(crate) u64);

/// Handle to a compute or graphics pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub(crate) u64);

/// Handle to a resource set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceLayoutHandle(pub(crate) u64);

/// Handle to a resource set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceSetHandle(pub(crate) u64);

/// Handle to a timestamp query pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryPoolHandle(pub(crate) u64);

macro_rules! impl_handle_id {
    ($($handle:ty),* $(,)?) => {
        $(
            impl $handle {
                /// Raw id, for logging.
                pub fn id(&self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

impl_handle_id!(
    BufferHandle,
    ImageHandle,
    RenderPassHandle,
    FramebufferHandle,
    PipelineHandle,
    ResourceLayoutHandle,
    ResourceSetHandle,
    QueryPoolHandle,
);

/// Main graphics backend trait
///
/// Object creation errors are fatal for the caller: the renderer does not
/// retry them. Commands are recorded into a [`CommandList`] first and handed
/// to [`GraphicsBackend::submit`] per submission queue.
pub trait GraphicsBackend: Send {
    /// Short backend name for logging
    fn name(&self) -> &'static str;

    /// Device properties the renderer depends on
    fn capabilities(&self) -> DeviceCapabilities;

    // Buffers

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Copy `data` into the mapped memory of a host-visible buffer.
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()>;

    /// Make host writes in the range visible to the device. A no-op on coherent memory.
    fn flush_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<()>;

    /// Read back a range of a buffer.
    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>>;

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    // Render targets

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle>;

    fn destroy_image(&mut self, image: ImageHandle);

    fn create_render_pass(&mut self, desc: &RenderPassDescriptor) -> BackendResult<RenderPassHandle>;

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle);

    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor) -> BackendResult<FramebufferHandle>;

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);

    // Pipelines and resource sets

    fn create_resource_layout(
        &mut self,
        desc: &ResourceLayoutDescriptor,
    ) -> BackendResult<ResourceLayoutHandle>;

    fn create_resource_set(&mut self, desc: &ResourceSetDescriptor) -> BackendResult<ResourceSetHandle>;

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<PipelineHandle>;

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDescriptor,
    ) -> BackendResult<PipelineHandle>;

    // Queries

    fn create_query_pool(&mut self, query_count: u32) -> BackendResult<QueryPoolHandle>;

    /// Fetch timestamp results. Returns `None` when `wait` is false and the
    /// results are not yet available.
    fn get_query_results(
        &mut self,
        pool: QueryPoolHandle,
        first: u32,
        count: u32,
        wait: bool,
    ) -> BackendResult<Option<Vec<u64>>>;

    // Execution

    /// Start work on a frame slot. Blocks until the GPU finished the work
    /// previously submitted on this slot, so its host-visible data may be reused.
    fn begin_frame(&mut self, slot: usize) -> BackendResult<()>;

    /// Submit a command list on a queue. Submissions within a frame execute in
    /// call order; each waits for the previous one.
    fn submit(&mut self, queue: SubmitQueue, commands: &CommandList) -> BackendResult<()>;

    /// Block until the device has finished all submitted work.
    fn wait_idle(&mut self) -> BackendResult<()>;
}

/// Boxed backends, for callers that pick the backend at runtime.
impl<B: GraphicsBackend + ?Sized> GraphicsBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn capabilities(&self) -> DeviceCapabilities {
        (**self).capabilities()
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        (**self).create_buffer(desc)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        (**self).write_buffer(buffer, offset, data)
    }

    fn flush_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<()> {
        (**self).flush_buffer(buffer, offset, size)
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        (**self).read_buffer(buffer, offset, size)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        (**self).destroy_buffer(buffer)
    }

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        (**self).create_image(desc)
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        (**self).destroy_image(image)
    }

    fn create_render_pass(&mut self, desc: &RenderPassDescriptor) -> BackendResult<RenderPassHandle> {
        (**self).create_render_pass(desc)
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle) {
        (**self).destroy_render_pass(render_pass)
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor) -> BackendResult<FramebufferHandle> {
        (**self).create_framebuffer(desc)
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        (**self).destroy_framebuffer(framebuffer)
    }

    fn create_resource_layout(
        &mut self,
        desc: &ResourceLayoutDescriptor,
    ) -> BackendResult<ResourceLayoutHandle> {
        (**self).create_resource_layout(desc)
    }

    fn create_resource_set(&mut self, desc: &ResourceSetDescriptor) -> BackendResult<ResourceSetHandle> {
        (**self).create_resource_set(desc)
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        (**self).create_compute_pipeline(desc)
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        (**self).create_graphics_pipeline(desc)
    }

    fn create_query_pool(&mut self, query_count: u32) -> BackendResult<QueryPoolHandle> {
        (**self).create_query_pool(query_count)
    }

    fn get_query_results(
        &mut self,
        pool: QueryPoolHandle,
        first: u32,
        count: u32,
        wait: bool,
    ) -> BackendResult<Option<Vec<u64>>> {
        (**self).get_query_results(pool, first, count, wait)
    }

    fn begin_frame(&mut self, slot: usize) -> BackendResult<()> {
        (**self).begin_frame(slot)
    }

    fn submit(&mut self, queue: SubmitQueue, commands: &CommandList) -> BackendResult<()> {
        (**self).submit(queue, commands)
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        (**self).wait_idle()
    }
}
