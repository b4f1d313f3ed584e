//! Pass definitions.
//!
//! A pass is either a graphics pass, which owns a render pass, its
//! framebuffer and per-subpass pipelines, or a compute pass that only records
//! commands. Every pass runs on one [`SubmitQueue`].

use crate::backend::{
    BackendResult, ClearValue, Extent2D, FramebufferHandle, GraphicsBackend, ImageHandle,
    PipelineHandle, RenderPassHandle, SubmitQueue,
};
use crate::frame_graph::PassContext;

/// Callback run before or after a pass records its commands
pub type PassCallback<D> = Box<dyn FnMut(&mut PassContext<'_, D>) + Send>;

/// Creates the render pass of a graphics pass. Runs once.
pub type RenderPassCreator = Box<dyn FnMut(&mut dyn GraphicsBackend) -> BackendResult<RenderPassHandle> + Send>;

/// Creates a framebuffer and the images it renders into, once per layer.
/// Runs lazily, and again after every resize unless the pass has a fixed extent.
pub type FramebufferCreator = Box<
    dyn FnMut(&mut dyn GraphicsBackend, RenderPassHandle, Extent2D) -> BackendResult<FramebufferTarget>
        + Send,
>;

/// Creates the pipelines of one subpass: `(backend, render pass, subpass index)`.
pub type PipelineCreator = Box<
    dyn FnMut(&mut dyn GraphicsBackend, RenderPassHandle, u32) -> BackendResult<Vec<PipelineHandle>>
        + Send,
>;

/// Records the draws of one subpass with its pipelines.
pub type SubpassRecorder<D> = Box<dyn FnMut(&mut PassContext<'_, D>, &[PipelineHandle]) + Send>;

/// A framebuffer and the images it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferTarget {
    pub framebuffer: FramebufferHandle,
    /// Images destroyed together with the framebuffer
    pub images: Vec<ImageHandle>,
}

impl FramebufferTarget {
    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_framebuffer(self.framebuffer);
        for image in self.images {
            backend.destroy_image(image);
        }
    }
}

pub struct Subpass<D> {
    pub(crate) create_pipelines: PipelineCreator,
    pub(crate) record: SubpassRecorder<D>,
    pub(crate) pipelines: Option<Vec<PipelineHandle>>,
}

impl<D> Subpass<D> {
    pub fn new(
        create_pipelines: impl FnMut(&mut dyn GraphicsBackend, RenderPassHandle, u32) -> BackendResult<Vec<PipelineHandle>>
            + Send
            + 'static,
        record: impl FnMut(&mut PassContext<'_, D>, &[PipelineHandle]) + Send + 'static,
    ) -> Self {
        Self {
            create_pipelines: Box::new(create_pipelines),
            record: Box::new(record),
            pipelines: None,
        }
    }

    pub fn pipelines(&self) -> Option<&[PipelineHandle]> {
        self.pipelines.as_deref()
    }
}

/// A pass that records inside a render pass.
pub struct GraphicsPass<D> {
    pub(crate) name: String,
    pub(crate) queue: SubmitQueue,
    pub(crate) create_render_pass: RenderPassCreator,
    pub(crate) create_framebuffer: FramebufferCreator,
    pub(crate) clear_values: Vec<ClearValue>,
    pub(crate) subpasses: Vec<Subpass<D>>,
    pub(crate) on_begin: Option<PassCallback<D>>,
    pub(crate) on_end: Option<PassCallback<D>>,
    pub(crate) extent: Option<Extent2D>,
    pub(crate) layers: u32,
    pub(crate) render_pass: Option<RenderPassHandle>,
    pub(crate) targets: Vec<FramebufferTarget>,
}

impl<D> GraphicsPass<D> {
    pub fn new(
        name: impl Into<String>,
        queue: SubmitQueue,
        create_render_pass: impl FnMut(&mut dyn GraphicsBackend) -> BackendResult<RenderPassHandle> + Send + 'static,
        create_framebuffer: impl FnMut(&mut dyn GraphicsBackend, RenderPassHandle, Extent2D) -> BackendResult<FramebufferTarget>
            + Send
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            create_render_pass: Box::new(create_render_pass),
            create_framebuffer: Box::new(create_framebuffer),
            clear_values: Vec::new(),
            subpasses: Vec::new(),
            on_begin: None,
            on_end: None,
            extent: None,
            layers: 1,
            render_pass: None,
            targets: Vec::new(),
        }
    }

    /// Render at `extent` instead of the viewport. Such targets survive resizes.
    pub fn with_extent(mut self, extent: Extent2D) -> Self {
        self.extent = Some(extent);
        self
    }

    /// Begin the render pass `layers` times per frame, each time on its own
    /// framebuffer. Subpass recorders see the index in [`PassContext::layer`].
    pub fn with_layers(mut self, layers: u32) -> Self {
        self.layers = layers.max(1);
        self
    }

    pub fn with_clear_values(mut self, clear_values: Vec<ClearValue>) -> Self {
        self.clear_values = clear_values;
        self
    }

    pub fn with_subpass(mut self, subpass: Subpass<D>) -> Self {
        self.subpasses.push(subpass);
        self
    }

    /// Runs before the render pass begins.
    pub fn on_begin(mut self, callback: impl FnMut(&mut PassContext<'_, D>) + Send + 'static) -> Self {
        self.on_begin = Some(Box::new(callback));
        self
    }

    /// Runs after the render pass ends.
    pub fn on_end(mut self, callback: impl FnMut(&mut PassContext<'_, D>) + Send + 'static) -> Self {
        self.on_end = Some(Box::new(callback));
        self
    }

    pub fn render_pass(&self) -> Option<RenderPassHandle> {
        self.render_pass
    }

    pub fn framebuffer(&self) -> Option<FramebufferHandle> {
        self.targets.first().map(|t| t.framebuffer)
    }

    /// One target per layer, empty until created.
    pub fn targets(&self) -> &[FramebufferTarget] {
        &self.targets
    }

    pub fn extent(&self) -> Option<Extent2D> {
        self.extent
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    pub fn subpasses(&self) -> &[Subpass<D>] {
        &self.subpasses
    }
}

/// A pass that records compute work outside any render pass.
pub struct ComputePass<D> {
    pub(crate) name: String,
    pub(crate) queue: SubmitQueue,
    pub(crate) record: PassCallback<D>,
    pub(crate) on_begin: Option<PassCallback<D>>,
    pub(crate) on_end: Option<PassCallback<D>>,
}

impl<D> ComputePass<D> {
    pub fn new(
        name: impl Into<String>,
        queue: SubmitQueue,
        record: impl FnMut(&mut PassContext<'_, D>) + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            record: Box::new(record),
            on_begin: None,
            on_end: None,
        }
    }

    pub fn on_begin(mut self, callback: impl FnMut(&mut PassContext<'_, D>) + Send + 'static) -> Self {
        self.on_begin = Some(Box::new(callback));
        self
    }

    pub fn on_end(mut self, callback: impl FnMut(&mut PassContext<'_, D>) + Send + 'static) -> Self {
        self.on_end = Some(Box::new(callback));
        self
    }
}

/// A node of the frame graph.
pub enum Pass<D> {
    Graphics(GraphicsPass<D>),
    Compute(ComputePass<D>),
}

impl<D> Pass<D> {
    pub fn name(&self) -> &str {
        match self {
            Pass::Graphics(pass) => &pass.name,
            Pass::Compute(pass) => &pass.name,
        }
    }

    pub fn queue(&self) -> SubmitQueue {
        match self {
            Pass::Graphics(pass) => pass.queue,
            Pass::Compute(pass) => pass.queue,
        }
    }

    pub fn is_graphics(&self) -> bool {
        matches!(self, Pass::Graphics(_))
    }

    pub fn as_graphics(&self) -> Option<&GraphicsPass<D>> {
        match self {
            Pass::Graphics(pass) => Some(pass),
            Pass::Compute(_) => None,
        }
    }
}

impl<D> From<GraphicsPass<D>> for Pass<D> {
    fn from(pass: GraphicsPass<D>) -> Self {
        Pass::Graphics(pass)
    }
}

impl<D> From<ComputePass<D>> for Pass<D> {
    fn from(pass: ComputePass<D>) -> Self {
        Pass::Compute(pass)
    }
}

impl<D> std::fmt::Debug for Pass<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(if self.is_graphics() { "GraphicsPass" } else { "ComputePass" })
            .field("name", &self.name())
            .field("queue", &self.queue())
            .finish()
    }
}
