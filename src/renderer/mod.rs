//! Clustered forward renderer.
//!
//! Each frame runs three submissions:
//!
//! 1. **EarlyGraphics** `shadow`: the opaque geometry is rendered into four
//!    cascaded depth maps from the first directional light. Then
//!    `clustering`, a depth-only draw that flags every cluster containing
//!    visible surfaces.
//! 2. **Compute** `light_cull`: the three culling stages build the per-cluster
//!    light lists.
//! 3. **Graphics** `cluster_forward`: shading with the light lists, then the
//!    seven grid buffers are zeroed for the next frame.
//!
//! # Example
//!
//! ```ignore
//! let mut renderer = ClusterRenderer::new(SoftwareBackend::new(SoftwareConfig::default()),
//!     RendererConfig::default().with_viewport(1280, 720))?;
//! renderer.on_submit_completed(|backend, queue| { /* inspect results */ });
//! loop {
//!     renderer.render_frame(&view)?;
//! }
//! ```

pub mod pipeline;
pub mod query;
pub mod shadow;

use thiserror::Error;

use crate::backend::{
    BackendError, BufferBinding, BufferHandle, BufferUsage, ClearValue, CommandList, Extent2D,
    Format, FrameCommands, GraphicsBackend, PipelineHandle, PipelineStages, QueryPoolHandle,
    QueueFamilies, ResourceLayoutHandle, ResourceSetDescriptor, ResourceSetHandle, SubmitQueue,
};
use crate::cluster::{
    ClusterGrid, ClusterUniforms, CullDispatch, CullTimestamps, GridBuffers, LightBuffers,
    LightCuller, MAX_HEIGHT, MAX_WIDTH, MIN_NUM_LIGHTS,
};
use crate::frame_graph::{
    ComputePass, FrameContext, FrameGraph, FrameGraphError, GraphicsPass, PassContext, Subpass,
};
use crate::renderer::shadow::{ShadowCascades, SHADOW_CASCADE_COUNT, SHADOW_MAP_SIZE};
use crate::resources::{QueueSharing, SharedBuffer};
use crate::scene::{DrawBatch, RenderView};

use self::pipeline::{FORWARD_OPAQUE, FORWARD_TRANSLUCENT};
pub use self::query::{FrameTimings, GpuTimer, QueryData, QueryPools, QUERY_COUNT};
pub use self::shadow::Cascade;

/// Renderer error type
#[derive(Error, Debug)]
pub enum RendererError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    FrameGraph(#[from] FrameGraphError),
    #[error("viewport {width}x{height} exceeds the supported maximum {}x{}", MAX_WIDTH, MAX_HEIGHT)]
    ViewportTooLarge { width: u32, height: u32 },
    #[error("viewport {width}x{height} is empty")]
    EmptyViewport { width: u32, height: u32 },
    #[error("{0} called out of order")]
    OutOfOrder(&'static str),
    #[error("renderer has been shut down")]
    ShutDown,
}

pub type RendererResult<T> = Result<T, RendererError>;

/// Called after each queue submission with the queue that was submitted.
pub type SubmitCallback = Box<dyn FnMut(&mut dyn GraphicsBackend, SubmitQueue) + Send>;

/// Renderer configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfig {
    /// Initial viewport width
    pub width: u32,
    /// Initial viewport height
    pub height: u32,
    pub frames_in_flight: usize,
    /// Point light capacity, clamped to the supported range
    pub max_lights: u32,
    /// Record and read back timestamp queries
    pub gpu_timing: bool,
    /// Render cascaded shadow maps for the first directional light
    pub shadows: bool,
    pub queue_sharing: QueueSharing,
    pub color_format: Format,
    pub depth_format: Format,
    pub clear_color: [f32; 4],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frames_in_flight: 2,
            max_lights: MIN_NUM_LIGHTS * 4,
            gpu_timing: true,
            shadows: true,
            queue_sharing: QueueSharing::Concurrent,
            color_format: Format::Rgba8Unorm,
            depth_format: Format::Depth32Float,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl RendererConfig {
    pub fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_frames_in_flight(mut self, frames_in_flight: usize) -> Self {
        self.frames_in_flight = frames_in_flight.max(1);
        self
    }

    pub fn with_max_lights(mut self, max_lights: u32) -> Self {
        self.max_lights = max_lights;
        self
    }

    pub fn with_gpu_timing(mut self, enabled: bool) -> Self {
        self.gpu_timing = enabled;
        self
    }

    pub fn with_shadows(mut self, enabled: bool) -> Self {
        self.shadows = enabled;
        self
    }

    pub fn with_queue_sharing(mut self, sharing: QueueSharing) -> Self {
        self.queue_sharing = sharing;
        self
    }

    pub fn with_formats(mut self, color: Format, depth: Format) -> Self {
        self.color_format = color;
        self.depth_format = depth;
        self
    }

    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }
}

/// Data every pass sees for the frame being recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterFrame {
    pub grid: ClusterGrid,
    pub num_lights: u32,
    pub dispatch: CullDispatch,
    /// `None` when the view has no directional light
    pub cascades: Option<ShadowCascades>,
}

/// Check a viewport against the cluster buffer limits.
pub fn validate_viewport(width: u32, height: u32) -> RendererResult<Extent2D> {
    if width == 0 || height == 0 {
        return Err(RendererError::EmptyViewport { width, height });
    }
    if width > MAX_WIDTH || height > MAX_HEIGHT {
        return Err(RendererError::ViewportTooLarge { width, height });
    }
    Ok(Extent2D::new(width, height))
}

/// Objects released at shutdown
struct FrameResources {
    uniforms: SharedBuffer,
    lights: LightBuffers,
    grid: GridBuffers,
}

/// Handles the pass closures need; every closure owns a clone.
#[derive(Clone)]
struct PassBindings {
    layouts: [ResourceLayoutHandle; 2],
    frame_sets: Vec<ResourceSetHandle>,
    grid_set: ResourceSetHandle,
    /// Uniform, position and color buffer of each slot
    host_written: Vec<[BufferHandle; 3]>,
    grid: GridBuffers,
    culler: LightCuller,
    query_pools: Option<Vec<QueryPoolHandle>>,
    families: QueueFamilies,
    transfer: bool,
}

impl PassBindings {
    fn frame_set(&self, slot: usize) -> ResourceSetHandle {
        self.frame_sets[slot % self.frame_sets.len()]
    }

    fn query_pool(&self, slot: usize) -> Option<QueryPoolHandle> {
        self.query_pools.as_ref().map(|pools| pools[slot % pools.len()])
    }

    fn begin_timer(&self, ctx: &mut PassContext<'_, ClusterFrame>, timer: GpuTimer) {
        if let Some(pool) = self.query_pool(ctx.frame.slot) {
            QueryPools::record_begin(ctx.commands, pool, timer);
        }
    }

    fn end_timer(&self, ctx: &mut PassContext<'_, ClusterFrame>, timer: GpuTimer, stage: PipelineStages) {
        if let Some(pool) = self.query_pool(ctx.frame.slot) {
            QueryPools::record_end(ctx.commands, pool, timer, stage);
        }
    }

    fn record_draws<'a>(
        &self,
        commands: &mut CommandList,
        slot: usize,
        pipeline: Option<&PipelineHandle>,
        batches: impl Iterator<Item = &'a DrawBatch>,
    ) {
        let Some(&pipeline) = pipeline else {
            log::error!("Subpass has no pipeline, skipping its draws");
            return;
        };
        let mut batches = batches.peekable();
        if batches.peek().is_none() {
            return;
        }
        commands.bind_pipeline(pipeline);
        commands.bind_resource_set(0, self.frame_set(slot));
        commands.bind_resource_set(1, self.grid_set);
        for batch in batches {
            commands.draw_indexed(batch.draw_call());
        }
    }
}

/// Cascade depth maps, rendered before clustering on the early queue.
fn shadow_pass(depth_format: Format, bindings: &PassBindings) -> GraphicsPass<ClusterFrame> {
    let (begin, end) = (bindings.clone(), bindings.clone());
    let layouts = bindings.layouts;
    GraphicsPass::new(
        "shadow",
        SubmitQueue::EarlyGraphics,
        move |backend: &mut dyn GraphicsBackend| pipeline::shadow_render_pass(backend, depth_format),
        move |backend: &mut dyn GraphicsBackend, render_pass, extent| {
            pipeline::create_shadow_target(backend, render_pass, extent, depth_format)
        },
    )
    .with_extent(Extent2D::new(SHADOW_MAP_SIZE, SHADOW_MAP_SIZE))
    .with_layers(SHADOW_CASCADE_COUNT as u32)
    .with_clear_values(vec![ClearValue::Depth(1.0)])
    .with_subpass(Subpass::new(
        move |backend: &mut dyn GraphicsBackend, render_pass, subpass| {
            pipeline::shadow_pipelines(backend, layouts, render_pass, subpass)
        },
        |ctx: &mut PassContext<'_, ClusterFrame>, pipelines: &[PipelineHandle]| {
            let Some(cascades) = ctx.data.cascades.as_ref() else {
                return;
            };
            let Some(&pipeline) = pipelines.first() else {
                log::error!("Shadow pass has no pipeline, skipping its draws");
                return;
            };
            if ctx.view.opaque.is_empty() {
                return;
            }
            let light_view_proj = cascades[ctx.layer as usize % SHADOW_CASCADE_COUNT].view_proj;
            ctx.commands.bind_pipeline(pipeline);
            for batch in &ctx.view.opaque {
                let mut call = batch.draw_call();
                call.transform = light_view_proj * batch.transform;
                ctx.commands.draw_indexed(call);
            }
        },
    ))
    .on_begin(move |ctx: &mut PassContext<'_, ClusterFrame>| begin.begin_timer(ctx, GpuTimer::DepthPass))
    .on_end(move |ctx: &mut PassContext<'_, ClusterFrame>| {
        end.end_timer(ctx, GpuTimer::DepthPass, PipelineStages::BOTTOM_OF_PIPE)
    })
}

/// Build the passes of the clustered frame.
fn build_frame_graph(
    config: &RendererConfig,
    bindings: PassBindings,
) -> Result<FrameGraph<ClusterFrame>, FrameGraphError> {
    let mut graph = FrameGraph::new();
    let depth_format = config.depth_format;
    let color_format = config.color_format;

    if config.shadows {
        graph.add_pass(shadow_pass(depth_format, &bindings))?;
    }

    let (begin, end, draw) = (bindings.clone(), bindings.clone(), bindings.clone());
    let layouts = bindings.layouts;
    graph.add_pass(
        GraphicsPass::new(
            "clustering",
            SubmitQueue::EarlyGraphics,
            move |backend: &mut dyn GraphicsBackend| pipeline::clustering_render_pass(backend, depth_format),
            move |backend: &mut dyn GraphicsBackend, render_pass, extent| {
                pipeline::create_target(backend, "clustering", render_pass, extent, &[depth_format])
            },
        )
        .with_clear_values(vec![ClearValue::Depth(1.0)])
        .with_subpass(Subpass::new(
            move |backend: &mut dyn GraphicsBackend, render_pass, subpass| {
                pipeline::clustering_pipelines(backend, layouts, render_pass, subpass)
            },
            move |ctx: &mut PassContext<'_, ClusterFrame>, pipelines: &[PipelineHandle]| {
                let batches = ctx.view.opaque.iter().chain(ctx.view.alpha_test.iter());
                draw.record_draws(ctx.commands, ctx.frame.slot, pipelines.first(), batches);
            },
        ))
        .on_begin(move |ctx: &mut PassContext<'_, ClusterFrame>| begin.begin_timer(ctx, GpuTimer::Clustering))
        .on_end(move |ctx: &mut PassContext<'_, ClusterFrame>| {
            end.end_timer(ctx, GpuTimer::Clustering, PipelineStages::BOTTOM_OF_PIPE);
            if end.transfer {
                end.grid.record_release_to_compute(ctx.commands, &end.families);
            }
        }),
    )?;

    let (begin, cull, end) = (bindings.clone(), bindings.clone(), bindings.clone());
    graph.add_pass(
        ComputePass::new(
            "light_cull",
            SubmitQueue::Compute,
            move |ctx: &mut PassContext<'_, ClusterFrame>| {
                let slot = ctx.frame.slot;
                let timestamps = cull.query_pool(slot).map(|pool| {
                    let first = GpuTimer::LightGrids.begin_query();
                    ctx.commands.reset_queries(pool, first, 6);
                    CullTimestamps { pool, first }
                });
                cull.culler.record(
                    ctx.commands,
                    &ctx.data.dispatch,
                    cull.frame_set(slot),
                    cull.grid_set,
                    &cull.grid,
                    &cull.host_written[slot % cull.host_written.len()],
                    timestamps,
                );
            },
        )
        .on_begin(move |ctx: &mut PassContext<'_, ClusterFrame>| {
            if begin.transfer {
                begin.grid.record_acquire_on_compute(ctx.commands, &begin.families);
            }
        })
        .on_end(move |ctx: &mut PassContext<'_, ClusterFrame>| {
            if end.transfer {
                end.grid.record_release_to_graphics(ctx.commands, &end.families);
            }
        }),
    )?;

    let (begin, end, draw) = (bindings.clone(), bindings.clone(), bindings);
    graph.add_pass(
        GraphicsPass::new(
            "cluster_forward",
            SubmitQueue::Graphics,
            move |backend: &mut dyn GraphicsBackend| {
                pipeline::forward_render_pass(backend, color_format, depth_format)
            },
            move |backend: &mut dyn GraphicsBackend, render_pass, extent| {
                pipeline::create_target(
                    backend,
                    "cluster_forward",
                    render_pass,
                    extent,
                    &[color_format, depth_format],
                )
            },
        )
        .with_clear_values(vec![ClearValue::Color(config.clear_color), ClearValue::Depth(1.0)])
        .with_subpass(Subpass::new(
            move |backend: &mut dyn GraphicsBackend, render_pass, subpass| {
                pipeline::forward_pipelines(backend, layouts, render_pass, subpass)
            },
            move |ctx: &mut PassContext<'_, ClusterFrame>, pipelines: &[PipelineHandle]| {
                let slot = ctx.frame.slot;
                let solid = ctx.view.opaque.iter().chain(ctx.view.alpha_test.iter());
                draw.record_draws(ctx.commands, slot, pipelines.get(FORWARD_OPAQUE), solid);
                draw.record_draws(
                    ctx.commands,
                    slot,
                    pipelines.get(FORWARD_TRANSLUCENT),
                    ctx.view.translucent.iter(),
                );
            },
        ))
        .on_begin(move |ctx: &mut PassContext<'_, ClusterFrame>| {
            if begin.transfer {
                begin.grid.record_acquire_on_graphics(ctx.commands, &begin.families);
            }
            begin.begin_timer(ctx, GpuTimer::Onscreen);
        })
        .on_end(move |ctx: &mut PassContext<'_, ClusterFrame>| {
            end.end_timer(ctx, GpuTimer::Onscreen, PipelineStages::COLOR_ATTACHMENT_OUTPUT);
            end.begin_timer(ctx, GpuTimer::Transfer);
            end.grid.record_clear(ctx.commands);
            end.end_timer(ctx, GpuTimer::Transfer, PipelineStages::TRANSFER);
        }),
    )?;

    Ok(graph)
}

/// The clustered forward renderer.
///
/// Frames go through [`update`](Self::update), [`draw`](Self::draw) and
/// [`submit`](Self::submit) in that order, or all at once through
/// [`render_frame`](Self::render_frame).
pub struct ClusterRenderer<B: GraphicsBackend> {
    backend: B,
    config: RendererConfig,
    frame: FrameContext,
    graph: FrameGraph<ClusterFrame>,
    resources: Option<FrameResources>,
    queries: Option<QueryPools>,
    submit_callbacks: Vec<SubmitCallback>,
    prepared: Option<ClusterFrame>,
    recorded: Option<FrameCommands>,
    cascades: Option<ShadowCascades>,
}

impl<B: GraphicsBackend> ClusterRenderer<B> {
    /// Create every GPU object the renderer needs. Any failure is fatal.
    pub fn new(mut backend: B, config: RendererConfig) -> RendererResult<Self> {
        let extent = validate_viewport(config.width, config.height)?;
        let frames_in_flight = config.frames_in_flight.max(1);
        let capabilities = backend.capabilities();
        let families = capabilities.queue_families;
        log::info!(
            "Creating cluster renderer on {} backend: {}x{}, {} frames in flight, families {}/{}",
            backend.name(),
            extent.width,
            extent.height,
            frames_in_flight,
            families.graphics,
            families.compute
        );

        let layouts = pipeline::create_layouts(&mut backend)?;
        let uniforms = SharedBuffer::new(
            &mut backend,
            "cluster_uniforms",
            std::mem::size_of::<ClusterUniforms>() as u64,
            BufferUsage::UNIFORM,
            frames_in_flight,
        )?;
        let lights = LightBuffers::new(&mut backend, config.max_lights, frames_in_flight)?;
        let grid = GridBuffers::new(&mut backend, lights.capacity(), &families, config.queue_sharing)?;

        let mut frame_sets = Vec::with_capacity(frames_in_flight);
        let mut host_written = Vec::with_capacity(frames_in_flight);
        for slot in 0..frames_in_flight {
            let buffers = [
                uniforms.buffer(slot),
                lights.pos_ranges().buffer(slot),
                lights.colors().buffer(slot),
            ];
            frame_sets.push(backend.create_resource_set(&ResourceSetDescriptor {
                label: Some(format!("cluster_frame[{slot}]")),
                layout: layouts[0],
                buffers: buffers
                    .iter()
                    .enumerate()
                    .map(|(binding, &buffer)| BufferBinding::whole(binding as u32, buffer))
                    .collect(),
            })?);
            host_written.push(buffers);
        }
        let grid_set = backend.create_resource_set(&ResourceSetDescriptor {
            label: Some("cluster_grid".into()),
            layout: layouts[1],
            buffers: grid
                .all()
                .iter()
                .enumerate()
                .map(|(binding, &buffer)| BufferBinding::whole(binding as u32, buffer))
                .collect(),
        })?;

        let culler = LightCuller::new(&mut backend, layouts)?;
        let queries = if config.gpu_timing {
            let timers: Vec<GpuTimer> = GpuTimer::ALL
                .into_iter()
                .filter(|&timer| config.shadows || timer != GpuTimer::DepthPass)
                .collect();
            Some(QueryPools::new(&mut backend, frames_in_flight, &timers)?)
        } else {
            None
        };

        let bindings = PassBindings {
            layouts,
            frame_sets,
            grid_set,
            host_written,
            grid,
            culler,
            query_pools: queries.as_ref().map(|q| q.pools().to_vec()),
            families,
            transfer: config.queue_sharing.needs_transfer(&families),
        };
        let mut graph = build_frame_graph(&config, bindings)?;
        graph.prepare(&mut backend, extent)?;

        // Device memory starts undefined: zero the grid once before the first frame.
        let mut clear = CommandList::new();
        grid.record_clear(&mut clear);
        backend.begin_frame(0)?;
        backend.submit(SubmitQueue::Graphics, &clear)?;
        backend.wait_idle()?;

        Ok(Self {
            backend,
            frame: FrameContext::new(capabilities, frames_in_flight, extent),
            config,
            graph,
            resources: Some(FrameResources {
                uniforms,
                lights,
                grid,
            }),
            queries,
            submit_callbacks: Vec::new(),
            prepared: None,
            recorded: None,
            cascades: None,
        })
    }

    fn resources(&self) -> RendererResult<&FrameResources> {
        self.resources.as_ref().ok_or(RendererError::ShutDown)
    }

    /// Prepare the frame on the current work slot: wait for the slot, then
    /// upload the view's lights and the cluster uniforms.
    pub fn update(&mut self, view: &RenderView) -> RendererResult<()> {
        if self.resources.is_none() {
            return Err(RendererError::ShutDown);
        }
        let extent = validate_viewport(view.width, view.height)?;
        if extent != self.frame.extent {
            self.resize(extent.width, extent.height)?;
        }

        let slot = self.frame.slot;
        self.backend.begin_frame(slot)?;

        let grid = ClusterGrid::from_viewport(extent.width, extent.height);
        let resources = self.resources.as_ref().ok_or(RendererError::ShutDown)?;
        let num_lights = resources.lights.upload(&mut self.backend, slot, &view.lights)?;
        let uniforms = ClusterUniforms::new(&view.camera, &grid, extent.width, extent.height, num_lights);
        resources.uniforms.set_data(&mut self.backend, slot, &uniforms)?;
        resources.uniforms.flush(&mut self.backend, slot)?;

        log::debug!(
            "Frame {} slot {}: {}x{}x{} clusters, {} lights",
            self.frame.frame_number,
            slot,
            grid.tile_count_x,
            grid.tile_count_y,
            grid.tile_count_z,
            num_lights
        );
        self.cascades = if self.config.shadows {
            shadow::sun_light(&view.lights).map(|sun| shadow::compute_cascades(&view.camera, sun.direction))
        } else {
            None
        };
        self.prepared = Some(ClusterFrame {
            grid,
            num_lights,
            dispatch: CullDispatch::new(num_lights, &grid),
            cascades: self.cascades,
        });
        Ok(())
    }

    /// Record the frame graph for the frame prepared by [`update`](Self::update).
    pub fn draw(&mut self, view: &RenderView) -> RendererResult<()> {
        let data = self.prepared.ok_or(RendererError::OutOfOrder("draw"))?;
        let commands = self.graph.record(&mut self.backend, &self.frame, view, &data)?;
        self.recorded = Some(commands);
        Ok(())
    }

    /// Submit the recorded queues in order and move to the next work slot.
    pub fn submit(&mut self) -> RendererResult<()> {
        let commands = self.recorded.take().ok_or(RendererError::OutOfOrder("submit"))?;
        for queue in SubmitQueue::ALL {
            self.backend.submit(queue, commands.queue(queue))?;
            self.on_submit(queue)?;
        }
        if let Some(queries) = self.queries.as_mut() {
            queries.complete(self.frame.slot);
        }
        self.prepared = None;
        self.frame.advance();
        Ok(())
    }

    fn on_submit(&mut self, queue: SubmitQueue) -> RendererResult<()> {
        if let Some(queries) = self.queries.as_mut() {
            queries.read(&mut self.backend, self.frame.slot, queue, self.frame.frame_number)?;
        }
        for callback in &mut self.submit_callbacks {
            callback(&mut self.backend, queue);
        }
        Ok(())
    }

    /// [`update`](Self::update), [`draw`](Self::draw) and [`submit`](Self::submit).
    pub fn render_frame(&mut self, view: &RenderView) -> RendererResult<()> {
        self.update(view)?;
        self.draw(view)?;
        self.submit()
    }

    /// Register a callback run after every queue submission.
    pub fn on_submit_completed(
        &mut self,
        callback: impl FnMut(&mut dyn GraphicsBackend, SubmitQueue) + Send + 'static,
    ) {
        self.submit_callbacks.push(Box::new(callback));
    }

    /// Drop the viewport-sized targets. They are recreated on the next frame.
    pub fn resize(&mut self, width: u32, height: u32) -> RendererResult<()> {
        let extent = validate_viewport(width, height)?;
        if extent == self.frame.extent {
            return Ok(());
        }
        log::info!(
            "Resizing from {}x{} to {}x{}",
            self.frame.extent.width,
            self.frame.extent.height,
            width,
            height
        );
        self.backend.wait_idle()?;
        self.graph.resize(&mut self.backend);
        self.frame.extent = extent;
        self.prepared = None;
        self.recorded = None;
        Ok(())
    }

    /// GPU timings of the last fully submitted frame.
    pub fn frame_timings(&self) -> Option<FrameTimings> {
        let data = self.queries.as_ref()?.last_completed()?;
        Some(FrameTimings::from_query_data(
            data,
            self.frame.capabilities.timestamp_period_ns,
        ))
    }

    /// Cascades of the last frame prepared by [`update`](Self::update).
    pub fn shadow_cascades(&self) -> Option<&ShadowCascades> {
        self.cascades.as_ref()
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn frame_context(&self) -> &FrameContext {
        &self.frame
    }

    pub fn frame_graph(&self) -> &FrameGraph<ClusterFrame> {
        &self.graph
    }

    /// The seven grid buffers, for inspection after submission.
    pub fn grid_buffers(&self) -> RendererResult<GridBuffers> {
        Ok(self.resources()?.grid)
    }

    pub fn uniforms(&self) -> RendererResult<&SharedBuffer> {
        Ok(&self.resources()?.uniforms)
    }

    pub fn light_buffers(&self) -> RendererResult<&LightBuffers> {
        Ok(&self.resources()?.lights)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Wait for the GPU and destroy everything the renderer created.
    pub fn shutdown(&mut self) -> RendererResult<()> {
        let Some(resources) = self.resources.take() else {
            return Ok(());
        };
        log::info!("Shutting down cluster renderer after {} frames", self.frame.frame_number);
        let idle = self.backend.wait_idle();
        self.graph.destroy(&mut self.backend);
        resources.grid.destroy(&mut self.backend);
        resources.lights.destroy(&mut self.backend);
        resources.uniforms.destroy(&mut self.backend);
        self.prepared = None;
        self.recorded = None;
        idle.map_err(RendererError::from)
    }
}

impl<B: GraphicsBackend> Drop for ClusterRenderer<B> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("Cluster renderer shutdown failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Command, SoftwareBackend, SoftwareConfig};
    use crate::scene::{Camera, Light};
    use glam::Vec3;

    fn view(width: u32, height: u32) -> RenderView {
        RenderView::new(Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO), width, height)
            .with_lights(vec![Light::point(Vec3::ZERO, 10.0, Vec3::ONE)])
    }

    fn renderer(config: RendererConfig) -> ClusterRenderer<SoftwareBackend> {
        ClusterRenderer::new(SoftwareBackend::new(SoftwareConfig::default()), config).unwrap()
    }

    #[test]
    fn test_passes_in_queue_order() {
        let renderer = renderer(RendererConfig::default());
        let graph = renderer.frame_graph();
        assert_eq!(graph.passes_on(SubmitQueue::EarlyGraphics), vec!["shadow", "clustering"]);
        assert_eq!(graph.passes_on(SubmitQueue::Compute), vec!["light_cull"]);
        assert_eq!(graph.passes_on(SubmitQueue::Graphics), vec!["cluster_forward"]);
    }

    #[test]
    fn test_shadow_pass_renders_each_cascade() {
        use crate::scene::{Aabb, BatchKind, DrawBatch};

        let mut renderer = renderer(RendererConfig::default().with_gpu_timing(false));
        let buffer = renderer
            .backend_mut()
            .create_buffer(&crate::backend::BufferDescriptor::new(64, BufferUsage::VERTEX | BufferUsage::INDEX))
            .unwrap();
        let mut view = view(1280, 720);
        view.lights.push(Light::directional(Vec3::new(-0.5, -1.0, -0.3), Vec3::ONE));
        let model = glam::Mat4::from_translation(Vec3::X);
        view.add_batch(
            BatchKind::Opaque,
            DrawBatch {
                vertex_buffer: buffer,
                index_buffer: buffer,
                index_count: 3,
                transform: model,
                bounds: Aabb::from_center_extent(Vec3::ZERO, Vec3::splat(0.5)),
            },
        );

        renderer.update(&view).unwrap();
        renderer.draw(&view).unwrap();
        let cascades = *renderer.shadow_cascades().unwrap();
        let early = renderer.recorded.as_ref().unwrap().queue(SubmitQueue::EarlyGraphics).commands();
        let extents: Vec<Extent2D> = early
            .iter()
            .filter_map(|c| match c {
                Command::BeginRenderPass { extent, .. } => Some(*extent),
                _ => None,
            })
            .collect();
        let shadow_extent = Extent2D::new(SHADOW_MAP_SIZE, SHADOW_MAP_SIZE);
        let mut expected = vec![shadow_extent; SHADOW_CASCADE_COUNT];
        expected.push(Extent2D::new(1280, 720));
        assert_eq!(extents, expected);

        let transforms: Vec<glam::Mat4> = early
            .iter()
            .filter_map(|c| match c {
                Command::DrawIndexed(call) => Some(call.transform),
                _ => None,
            })
            .collect();
        assert_eq!(transforms.len(), SHADOW_CASCADE_COUNT + 1);
        for (transform, cascade) in transforms.iter().zip(&cascades) {
            assert_eq!(*transform, cascade.view_proj * model);
        }
        assert_eq!(transforms[SHADOW_CASCADE_COUNT], model);
        renderer.submit().unwrap();
    }

    #[test]
    fn test_shadows_need_a_sun_and_the_option() {
        let mut point_lit = renderer(RendererConfig::default());
        point_lit.update(&view(1280, 720)).unwrap();
        assert!(point_lit.shadow_cascades().is_none());

        let mut disabled = renderer(RendererConfig::default().with_shadows(false));
        assert_eq!(disabled.frame_graph().passes_on(SubmitQueue::EarlyGraphics), vec!["clustering"]);
        let mut sunny = view(1280, 720);
        sunny.lights.push(Light::directional(Vec3::NEG_Y, Vec3::ONE));
        disabled.render_frame(&sunny).unwrap();
        assert!(disabled.shadow_cascades().is_none());
        let timings = disabled.frame_timings().unwrap();
        assert!(timings.get(GpuTimer::DepthPass).is_none());
        assert!(timings.get(GpuTimer::Clustering).is_some());
    }

    #[test]
    fn test_draw_before_update_is_rejected() {
        let mut renderer = renderer(RendererConfig::default());
        assert!(matches!(
            renderer.draw(&view(1280, 720)),
            Err(RendererError::OutOfOrder("draw"))
        ));
        assert!(matches!(renderer.submit(), Err(RendererError::OutOfOrder("submit"))));
    }

    #[test]
    fn test_clear_ends_graphics_submission() {
        let mut renderer = renderer(RendererConfig::default().with_gpu_timing(false));
        let view = view(1280, 720);
        renderer.update(&view).unwrap();
        renderer.draw(&view).unwrap();
        let commands = renderer.recorded.as_ref().unwrap().queue(SubmitQueue::Graphics).commands();

        let fills = commands.iter().filter(|c| matches!(c, Command::FillBuffer { .. })).count();
        assert_eq!(fills, 7);
        assert!(matches!(commands.last(), Some(Command::PipelineBarrier { .. })));
        let end = commands.iter().position(|c| matches!(c, Command::EndRenderPass)).unwrap();
        let first_fill = commands
            .iter()
            .position(|c| matches!(c, Command::FillBuffer { .. }))
            .unwrap();
        assert!(end < first_fill);
        assert!(matches!(commands[first_fill - 1], Command::PipelineBarrier { .. }));
        renderer.submit().unwrap();
    }

    #[test]
    fn test_slots_cycle_and_timings_available() {
        let mut renderer = renderer(RendererConfig::default().with_frames_in_flight(3));
        let view = view(640, 480);
        let mut slots = Vec::new();
        for _ in 0..4 {
            slots.push(renderer.frame_context().slot);
            renderer.render_frame(&view).unwrap();
        }
        assert_eq!(slots, vec![0, 1, 2, 0]);
        let timings = renderer.frame_timings().unwrap();
        assert_eq!(timings.frame_number, 3);
        for timer in GpuTimer::ALL {
            assert!(timings.get(timer).is_some(), "missing {}", timer.name());
        }
    }

    #[test]
    fn test_viewport_limits() {
        assert!(matches!(
            validate_viewport(1921, 1080),
            Err(RendererError::ViewportTooLarge { width: 1921, height: 1080 })
        ));
        assert!(matches!(validate_viewport(0, 10), Err(RendererError::EmptyViewport { .. })));
        assert_eq!(validate_viewport(1920, 1080).unwrap(), Extent2D::new(1920, 1080));

        let result = ClusterRenderer::new(
            SoftwareBackend::new(SoftwareConfig::default()),
            RendererConfig::default().with_viewport(2560, 1440),
        );
        assert!(matches!(result, Err(RendererError::ViewportTooLarge { .. })));
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut renderer = renderer(RendererConfig::default());
        renderer.render_frame(&view(800, 600)).unwrap();
        renderer.shutdown().unwrap();
        let stats = renderer.backend().stats();
        assert_eq!(stats.live_buffers, 0);
        assert_eq!(stats.live_images, 0);
        assert_eq!(stats.live_framebuffers, 0);
        assert_eq!(stats.live_render_passes, 0);
        assert!(matches!(renderer.update(&view(800, 600)), Err(RendererError::ShutDown)));
    }
}
