//! Frame graph: an ordered list of passes recorded into per-queue command lists.

use thiserror::Error;

use crate::backend::{BackendError, Extent2D, FrameCommands, GraphicsBackend, SubmitQueue};
use crate::frame_graph::pass::{GraphicsPass, Pass};
use crate::frame_graph::{FrameContext, PassContext};
use crate::scene::RenderView;

/// Errors raised while creating the objects of a pass
#[derive(Error, Debug)]
pub enum FrameGraphError {
    #[error("pass '{pass}': failed to create render pass: {source}")]
    RenderPass { pass: String, source: BackendError },
    #[error("pass '{pass}': failed to create framebuffer: {source}")]
    Framebuffer { pass: String, source: BackendError },
    #[error("pass '{pass}': failed to create pipelines of subpass {subpass}: {source}")]
    Pipeline {
        pass: String,
        subpass: u32,
        source: BackendError,
    },
    #[error("a pass named '{0}' already exists")]
    DuplicatePass(String),
}

pub type FrameGraphResult<T> = Result<T, FrameGraphError>;

/// Passes in recording order.
///
/// `D` is the renderer's per-frame data, handed to every pass callback.
pub struct FrameGraph<D> {
    passes: Vec<Pass<D>>,
}

impl<D> Default for FrameGraph<D> {
    fn default() -> Self {
        Self { passes: Vec::new() }
    }
}

impl<D> FrameGraph<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pass. Pass names must be unique.
    pub fn add_pass(&mut self, pass: impl Into<Pass<D>>) -> FrameGraphResult<usize> {
        let pass = pass.into();
        if self.pass(pass.name()).is_some() {
            return Err(FrameGraphError::DuplicatePass(pass.name().to_string()));
        }
        log::debug!("Added pass '{}' on {} queue", pass.name(), pass.queue().name());
        self.passes.push(pass);
        Ok(self.passes.len() - 1)
    }

    pub fn passes(&self) -> &[Pass<D>] {
        &self.passes
    }

    pub fn pass(&self, name: &str) -> Option<&Pass<D>> {
        self.passes.iter().find(|p| p.name() == name)
    }

    /// Names of the passes that run on `queue`, in order.
    pub fn passes_on(&self, queue: SubmitQueue) -> Vec<&str> {
        self.passes
            .iter()
            .filter(|p| p.queue() == queue)
            .map(|p| p.name())
            .collect()
    }

    /// Create every render pass, framebuffer and pipeline up front.
    ///
    /// Callers treat an error as fatal: it names the pass that failed.
    pub fn prepare(&mut self, backend: &mut dyn GraphicsBackend, extent: Extent2D) -> FrameGraphResult<()> {
        for pass in &mut self.passes {
            if let Pass::Graphics(pass) = pass {
                Self::ensure_created(pass, backend, extent)?;
            }
        }
        log::info!("Prepared frame graph with {} passes", self.passes.len());
        Ok(())
    }

    fn ensure_created(
        pass: &mut GraphicsPass<D>,
        backend: &mut dyn GraphicsBackend,
        extent: Extent2D,
    ) -> FrameGraphResult<()> {
        let render_pass = match pass.render_pass {
            Some(render_pass) => render_pass,
            None => {
                let render_pass = (pass.create_render_pass)(backend).map_err(|source| {
                    FrameGraphError::RenderPass {
                        pass: pass.name.clone(),
                        source,
                    }
                })?;
                log::debug!("Created render pass for '{}'", pass.name);
                pass.render_pass = Some(render_pass);
                render_pass
            }
        };

        for (index, subpass) in pass.subpasses.iter_mut().enumerate() {
            if subpass.pipelines.is_some() {
                continue;
            }
            let pipelines = (subpass.create_pipelines)(backend, render_pass, index as u32).map_err(
                |source| FrameGraphError::Pipeline {
                    pass: pass.name.clone(),
                    subpass: index as u32,
                    source,
                },
            )?;
            subpass.pipelines = Some(pipelines);
        }

        if pass.targets.is_empty() {
            let extent = pass.extent.unwrap_or(extent);
            let mut targets = Vec::with_capacity(pass.layers as usize);
            for _ in 0..pass.layers {
                match (pass.create_framebuffer)(backend, render_pass, extent) {
                    Ok(target) => targets.push(target),
                    Err(source) => {
                        for target in targets {
                            target.destroy(backend);
                        }
                        return Err(FrameGraphError::Framebuffer {
                            pass: pass.name.clone(),
                            source,
                        });
                    }
                }
            }
            log::debug!(
                "Created {} {}x{} framebuffer(s) for '{}'",
                targets.len(),
                extent.width,
                extent.height,
                pass.name
            );
            pass.targets = targets;
        }
        Ok(())
    }

    /// Record every pass into the command list of its queue.
    ///
    /// Begin callbacks run before the render pass begins, end callbacks after
    /// it ends. Missing framebuffers are created on the way.
    pub fn record(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        frame: &FrameContext,
        view: &RenderView,
        data: &D,
    ) -> FrameGraphResult<FrameCommands> {
        let mut commands = FrameCommands::new();
        for pass in &mut self.passes {
            match pass {
                Pass::Graphics(pass) => {
                    Self::ensure_created(pass, backend, frame.extent)?;
                    let Some(render_pass) = pass.render_pass else {
                        continue;
                    };
                    if pass.targets.is_empty() {
                        continue;
                    }
                    let extent = pass.extent.unwrap_or(frame.extent);
                    let mut ctx = PassContext {
                        frame,
                        view,
                        data,
                        commands: commands.queue_mut(pass.queue),
                        layer: 0,
                    };
                    if let Some(on_begin) = pass.on_begin.as_mut() {
                        on_begin(&mut ctx);
                    }
                    for (layer, target) in pass.targets.iter().enumerate() {
                        ctx.layer = layer as u32;
                        ctx.commands.begin_render_pass(
                            render_pass,
                            target.framebuffer,
                            extent,
                            pass.clear_values.clone(),
                        );
                        ctx.commands.set_viewport(extent);
                        for (index, subpass) in pass.subpasses.iter_mut().enumerate() {
                            if index > 0 {
                                ctx.commands.next_subpass();
                            }
                            let pipelines = subpass.pipelines.as_deref().unwrap_or(&[]);
                            (subpass.record)(&mut ctx, pipelines);
                        }
                        ctx.commands.end_render_pass();
                    }
                    ctx.layer = 0;
                    if let Some(on_end) = pass.on_end.as_mut() {
                        on_end(&mut ctx);
                    }
                }
                Pass::Compute(pass) => {
                    let mut ctx = PassContext {
                        frame,
                        view,
                        data,
                        commands: commands.queue_mut(pass.queue),
                        layer: 0,
                    };
                    if let Some(on_begin) = pass.on_begin.as_mut() {
                        on_begin(&mut ctx);
                    }
                    (pass.record)(&mut ctx);
                    if let Some(on_end) = pass.on_end.as_mut() {
                        on_end(&mut ctx);
                    }
                }
            }
        }
        log::trace!("Recorded frame {} into slot {}", frame.frame_number, frame.slot);
        Ok(commands)
    }

    /// Drop every viewport-sized framebuffer and its images; they are
    /// recreated at the new extent the next time the pass records.
    pub fn resize(&mut self, backend: &mut dyn GraphicsBackend) {
        self.release_targets(backend, false);
    }

    fn release_targets(&mut self, backend: &mut dyn GraphicsBackend, fixed: bool) {
        for pass in &mut self.passes {
            if let Pass::Graphics(pass) = pass {
                if pass.extent.is_some() && !fixed {
                    continue;
                }
                for target in pass.targets.drain(..) {
                    target.destroy(backend);
                }
            }
        }
    }

    /// Destroy framebuffers, images and render passes.
    pub fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        self.release_targets(backend, true);
        for pass in &mut self.passes {
            if let Pass::Graphics(pass) = pass {
                if let Some(render_pass) = pass.render_pass.take() {
                    backend.destroy_render_pass(render_pass);
                }
                for subpass in &mut pass.subpasses {
                    subpass.pipelines = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::*;
    use crate::frame_graph::{ComputePass, FramebufferTarget, Subpass};
    use crate::scene::Camera;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn color_pass(backend: &mut dyn GraphicsBackend) -> BackendResult<RenderPassHandle> {
        backend.create_render_pass(&RenderPassDescriptor {
            label: Some("test".into()),
            attachments: vec![AttachmentDescription {
                format: Format::Rgba8Unorm,
                load_op: LoadOp::Clear,
                store_op: StoreOp::Store,
                initial_layout: ImageLayout::Undefined,
                final_layout: ImageLayout::ColorAttachment,
            }],
            subpasses: vec![SubpassDescription {
                color_attachments: vec![0],
                depth_attachment: None,
            }],
            dependencies: Vec::new(),
        })
    }

    fn color_target(
        backend: &mut dyn GraphicsBackend,
        render_pass: RenderPassHandle,
        extent: Extent2D,
    ) -> BackendResult<FramebufferTarget> {
        let image = backend.create_image(&ImageDescriptor {
            label: None,
            extent,
            format: Format::Rgba8Unorm,
            usage: ImageUsage::COLOR_ATTACHMENT,
        })?;
        let framebuffer = backend.create_framebuffer(&FramebufferDescriptor {
            label: None,
            render_pass,
            attachments: vec![image],
            extent,
        })?;
        Ok(FramebufferTarget {
            framebuffer,
            images: vec![image],
        })
    }

    fn frame(backend: &SoftwareBackend, extent: Extent2D) -> FrameContext {
        FrameContext::new(backend.capabilities(), 2, extent)
    }

    #[test]
    fn test_callbacks_bracket_render_pass() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let mut graph: FrameGraph<()> = FrameGraph::new();
        let pool = backend.create_query_pool(2).unwrap();
        graph
            .add_pass(
                GraphicsPass::new("main", SubmitQueue::Graphics, color_pass, color_target)
                    .with_subpass(Subpass::new(|_, _, _| Ok(Vec::new()), |_, _| {}))
                    .on_begin(move |ctx| ctx.commands.write_timestamp(PipelineStages::TOP_OF_PIPE, pool, 0))
                    .on_end(move |ctx| ctx.commands.write_timestamp(PipelineStages::BOTTOM_OF_PIPE, pool, 1)),
            )
            .unwrap();

        let extent = Extent2D::new(64, 64);
        graph.prepare(&mut backend, extent).unwrap();
        let view = RenderView::new(Camera::default(), 64, 64);
        let frame_ctx = frame(&backend, extent);
        let commands = graph.record(&mut backend, &frame_ctx, &view, &()).unwrap();

        let list = commands.queue(SubmitQueue::Graphics).commands();
        assert!(matches!(list[0], Command::WriteTimestamp { query: 0, .. }));
        assert!(matches!(list[1], Command::BeginRenderPass { .. }));
        assert!(matches!(list[list.len() - 2], Command::EndRenderPass));
        assert!(matches!(list[list.len() - 1], Command::WriteTimestamp { query: 1, .. }));
        assert!(commands.queue(SubmitQueue::Compute).is_empty());
        backend.submit(SubmitQueue::Graphics, commands.queue(SubmitQueue::Graphics)).unwrap();
    }

    #[test]
    fn test_passes_record_into_their_queue() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let mut graph: FrameGraph<u32> = FrameGraph::new();
        graph
            .add_pass(ComputePass::new("cull", SubmitQueue::Compute, |ctx: &mut PassContext<'_, u32>| {
                ctx.commands.dispatch(*ctx.data, 1, 1)
            }))
            .unwrap();
        graph
            .add_pass(GraphicsPass::new("early", SubmitQueue::EarlyGraphics, color_pass, color_target))
            .unwrap();
        assert_eq!(graph.passes_on(SubmitQueue::Compute), vec!["cull"]);

        let extent = Extent2D::new(32, 32);
        let view = RenderView::new(Camera::default(), 32, 32);
        let frame_ctx = frame(&backend, extent);
        let commands = graph.record(&mut backend, &frame_ctx, &view, &7).unwrap();
        assert_eq!(commands.queue(SubmitQueue::Compute).dispatches(), vec![[7, 1, 1]]);
        assert!(!commands.queue(SubmitQueue::EarlyGraphics).is_empty());
        assert!(commands.queue(SubmitQueue::Graphics).is_empty());
    }

    #[test]
    fn test_layered_pass_keeps_fixed_targets_across_resize() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let mut graph: FrameGraph<()> = FrameGraph::new();
        let fixed = Extent2D::new(256, 256);
        graph
            .add_pass(
                GraphicsPass::new("layers", SubmitQueue::EarlyGraphics, color_pass, color_target)
                    .with_extent(fixed)
                    .with_layers(3)
                    .with_subpass(Subpass::new(
                        |_, _, _| Ok(Vec::new()),
                        |ctx: &mut PassContext<'_, ()>, _| ctx.commands.dispatch(ctx.layer, 0, 0),
                    )),
            )
            .unwrap();
        graph
            .add_pass(GraphicsPass::new("main", SubmitQueue::Graphics, color_pass, color_target))
            .unwrap();
        graph.prepare(&mut backend, Extent2D::new(64, 64)).unwrap();
        assert_eq!(backend.stats().live_framebuffers, 4);

        let view = RenderView::new(Camera::default(), 64, 64);
        let frame_ctx = frame(&backend, Extent2D::new(64, 64));
        let commands = graph
            .record(&mut backend, &frame_ctx, &view, &())
            .unwrap();
        let list = commands.queue(SubmitQueue::EarlyGraphics);
        let extents: Vec<Extent2D> = list
            .iter()
            .filter_map(|c| match c {
                Command::BeginRenderPass { extent, .. } => Some(*extent),
                _ => None,
            })
            .collect();
        assert_eq!(extents, vec![fixed; 3]);
        assert_eq!(list.dispatches(), vec![[0, 0, 0], [1, 0, 0], [2, 0, 0]]);

        let layers = graph.pass("layers").and_then(Pass::as_graphics).unwrap();
        let before = layers.targets().to_vec();
        graph.resize(&mut backend);
        assert_eq!(backend.stats().live_framebuffers, 3);
        let layers = graph.pass("layers").and_then(Pass::as_graphics).unwrap();
        assert_eq!(layers.targets(), &before[..]);

        graph.destroy(&mut backend);
        assert_eq!(backend.stats().live_framebuffers, 0);
        assert_eq!(backend.stats().live_images, 0);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut graph: FrameGraph<()> = FrameGraph::new();
        graph.add_pass(ComputePass::new("a", SubmitQueue::Compute, |_| {})).unwrap();
        assert!(matches!(
            graph.add_pass(ComputePass::new("a", SubmitQueue::Compute, |_| {})),
            Err(FrameGraphError::DuplicatePass(_))
        ));
    }

    #[test]
    fn test_creation_failure_names_the_pass() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let mut graph: FrameGraph<()> = FrameGraph::new();
        graph
            .add_pass(GraphicsPass::new(
                "broken",
                SubmitQueue::Graphics,
                |backend: &mut dyn GraphicsBackend| backend.create_render_pass(&RenderPassDescriptor::default()),
                color_target,
            ))
            .unwrap();
        let err = graph.prepare(&mut backend, Extent2D::new(8, 8)).unwrap_err();
        assert!(matches!(&err, FrameGraphError::RenderPass { pass, .. } if pass == "broken"));
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_render_pass_and_pipelines_created_once() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let mut graph: FrameGraph<()> = FrameGraph::new();
        graph
            .add_pass(
                GraphicsPass::new("main", SubmitQueue::Graphics, color_pass, color_target).with_subpass(
                    Subpass::new(
                        move |_, _, _| {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(Vec::new())
                        },
                        |_, _| {},
                    ),
                ),
            )
            .unwrap();

        let extent = Extent2D::new(16, 16);
        let view = RenderView::new(Camera::default(), 16, 16);
        graph.prepare(&mut backend, extent).unwrap();
        for _ in 0..3 {
            let frame_ctx = frame(&backend, extent);
            graph.record(&mut backend, &frame_ctx, &view, &()).unwrap();
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(backend.stats().live_render_passes, 1);
        assert_eq!(backend.stats().live_framebuffers, 1);
    }

    #[test]
    fn test_resize_recreates_framebuffer_lazily() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let mut graph: FrameGraph<()> = FrameGraph::new();
        graph
            .add_pass(GraphicsPass::new("main", SubmitQueue::Graphics, color_pass, color_target))
            .unwrap();
        graph.prepare(&mut backend, Extent2D::new(64, 64)).unwrap();
        let before = graph.pass("main").and_then(Pass::as_graphics).and_then(GraphicsPass::framebuffer);

        graph.resize(&mut backend);
        assert_eq!(backend.stats().live_framebuffers, 0);
        assert_eq!(backend.stats().live_images, 0);

        let extent = Extent2D::new(32, 16);
        let view = RenderView::new(Camera::default(), 32, 16);
        let frame_ctx = frame(&backend, extent);
        graph.record(&mut backend, &frame_ctx, &view, &()).unwrap();
        let after = graph.pass("main").and_then(Pass::as_graphics).and_then(GraphicsPass::framebuffer);
        assert!(after.is_some());
        assert_ne!(before, after);
        assert_eq!(backend.stats().live_framebuffers, 1);

        graph.destroy(&mut backend);
        let stats = backend.stats();
        assert_eq!((stats.live_framebuffers, stats.live_images, stats.live_render_passes), (0, 0, 0));
    }
}
