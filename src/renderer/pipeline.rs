//! Resource layouts, render passes and pipelines of the clustered renderer.

use crate::backend::{
    AccessFlags, AttachmentDescription, BackendResult, BindingKind, Extent2D, Format,
    FramebufferDescriptor, GraphicsBackend, GraphicsPipelineDescriptor, ImageDescriptor,
    ImageLayout, ImageUsage, LoadOp, PipelineHandle, PipelineStages, RenderPassDescriptor,
    RenderPassHandle, ResourceLayoutDescriptor, ResourceLayoutEntry, ResourceLayoutHandle,
    ShaderProgram, ShaderStages, StoreOp, SubpassDependency, SubpassDescription, VertexLayout,
    SUBPASS_EXTERNAL,
};
use crate::cluster::shaders::{
    CLUSTERING_FS, CLUSTERING_VS, FORWARD_FS, FORWARD_VS, SHADOW_FS, SHADOW_VS,
};
use crate::frame_graph::FramebufferTarget;

/// Size of the per-draw model matrix push constant
pub const PUSH_CONSTANT_SIZE: u32 = 64;

/// Number of bindings in the grid set
const GRID_BINDINGS: u32 = 7;

/// Create the two resource set layouts shared by every pipeline.
///
/// Set 0 holds the cluster uniforms and the two light arrays, set 1 the
/// seven grid buffers.
pub fn create_layouts<B: GraphicsBackend + ?Sized>(backend: &mut B) -> BackendResult<[ResourceLayoutHandle; 2]> {
    let all_stages = ShaderStages::VERTEX | ShaderStages::FRAGMENT | ShaderStages::COMPUTE;
    let frame = backend.create_resource_layout(&ResourceLayoutDescriptor {
        label: Some("cluster_frame".into()),
        entries: vec![
            ResourceLayoutEntry {
                binding: 0,
                kind: BindingKind::UniformBuffer,
                stages: all_stages,
            },
            ResourceLayoutEntry {
                binding: 1,
                kind: BindingKind::StorageBuffer,
                stages: ShaderStages::FRAGMENT | ShaderStages::COMPUTE,
            },
            ResourceLayoutEntry {
                binding: 2,
                kind: BindingKind::StorageBuffer,
                stages: ShaderStages::FRAGMENT | ShaderStages::COMPUTE,
            },
        ],
    })?;
    let grid = backend.create_resource_layout(&ResourceLayoutDescriptor {
        label: Some("cluster_grid".into()),
        entries: (0..GRID_BINDINGS)
            .map(|binding| ResourceLayoutEntry {
                binding,
                kind: BindingKind::StorageBuffer,
                stages: ShaderStages::FRAGMENT | ShaderStages::COMPUTE,
            })
            .collect(),
    })?;
    Ok([frame, grid])
}

/// Depth pass rendering one shadow cascade. The map is left readable by
/// fragment shaders of later passes.
pub fn shadow_render_pass(backend: &mut dyn GraphicsBackend, depth_format: Format) -> BackendResult<RenderPassHandle> {
    backend.create_render_pass(&RenderPassDescriptor {
        label: Some("shadow".into()),
        attachments: vec![AttachmentDescription {
            format: depth_format,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            initial_layout: ImageLayout::Undefined,
            final_layout: ImageLayout::ShaderReadOnly,
        }],
        subpasses: vec![SubpassDescription {
            color_attachments: Vec::new(),
            depth_attachment: Some(0),
        }],
        dependencies: vec![
            SubpassDependency {
                src_subpass: SUBPASS_EXTERNAL,
                dst_subpass: 0,
                src_stages: PipelineStages::FRAGMENT_SHADER,
                dst_stages: PipelineStages::EARLY_FRAGMENT_TESTS,
                src_access: AccessFlags::SHADER_READ,
                dst_access: AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            },
            SubpassDependency {
                src_subpass: 0,
                dst_subpass: SUBPASS_EXTERNAL,
                src_stages: PipelineStages::LATE_FRAGMENT_TESTS,
                dst_stages: PipelineStages::FRAGMENT_SHADER,
                src_access: AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dst_access: AccessFlags::SHADER_READ,
            },
        ],
    })
}

/// A sampled depth map and its framebuffer, for one cascade.
pub fn create_shadow_target(
    backend: &mut dyn GraphicsBackend,
    render_pass: RenderPassHandle,
    extent: Extent2D,
    depth_format: Format,
) -> BackendResult<FramebufferTarget> {
    let image = backend.create_image(&ImageDescriptor {
        label: Some("shadow_cascade".into()),
        extent,
        format: depth_format,
        usage: ImageUsage::DEPTH_STENCIL_ATTACHMENT | ImageUsage::SAMPLED,
    })?;
    let framebuffer = backend.create_framebuffer(&FramebufferDescriptor {
        label: Some("shadow_cascade".into()),
        render_pass,
        attachments: vec![image],
        extent,
    });
    match framebuffer {
        Ok(framebuffer) => Ok(FramebufferTarget {
            framebuffer,
            images: vec![image],
        }),
        Err(err) => {
            backend.destroy_image(image);
            Err(err)
        }
    }
}

/// Depth-only pass that flags the clusters covered by geometry.
///
/// The grid flags written by its fragment stage are read by compute on
/// another submission, which the queue semaphores order.
pub fn clustering_render_pass(backend: &mut dyn GraphicsBackend, depth_format: Format) -> BackendResult<RenderPassHandle> {
    backend.create_render_pass(&RenderPassDescriptor {
        label: Some("clustering".into()),
        attachments: vec![AttachmentDescription {
            format: depth_format,
            load_op: LoadOp::Clear,
            store_op: StoreOp::DontCare,
            initial_layout: ImageLayout::Undefined,
            final_layout: ImageLayout::DepthStencilAttachment,
        }],
        subpasses: vec![SubpassDescription {
            color_attachments: Vec::new(),
            depth_attachment: Some(0),
        }],
        dependencies: vec![SubpassDependency {
            src_subpass: SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stages: PipelineStages::TRANSFER,
            dst_stages: PipelineStages::FRAGMENT_SHADER,
            src_access: AccessFlags::TRANSFER_WRITE,
            dst_access: AccessFlags::SHADER_WRITE,
        }],
    })
}

/// Forward shading pass: one color target plus depth.
pub fn forward_render_pass(
    backend: &mut dyn GraphicsBackend,
    color_format: Format,
    depth_format: Format,
) -> BackendResult<RenderPassHandle> {
    backend.create_render_pass(&RenderPassDescriptor {
        label: Some("cluster_forward".into()),
        attachments: vec![
            AttachmentDescription {
                format: color_format,
                load_op: LoadOp::Clear,
                store_op: StoreOp::Store,
                initial_layout: ImageLayout::Undefined,
                final_layout: ImageLayout::TransferSrc,
            },
            AttachmentDescription {
                format: depth_format,
                load_op: LoadOp::Clear,
                store_op: StoreOp::DontCare,
                initial_layout: ImageLayout::Undefined,
                final_layout: ImageLayout::DepthStencilAttachment,
            },
        ],
        subpasses: vec![SubpassDescription {
            color_attachments: vec![0],
            depth_attachment: Some(1),
        }],
        dependencies: vec![SubpassDependency {
            src_subpass: SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stages: PipelineStages::COMPUTE_SHADER,
            dst_stages: PipelineStages::FRAGMENT_SHADER,
            src_access: AccessFlags::SHADER_WRITE,
            dst_access: AccessFlags::SHADER_READ,
        }],
    })
}

/// Create viewport-sized attachments for `formats` and a framebuffer over them.
pub fn create_target(
    backend: &mut dyn GraphicsBackend,
    label: &str,
    render_pass: RenderPassHandle,
    extent: Extent2D,
    formats: &[Format],
) -> BackendResult<FramebufferTarget> {
    let mut images = Vec::with_capacity(formats.len());
    for (i, &format) in formats.iter().enumerate() {
        let usage = if format.is_depth() {
            ImageUsage::DEPTH_STENCIL_ATTACHMENT
        } else {
            ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC
        };
        let image = backend.create_image(&ImageDescriptor {
            label: Some(format!("{label}_attachment{i}")),
            extent,
            format,
            usage,
        });
        match image {
            Ok(image) => images.push(image),
            Err(err) => {
                for image in images {
                    backend.destroy_image(image);
                }
                return Err(err);
            }
        }
    }
    let framebuffer = backend.create_framebuffer(&FramebufferDescriptor {
        label: Some(label.to_string()),
        render_pass,
        attachments: images.clone(),
        extent,
    });
    match framebuffer {
        Ok(framebuffer) => Ok(FramebufferTarget { framebuffer, images }),
        Err(err) => {
            for image in images {
                backend.destroy_image(image);
            }
            Err(err)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PipelineState {
    color_attachment_count: u32,
    depth_write: bool,
    alpha_blend: bool,
}

fn graphics_pipeline(
    backend: &mut dyn GraphicsBackend,
    layouts: [ResourceLayoutHandle; 2],
    render_pass: RenderPassHandle,
    subpass: u32,
    (vertex, fragment): (ShaderProgram, ShaderProgram),
    state: PipelineState,
) -> BackendResult<PipelineHandle> {
    backend.create_graphics_pipeline(&GraphicsPipelineDescriptor {
        label: Some(format!("{}{}", fragment.label, if state.alpha_blend { "_blend" } else { "" })),
        vertex,
        fragment,
        vertex_layout: VertexLayout::position_normal(),
        layouts: layouts.to_vec(),
        render_pass,
        subpass,
        color_attachment_count: state.color_attachment_count,
        depth_test: true,
        depth_write: state.depth_write,
        alpha_blend: state.alpha_blend,
        push_constant_size: PUSH_CONSTANT_SIZE,
    })
}

/// Depth-only pipeline of the shadow pass. The push constant carries the
/// cascade's view-projection times the model matrix.
pub fn shadow_pipelines(
    backend: &mut dyn GraphicsBackend,
    layouts: [ResourceLayoutHandle; 2],
    render_pass: RenderPassHandle,
    subpass: u32,
) -> BackendResult<Vec<PipelineHandle>> {
    let pipeline = graphics_pipeline(
        backend,
        layouts,
        render_pass,
        subpass,
        (SHADOW_VS, SHADOW_FS),
        PipelineState {
            color_attachment_count: 0,
            depth_write: true,
            alpha_blend: false,
        },
    )?;
    Ok(vec![pipeline])
}

/// The depth-only pipeline that flags clusters.
pub fn clustering_pipelines(
    backend: &mut dyn GraphicsBackend,
    layouts: [ResourceLayoutHandle; 2],
    render_pass: RenderPassHandle,
    subpass: u32,
) -> BackendResult<Vec<PipelineHandle>> {
    let pipeline = graphics_pipeline(
        backend,
        layouts,
        render_pass,
        subpass,
        (CLUSTERING_VS, CLUSTERING_FS),
        PipelineState {
            color_attachment_count: 0,
            depth_write: true,
            alpha_blend: false,
        },
    )?;
    Ok(vec![pipeline])
}

/// Index of the opaque pipeline in [`forward_pipelines`]
pub const FORWARD_OPAQUE: usize = 0;
/// Index of the blended pipeline in [`forward_pipelines`]
pub const FORWARD_TRANSLUCENT: usize = 1;

/// Opaque and translucent forward shading pipelines.
pub fn forward_pipelines(
    backend: &mut dyn GraphicsBackend,
    layouts: [ResourceLayoutHandle; 2],
    render_pass: RenderPassHandle,
    subpass: u32,
) -> BackendResult<Vec<PipelineHandle>> {
    let opaque = graphics_pipeline(
        backend,
        layouts,
        render_pass,
        subpass,
        (FORWARD_VS, FORWARD_FS),
        PipelineState {
            color_attachment_count: 1,
            depth_write: true,
            alpha_blend: false,
        },
    )?;
    let translucent = graphics_pipeline(
        backend,
        layouts,
        render_pass,
        subpass,
        (FORWARD_VS, FORWARD_FS),
        PipelineState {
            color_attachment_count: 1,
            depth_write: false,
            alpha_blend: true,
        },
    )?;
    Ok(vec![opaque, translucent])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SoftwareBackend, SoftwareConfig};

    #[test]
    fn test_forward_target_lifecycle() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let layouts = create_layouts(&mut backend).unwrap();
        let render_pass = forward_render_pass(&mut backend, Format::Rgba8Unorm, Format::Depth32Float).unwrap();
        let pipelines = forward_pipelines(&mut backend, layouts, render_pass, 0).unwrap();
        assert_eq!(pipelines.len(), 2);

        let extent = Extent2D::new(320, 200);
        let target = create_target(
            &mut backend,
            "forward",
            render_pass,
            extent,
            &[Format::Rgba8Unorm, Format::Depth32Float],
        )
        .unwrap();
        assert_eq!(target.images.len(), 2);
        assert_eq!(backend.image_extent(target.images[0]), Some(extent));
        assert_eq!(backend.stats().live_images, 2);

        target.destroy(&mut backend);
        assert_eq!(backend.stats().live_images, 0);
        assert_eq!(backend.stats().live_framebuffers, 0);
    }

    #[test]
    fn test_shadow_target_is_sampled_depth() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let layouts = create_layouts(&mut backend).unwrap();
        let render_pass = shadow_render_pass(&mut backend, Format::Depth32Float).unwrap();
        assert_eq!(shadow_pipelines(&mut backend, layouts, render_pass, 0).unwrap().len(), 1);

        let extent = Extent2D::new(2048, 2048);
        let target = create_shadow_target(&mut backend, render_pass, extent, Format::Depth32Float).unwrap();
        assert_eq!(target.images.len(), 1);
        assert_eq!(backend.image_extent(target.images[0]), Some(extent));
        target.destroy(&mut backend);
        assert_eq!(backend.stats().live_images, 0);
    }

    #[test]
    fn test_attachment_count_mismatch_leaks_nothing() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let render_pass = clustering_render_pass(&mut backend, Format::Depth32Float).unwrap();
        let result = create_target(
            &mut backend,
            "clustering",
            render_pass,
            Extent2D::new(64, 64),
            &[Format::Depth32Float, Format::Depth32Float],
        );
        assert!(result.is_err());
        assert_eq!(backend.stats().live_images, 0);
    }
}
