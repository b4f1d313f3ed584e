//! Render passes, descriptor layouts and pipeline state objects.

use std::ffi::CString;

use ash::vk;

use crate::backend::{
    BackendError, BackendResult, ComputePipelineDescriptor, GraphicsPipelineDescriptor,
    RenderPassDescriptor, ResourceLayoutDescriptor,
};

use super::convert;
use super::shader::ShaderCache;

/// Storage buffer descriptors per pool
const POOL_STORAGE_BUFFERS: u32 = 256;
/// Uniform buffer descriptors per pool
const POOL_UNIFORM_BUFFERS: u32 = 64;
const POOL_MAX_SETS: u32 = 64;

/// A pipeline and the layout its resource sets are bound with.
#[derive(Debug, Clone, Copy)]
pub struct VkPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
    pub set_count: u32,
    pub push_constant_size: u32,
}

impl VkPipeline {
    /// # Safety
    /// The pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

pub fn create_render_pass(
    device: &ash::Device,
    desc: &RenderPassDescriptor,
) -> BackendResult<vk::RenderPass> {
    let attachments: Vec<_> = desc
        .attachments
        .iter()
        .map(|a| {
            vk::AttachmentDescription::default()
                .format(convert::format(a.format))
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(convert::load_op(a.load_op))
                .store_op(convert::store_op(a.store_op))
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(convert::image_layout(a.initial_layout))
                .final_layout(convert::image_layout(a.final_layout))
        })
        .collect();

    // References must outlive the subpass descriptions pointing at them.
    let color_refs: Vec<Vec<vk::AttachmentReference>> = desc
        .subpasses
        .iter()
        .map(|s| {
            s.color_attachments
                .iter()
                .map(|&attachment| vk::AttachmentReference {
                    attachment,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                })
                .collect()
        })
        .collect();
    let depth_refs: Vec<Option<vk::AttachmentReference>> = desc
        .subpasses
        .iter()
        .map(|s| {
            s.depth_attachment.map(|attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            })
        })
        .collect();
    let subpasses: Vec<_> = color_refs
        .iter()
        .zip(&depth_refs)
        .map(|(colors, depth)| {
            let subpass = vk::SubpassDescription::default()
                .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                .color_attachments(colors);
            match depth {
                Some(depth) => subpass.depth_stencil_attachment(depth),
                None => subpass,
            }
        })
        .collect();

    let dependencies: Vec<_> = desc
        .dependencies
        .iter()
        .map(|d| {
            vk::SubpassDependency::default()
                .src_subpass(convert::subpass_index(d.src_subpass))
                .dst_subpass(convert::subpass_index(d.dst_subpass))
                .src_stage_mask(convert::pipeline_stages(d.src_stages))
                .dst_stage_mask(convert::pipeline_stages(d.dst_stages))
                .src_access_mask(convert::access_flags(d.src_access))
                .dst_access_mask(convert::access_flags(d.dst_access))
        })
        .collect();

    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.create_render_pass(&create_info, None) }.map_err(|e| {
        BackendError::RenderPassCreationFailed(format!(
            "{}: {e:?}",
            desc.label.as_deref().unwrap_or("render pass")
        ))
    })
}

pub fn create_set_layout(
    device: &ash::Device,
    desc: &ResourceLayoutDescriptor,
) -> BackendResult<vk::DescriptorSetLayout> {
    let bindings: Vec<_> = desc
        .entries
        .iter()
        .map(|entry| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(entry.binding)
                .descriptor_type(convert::descriptor_type(entry.kind))
                .descriptor_count(1)
                .stage_flags(convert::shader_stages(entry.stages))
        })
        .collect();
    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    unsafe { device.create_descriptor_set_layout(&create_info, None) }.map_err(|e| {
        BackendError::ResourceSetCreationFailed(format!(
            "{}: failed to create layout: {e:?}",
            desc.label.as_deref().unwrap_or("resource layout")
        ))
    })
}

/// Grows by whole pools; sets are never freed individually.
#[derive(Default)]
pub struct DescriptorAllocator {
    pools: Vec<vk::DescriptorPool>,
}

impl DescriptorAllocator {
    fn new_pool(&mut self, device: &ash::Device) -> BackendResult<vk::DescriptorPool> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: POOL_UNIFORM_BUFFERS,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: POOL_STORAGE_BUFFERS,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(POOL_MAX_SETS)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }.map_err(|e| {
            BackendError::ResourceSetCreationFailed(format!("Failed to create descriptor pool: {e:?}"))
        })?;
        self.pools.push(pool);
        Ok(pool)
    }

    pub fn allocate(
        &mut self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
    ) -> BackendResult<vk::DescriptorSet> {
        let layouts = [layout];
        if let Some(&pool) = self.pools.last() {
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(&layouts);
            match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
                Ok(sets) => return first_set(sets),
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {}
                Err(e) => {
                    return Err(BackendError::ResourceSetCreationFailed(format!(
                        "Failed to allocate descriptor set: {e:?}"
                    )))
                }
            }
        }

        let pool = self.new_pool(device)?;
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { device.allocate_descriptor_sets(&alloc_info) }.map_err(|e| {
            BackendError::ResourceSetCreationFailed(format!("Failed to allocate descriptor set: {e:?}"))
        })?;
        first_set(sets)
    }

    /// # Safety
    /// No set allocated here may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for pool in self.pools.drain(..) {
            device.destroy_descriptor_pool(pool, None);
        }
    }
}

fn first_set(sets: Vec<vk::DescriptorSet>) -> BackendResult<vk::DescriptorSet> {
    sets.into_iter()
        .next()
        .ok_or_else(|| BackendError::ResourceSetCreationFailed("No descriptor set allocated".into()))
}

fn create_pipeline_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_size: u32,
) -> BackendResult<vk::PipelineLayout> {
    let push_ranges = [vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX,
        offset: 0,
        size: push_constant_size,
    }];
    let create_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(if push_constant_size > 0 { &push_ranges[..] } else { &[] });
    unsafe { device.create_pipeline_layout(&create_info, None) }.map_err(|e| {
        BackendError::PipelineCreationFailed(format!("Failed to create pipeline layout: {e:?}"))
    })
}

fn entry_name(entry_point: &str) -> BackendResult<CString> {
    CString::new(entry_point)
        .map_err(|e| BackendError::PipelineCreationFailed(format!("Invalid entry point name: {e}")))
}

pub fn create_compute_pipeline(
    device: &ash::Device,
    shaders: &mut ShaderCache,
    desc: &ComputePipelineDescriptor,
    set_layouts: &[vk::DescriptorSetLayout],
) -> BackendResult<VkPipeline> {
    let module = shaders.get_or_create(device, &desc.program, naga::ShaderStage::Compute)?;
    let name = entry_name(desc.program.entry_point)?;
    let layout = create_pipeline_layout(device, set_layouts, 0)?;

    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(&name);
    let create_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage)
        .layout(layout);

    let pipeline = unsafe {
        device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
    }
    .map_err(|(_, e)| e)
    .and_then(|pipelines| pipelines.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN));

    match pipeline {
        Ok(pipeline) => Ok(VkPipeline {
            pipeline,
            layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
            set_count: set_layouts.len() as u32,
            push_constant_size: 0,
        }),
        Err(e) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(BackendError::PipelineCreationFailed(format!(
                "{}: {e:?}",
                desc.label.as_deref().unwrap_or(desc.program.label)
            )))
        }
    }
}

pub fn create_graphics_pipeline(
    device: &ash::Device,
    shaders: &mut ShaderCache,
    desc: &GraphicsPipelineDescriptor,
    set_layouts: &[vk::DescriptorSetLayout],
    render_pass: vk::RenderPass,
) -> BackendResult<VkPipeline> {
    let vertex_module = shaders.get_or_create(device, &desc.vertex, naga::ShaderStage::Vertex)?;
    let fragment_module = shaders.get_or_create(device, &desc.fragment, naga::ShaderStage::Fragment)?;
    let vertex_name = entry_name(desc.vertex.entry_point)?;
    let fragment_name = entry_name(desc.fragment.entry_point)?;
    let layout = create_pipeline_layout(device, set_layouts, desc.push_constant_size)?;

    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_module)
            .name(&vertex_name),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment_module)
            .name(&fragment_name),
    ];

    let vertex_bindings = [vk::VertexInputBindingDescription {
        binding: 0,
        stride: desc.vertex_layout.stride,
        input_rate: vk::VertexInputRate::VERTEX,
    }];
    let vertex_attributes: Vec<_> = desc
        .vertex_layout
        .attributes
        .iter()
        .map(|a| vk::VertexInputAttributeDescription {
            location: a.location,
            binding: 0,
            format: convert::vertex_format(a.format),
            offset: a.offset,
        })
        .collect();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&vertex_bindings)
        .vertex_attribute_descriptions(&vertex_attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(desc.depth_test)
        .depth_write_enable(desc.depth_write)
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);

    let blend_attachment = if desc.alpha_blend {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    } else {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    };
    let blend_attachments = vec![blend_attachment; desc.color_attachment_count as usize];
    let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let create_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(desc.subpass);

    let pipeline = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
    }
    .map_err(|(_, e)| e)
    .and_then(|pipelines| pipelines.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN));

    match pipeline {
        Ok(pipeline) => Ok(VkPipeline {
            pipeline,
            layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            set_count: set_layouts.len() as u32,
            push_constant_size: desc.push_constant_size,
        }),
        Err(e) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(BackendError::PipelineCreationFailed(format!(
                "{}: {e:?}",
                desc.label.as_deref().unwrap_or(desc.fragment.label)
            )))
        }
    }
}
