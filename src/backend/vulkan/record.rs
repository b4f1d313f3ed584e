//! Replays a [`CommandList`] into a Vulkan command buffer.

use ash::vk;

use crate::backend::{BackendResult, Command, CommandList, DrawCall, Extent2D};

use super::convert;
use super::pipeline::VkPipeline;
use super::Objects;

/// Highest resource set index the renderer binds.
const MAX_SETS: usize = 4;

struct RecordState {
    pipeline: Option<VkPipeline>,
    sets: [Option<vk::DescriptorSet>; MAX_SETS],
    /// Sets changed since the last bind.
    dirty: bool,
}

/// Record `commands` into `command_buffer`.
///
/// Resource sets may be bound before the pipeline that uses them, so binding
/// is deferred to the next dispatch or draw. Timestamp commands are skipped
/// when the queue family has no valid timestamp bits.
pub fn record_commands(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    commands: &CommandList,
    objects: &Objects,
    timestamps: bool,
) -> BackendResult<()> {
    let mut state = RecordState {
        pipeline: None,
        sets: [None; MAX_SETS],
        dirty: false,
    };

    for command in commands {
        match command {
            Command::PipelineBarrier {
                src_stages,
                dst_stages,
                buffers,
            } => {
                let barriers = buffers
                    .iter()
                    .map(|b| {
                        let buffer = objects.buffer(b.buffer)?;
                        let (src_family, dst_family) = if b.is_ownership_transfer() {
                            (
                                convert::queue_family(b.src_queue_family),
                                convert::queue_family(b.dst_queue_family),
                            )
                        } else {
                            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
                        };
                        Ok(vk::BufferMemoryBarrier::default()
                            .buffer(buffer.buffer)
                            .offset(b.offset)
                            .size(b.size.unwrap_or(vk::WHOLE_SIZE))
                            .src_access_mask(convert::access_flags(b.src_access))
                            .dst_access_mask(convert::access_flags(b.dst_access))
                            .src_queue_family_index(src_family)
                            .dst_queue_family_index(dst_family))
                    })
                    .collect::<BackendResult<Vec<_>>>()?;
                unsafe {
                    device.cmd_pipeline_barrier(
                        command_buffer,
                        convert::pipeline_stages(*src_stages),
                        convert::pipeline_stages(*dst_stages),
                        vk::DependencyFlags::empty(),
                        &[],
                        &barriers,
                        &[],
                    );
                }
            }
            Command::FillBuffer {
                buffer,
                offset,
                size,
                value,
            } => {
                let buffer = objects.buffer(*buffer)?;
                unsafe {
                    device.cmd_fill_buffer(
                        command_buffer,
                        buffer.buffer,
                        *offset,
                        size.unwrap_or(vk::WHOLE_SIZE),
                        *value,
                    );
                }
            }
            Command::BindPipeline(handle) => {
                let pipeline = *objects.pipeline(*handle)?;
                unsafe {
                    device.cmd_bind_pipeline(command_buffer, pipeline.bind_point, pipeline.pipeline);
                }
                state.pipeline = Some(pipeline);
                state.dirty = true;
            }
            Command::BindResourceSet { set, resource_set } => {
                let index = *set as usize;
                if index >= MAX_SETS {
                    log::warn!("Resource set index {set} out of range, ignored");
                    continue;
                }
                state.sets[index] = Some(objects.resource_set(*resource_set)?);
                state.dirty = true;
            }
            Command::Dispatch { x, y, z } => {
                flush_sets(device, command_buffer, &mut state);
                unsafe { device.cmd_dispatch(command_buffer, *x, *y, *z) };
            }
            Command::BeginRenderPass {
                render_pass,
                framebuffer,
                extent,
                clear_values,
            } => {
                let render_pass = objects.render_pass(*render_pass)?;
                let framebuffer = objects.framebuffer(*framebuffer)?;
                let clear_values: Vec<_> = clear_values.iter().map(|v| convert::clear_value(*v)).collect();
                let begin_info = vk::RenderPassBeginInfo::default()
                    .render_pass(render_pass)
                    .framebuffer(framebuffer)
                    .render_area(rect(*extent))
                    .clear_values(&clear_values);
                unsafe {
                    device.cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::INLINE);
                }
                set_viewport(device, command_buffer, *extent);
            }
            Command::NextSubpass => unsafe {
                device.cmd_next_subpass(command_buffer, vk::SubpassContents::INLINE);
            },
            Command::EndRenderPass => unsafe {
                device.cmd_end_render_pass(command_buffer);
            },
            Command::SetViewport(extent) => set_viewport(device, command_buffer, *extent),
            Command::DrawIndexed(call) => {
                flush_sets(device, command_buffer, &mut state);
                draw_indexed(device, command_buffer, objects, &state, call)?;
            }
            Command::ResetQueries { pool, first, count } => {
                if timestamps {
                    let pool = objects.query_pool(*pool)?;
                    unsafe { device.cmd_reset_query_pool(command_buffer, pool, *first, *count) };
                }
            }
            Command::WriteTimestamp { stage, pool, query } => {
                if timestamps {
                    let pool = objects.query_pool(*pool)?;
                    unsafe {
                        device.cmd_write_timestamp(
                            command_buffer,
                            convert::timestamp_stage(*stage),
                            pool,
                            *query,
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

fn flush_sets(device: &ash::Device, command_buffer: vk::CommandBuffer, state: &mut RecordState) {
    if !state.dirty {
        return;
    }
    let Some(pipeline) = state.pipeline else {
        return;
    };
    for (index, set) in state.sets.iter().enumerate().take(pipeline.set_count as usize) {
        if let Some(set) = set {
            unsafe {
                device.cmd_bind_descriptor_sets(
                    command_buffer,
                    pipeline.bind_point,
                    pipeline.layout,
                    index as u32,
                    std::slice::from_ref(set),
                    &[],
                );
            }
        }
    }
    state.dirty = false;
}

fn draw_indexed(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    objects: &Objects,
    state: &RecordState,
    call: &DrawCall,
) -> BackendResult<()> {
    let vertex_buffer = objects.buffer(call.vertex_buffer)?.buffer;
    let index_buffer = objects.buffer(call.index_buffer)?.buffer;
    unsafe {
        device.cmd_bind_vertex_buffers(command_buffer, 0, &[vertex_buffer], &[0]);
        device.cmd_bind_index_buffer(command_buffer, index_buffer, 0, vk::IndexType::UINT32);
        if let Some(pipeline) = state.pipeline.filter(|p| p.push_constant_size > 0) {
            device.cmd_push_constants(
                command_buffer,
                pipeline.layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&call.transform),
            );
        }
        device.cmd_draw_indexed(command_buffer, call.index_count, 1, call.first_index, 0, 0);
    }
    Ok(())
}

fn rect(extent: Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: vk::Extent2D {
            width: extent.width,
            height: extent.height,
        },
    }
}

fn set_viewport(device: &ash::Device, command_buffer: vk::CommandBuffer, extent: Extent2D) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    unsafe {
        device.cmd_set_viewport(command_buffer, 0, &[viewport]);
        device.cmd_set_scissor(command_buffer, 0, &[rect(extent)]);
    }
}
