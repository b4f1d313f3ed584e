//! Three-stage light culling on the compute queue.
//!
//! 1. `assign_lights`: per light, the cluster range its sphere overlaps and a
//!    count increment for every flagged cluster in that range.
//! 2. `calc_grid_offsets`: per flagged cluster with lights, a base offset
//!    reserved from the running total.
//! 3. `compact_light_list`: per light, its index written into the list of
//!    every flagged cluster it overlaps.
//!
//! Each stage reads what the previous one wrote, so a compute → compute
//! barrier separates them.

use crate::backend::{
    AccessFlags, BackendResult, BufferHandle, CommandList, ComputePipelineDescriptor,
    GraphicsBackend, PipelineHandle, PipelineStages, QueryPoolHandle, ResourceLayoutHandle,
    ResourceSetHandle, ShaderProgram,
};
use crate::cluster::shaders::{ASSIGN_LIGHTS, CALC_GRID_OFFSETS, COMPACT_LIGHT_LIST};
use crate::cluster::{ClusterGrid, GridBuffers};
use crate::resources::buffer_barriers;

/// Invocations per workgroup of the per-light stages
pub const LIGHT_GROUP_SIZE: u32 = 32;
/// Workgroup edge of the per-cluster offsets stage (16 × 16 × 1)
pub const OFFSETS_GROUP_SIZE: u32 = 16;

/// Workgroup counts of the three stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CullDispatch {
    pub assign: [u32; 3],
    pub offsets: [u32; 3],
    pub compact: [u32; 3],
}

impl CullDispatch {
    /// Zero lights give zero per-light groups rather than an underflowed count.
    pub fn new(num_lights: u32, grid: &ClusterGrid) -> Self {
        let light_groups = num_lights.div_ceil(LIGHT_GROUP_SIZE);
        Self {
            assign: [light_groups, 1, 1],
            offsets: [
                grid.tile_count_x.div_ceil(OFFSETS_GROUP_SIZE),
                grid.tile_count_y.div_ceil(OFFSETS_GROUP_SIZE),
                grid.tile_count_z,
            ],
            compact: [light_groups, 1, 1],
        }
    }
}

/// Where the culling stages write their begin/end timestamps.
///
/// Queries `first..first + 6` hold begin/end pairs for assign, offsets and
/// compact, in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CullTimestamps {
    pub pool: QueryPoolHandle,
    pub first: u32,
}

/// Compute pipelines of the three culling stages.
#[derive(Debug, Clone, Copy)]
pub struct LightCuller {
    assign: PipelineHandle,
    offsets: PipelineHandle,
    compact: PipelineHandle,
}

impl LightCuller {
    /// `layouts` are the frame set (uniforms, lights) and the grid set.
    pub fn new<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        layouts: [ResourceLayoutHandle; 2],
    ) -> BackendResult<Self> {
        let mut pipeline = |program: ShaderProgram| {
            backend.create_compute_pipeline(&ComputePipelineDescriptor {
                label: Some(program.label.to_string()),
                program,
                layouts: layouts.to_vec(),
            })
        };
        Ok(Self {
            assign: pipeline(ASSIGN_LIGHTS)?,
            offsets: pipeline(CALC_GRID_OFFSETS)?,
            compact: pipeline(COMPACT_LIGHT_LIST)?,
        })
    }

    pub fn pipelines(&self) -> [PipelineHandle; 3] {
        [self.assign, self.offsets, self.compact]
    }

    /// Record the three stages.
    ///
    /// `host_written` are the buffers the CPU filled for this frame; a
    /// host → compute barrier makes them visible before the first stage.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        commands: &mut CommandList,
        dispatch: &CullDispatch,
        frame_set: ResourceSetHandle,
        grid_set: ResourceSetHandle,
        grid: &GridBuffers,
        host_written: &[BufferHandle],
        timestamps: Option<CullTimestamps>,
    ) {
        commands.pipeline_barrier(
            PipelineStages::HOST,
            PipelineStages::COMPUTE_SHADER,
            buffer_barriers(
                host_written,
                AccessFlags::HOST_WRITE,
                AccessFlags::UNIFORM_READ | AccessFlags::SHADER_READ,
            ),
        );
        commands.bind_resource_set(0, frame_set);
        commands.bind_resource_set(1, grid_set);

        let stages = [
            (self.assign, dispatch.assign),
            (self.offsets, dispatch.offsets),
            (self.compact, dispatch.compact),
        ];
        for (i, (pipeline, [x, y, z])) in stages.into_iter().enumerate() {
            if i > 0 {
                Self::record_stage_barrier(commands, grid);
            }
            if let Some(ts) = timestamps {
                commands.write_timestamp(PipelineStages::TOP_OF_PIPE, ts.pool, ts.first + 2 * i as u32);
            }
            commands.bind_pipeline(pipeline);
            commands.dispatch(x, y, z);
            if let Some(ts) = timestamps {
                commands.write_timestamp(
                    PipelineStages::COMPUTE_SHADER,
                    ts.pool,
                    ts.first + 2 * i as u32 + 1,
                );
            }
        }
        log::trace!(
            "Recorded light cull: assign {:?}, offsets {:?}, compact {:?}",
            dispatch.assign,
            dispatch.offsets,
            dispatch.compact
        );
    }

    fn record_stage_barrier(commands: &mut CommandList, grid: &GridBuffers) {
        commands.pipeline_barrier(
            PipelineStages::COMPUTE_SHADER,
            PipelineStages::COMPUTE_SHADER,
            buffer_barriers(
                &grid.all(),
                AccessFlags::SHADER_WRITE,
                AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
            ),
        );
    }
}
