//! Recorded command lists.
//!
//! Passes record into a [`CommandList`]; backends replay the list on submit.

use glam::Mat4;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::scene::Aabb;

/// One indexed draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawCall {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
    pub first_index: u32,
    /// Model matrix, pushed as vertex-stage push constants.
    pub transform: Mat4,
    /// World-space bounds, used by backends that rasterize conservatively.
    pub bounds: Aabb,
}

/// A single recorded GPU command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    PipelineBarrier {
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
        buffers: Vec<BufferBarrier>,
    },
    FillBuffer {
        buffer: BufferHandle,
        offset: u64,
        /// `None` fills to the end of the buffer.
        size: Option<u64>,
        value: u32,
    },
    BindPipeline(PipelineHandle),
    BindResourceSet {
        set: u32,
        resource_set: ResourceSetHandle,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    BeginRenderPass {
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2D,
        clear_values: Vec<ClearValue>,
    },
    NextSubpass,
    EndRenderPass,
    SetViewport(Extent2D),
    DrawIndexed(DrawCall),
    ResetQueries {
        pool: QueryPoolHandle,
        first: u32,
        count: u32,
    },
    WriteTimestamp {
        stage: PipelineStages,
        pool: QueryPoolHandle,
        query: u32,
    },
}

/// Commands recorded for one submission queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Command> {
        self.commands.iter()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Record a pipeline barrier. Empty barrier lists are dropped.
    pub fn pipeline_barrier(
        &mut self,
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
        buffers: Vec<BufferBarrier>,
    ) {
        if buffers.is_empty() {
            return;
        }
        self.push(Command::PipelineBarrier {
            src_stages,
            dst_stages,
            buffers,
        });
    }

    pub fn fill_buffer(&mut self, buffer: BufferHandle, value: u32) {
        self.push(Command::FillBuffer {
            buffer,
            offset: 0,
            size: None,
            value,
        });
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        self.push(Command::BindPipeline(pipeline));
    }

    pub fn bind_resource_set(&mut self, set: u32, resource_set: ResourceSetHandle) {
        self.push(Command::BindResourceSet { set, resource_set });
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.push(Command::Dispatch { x, y, z });
    }

    pub fn begin_render_pass(
        &mut self,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2D,
        clear_values: Vec<ClearValue>,
    ) {
        self.push(Command::BeginRenderPass {
            render_pass,
            framebuffer,
            extent,
            clear_values,
        });
    }

    pub fn next_subpass(&mut self) {
        self.push(Command::NextSubpass);
    }

    pub fn end_render_pass(&mut self) {
        self.push(Command::EndRenderPass);
    }

    pub fn set_viewport(&mut self, extent: Extent2D) {
        self.push(Command::SetViewport(extent));
    }

    pub fn draw_indexed(&mut self, call: DrawCall) {
        self.push(Command::DrawIndexed(call));
    }

    pub fn reset_queries(&mut self, pool: QueryPoolHandle, first: u32, count: u32) {
        self.push(Command::ResetQueries { pool, first, count });
    }

    pub fn write_timestamp(&mut self, stage: PipelineStages, pool: QueryPoolHandle, query: u32) {
        self.push(Command::WriteTimestamp { stage, pool, query });
    }

    /// All dispatch group counts, in recording order.
    pub fn dispatches(&self) -> Vec<[u32; 3]> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::Dispatch { x, y, z } => Some([*x, *y, *z]),
                _ => None,
            })
            .collect()
    }
}

impl<'a> IntoIterator for &'a CommandList {
    type Item = &'a Command;
    type IntoIter = std::slice::Iter<'a, Command>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.iter()
    }
}

/// Command lists for every submission queue of one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameCommands {
    lists: [CommandList; SubmitQueue::COUNT],
}

impl FrameCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, queue: SubmitQueue) -> &CommandList {
        &self.lists[queue.index()]
    }

    pub fn queue_mut(&mut self, queue: SubmitQueue) -> &mut CommandList {
        &mut self.lists[queue.index()]
    }

    pub fn is_empty(&self) -> bool {
        self.lists.iter().all(CommandList::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_barrier_is_dropped() {
        let mut list = CommandList::new();
        list.pipeline_barrier(
            PipelineStages::TRANSFER,
            PipelineStages::COMPUTE_SHADER,
            Vec::new(),
        );
        assert!(list.is_empty());
    }

    #[test]
    fn test_dispatches_in_order() {
        let mut list = CommandList::new();
        list.dispatch(4, 1, 1);
        list.fill_buffer(BufferHandle(1), 0);
        list.dispatch(2, 3, 256);
        assert_eq!(list.dispatches(), vec![[4, 1, 1], [2, 3, 256]]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_frame_commands_per_queue() {
        let mut frame = FrameCommands::new();
        assert!(frame.is_empty());
        frame.queue_mut(SubmitQueue::Compute).dispatch(1, 1, 1);
        assert!(!frame.is_empty());
        assert!(frame.queue(SubmitQueue::Graphics).is_empty());
        assert_eq!(frame.queue(SubmitQueue::Compute).len(), 1);
    }
}
