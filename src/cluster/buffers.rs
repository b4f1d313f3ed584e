//! Transient cluster buffers, sized once for the largest grid and zeroed every frame.

use crate::backend::{
    AccessFlags, BackendResult, BufferDescriptor, BufferHandle, BufferUsage, CommandList,
    GraphicsBackend, PipelineStages, QueueFamilies,
};
use crate::cluster::ClusterGrid;
use crate::resources::{buffer_barriers, record_acquire, record_release, QueueSharing};

/// Capacity of the compacted light index list, in entries
pub const LIGHT_LIST_CAPACITY: u32 = 1024 * 1024;

/// Words per entry of the light bounds buffer
pub const LIGHT_BOUNDS_WORDS: u32 = 6;

const WORD: u64 = std::mem::size_of::<u32>() as u64;

/// The seven grid buffers the culling stages read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridBuffers {
    /// One word per cluster, non-zero when geometry touched the cluster this frame
    pub grid_flags: BufferHandle,
    /// Six words per light: min xyz, max xyz cluster coordinates
    pub light_bounds: BufferHandle,
    /// Lights per cluster
    pub grid_light_counts: BufferHandle,
    /// Single word: sum of all cluster counts
    pub grid_light_count_total: BufferHandle,
    /// First light list entry of each cluster
    pub grid_light_count_offsets: BufferHandle,
    /// Compacted light indices
    pub light_list: BufferHandle,
    /// Per-cluster insertion counters of the compaction stage
    pub grid_light_counts_compare: BufferHandle,
    pub max_clusters: u32,
    pub max_lights: u32,
}

impl GridBuffers {
    /// Allocate buffers for the largest grid and `max_lights` lights.
    ///
    /// Buffers shared by the graphics and compute families follow `sharing`.
    pub fn new<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        max_lights: u32,
        families: &QueueFamilies,
        sharing: QueueSharing,
    ) -> BackendResult<Self> {
        let max_clusters = ClusterGrid::max().cluster_count();
        let mode = sharing.sharing_mode(families);
        let mut create = |label: &str, words: u64| {
            let desc = BufferDescriptor::new(
                words * WORD,
                BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
            )
            .with_label(label)
            .with_sharing(mode);
            backend.create_buffer(&desc)
        };

        let buffers = Self {
            grid_flags: create("grid_flags", max_clusters as u64)?,
            light_bounds: create("light_bounds", max_lights as u64 * LIGHT_BOUNDS_WORDS as u64)?,
            grid_light_counts: create("grid_light_counts", max_clusters as u64)?,
            grid_light_count_total: create("grid_light_count_total", 1)?,
            grid_light_count_offsets: create("grid_light_count_offsets", max_clusters as u64)?,
            light_list: create("light_list", LIGHT_LIST_CAPACITY as u64)?,
            grid_light_counts_compare: create("grid_light_counts_compare", max_clusters as u64)?,
            max_clusters,
            max_lights,
        };
        log::debug!(
            "Allocated cluster buffers for {} clusters and {} lights ({:?} sharing)",
            max_clusters,
            max_lights,
            mode
        );
        Ok(buffers)
    }

    /// All seven buffers, in binding order
    pub fn all(&self) -> [BufferHandle; 7] {
        [
            self.grid_flags,
            self.light_bounds,
            self.grid_light_counts,
            self.grid_light_count_total,
            self.grid_light_count_offsets,
            self.light_list,
            self.grid_light_counts_compare,
        ]
    }

    /// Zero every buffer for the next frame.
    ///
    /// Recorded on the graphics queue after the shading pass: shader access is
    /// made available to the transfer stage, the buffers are filled, then the
    /// fills are made visible to the next frame's shader stages.
    pub fn record_clear(&self, commands: &mut CommandList) {
        let shader_stages = PipelineStages::FRAGMENT_SHADER | PipelineStages::COMPUTE_SHADER;
        let shader_access = AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE;

        commands.pipeline_barrier(
            shader_stages,
            PipelineStages::TRANSFER,
            buffer_barriers(&self.all(), shader_access, AccessFlags::TRANSFER_WRITE),
        );
        for buffer in self.all() {
            commands.fill_buffer(buffer, 0);
        }
        commands.pipeline_barrier(
            PipelineStages::TRANSFER,
            shader_stages,
            buffer_barriers(&self.all(), AccessFlags::TRANSFER_WRITE, shader_access),
        );
    }

    /// Hand every buffer from the graphics family to the compute family.
    pub fn record_release_to_compute(&self, commands: &mut CommandList, families: &QueueFamilies) {
        record_release(
            commands,
            &self.all(),
            families.graphics,
            families.compute,
            PipelineStages::FRAGMENT_SHADER | PipelineStages::TRANSFER,
            AccessFlags::SHADER_WRITE | AccessFlags::TRANSFER_WRITE,
        );
    }

    /// Compute side of [`GridBuffers::record_release_to_compute`].
    pub fn record_acquire_on_compute(&self, commands: &mut CommandList, families: &QueueFamilies) {
        record_acquire(
            commands,
            &self.all(),
            families.graphics,
            families.compute,
            PipelineStages::COMPUTE_SHADER,
            AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
        );
    }

    /// Hand every buffer from the compute family back to the graphics family.
    pub fn record_release_to_graphics(&self, commands: &mut CommandList, families: &QueueFamilies) {
        record_release(
            commands,
            &self.all(),
            families.compute,
            families.graphics,
            PipelineStages::COMPUTE_SHADER,
            AccessFlags::SHADER_WRITE,
        );
    }

    /// Graphics side of [`GridBuffers::record_release_to_graphics`].
    pub fn record_acquire_on_graphics(&self, commands: &mut CommandList, families: &QueueFamilies) {
        record_acquire(
            commands,
            &self.all(),
            families.compute,
            families.graphics,
            PipelineStages::FRAGMENT_SHADER | PipelineStages::TRANSFER,
            AccessFlags::SHADER_READ | AccessFlags::TRANSFER_WRITE,
        );
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        for buffer in self.all() {
            backend.destroy_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Command, SharingMode, SoftwareBackend, SoftwareConfig};

    fn split() -> QueueFamilies {
        QueueFamilies {
            graphics: 0,
            compute: 1,
        }
    }

    #[test]
    fn test_buffer_sizes() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let grid = GridBuffers::new(&mut backend, 1024, &split(), QueueSharing::Concurrent).unwrap();
        let clusters = ClusterGrid::max().cluster_count() as u64;
        assert_eq!(backend.buffer_size(grid.grid_flags), Some(clusters * 4));
        assert_eq!(backend.buffer_size(grid.light_bounds), Some(1024 * 6 * 4));
        assert_eq!(backend.buffer_size(grid.grid_light_count_total), Some(4));
        assert_eq!(backend.buffer_size(grid.light_list), Some(LIGHT_LIST_CAPACITY as u64 * 4));
        assert_eq!(backend.buffer_sharing(grid.light_list), Some(SharingMode::Concurrent));
    }

    #[test]
    fn test_clear_is_fenced_by_barriers() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let grid = GridBuffers::new(&mut backend, 1024, &split(), QueueSharing::Concurrent).unwrap();
        let mut commands = CommandList::new();
        grid.record_clear(&mut commands);

        let cmds = commands.commands();
        assert_eq!(cmds.len(), 9);
        let Command::PipelineBarrier { dst_stages, buffers, .. } = &cmds[0] else {
            panic!("clear must start with a barrier");
        };
        assert_eq!(*dst_stages, PipelineStages::TRANSFER);
        assert_eq!(buffers.len(), 7);
        assert!(cmds[1..8]
            .iter()
            .all(|c| matches!(c, Command::FillBuffer { value: 0, .. })));
        let Command::PipelineBarrier { src_stages, .. } = &cmds[8] else {
            panic!("clear must end with a barrier");
        };
        assert_eq!(*src_stages, PipelineStages::TRANSFER);
    }

    #[test]
    fn test_clear_zeroes_buffers() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let grid = GridBuffers::new(&mut backend, 1024, &split(), QueueSharing::Concurrent).unwrap();
        backend.write_buffer(grid.light_list, 0, &[7u8; 16]).unwrap();
        let mut commands = CommandList::new();
        grid.record_clear(&mut commands);
        backend.submit(crate::backend::SubmitQueue::Graphics, &commands).unwrap();
        let bytes = backend.read_buffer(grid.light_list, 0, 16).unwrap();
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
