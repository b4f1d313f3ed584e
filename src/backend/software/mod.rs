//! CPU backend.
//!
//! Executes recorded command lists synchronously on submit. Buffers are plain
//! memory, compute dispatches and clustering draws run the reference kernels
//! in [`kernels`], and queue-family ownership of exclusive buffers is tracked
//! so missing release/acquire pairs show up as validation errors.

pub mod kernels;

use std::collections::HashMap;
use std::time::Instant;

use glam::Vec4;

use crate::backend::command::{Command, CommandList, DrawCall};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::cluster::ClusterUniforms;

use kernels::GridViews;

/// Configuration of the software backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftwareConfig {
    /// Queue family indices reported to the renderer.
    pub queue_families: QueueFamilies,
    pub timestamp_period_ns: f32,
    /// Track ownership of exclusive buffers across queue families.
    pub validate_ownership: bool,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        Self {
            queue_families: QueueFamilies {
                graphics: 0,
                compute: 0,
            },
            timestamp_period_ns: 1.0,
            validate_ownership: true,
        }
    }
}

impl SoftwareConfig {
    /// Graphics and compute on different families.
    pub fn split_queues() -> Self {
        Self {
            queue_families: QueueFamilies {
                graphics: 0,
                compute: 1,
            },
            ..Default::default()
        }
    }
}

/// Object counts and execution counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftwareStats {
    pub live_buffers: usize,
    pub live_images: usize,
    pub live_render_passes: usize,
    pub live_framebuffers: usize,
    pub live_pipelines: usize,
    pub live_resource_sets: usize,
    pub live_query_pools: usize,
    pub submissions: u64,
    pub dispatches: u64,
    pub draws: u64,
    pub fills: u64,
    pub ownership_transfers: u64,
    pub validation_errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    /// Not used by any queue yet
    Unowned,
    Owned(u32),
    /// Released by `from`, waiting for the acquire on `to`
    Released { from: u32, to: u32 },
}

struct Buffer {
    desc: BufferDescriptor,
    /// Backing store in words; byte views are taken over it.
    words: Vec<u32>,
    ownership: Ownership,
}

impl Buffer {
    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u32, u8>(&self.words)[..self.desc.size as usize]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u32, u8>(&mut self.words)[..self.desc.size as usize]
    }

    fn check_range(&self, offset: u64, size: u64) -> BackendResult<()> {
        if offset.checked_add(size).map_or(true, |end| end > self.desc.size) {
            return Err(BackendError::OutOfRange {
                offset,
                size,
                capacity: self.desc.size,
            });
        }
        Ok(())
    }
}

enum Pipeline {
    Compute(ShaderProgram),
    Graphics { fragment: ShaderProgram },
}

/// Bind state while a command list executes.
#[derive(Default)]
struct ExecState {
    pipeline: Option<PipelineHandle>,
    sets: [Option<ResourceSetHandle>; 2],
    render_pass: Option<(RenderPassHandle, u32)>,
}

/// CPU implementation of [`GraphicsBackend`].
pub struct SoftwareBackend {
    config: SoftwareConfig,
    epoch: Instant,
    next_id: u64,
    buffers: HashMap<u64, Buffer>,
    images: HashMap<u64, ImageDescriptor>,
    render_passes: HashMap<u64, RenderPassDescriptor>,
    framebuffers: HashMap<u64, FramebufferDescriptor>,
    layouts: HashMap<u64, ResourceLayoutDescriptor>,
    resource_sets: HashMap<u64, ResourceSetDescriptor>,
    pipelines: HashMap<u64, Pipeline>,
    query_pools: HashMap<u64, Vec<Option<u64>>>,
    stats: SoftwareStats,
    frame_slot: usize,
}

impl SoftwareBackend {
    pub fn new(config: SoftwareConfig) -> Self {
        log::info!(
            "Created software backend (graphics family {}, compute family {})",
            config.queue_families.graphics,
            config.queue_families.compute
        );
        Self {
            config,
            epoch: Instant::now(),
            next_id: 1,
            buffers: HashMap::new(),
            images: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            layouts: HashMap::new(),
            resource_sets: HashMap::new(),
            pipelines: HashMap::new(),
            query_pools: HashMap::new(),
            stats: SoftwareStats::default(),
            frame_slot: 0,
        }
    }

    /// Live object counts and execution counters.
    pub fn stats(&self) -> SoftwareStats {
        SoftwareStats {
            live_buffers: self.buffers.len(),
            live_images: self.images.len(),
            live_render_passes: self.render_passes.len(),
            live_framebuffers: self.framebuffers.len(),
            live_pipelines: self.pipelines.len(),
            live_resource_sets: self.resource_sets.len(),
            live_query_pools: self.query_pools.len(),
            ..self.stats
        }
    }

    pub fn buffer_size(&self, buffer: BufferHandle) -> Option<u64> {
        self.buffers.get(&buffer.0).map(|b| b.desc.size)
    }

    pub fn buffer_sharing(&self, buffer: BufferHandle) -> Option<SharingMode> {
        self.buffers.get(&buffer.0).map(|b| b.desc.sharing)
    }

    pub fn image_extent(&self, image: ImageHandle) -> Option<Extent2D> {
        self.images.get(&image.0).map(|i| i.extent)
    }

    /// Slot passed to the last [`GraphicsBackend::begin_frame`].
    pub fn frame_slot(&self) -> usize {
        self.frame_slot
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn validation_error(&mut self, message: String) {
        self.stats.validation_errors += 1;
        log::warn!("Validation: {}", message);
    }

    fn buffer(&self, handle: BufferHandle) -> BackendResult<&Buffer> {
        self.buffers.get(&handle.0).ok_or(BackendError::InvalidHandle {
            kind: "buffer",
            id: handle.0,
        })
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> BackendResult<&mut Buffer> {
        self.buffers.get_mut(&handle.0).ok_or(BackendError::InvalidHandle {
            kind: "buffer",
            id: handle.0,
        })
    }

    /// Record a use of `buffer` on `family`, flagging unowned cross-family access.
    fn touch(&mut self, handle: BufferHandle, family: u32) {
        if !self.config.validate_ownership || !self.config.queue_families.is_split() {
            return;
        }
        let Some(buffer) = self.buffers.get_mut(&handle.0) else {
            return;
        };
        if buffer.desc.sharing == SharingMode::Concurrent {
            return;
        }
        let error = match buffer.ownership {
            Ownership::Unowned => {
                buffer.ownership = Ownership::Owned(family);
                None
            }
            Ownership::Owned(owner) if owner == family => None,
            Ownership::Owned(owner) => Some(format!(
                "buffer {} owned by family {} used on family {} without ownership transfer",
                handle.0, owner, family
            )),
            Ownership::Released { from, to } => Some(format!(
                "buffer {} used on family {} while in transfer {} -> {}",
                handle.0, family, from, to
            )),
        };
        if let Some(message) = error {
            self.validation_error(message);
        }
    }

    fn touch_bound_sets(&mut self, state: &ExecState, family: u32) {
        let handles: Vec<BufferHandle> = state
            .sets
            .iter()
            .flatten()
            .filter_map(|set| self.resource_sets.get(&set.0))
            .flat_map(|set| set.buffers.iter().map(|b| b.buffer))
            .collect();
        for handle in handles {
            self.touch(handle, family);
        }
    }

    fn apply_barrier(&mut self, barrier: &BufferBarrier, family: u32) -> BackendResult<()> {
        let buffer = self.buffer(barrier.buffer)?;
        if !barrier.is_ownership_transfer() {
            return Ok(());
        }
        if buffer.desc.sharing == SharingMode::Concurrent {
            return Ok(());
        }
        let (Some(src), Some(dst)) = (barrier.src_queue_family, barrier.dst_queue_family) else {
            return Ok(());
        };
        let ownership = buffer.ownership;
        if family == src {
            match ownership {
                Ownership::Unowned => {}
                Ownership::Owned(owner) if owner == src => {}
                other => self.validation_error(format!(
                    "release of buffer {} from family {} but state is {:?}",
                    barrier.buffer.0, src, other
                )),
            }
            self.buffer_mut(barrier.buffer)?.ownership = Ownership::Released { from: src, to: dst };
        } else if family == dst {
            match ownership {
                Ownership::Released { from, to } if from == src && to == dst => {}
                other => self.validation_error(format!(
                    "acquire of buffer {} on family {} without matching release (state {:?})",
                    barrier.buffer.0, dst, other
                )),
            }
            self.buffer_mut(barrier.buffer)?.ownership = Ownership::Owned(dst);
            self.stats.ownership_transfers += 1;
        } else {
            self.validation_error(format!(
                "ownership barrier {} -> {} recorded on unrelated family {}",
                src, dst, family
            ));
        }
        Ok(())
    }

    fn fill(&mut self, handle: BufferHandle, offset: u64, size: Option<u64>, value: u32) -> BackendResult<()> {
        let buffer = self.buffer_mut(handle)?;
        let size = size.unwrap_or(buffer.desc.size.saturating_sub(offset));
        buffer.check_range(offset, size)?;
        if offset % 4 != 0 || size % 4 != 0 {
            return Err(BackendError::SubmitFailed(format!(
                "fill of buffer {} at {}+{} is not word aligned",
                handle.0, offset, size
            )));
        }
        let start = (offset / 4) as usize;
        let end = start + (size / 4) as usize;
        buffer.words[start..end].fill(value);
        self.stats.fills += 1;
        Ok(())
    }

    /// Buffer bound at `binding` of the set bound at `set`.
    fn bound_buffer(&self, state: &ExecState, set: usize, binding: u32) -> BackendResult<BufferHandle> {
        let handle = state.sets[set].ok_or_else(|| {
            BackendError::SubmitFailed(format!("no resource set bound at index {set}"))
        })?;
        let desc = self.resource_sets.get(&handle.0).ok_or(BackendError::InvalidHandle {
            kind: "resource set",
            id: handle.0,
        })?;
        desc.buffers
            .iter()
            .find(|b| b.binding == binding)
            .map(|b| b.buffer)
            .ok_or_else(|| BackendError::SubmitFailed(format!("set {set} has no binding {binding}")))
    }

    fn bound_uniforms(&self, state: &ExecState) -> BackendResult<ClusterUniforms> {
        let bytes = self.buffer(self.bound_buffer(state, 0, 0)?)?.bytes();
        let size = std::mem::size_of::<ClusterUniforms>();
        if bytes.len() < size {
            return Err(BackendError::OutOfRange {
                offset: 0,
                size: size as u64,
                capacity: bytes.len() as u64,
            });
        }
        Ok(bytemuck::pod_read_unaligned(&bytes[..size]))
    }

    fn bound_lights(&self, state: &ExecState) -> BackendResult<Vec<Vec4>> {
        let bytes = self.buffer(self.bound_buffer(state, 0, 1)?)?.bytes();
        Ok(pod_vec_from_bytes(bytes))
    }

    /// Run `f` over the grid buffers bound in set 1.
    fn with_grid_views<R>(
        &mut self,
        state: &ExecState,
        f: impl FnOnce(&mut GridViews<'_>) -> R,
    ) -> BackendResult<R> {
        let mut handles = [BufferHandle(0); 7];
        for (binding, handle) in handles.iter_mut().enumerate() {
            *handle = self.bound_buffer(state, 1, binding as u32)?;
        }
        let mut taken: [Vec<u32>; 7] = Default::default();
        for (words, handle) in taken.iter_mut().zip(handles) {
            *words = std::mem::take(&mut self.buffer_mut(handle)?.words);
        }
        let result = {
            let [flags, bounds, counts, total, offsets, list, compare] = &mut taken;
            f(&mut GridViews {
                grid_flags: flags,
                light_bounds: bounds,
                grid_light_counts: counts,
                grid_light_count_total: total,
                grid_light_count_offsets: offsets,
                light_list: list,
                grid_light_counts_compare: compare,
            })
        };
        for (handle, words) in handles.into_iter().zip(taken) {
            self.buffer_mut(handle)?.words = words;
        }
        Ok(result)
    }

    fn dispatch(&mut self, state: &ExecState, groups: [u32; 3]) -> BackendResult<()> {
        let handle = state
            .pipeline
            .ok_or_else(|| BackendError::SubmitFailed("dispatch without a bound pipeline".into()))?;
        let entry_point = match self.pipelines.get(&handle.0) {
            Some(Pipeline::Compute(program)) => program.entry_point,
            Some(Pipeline::Graphics { .. }) => {
                return Err(BackendError::SubmitFailed(
                    "dispatch with a graphics pipeline bound".into(),
                ))
            }
            None => {
                return Err(BackendError::InvalidHandle {
                    kind: "pipeline",
                    id: handle.0,
                })
            }
        };
        self.stats.dispatches += 1;
        if groups.contains(&0) {
            log::trace!("Skipping empty dispatch of {}", entry_point);
            return Ok(());
        }

        let uniforms = self.bound_uniforms(state)?;
        match entry_point {
            "assign_lights" => {
                let lights = self.bound_lights(state)?;
                self.with_grid_views(state, |views| {
                    kernels::assign_lights(&uniforms, &lights, groups, views)
                })?;
            }
            "calc_grid_offsets" => {
                self.with_grid_views(state, |views| {
                    kernels::calc_grid_offsets(&uniforms, groups, views)
                })?;
            }
            "compact_light_list" => {
                let lights = self.bound_lights(state)?;
                self.with_grid_views(state, |views| {
                    kernels::compact_light_list(&uniforms, &lights, groups, views)
                })?;
            }
            other => log::debug!("No CPU kernel for entry point {}, dispatch ignored", other),
        }
        Ok(())
    }

    fn draw(&mut self, state: &ExecState, call: &DrawCall) -> BackendResult<()> {
        if state.render_pass.is_none() {
            return Err(BackendError::SubmitFailed("draw outside a render pass".into()));
        }
        let handle = state
            .pipeline
            .ok_or_else(|| BackendError::SubmitFailed("draw without a bound pipeline".into()))?;
        let fragment = match self.pipelines.get(&handle.0) {
            Some(Pipeline::Graphics { fragment }) => fragment.entry_point,
            _ => {
                return Err(BackendError::SubmitFailed(
                    "draw without a graphics pipeline bound".into(),
                ))
            }
        };
        self.buffer(call.vertex_buffer)?;
        self.buffer(call.index_buffer)?;
        self.stats.draws += 1;

        if fragment == "fs_clustering" {
            let uniforms = self.bound_uniforms(state)?;
            let flags = self.bound_buffer(state, 1, 0)?;
            let buffer = self.buffer_mut(flags)?;
            let flagged = kernels::rasterize_clusters(&uniforms, &call.bounds, &mut buffer.words);
            log::trace!("Clustering draw flagged {} clusters", flagged);
        }
        Ok(())
    }

    fn execute(&mut self, queue: SubmitQueue, commands: &CommandList) -> BackendResult<()> {
        let family = queue.family(&self.config.queue_families);
        let mut state = ExecState::default();
        for command in commands {
            match command {
                Command::PipelineBarrier { buffers, .. } => {
                    for barrier in buffers {
                        if barrier.is_ownership_transfer() {
                            self.apply_barrier(barrier, family)?;
                        } else {
                            self.buffer(barrier.buffer)?;
                            self.touch(barrier.buffer, family);
                        }
                    }
                }
                Command::FillBuffer {
                    buffer,
                    offset,
                    size,
                    value,
                } => {
                    self.touch(*buffer, family);
                    self.fill(*buffer, *offset, *size, *value)?;
                }
                Command::BindPipeline(pipeline) => {
                    if !self.pipelines.contains_key(&pipeline.0) {
                        return Err(BackendError::InvalidHandle {
                            kind: "pipeline",
                            id: pipeline.0,
                        });
                    }
                    state.pipeline = Some(*pipeline);
                }
                Command::BindResourceSet { set, resource_set } => {
                    if !self.resource_sets.contains_key(&resource_set.0) {
                        return Err(BackendError::InvalidHandle {
                            kind: "resource set",
                            id: resource_set.0,
                        });
                    }
                    let slot = state.sets.get_mut(*set as usize).ok_or_else(|| {
                        BackendError::SubmitFailed(format!("resource set index {set} out of range"))
                    })?;
                    *slot = Some(*resource_set);
                }
                Command::Dispatch { x, y, z } => {
                    self.touch_bound_sets(&state, family);
                    self.dispatch(&state, [*x, *y, *z])?;
                }
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    ..
                } => {
                    if state.render_pass.is_some() {
                        return Err(BackendError::SubmitFailed("nested render pass".into()));
                    }
                    if !self.render_passes.contains_key(&render_pass.0) {
                        return Err(BackendError::InvalidHandle {
                            kind: "render pass",
                            id: render_pass.0,
                        });
                    }
                    let fb = self.framebuffers.get(&framebuffer.0).ok_or(BackendError::InvalidHandle {
                        kind: "framebuffer",
                        id: framebuffer.0,
                    })?;
                    if fb.render_pass != *render_pass {
                        return Err(BackendError::SubmitFailed(format!(
                            "framebuffer {} was created for another render pass",
                            framebuffer.0
                        )));
                    }
                    state.render_pass = Some((*render_pass, 0));
                }
                Command::NextSubpass => match state.render_pass.as_mut() {
                    Some((_, subpass)) => *subpass += 1,
                    None => return Err(BackendError::SubmitFailed("next subpass outside a render pass".into())),
                },
                Command::EndRenderPass => {
                    if state.render_pass.take().is_none() {
                        return Err(BackendError::SubmitFailed("end of a render pass never begun".into()));
                    }
                }
                Command::SetViewport(_) => {}
                Command::DrawIndexed(call) => {
                    self.touch_bound_sets(&state, family);
                    self.draw(&state, call)?;
                }
                Command::ResetQueries { pool, first, count } => {
                    let results = self.query_pool_mut(*pool)?;
                    let end = (*first + *count) as usize;
                    if end > results.len() {
                        return Err(BackendError::OutOfRange {
                            offset: *first as u64,
                            size: *count as u64,
                            capacity: results.len() as u64,
                        });
                    }
                    results[*first as usize..end].fill(None);
                }
                Command::WriteTimestamp { pool, query, .. } => {
                    let now = self.now_ns();
                    let results = self.query_pool_mut(*pool)?;
                    let slot = results.get_mut(*query as usize).ok_or(BackendError::OutOfRange {
                        offset: *query as u64,
                        size: 1,
                        capacity: 0,
                    })?;
                    *slot = Some(now);
                }
            }
        }
        if state.render_pass.is_some() {
            return Err(BackendError::SubmitFailed(format!(
                "{} submission ends inside a render pass",
                queue.name()
            )));
        }
        Ok(())
    }

    fn query_pool_mut(&mut self, pool: QueryPoolHandle) -> BackendResult<&mut Vec<Option<u64>>> {
        self.query_pools.get_mut(&pool.0).ok_or(BackendError::InvalidHandle {
            kind: "query pool",
            id: pool.0,
        })
    }
}

impl GraphicsBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "software"
    }

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            queue_families: self.config.queue_families,
            timestamp_period_ns: self.config.timestamp_period_ns,
            non_coherent_atom_size: 64,
        }
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        if desc.size == 0 {
            return Err(BackendError::BufferCreationFailed(format!(
                "{} has zero size",
                desc.label.as_deref().unwrap_or("buffer")
            )));
        }
        let id = self.allocate_id();
        self.buffers.insert(
            id,
            Buffer {
                desc: desc.clone(),
                words: vec![0; desc.size.div_ceil(4) as usize],
                ownership: Ownership::Unowned,
            },
        );
        log::trace!("Created buffer {} ({:?}, {} bytes)", id, desc.label, desc.size);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let target = self.buffer_mut(buffer)?;
        if !target.desc.is_host_visible() {
            return Err(BackendError::NotHostVisible(buffer.0));
        }
        target.check_range(offset, data.len() as u64)?;
        let start = offset as usize;
        target.bytes_mut()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<()> {
        let target = self.buffer(buffer)?;
        if !target.desc.is_host_visible() {
            return Err(BackendError::NotHostVisible(buffer.0));
        }
        target.check_range(offset, size)
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        let source = self.buffer(buffer)?;
        source.check_range(offset, size)?;
        let start = offset as usize;
        Ok(source.bytes()[start..start + size as usize].to_vec())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if self.buffers.remove(&buffer.0).is_none() {
            log::warn!("Destroying unknown buffer {}", buffer.0);
        }
    }

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(BackendError::ImageCreationFailed(format!(
                "{:?} has zero extent",
                desc.label
            )));
        }
        let id = self.allocate_id();
        self.images.insert(id, desc.clone());
        Ok(ImageHandle(id))
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        self.images.remove(&image.0);
    }

    fn create_render_pass(&mut self, desc: &RenderPassDescriptor) -> BackendResult<RenderPassHandle> {
        if desc.subpasses.is_empty() {
            return Err(BackendError::RenderPassCreationFailed("no subpasses".into()));
        }
        let attachment_count = desc.attachments.len() as u32;
        for subpass in &desc.subpasses {
            let refs = subpass.color_attachments.iter().chain(subpass.depth_attachment.iter());
            if let Some(bad) = refs.into_iter().find(|&&a| a >= attachment_count) {
                return Err(BackendError::RenderPassCreationFailed(format!(
                    "attachment reference {bad} out of range"
                )));
            }
        }
        let id = self.allocate_id();
        self.render_passes.insert(id, desc.clone());
        Ok(RenderPassHandle(id))
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle) {
        self.render_passes.remove(&render_pass.0);
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor) -> BackendResult<FramebufferHandle> {
        let pass = self.render_passes.get(&desc.render_pass.0).ok_or_else(|| {
            BackendError::FramebufferCreationFailed(format!("unknown render pass {}", desc.render_pass.0))
        })?;
        if pass.attachments.len() != desc.attachments.len() {
            return Err(BackendError::FramebufferCreationFailed(format!(
                "render pass expects {} attachments, got {}",
                pass.attachments.len(),
                desc.attachments.len()
            )));
        }
        for image in &desc.attachments {
            let extent = self.image_extent(*image).ok_or_else(|| {
                BackendError::FramebufferCreationFailed(format!("unknown image {}", image.0))
            })?;
            if extent != desc.extent {
                return Err(BackendError::FramebufferCreationFailed(format!(
                    "image {} is {}x{}, framebuffer is {}x{}",
                    image.0, extent.width, extent.height, desc.extent.width, desc.extent.height
                )));
            }
        }
        let id = self.allocate_id();
        self.framebuffers.insert(id, desc.clone());
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer.0);
    }

    fn create_resource_layout(
        &mut self,
        desc: &ResourceLayoutDescriptor,
    ) -> BackendResult<ResourceLayoutHandle> {
        let id = self.allocate_id();
        self.layouts.insert(id, desc.clone());
        Ok(ResourceLayoutHandle(id))
    }

    fn create_resource_set(&mut self, desc: &ResourceSetDescriptor) -> BackendResult<ResourceSetHandle> {
        let layout = self.layouts.get(&desc.layout.0).ok_or_else(|| {
            BackendError::ResourceSetCreationFailed(format!("unknown layout {}", desc.layout.0))
        })?;
        for binding in &desc.buffers {
            if layout.entry(binding.binding).is_none() {
                return Err(BackendError::ResourceSetCreationFailed(format!(
                    "binding {} not in layout",
                    binding.binding
                )));
            }
            if !self.buffers.contains_key(&binding.buffer.0) {
                return Err(BackendError::ResourceSetCreationFailed(format!(
                    "unknown buffer {} at binding {}",
                    binding.buffer.0, binding.binding
                )));
            }
        }
        let id = self.allocate_id();
        self.resource_sets.insert(id, desc.clone());
        Ok(ResourceSetHandle(id))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        if !desc.program.source.contains(desc.program.entry_point) {
            return Err(BackendError::PipelineCreationFailed(format!(
                "entry point {} not found in {}",
                desc.program.entry_point, desc.program.label
            )));
        }
        let id = self.allocate_id();
        self.pipelines.insert(id, Pipeline::Compute(desc.program));
        Ok(PipelineHandle(id))
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        let pass = self.render_passes.get(&desc.render_pass.0).ok_or_else(|| {
            BackendError::PipelineCreationFailed(format!("unknown render pass {}", desc.render_pass.0))
        })?;
        if desc.subpass as usize >= pass.subpasses.len() {
            return Err(BackendError::PipelineCreationFailed(format!(
                "subpass {} out of range",
                desc.subpass
            )));
        }
        let id = self.allocate_id();
        self.pipelines.insert(
            id,
            Pipeline::Graphics {
                fragment: desc.fragment,
            },
        );
        Ok(PipelineHandle(id))
    }

    fn create_query_pool(&mut self, query_count: u32) -> BackendResult<QueryPoolHandle> {
        let id = self.allocate_id();
        self.query_pools.insert(id, vec![None; query_count as usize]);
        Ok(QueryPoolHandle(id))
    }

    fn get_query_results(
        &mut self,
        pool: QueryPoolHandle,
        first: u32,
        count: u32,
        _wait: bool,
    ) -> BackendResult<Option<Vec<u64>>> {
        let results = self.query_pool_mut(pool)?;
        let range = first as usize..(first + count) as usize;
        let Some(values) = results.get(range) else {
            return Err(BackendError::OutOfRange {
                offset: first as u64,
                size: count as u64,
                capacity: results.len() as u64,
            });
        };
        // Execution is synchronous: an unwritten query will never become available.
        Ok(values.iter().copied().collect())
    }

    fn begin_frame(&mut self, slot: usize) -> BackendResult<()> {
        self.frame_slot = slot;
        Ok(())
    }

    fn submit(&mut self, queue: SubmitQueue, commands: &CommandList) -> BackendResult<()> {
        log::trace!("Submitting {} commands on {}", commands.len(), queue.name());
        self.stats.submissions += 1;
        self.execute(queue, commands)
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        Ok(())
    }
}

impl std::fmt::Debug for SoftwareBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareBackend")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(backend: &mut SoftwareBackend, sharing: SharingMode) -> BufferHandle {
        backend
            .create_buffer(
                &BufferDescriptor::new(64, BufferUsage::STORAGE | BufferUsage::TRANSFER_DST)
                    .with_sharing(sharing),
            )
            .unwrap()
    }

    #[test]
    fn test_write_requires_host_visible() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let buffer = storage(&mut backend, SharingMode::Exclusive);
        assert!(matches!(
            backend.write_buffer(buffer, 0, &[1, 2, 3]),
            Err(BackendError::NotHostVisible(_))
        ));
    }

    #[test]
    fn test_fill_range() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let buffer = storage(&mut backend, SharingMode::Exclusive);
        let mut commands = CommandList::new();
        commands.push(Command::FillBuffer {
            buffer,
            offset: 8,
            size: Some(8),
            value: 0xAABBCCDD,
        });
        backend.submit(SubmitQueue::Graphics, &commands).unwrap();
        let words: Vec<u32> = pod_vec_from_bytes(&backend.read_buffer(buffer, 0, 16).unwrap());
        assert_eq!(words, vec![0, 0, 0xAABBCCDD, 0xAABBCCDD]);
    }

    #[test]
    fn test_cross_family_use_without_transfer_is_flagged() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::split_queues());
        let buffer = storage(&mut backend, SharingMode::Exclusive);
        let mut fill = CommandList::new();
        fill.fill_buffer(buffer, 0);
        backend.submit(SubmitQueue::Graphics, &fill).unwrap();
        backend.submit(SubmitQueue::Compute, &fill).unwrap();
        assert_eq!(backend.stats().validation_errors, 1);
    }

    #[test]
    fn test_ownership_transfer_pair_is_clean() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::split_queues());
        let buffer = storage(&mut backend, SharingMode::Exclusive);
        let mut graphics = CommandList::new();
        graphics.fill_buffer(buffer, 0);
        crate::resources::record_release(
            &mut graphics,
            &[buffer],
            0,
            1,
            PipelineStages::TRANSFER,
            AccessFlags::TRANSFER_WRITE,
        );
        let mut compute = CommandList::new();
        crate::resources::record_acquire(
            &mut compute,
            &[buffer],
            0,
            1,
            PipelineStages::TRANSFER,
            AccessFlags::TRANSFER_WRITE,
        );
        compute.fill_buffer(buffer, 1);

        backend.submit(SubmitQueue::Graphics, &graphics).unwrap();
        backend.submit(SubmitQueue::Compute, &compute).unwrap();
        let stats = backend.stats();
        assert_eq!(stats.validation_errors, 0);
        assert_eq!(stats.ownership_transfers, 1);
    }

    #[test]
    fn test_concurrent_buffers_need_no_transfer() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::split_queues());
        let buffer = storage(&mut backend, SharingMode::Concurrent);
        let mut fill = CommandList::new();
        fill.fill_buffer(buffer, 0);
        backend.submit(SubmitQueue::Graphics, &fill).unwrap();
        backend.submit(SubmitQueue::Compute, &fill).unwrap();
        assert_eq!(backend.stats().validation_errors, 0);
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let pool = backend.create_query_pool(2).unwrap();
        assert_eq!(backend.get_query_results(pool, 0, 2, false).unwrap(), None);

        let mut commands = CommandList::new();
        commands.reset_queries(pool, 0, 2);
        commands.write_timestamp(PipelineStages::TOP_OF_PIPE, pool, 0);
        commands.write_timestamp(PipelineStages::BOTTOM_OF_PIPE, pool, 1);
        backend.submit(SubmitQueue::Graphics, &commands).unwrap();
        let values = backend.get_query_results(pool, 0, 2, true).unwrap().unwrap();
        assert!(values[1] >= values[0]);
    }

    #[test]
    fn test_render_pass_must_be_closed() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let pass = backend
            .create_render_pass(&RenderPassDescriptor {
                label: None,
                attachments: Vec::new(),
                subpasses: vec![SubpassDescription::default()],
                dependencies: Vec::new(),
            })
            .unwrap();
        let framebuffer = backend
            .create_framebuffer(&FramebufferDescriptor {
                label: None,
                render_pass: pass,
                attachments: Vec::new(),
                extent: Extent2D::new(4, 4),
            })
            .unwrap();
        let mut commands = CommandList::new();
        commands.begin_render_pass(pass, framebuffer, Extent2D::new(4, 4), Vec::new());
        assert!(backend.submit(SubmitQueue::Graphics, &commands).is_err());

        backend.destroy_framebuffer(framebuffer);
        let mut commands = CommandList::new();
        commands.begin_render_pass(pass, framebuffer, Extent2D::new(4, 4), Vec::new());
        commands.end_render_pass();
        assert!(matches!(
            backend.submit(SubmitQueue::Graphics, &commands),
            Err(BackendError::InvalidHandle { kind: "framebuffer", .. })
        ));
    }
}
