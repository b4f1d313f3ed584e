//! Vulkan backend using ash and gpu-allocator.
//!
//! Headless: rendering targets are offscreen images, there is no surface or
//! swapchain. All submissions are chained through one timeline semaphore,
//! and each frame slot recycles its own command pools once the slot's last
//! submission has completed.

mod convert;
mod device;
mod frame;
mod pipeline;
mod record;
mod shader;

use std::collections::HashMap;
use std::mem::ManuallyDrop;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::backend::command::CommandList;
use crate::backend::traits::*;
use crate::backend::types::*;

use device::{InstanceContext, PhysicalDeviceInfo};
use frame::{FrameSlot, Timeline};
use pipeline::{DescriptorAllocator, VkPipeline};
use shader::ShaderCache;

/// Configuration of the Vulkan backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VulkanConfig {
    pub app_name: String,
    /// Enable `VK_LAYER_KHRONOS_validation` when installed.
    pub validation: bool,
    /// Run compute on a dedicated queue family when the device has one.
    pub prefer_separate_compute: bool,
    /// Frame slots whose command buffers are recycled independently.
    pub frames_in_flight: usize,
}

impl Default for VulkanConfig {
    fn default() -> Self {
        Self {
            app_name: "cluster-renderer".to_string(),
            validation: cfg!(debug_assertions),
            prefer_separate_compute: true,
            frames_in_flight: 2,
        }
    }
}

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
    host_visible: bool,
}

struct VkImage {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
}

struct VkSetLayout {
    layout: vk::DescriptorSetLayout,
    desc: ResourceLayoutDescriptor,
}

/// Every object the backend hands out a handle for.
#[derive(Default)]
pub(crate) struct Objects {
    buffers: HashMap<u64, VkBuffer>,
    images: HashMap<u64, VkImage>,
    render_passes: HashMap<u64, vk::RenderPass>,
    framebuffers: HashMap<u64, vk::Framebuffer>,
    set_layouts: HashMap<u64, VkSetLayout>,
    resource_sets: HashMap<u64, vk::DescriptorSet>,
    pipelines: HashMap<u64, VkPipeline>,
    query_pools: HashMap<u64, (vk::QueryPool, u32)>,
}

impl Objects {
    fn buffer(&self, handle: BufferHandle) -> BackendResult<&VkBuffer> {
        self.buffers.get(&handle.0).ok_or(BackendError::InvalidHandle {
            kind: "buffer",
            id: handle.0,
        })
    }

    fn render_pass(&self, handle: RenderPassHandle) -> BackendResult<vk::RenderPass> {
        self.render_passes
            .get(&handle.0)
            .copied()
            .ok_or(BackendError::InvalidHandle {
                kind: "render pass",
                id: handle.0,
            })
    }

    fn framebuffer(&self, handle: FramebufferHandle) -> BackendResult<vk::Framebuffer> {
        self.framebuffers
            .get(&handle.0)
            .copied()
            .ok_or(BackendError::InvalidHandle {
                kind: "framebuffer",
                id: handle.0,
            })
    }

    fn set_layout(&self, handle: ResourceLayoutHandle) -> BackendResult<&VkSetLayout> {
        self.set_layouts.get(&handle.0).ok_or(BackendError::InvalidHandle {
            kind: "resource layout",
            id: handle.0,
        })
    }

    fn set_layouts(&self, handles: &[ResourceLayoutHandle]) -> BackendResult<Vec<vk::DescriptorSetLayout>> {
        handles
            .iter()
            .map(|h| self.set_layout(*h).map(|l| l.layout))
            .collect()
    }

    fn resource_set(&self, handle: ResourceSetHandle) -> BackendResult<vk::DescriptorSet> {
        self.resource_sets
            .get(&handle.0)
            .copied()
            .ok_or(BackendError::InvalidHandle {
                kind: "resource set",
                id: handle.0,
            })
    }

    fn pipeline(&self, handle: PipelineHandle) -> BackendResult<&VkPipeline> {
        self.pipelines.get(&handle.0).ok_or(BackendError::InvalidHandle {
            kind: "pipeline",
            id: handle.0,
        })
    }

    fn query_pool(&self, handle: QueryPoolHandle) -> BackendResult<vk::QueryPool> {
        self.query_pools
            .get(&handle.0)
            .map(|(pool, _)| *pool)
            .ok_or(BackendError::InvalidHandle {
                kind: "query pool",
                id: handle.0,
            })
    }
}

/// Transient pool and fence for synchronous buffer read-back.
struct Readback {
    pool: vk::CommandPool,
    fence: vk::Fence,
}

/// GPU backend on Vulkan 1.2.
pub struct VulkanBackend {
    instance: InstanceContext,
    info: PhysicalDeviceInfo,
    device: ash::Device,
    graphics_queue: vk::Queue,
    compute_queue: vk::Queue,
    allocator: ManuallyDrop<Mutex<Allocator>>,
    objects: Objects,
    shaders: ShaderCache,
    descriptors: DescriptorAllocator,
    timeline: Timeline,
    slots: Vec<FrameSlot>,
    current_slot: usize,
    readback: Mutex<Readback>,
    next_id: u64,
}

impl VulkanBackend {
    pub fn new(config: VulkanConfig) -> BackendResult<Self> {
        let mut instance = InstanceContext::new(&config)?;
        let info = match device::select_physical_device(&instance.instance, &config) {
            Ok(info) => info,
            Err(err) => {
                unsafe { instance.destroy() };
                return Err(err);
            }
        };
        let device = match device::create_logical_device(&instance.instance, &info) {
            Ok(device) => device,
            Err(err) => {
                unsafe { instance.destroy() };
                return Err(err);
            }
        };

        match Self::with_device(config, instance, info, device) {
            Ok(backend) => Ok(backend),
            Err((err, mut instance, device)) => {
                unsafe {
                    device.destroy_device(None);
                    instance.destroy();
                }
                Err(err)
            }
        }
    }

    /// Create the device-level objects. On failure the caller destroys the
    /// device and instance handed back with the error.
    #[allow(clippy::result_large_err)]
    fn with_device(
        config: VulkanConfig,
        instance: InstanceContext,
        info: PhysicalDeviceInfo,
        device: ash::Device,
    ) -> Result<Self, (BackendError, InstanceContext, ash::Device)> {
        let families = info.families;
        let allocator = match device::create_allocator(&instance.instance, info.physical_device, &device) {
            Ok(allocator) => allocator,
            Err(err) => return Err((err, instance, device)),
        };
        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let compute_queue = unsafe { device.get_device_queue(families.compute, 0) };

        let timeline = match Timeline::new(&device) {
            Ok(timeline) => timeline,
            Err(err) => return Err((err, instance, device)),
        };
        let mut slots = Vec::new();
        let mut created = Ok(());
        for _ in 0..config.frames_in_flight.max(1) {
            match FrameSlot::new(&device, &families.unique()) {
                Ok(slot) => slots.push(slot),
                Err(err) => {
                    created = Err(err);
                    break;
                }
            }
        }
        let readback = created.and_then(|()| create_readback(&device, families.graphics));
        let readback = match readback {
            Ok(readback) => readback,
            Err(err) => {
                unsafe {
                    for slot in &mut slots {
                        slot.destroy(&device);
                    }
                    timeline.destroy(&device);
                }
                drop(allocator);
                return Err((err, instance, device));
            }
        };

        log::info!(
            "Vulkan backend ready: graphics family {}, compute family {}, {} frame slot(s)",
            families.graphics,
            families.compute,
            slots.len()
        );

        Ok(Self {
            instance,
            info,
            device,
            graphics_queue,
            compute_queue,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            objects: Objects::default(),
            shaders: ShaderCache::default(),
            descriptors: DescriptorAllocator::default(),
            timeline,
            slots,
            current_slot: 0,
            readback: Mutex::new(readback),
            next_id: 1,
        })
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn queue(&self, queue: SubmitQueue) -> vk::Queue {
        match queue {
            SubmitQueue::Compute => self.compute_queue,
            SubmitQueue::EarlyGraphics | SubmitQueue::Graphics => self.graphics_queue,
        }
    }

    fn timestamps_supported(&self, queue: SubmitQueue) -> bool {
        let bits = match queue {
            SubmitQueue::Compute => self.info.timestamp_bits[1],
            _ => self.info.timestamp_bits[0],
        };
        bits > 0
    }

    fn sharing(&self, mode: SharingMode) -> (vk::SharingMode, Vec<u32>) {
        let families = self.info.families.unique();
        match mode {
            SharingMode::Concurrent if families.len() > 1 => (vk::SharingMode::CONCURRENT, families),
            _ => (vk::SharingMode::EXCLUSIVE, Vec::new()),
        }
    }

    fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation, gpu_allocator::AllocationError> {
        self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
    }

    fn free_memory(&self, allocation: Option<Allocation>) {
        if let Some(allocation) = allocation {
            if let Err(e) = self.allocator.lock().free(allocation) {
                log::error!("Failed to free GPU memory: {e}");
            }
        }
    }

    fn map_result(e: vk::Result, what: &str) -> BackendError {
        match e {
            vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                BackendError::OutOfMemory
            }
            other => BackendError::SubmitFailed(format!("{what}: {other:?}")),
        }
    }

    /// Flush or invalidate a mapped range on non-coherent memory.
    fn sync_mapped_range(&self, allocation: &Allocation, offset: u64, flush: bool) -> BackendResult<()> {
        if allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }
        let atom = self.info.limits.non_coherent_atom_size.max(1);
        let start = allocation.offset() + offset;
        let range = vk::MappedMemoryRange::default()
            .memory(unsafe { allocation.memory() })
            .offset(start - start % atom)
            .size(vk::WHOLE_SIZE);
        unsafe {
            if flush {
                self.device.flush_mapped_memory_ranges(&[range])
            } else {
                self.device.invalidate_mapped_memory_ranges(&[range])
            }
        }
        .map_err(|e| Self::map_result(e, "Failed to sync mapped memory"))
    }

    /// Copy a device-local buffer range into host memory.
    fn read_through_staging(&self, buffer: vk::Buffer, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        let staging_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let staging = unsafe { self.device.create_buffer(&staging_info, None) }
            .map_err(|e| BackendError::BufferCreationFailed(format!("Staging buffer: {e:?}")))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(staging) };
        let allocation = match self.allocate_memory("readback", requirements, MemoryLocation::GpuToCpu, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(staging, None) };
                return Err(BackendError::BufferCreationFailed(format!("Staging memory: {e}")));
            }
        };

        let result = self.copy_and_map(buffer, staging, &allocation, offset, size);

        unsafe { self.device.destroy_buffer(staging, None) };
        self.free_memory(Some(allocation));
        result
    }

    fn copy_and_map(
        &self,
        src: vk::Buffer,
        staging: vk::Buffer,
        allocation: &Allocation,
        offset: u64,
        size: u64,
    ) -> BackendResult<Vec<u8>> {
        unsafe {
            self.device
                .bind_buffer_memory(staging, allocation.memory(), allocation.offset())
                .map_err(|e| Self::map_result(e, "Failed to bind staging memory"))?;
        }

        let readback = self.readback.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(readback.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| Self::map_result(e, "Failed to allocate read-back command buffer"))?;

        let submitted = (|| unsafe {
            let cb = command_buffers[0];
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device.begin_command_buffer(cb, &begin_info)?;
            let region = vk::BufferCopy {
                src_offset: offset,
                dst_offset: 0,
                size,
            };
            self.device.cmd_copy_buffer(cb, src, staging, &[region]);
            self.device.end_command_buffer(cb)?;

            let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
            self.device.reset_fences(&[readback.fence])?;
            self.device
                .queue_submit(self.graphics_queue, &[submit], readback.fence)?;
            self.device.wait_for_fences(&[readback.fence], true, u64::MAX)
        })();

        unsafe {
            self.device.free_command_buffers(readback.pool, &command_buffers);
        }
        submitted.map_err(|e| Self::map_result(e, "Buffer read-back failed"))?;

        self.sync_mapped_range(allocation, 0, false)?;
        let data = allocation
            .mapped_slice()
            .ok_or_else(|| BackendError::SubmitFailed("Staging memory is not mapped".to_string()))?;
        Ok(data[..size as usize].to_vec())
    }
}

fn create_readback(device: &ash::Device, family: u32) -> BackendResult<Readback> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(family)
        .flags(vk::CommandPoolCreateFlags::TRANSIENT);
    let pool = unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| {
        BackendError::InitializationFailed(format!("Failed to create read-back pool: {e:?}"))
    })?;
    let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }.map_err(|e| {
        unsafe { device.destroy_command_pool(pool, None) };
        BackendError::InitializationFailed(format!("Failed to create read-back fence: {e:?}"))
    })?;
    Ok(Readback { pool, fence })
}

fn check_range(offset: u64, size: u64, capacity: u64) -> BackendResult<()> {
    if offset.checked_add(size).map_or(true, |end| end > capacity) {
        return Err(BackendError::OutOfRange {
            offset,
            size,
            capacity,
        });
    }
    Ok(())
}

impl GraphicsBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            queue_families: self.info.families,
            timestamp_period_ns: self.info.limits.timestamp_period,
            non_coherent_atom_size: self.info.limits.non_coherent_atom_size,
        }
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let (sharing_mode, families) = self.sharing(desc.sharing);
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size.max(4))
            .usage(convert::buffer_usage(desc.usage))
            .sharing_mode(sharing_mode)
            .queue_family_indices(&families);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| BackendError::BufferCreationFailed(format!("{e:?}")))?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let location = if desc.is_host_visible() {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let name = desc.label.as_deref().unwrap_or("buffer");
        let allocation = match self.allocate_memory(name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(BackendError::BufferCreationFailed(format!(
                    "{name}: failed to allocate memory: {e}"
                )));
            }
        };
        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free_memory(Some(allocation));
            return Err(BackendError::BufferCreationFailed(format!(
                "{name}: failed to bind memory: {e:?}"
            )));
        }

        let id = self.allocate_id();
        self.objects.buffers.insert(
            id,
            VkBuffer {
                buffer,
                allocation: Some(allocation),
                size: desc.size,
                host_visible: desc.is_host_visible(),
            },
        );
        log::trace!("Created buffer {name} ({} bytes) as {id}", desc.size);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let object = self
            .objects
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer",
                id: buffer.0,
            })?;
        if !object.host_visible {
            return Err(BackendError::NotHostVisible(buffer.0));
        }
        check_range(offset, data.len() as u64, object.size)?;
        let mapped = object
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or(BackendError::NotHostVisible(buffer.0))?;
        let start = offset as usize;
        mapped[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn flush_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<()> {
        let object = self.objects.buffer(buffer)?;
        if !object.host_visible {
            return Err(BackendError::NotHostVisible(buffer.0));
        }
        check_range(offset, size, object.size)?;
        match &object.allocation {
            Some(allocation) => self.sync_mapped_range(allocation, offset, true),
            None => Ok(()),
        }
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        let object = self.objects.buffer(buffer)?;
        check_range(offset, size, object.size)?;
        if size == 0 {
            return Ok(Vec::new());
        }
        self.timeline.wait(&self.device, self.timeline.last_value())?;

        if object.host_visible {
            let allocation = object
                .allocation
                .as_ref()
                .ok_or(BackendError::NotHostVisible(buffer.0))?;
            self.sync_mapped_range(allocation, offset, false)?;
            let mapped = allocation
                .mapped_slice()
                .ok_or(BackendError::NotHostVisible(buffer.0))?;
            let start = offset as usize;
            return Ok(mapped[start..start + size as usize].to_vec());
        }
        self.read_through_staging(object.buffer, offset, size)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(object) = self.objects.buffers.remove(&buffer.0) {
            unsafe { self.device.destroy_buffer(object.buffer, None) };
            self.free_memory(object.allocation);
        }
    }

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(BackendError::ImageCreationFailed(format!(
                "zero extent {}x{}",
                desc.extent.width, desc.extent.height
            )));
        }
        let format = convert::format(desc.format);
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert::image_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&image_info, None) }
            .map_err(|e| BackendError::ImageCreationFailed(format!("{e:?}")))?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let name = desc.label.as_deref().unwrap_or("image");
        let allocation = match self.allocate_memory(name, requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(BackendError::ImageCreationFailed(format!("{name}: {e}")));
            }
        };

        let view = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .and_then(|()| {
                    let view_info = vk::ImageViewCreateInfo::default()
                        .image(image)
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(format)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: convert::aspect(desc.format),
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        });
                    self.device.create_image_view(&view_info, None)
                })
        };
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                self.free_memory(Some(allocation));
                return Err(BackendError::ImageCreationFailed(format!("{name}: {e:?}")));
            }
        };

        let id = self.allocate_id();
        self.objects.images.insert(
            id,
            VkImage {
                image,
                view,
                allocation: Some(allocation),
            },
        );
        Ok(ImageHandle(id))
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        if let Some(object) = self.objects.images.remove(&image.0) {
            unsafe {
                self.device.destroy_image_view(object.view, None);
                self.device.destroy_image(object.image, None);
            }
            self.free_memory(object.allocation);
        }
    }

    fn create_render_pass(&mut self, desc: &RenderPassDescriptor) -> BackendResult<RenderPassHandle> {
        let render_pass = pipeline::create_render_pass(&self.device, desc)?;
        let id = self.allocate_id();
        self.objects.render_passes.insert(id, render_pass);
        Ok(RenderPassHandle(id))
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle) {
        if let Some(render_pass) = self.objects.render_passes.remove(&render_pass.0) {
            unsafe { self.device.destroy_render_pass(render_pass, None) };
        }
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor) -> BackendResult<FramebufferHandle> {
        let render_pass = self.objects.render_pass(desc.render_pass)?;
        let views = desc
            .attachments
            .iter()
            .map(|image| {
                self.objects
                    .images
                    .get(&image.0)
                    .map(|i| i.view)
                    .ok_or(BackendError::InvalidHandle {
                        kind: "image",
                        id: image.0,
                    })
            })
            .collect::<BackendResult<Vec<_>>>()?;
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&views)
            .width(desc.extent.width)
            .height(desc.extent.height)
            .layers(1);
        let framebuffer = unsafe { self.device.create_framebuffer(&create_info, None) }.map_err(|e| {
            BackendError::FramebufferCreationFailed(format!(
                "{}: {e:?}",
                desc.label.as_deref().unwrap_or("framebuffer")
            ))
        })?;
        let id = self.allocate_id();
        self.objects.framebuffers.insert(id, framebuffer);
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if let Some(framebuffer) = self.objects.framebuffers.remove(&framebuffer.0) {
            unsafe { self.device.destroy_framebuffer(framebuffer, None) };
        }
    }

    fn create_resource_layout(
        &mut self,
        desc: &ResourceLayoutDescriptor,
    ) -> BackendResult<ResourceLayoutHandle> {
        let layout = pipeline::create_set_layout(&self.device, desc)?;
        let id = self.allocate_id();
        self.objects.set_layouts.insert(
            id,
            VkSetLayout {
                layout,
                desc: desc.clone(),
            },
        );
        Ok(ResourceLayoutHandle(id))
    }

    fn create_resource_set(&mut self, desc: &ResourceSetDescriptor) -> BackendResult<ResourceSetHandle> {
        let layout = self.objects.set_layout(desc.layout)?;

        let mut infos = Vec::with_capacity(desc.buffers.len());
        for binding in &desc.buffers {
            let entry = layout.desc.entry(binding.binding).ok_or_else(|| {
                BackendError::ResourceSetCreationFailed(format!(
                    "binding {} is not in the layout",
                    binding.binding
                ))
            })?;
            let buffer = self.objects.buffer(binding.buffer)?;
            let info = vk::DescriptorBufferInfo {
                buffer: buffer.buffer,
                offset: binding.offset,
                range: binding.size.unwrap_or(vk::WHOLE_SIZE),
            };
            infos.push((binding.binding, convert::descriptor_type(entry.kind), info));
        }

        let set = self.descriptors.allocate(&self.device, layout.layout)?;
        let writes: Vec<_> = infos
            .iter()
            .map(|(binding, ty, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .buffer_info(std::slice::from_ref(info))
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };

        let id = self.allocate_id();
        self.objects.resource_sets.insert(id, set);
        Ok(ResourceSetHandle(id))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        let set_layouts = self.objects.set_layouts(&desc.layouts)?;
        let pipeline =
            pipeline::create_compute_pipeline(&self.device, &mut self.shaders, desc, &set_layouts)?;
        let id = self.allocate_id();
        self.objects.pipelines.insert(id, pipeline);
        Ok(PipelineHandle(id))
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        let set_layouts = self.objects.set_layouts(&desc.layouts)?;
        let render_pass = self.objects.render_pass(desc.render_pass)?;
        let pipeline = pipeline::create_graphics_pipeline(
            &self.device,
            &mut self.shaders,
            desc,
            &set_layouts,
            render_pass,
        )?;
        let id = self.allocate_id();
        self.objects.pipelines.insert(id, pipeline);
        Ok(PipelineHandle(id))
    }

    fn create_query_pool(&mut self, query_count: u32) -> BackendResult<QueryPoolHandle> {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(query_count);
        let pool = unsafe { self.device.create_query_pool(&create_info, None) }
            .map_err(|e| BackendError::QueryPoolCreationFailed(format!("{e:?}")))?;
        let id = self.allocate_id();
        self.objects.query_pools.insert(id, (pool, query_count));
        Ok(QueryPoolHandle(id))
    }

    fn get_query_results(
        &mut self,
        pool: QueryPoolHandle,
        first: u32,
        count: u32,
        wait: bool,
    ) -> BackendResult<Option<Vec<u64>>> {
        let (query_pool, capacity) = *self
            .objects
            .query_pools
            .get(&pool.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "query pool",
                id: pool.0,
            })?;
        check_range(u64::from(first), u64::from(count), u64::from(capacity))?;
        if wait {
            self.timeline.wait(&self.device, self.timeline.last_value())?;
        }

        let mut results = vec![0u64; count as usize];
        let fetched = unsafe {
            self.device.get_query_pool_results(
                query_pool,
                first,
                &mut results,
                vk::QueryResultFlags::TYPE_64,
            )
        };
        match fetched {
            Ok(()) => Ok(Some(results)),
            Err(vk::Result::NOT_READY) => Ok(None),
            Err(e) => Err(Self::map_result(e, "Failed to read query results")),
        }
    }

    fn begin_frame(&mut self, slot: usize) -> BackendResult<()> {
        let index = slot % self.slots.len();
        let wait_value = self.slots[index].last_value;
        self.timeline.wait(&self.device, wait_value)?;
        self.slots[index].reset(&self.device)?;
        self.current_slot = index;
        Ok(())
    }

    fn submit(&mut self, queue: SubmitQueue, commands: &CommandList) -> BackendResult<()> {
        let family = queue.family(&self.info.families);
        let command_buffer = self.slots[self.current_slot].begin_command_buffer(&self.device, family)?;
        record::record_commands(
            &self.device,
            command_buffer,
            commands,
            &self.objects,
            self.timestamps_supported(queue),
        )?;
        unsafe { self.device.end_command_buffer(command_buffer) }
            .map_err(|e| Self::map_result(e, "Failed to end command buffer"))?;

        let (wait_value, signal_value) = self.timeline.advance();
        let semaphores = [self.timeline.semaphore()];
        let wait_values = [wait_value];
        let signal_values = [signal_value];
        let wait_stages = [convert::pipeline_stages(queue.wait_stage())];
        let command_buffers = [command_buffer];

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline_info);

        unsafe {
            self.device
                .queue_submit(self.queue(queue), &[submit_info], vk::Fence::null())
        }
        .map_err(|e| Self::map_result(e, "Queue submission failed"))?;

        self.slots[self.current_slot].last_value = signal_value;
        log::trace!(
            "Submitted {} commands on {} (timeline {signal_value})",
            commands.len(),
            queue.name()
        );
        Ok(())
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(|e| Self::map_result(e, "Wait idle failed"))
    }
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("families", &self.info.families)
            .field("buffers", &self.objects.buffers.len())
            .field("images", &self.objects.images.len())
            .field("pipelines", &self.objects.pipelines.len())
            .field("timeline", &self.timeline.last_value())
            .finish()
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            let objects = std::mem::take(&mut self.objects);
            for (_, pipeline) in objects.pipelines {
                pipeline.destroy(&self.device);
            }
            self.shaders.destroy(&self.device);
            self.descriptors.destroy(&self.device);
            for (_, layout) in objects.set_layouts {
                self.device.destroy_descriptor_set_layout(layout.layout, None);
            }
            for (_, framebuffer) in objects.framebuffers {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            for (_, render_pass) in objects.render_passes {
                self.device.destroy_render_pass(render_pass, None);
            }
            for (_, (pool, _)) in objects.query_pools {
                self.device.destroy_query_pool(pool, None);
            }
            for (_, image) in objects.images {
                self.device.destroy_image_view(image.view, None);
                self.device.destroy_image(image.image, None);
                self.free_memory(image.allocation);
            }
            for (_, buffer) in objects.buffers {
                self.device.destroy_buffer(buffer.buffer, None);
                self.free_memory(buffer.allocation);
            }

            for slot in &mut self.slots {
                slot.destroy(&self.device);
            }
            let readback = self.readback.get_mut();
            self.device.destroy_fence(readback.fence, None);
            self.device.destroy_command_pool(readback.pool, None);
            self.timeline.destroy(&self.device);

            // The allocator must go before the device.
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);
            self.instance.destroy();
        }
    }
}
