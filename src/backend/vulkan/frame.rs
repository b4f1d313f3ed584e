//! Submission ordering and per-slot command buffer recycling.

use std::collections::HashMap;

use ash::vk;

use crate::backend::{BackendError, BackendResult};

/// Timeout for host waits on the timeline, in nanoseconds.
const WAIT_TIMEOUT_NS: u64 = 5_000_000_000;

/// One timeline semaphore orders every submission.
///
/// Submission `n` waits for value `n` and signals `n + 1`, so the three
/// queues of a frame run in order even across queue families.
pub struct Timeline {
    semaphore: vk::Semaphore,
    signaled: u64,
}

impl Timeline {
    pub fn new(device: &ash::Device) -> BackendResult<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { device.create_semaphore(&create_info, None) }.map_err(|e| {
            BackendError::InitializationFailed(format!("Failed to create timeline semaphore: {e:?}"))
        })?;
        Ok(Self {
            semaphore,
            signaled: 0,
        })
    }

    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Value the last submission signals.
    pub fn last_value(&self) -> u64 {
        self.signaled
    }

    /// Reserve the next value: returns `(wait, signal)`.
    pub fn advance(&mut self) -> (u64, u64) {
        let wait = self.signaled;
        self.signaled += 1;
        (wait, self.signaled)
    }

    /// Block until the timeline reaches `value`.
    pub fn wait(&self, device: &ash::Device, value: u64) -> BackendResult<()> {
        if value == 0 {
            return Ok(());
        }
        let semaphores = [self.semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { device.wait_semaphores(&wait_info, WAIT_TIMEOUT_NS) }.map_err(|e| match e {
            vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
            other => BackendError::SubmitFailed(format!("Timeline wait for {value} failed: {other:?}")),
        })
    }

    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.semaphore, None);
    }
}

/// Command pools of one frame slot, one per queue family.
pub struct FrameSlot {
    pools: HashMap<u32, vk::CommandPool>,
    allocated: Vec<(u32, vk::CommandBuffer)>,
    /// Timeline value signaled by the slot's last submission.
    pub last_value: u64,
}

impl FrameSlot {
    pub fn new(device: &ash::Device, families: &[u32]) -> BackendResult<Self> {
        let mut slot = Self {
            pools: HashMap::new(),
            allocated: Vec::new(),
            last_value: 0,
        };
        for &family in families {
            let create_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(family)
                .flags(vk::CommandPoolCreateFlags::TRANSIENT);
            let pool = unsafe { device.create_command_pool(&create_info, None) };
            match pool {
                Ok(pool) => {
                    slot.pools.insert(family, pool);
                }
                Err(e) => {
                    unsafe { slot.destroy(device) };
                    return Err(BackendError::InitializationFailed(format!(
                        "Failed to create command pool: {e:?}"
                    )));
                }
            }
        }
        Ok(slot)
    }

    /// Allocate a primary command buffer for `family` and begin recording.
    pub fn begin_command_buffer(&mut self, device: &ash::Device, family: u32) -> BackendResult<vk::CommandBuffer> {
        let pool = *self.pools.get(&family).ok_or(BackendError::InvalidHandle {
            kind: "queue family",
            id: u64::from(family),
        })?;
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| BackendError::SubmitFailed(format!("Failed to allocate command buffer: {e:?}")))?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::SubmitFailed("No command buffer allocated".to_string()))?;
        self.allocated.push((family, command_buffer));

        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(command_buffer, &begin_info) }
            .map_err(|e| BackendError::SubmitFailed(format!("Failed to begin command buffer: {e:?}")))?;
        Ok(command_buffer)
    }

    /// Free the slot's command buffers. The GPU must be done with them.
    pub fn reset(&mut self, device: &ash::Device) -> BackendResult<()> {
        for (family, pool) in &self.pools {
            let buffers: Vec<_> = self
                .allocated
                .iter()
                .filter(|(f, _)| f == family)
                .map(|(_, cb)| *cb)
                .collect();
            unsafe {
                if !buffers.is_empty() {
                    device.free_command_buffers(*pool, &buffers);
                }
                device.reset_command_pool(*pool, vk::CommandPoolResetFlags::empty())
            }
            .map_err(|e| BackendError::SubmitFailed(format!("Failed to reset command pool: {e:?}")))?;
        }
        self.allocated.clear();
        Ok(())
    }

    /// # Safety
    /// The GPU must be done with the slot.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for (_, pool) in self.pools.drain() {
            device.destroy_command_pool(pool, None);
        }
        self.allocated.clear();
    }
}
