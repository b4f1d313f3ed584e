//! Per-frame replicated host-visible buffers.
//!
//! A [`SharedBuffer`] is logically one buffer and physically one allocation
//! per frame in flight. The CPU writes into the slot of the frame being
//! prepared while the GPU may still read the other slots.
//!
//! # Example
//!
//! ```ignore
//! let uniforms = SharedBuffer::new(&mut backend, "cluster_uniforms", 256, BufferUsage::UNIFORM, 2)?;
//! backend.begin_frame(slot)?;
//! uniforms.set_data(&mut backend, slot, &cluster_uniforms)?;
//! uniforms.flush(&mut backend, slot)?;
//! ```

use bytemuck::Pod;

use crate::backend::{
    BackendError, BackendResult, BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend,
    MemoryProperties, SharingMode,
};

/// A host-visible buffer replicated once per frame in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedBuffer {
    label: String,
    slots: Vec<BufferHandle>,
    size: u64,
}

impl SharedBuffer {
    /// Create `slot_count` host-visible, host-coherent buffers of `size` bytes.
    ///
    /// The buffers are only written by the host, so they are shared
    /// concurrently between queue families.
    pub fn new<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        label: &str,
        size: u64,
        usage: BufferUsage,
        slot_count: usize,
    ) -> BackendResult<Self> {
        let mut slots = Vec::with_capacity(slot_count);
        for slot in 0..slot_count {
            let desc = BufferDescriptor::new(size, usage)
                .with_label(format!("{label}[{slot}]"))
                .with_memory(MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT)
                .with_sharing(SharingMode::Concurrent);
            slots.push(backend.create_buffer(&desc)?);
        }
        Ok(Self {
            label: label.to_string(),
            slots,
            size,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Buffer backing `slot`
    pub fn buffer(&self, slot: usize) -> BufferHandle {
        self.slots[slot % self.slots.len()]
    }

    pub fn buffers(&self) -> &[BufferHandle] {
        &self.slots
    }

    /// Copy `value` to the start of the slot.
    pub fn set_data<B, T>(&self, backend: &mut B, slot: usize, value: &T) -> BackendResult<()>
    where
        B: GraphicsBackend + ?Sized,
        T: Pod,
    {
        self.set_bytes(backend, slot, 0, bytemuck::bytes_of(value))
    }

    /// Copy `data` into the slot starting at byte `offset`.
    pub fn set_slice<B, T>(
        &self,
        backend: &mut B,
        slot: usize,
        offset: u64,
        data: &[T],
    ) -> BackendResult<()>
    where
        B: GraphicsBackend + ?Sized,
        T: Pod,
    {
        self.set_bytes(backend, slot, offset, bytemuck::cast_slice(data))
    }

    fn set_bytes<B: GraphicsBackend + ?Sized>(
        &self,
        backend: &mut B,
        slot: usize,
        offset: u64,
        bytes: &[u8],
    ) -> BackendResult<()> {
        let len = bytes.len() as u64;
        if offset + len > self.size {
            return Err(BackendError::OutOfRange {
                offset,
                size: len,
                capacity: self.size,
            });
        }
        backend.write_buffer(self.buffer(slot), offset, bytes)
    }

    /// Make every host write to the slot visible to the device.
    pub fn flush<B: GraphicsBackend + ?Sized>(&self, backend: &mut B, slot: usize) -> BackendResult<()> {
        backend.flush_buffer(self.buffer(slot), 0, self.size)
    }

    /// Flush a sub-range of the slot.
    pub fn flush_range<B: GraphicsBackend + ?Sized>(
        &self,
        backend: &mut B,
        slot: usize,
        offset: u64,
        size: u64,
    ) -> BackendResult<()> {
        if size == 0 {
            return Ok(());
        }
        backend.flush_buffer(self.buffer(slot), offset, size)
    }

    /// Read the whole slot back.
    pub fn read_back<B: GraphicsBackend + ?Sized>(&self, backend: &B, slot: usize) -> BackendResult<Vec<u8>> {
        backend.read_buffer(self.buffer(slot), 0, self.size)
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        for buffer in self.slots {
            backend.destroy_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SoftwareBackend, SoftwareConfig};
    use bytemuck::{Pod, Zeroable};

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
    struct Sample {
        a: u32,
        b: f32,
        c: [u32; 2],
    }

    #[test]
    fn test_set_data_flush_round_trip_per_slot() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let shared = SharedBuffer::new(&mut backend, "sample", 16, BufferUsage::UNIFORM, 2).unwrap();

        let first = Sample { a: 7, b: 1.5, c: [9, 10] };
        let second = Sample { a: 1, b: -2.0, c: [3, 4] };
        shared.set_data(&mut backend, 0, &first).unwrap();
        shared.flush(&mut backend, 0).unwrap();
        shared.set_data(&mut backend, 1, &second).unwrap();
        shared.flush(&mut backend, 1).unwrap();

        let bytes = shared.read_back(&backend, 0).unwrap();
        assert_eq!(bytemuck::pod_read_unaligned::<Sample>(&bytes), first);
        let bytes = shared.read_back(&backend, 1).unwrap();
        assert_eq!(bytemuck::pod_read_unaligned::<Sample>(&bytes), second);
    }

    #[test]
    fn test_set_slice_out_of_range() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let shared = SharedBuffer::new(&mut backend, "small", 8, BufferUsage::STORAGE, 1).unwrap();
        let result = shared.set_slice(&mut backend, 0, 4, &[1u32, 2u32]);
        assert!(matches!(result, Err(BackendError::OutOfRange { .. })));
    }

    #[test]
    fn test_slots_are_distinct_buffers() {
        let mut backend = SoftwareBackend::new(SoftwareConfig::default());
        let shared = SharedBuffer::new(&mut backend, "ubo", 64, BufferUsage::UNIFORM, 3).unwrap();
        assert_eq!(shared.slot_count(), 3);
        assert_ne!(shared.buffer(0), shared.buffer(1));
        assert_eq!(shared.buffer(3), shared.buffer(0));
        shared.destroy(&mut backend);
        assert_eq!(backend.stats().live_buffers, 0);
    }
}
