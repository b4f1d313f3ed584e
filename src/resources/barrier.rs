//! Buffer barrier helpers.
//!
//! When graphics and compute run on different queue families, buffers used by
//! both are either created with concurrent sharing or handed over with an
//! ownership transfer: a release barrier on the source queue followed by a
//! matching acquire barrier on the destination queue.

use crate::backend::{
    AccessFlags, BufferBarrier, BufferHandle, CommandList, PipelineStages, QueueFamilies,
    SharingMode,
};

/// Policy for buffers shared between the graphics and compute families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueSharing {
    /// Concurrent sharing mode; no ownership transfers are recorded.
    #[default]
    Concurrent,
    /// Exclusive buffers handed over with release/acquire barrier pairs.
    OwnershipTransfer,
}

impl QueueSharing {
    /// Sharing mode for a buffer used by both queue families.
    pub fn sharing_mode(self, families: &QueueFamilies) -> SharingMode {
        match self {
            QueueSharing::Concurrent if families.is_split() => SharingMode::Concurrent,
            _ => SharingMode::Exclusive,
        }
    }

    /// Whether release/acquire pairs must be recorded.
    pub fn needs_transfer(self, families: &QueueFamilies) -> bool {
        self == QueueSharing::OwnershipTransfer && families.is_split()
    }
}

/// Whole-buffer barrier within one queue.
pub fn buffer_barrier(buffer: BufferHandle, src_access: AccessFlags, dst_access: AccessFlags) -> BufferBarrier {
    BufferBarrier {
        buffer,
        offset: 0,
        size: None,
        src_access,
        dst_access,
        src_queue_family: None,
        dst_queue_family: None,
    }
}

/// Same access change applied to several buffers.
pub fn buffer_barriers(
    buffers: &[BufferHandle],
    src_access: AccessFlags,
    dst_access: AccessFlags,
) -> Vec<BufferBarrier> {
    buffers
        .iter()
        .map(|&b| buffer_barrier(b, src_access, dst_access))
        .collect()
}

/// Release half of an ownership transfer, recorded on the source queue.
pub fn ownership_release(buffer: BufferHandle, from: u32, to: u32, src_access: AccessFlags) -> BufferBarrier {
    BufferBarrier {
        buffer,
        offset: 0,
        size: None,
        src_access,
        dst_access: AccessFlags::empty(),
        src_queue_family: Some(from),
        dst_queue_family: Some(to),
    }
}

/// Acquire half of an ownership transfer, recorded on the destination queue.
pub fn ownership_acquire(buffer: BufferHandle, from: u32, to: u32, dst_access: AccessFlags) -> BufferBarrier {
    BufferBarrier {
        buffer,
        offset: 0,
        size: None,
        src_access: AccessFlags::empty(),
        dst_access,
        src_queue_family: Some(from),
        dst_queue_family: Some(to),
    }
}

/// Record the release of `buffers` from family `from` to family `to`.
pub fn record_release(
    commands: &mut CommandList,
    buffers: &[BufferHandle],
    from: u32,
    to: u32,
    src_stages: PipelineStages,
    src_access: AccessFlags,
) {
    let barriers = buffers
        .iter()
        .map(|&b| ownership_release(b, from, to, src_access))
        .collect();
    commands.pipeline_barrier(src_stages, PipelineStages::BOTTOM_OF_PIPE, barriers);
}

/// Record the acquire matching [`record_release`].
pub fn record_acquire(
    commands: &mut CommandList,
    buffers: &[BufferHandle],
    from: u32,
    to: u32,
    dst_stages: PipelineStages,
    dst_access: AccessFlags,
) {
    let barriers = buffers
        .iter()
        .map(|&b| ownership_acquire(b, from, to, dst_access))
        .collect();
    commands.pipeline_barrier(PipelineStages::TOP_OF_PIPE, dst_stages, barriers);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Command;

    const SPLIT: QueueFamilies = QueueFamilies {
        graphics: 0,
        compute: 1,
    };
    const SHARED: QueueFamilies = QueueFamilies {
        graphics: 0,
        compute: 0,
    };

    #[test]
    fn test_sharing_mode_only_concurrent_when_split() {
        assert_eq!(QueueSharing::Concurrent.sharing_mode(&SPLIT), SharingMode::Concurrent);
        assert_eq!(QueueSharing::Concurrent.sharing_mode(&SHARED), SharingMode::Exclusive);
        assert_eq!(QueueSharing::OwnershipTransfer.sharing_mode(&SPLIT), SharingMode::Exclusive);
    }

    #[test]
    fn test_needs_transfer() {
        assert!(QueueSharing::OwnershipTransfer.needs_transfer(&SPLIT));
        assert!(!QueueSharing::OwnershipTransfer.needs_transfer(&SHARED));
        assert!(!QueueSharing::Concurrent.needs_transfer(&SPLIT));
    }

    #[test]
    fn test_release_acquire_pair_carries_families() {
        let buffer = BufferHandle(4);
        let mut release = CommandList::new();
        record_release(
            &mut release,
            &[buffer],
            0,
            1,
            PipelineStages::FRAGMENT_SHADER,
            AccessFlags::SHADER_WRITE,
        );
        let mut acquire = CommandList::new();
        record_acquire(
            &mut acquire,
            &[buffer],
            0,
            1,
            PipelineStages::COMPUTE_SHADER,
            AccessFlags::SHADER_READ,
        );

        let Command::PipelineBarrier { buffers, .. } = &release.commands()[0] else {
            panic!("expected barrier");
        };
        assert!(buffers[0].is_ownership_transfer());
        assert_eq!(buffers[0].src_queue_family, Some(0));
        assert_eq!(buffers[0].dst_queue_family, Some(1));
        assert_eq!(buffers[0].dst_access, AccessFlags::empty());

        let Command::PipelineBarrier { buffers, dst_stages, .. } = &acquire.commands()[0] else {
            panic!("expected barrier");
        };
        assert_eq!(*dst_stages, PipelineStages::COMPUTE_SHADER);
        assert_eq!(buffers[0].src_access, AccessFlags::empty());
        assert_eq!(buffers[0].dst_access, AccessFlags::SHADER_READ);
    }
}
