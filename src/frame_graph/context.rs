//! Per-frame context handed to passes.

use crate::backend::{CommandList, DeviceCapabilities, Extent2D};
use crate::scene::RenderView;

/// Frame-level state: which frame, which work slot, which viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameContext {
    /// Monotonic frame counter, starting at 0
    pub frame_number: u64,
    /// Index of the per-frame resource slot used by this frame
    pub slot: usize,
    pub frames_in_flight: usize,
    pub extent: Extent2D,
    pub capabilities: DeviceCapabilities,
}

impl FrameContext {
    pub fn new(capabilities: DeviceCapabilities, frames_in_flight: usize, extent: Extent2D) -> Self {
        Self {
            frame_number: 0,
            slot: 0,
            frames_in_flight: frames_in_flight.max(1),
            extent,
            capabilities,
        }
    }

    /// Move to the next frame and its slot.
    pub fn advance(&mut self) {
        self.frame_number += 1;
        self.slot = (self.frame_number % self.frames_in_flight as u64) as usize;
    }
}

/// What a pass callback sees while recording.
pub struct PassContext<'a, D> {
    pub frame: &'a FrameContext,
    pub view: &'a RenderView,
    /// Renderer data shared by all passes of this frame
    pub data: &'a D,
    /// Command list of the pass's submission queue
    pub commands: &'a mut CommandList,
    /// Layer being recorded by a layered graphics pass, 0 otherwise
    pub layer: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueueFamilies;

    #[test]
    fn test_advance_cycles_slots() {
        let caps = DeviceCapabilities {
            queue_families: QueueFamilies {
                graphics: 0,
                compute: 0,
            },
            timestamp_period_ns: 1.0,
            non_coherent_atom_size: 64,
        };
        let mut frame = FrameContext::new(caps, 2, Extent2D::new(8, 8));
        let slots: Vec<usize> = (0..5)
            .map(|_| {
                let slot = frame.slot;
                frame.advance();
                slot
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 0, 1, 0]);
        assert_eq!(frame.frame_number, 5);
    }
}
