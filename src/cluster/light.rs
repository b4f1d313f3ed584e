//! Light gathering: dense point-light arrays uploaded each frame.

use glam::Vec4;

use crate::backend::{BackendResult, BufferUsage, GraphicsBackend};
use crate::resources::SharedBuffer;
use crate::scene::{Light, LightType};

/// Lowest light capacity the renderer allocates
pub const MIN_NUM_LIGHTS: u32 = 1024;
/// Highest light capacity the renderer allocates
pub const MAX_NUM_LIGHTS: u32 = 600_000;

/// Point lights packed for the GPU. Index `i` of both vectors is the same light.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatheredLights {
    /// `(world position, range)`
    pub pos_ranges: Vec<Vec4>,
    /// RGBA8, red in the lowest byte
    pub colors: Vec<u32>,
}

impl GatheredLights {
    pub fn len(&self) -> usize {
        self.pos_ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pos_ranges.is_empty()
    }
}

/// Collect at most `capacity` point lights; other light types are skipped.
pub fn gather_point_lights(lights: &[Light], capacity: u32) -> GatheredLights {
    let mut gathered = GatheredLights::default();
    for light in lights.iter().filter(|l| l.kind == LightType::Point) {
        if gathered.len() as u32 >= capacity {
            log::warn!(
                "Point light capacity {} reached, dropping remaining lights",
                capacity
            );
            break;
        }
        gathered.pos_ranges.push(light.position.extend(light.range));
        gathered.colors.push(light.packed_color());
    }
    gathered
}

/// The light position/range and color buffers, one slot per frame in flight.
#[derive(Debug)]
pub struct LightBuffers {
    pos_ranges: SharedBuffer,
    colors: SharedBuffer,
    capacity: u32,
}

impl LightBuffers {
    pub fn new<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        capacity: u32,
        slot_count: usize,
    ) -> BackendResult<Self> {
        let capacity = capacity.clamp(MIN_NUM_LIGHTS, MAX_NUM_LIGHTS);
        let pos_ranges = SharedBuffer::new(
            backend,
            "light_pos_ranges",
            capacity as u64 * std::mem::size_of::<Vec4>() as u64,
            BufferUsage::STORAGE,
            slot_count,
        )?;
        let colors = SharedBuffer::new(
            backend,
            "light_colors",
            capacity as u64 * std::mem::size_of::<u32>() as u64,
            BufferUsage::STORAGE,
            slot_count,
        )?;
        Ok(Self {
            pos_ranges,
            colors,
            capacity,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn pos_ranges(&self) -> &SharedBuffer {
        &self.pos_ranges
    }

    pub fn colors(&self) -> &SharedBuffer {
        &self.colors
    }

    /// Gather the view's point lights into `slot` and flush both buffers.
    ///
    /// Returns the number of lights written.
    pub fn upload<B: GraphicsBackend + ?Sized>(
        &self,
        backend: &mut B,
        slot: usize,
        lights: &[Light],
    ) -> BackendResult<u32> {
        let gathered = gather_point_lights(lights, self.capacity);
        let num_lights = gathered.len() as u32;
        if num_lights > 0 {
            self.pos_ranges.set_slice(backend, slot, 0, &gathered.pos_ranges)?;
            self.colors.set_slice(backend, slot, 0, &gathered.colors)?;
        }
        self.pos_ranges.flush_range(
            backend,
            slot,
            0,
            num_lights as u64 * std::mem::size_of::<Vec4>() as u64,
        )?;
        self.colors.flush_range(
            backend,
            slot,
            0,
            num_lights as u64 * std::mem::size_of::<u32>() as u64,
        )?;
        log::trace!("Uploaded {} point lights to slot {}", num_lights, slot);
        Ok(num_lights)
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        self.pos_ranges.destroy(backend);
        self.colors.destroy(backend);
    }
}
