//! Render view: everything the renderer consumes for one frame.

use glam::{Mat4, Vec3};

use super::{Camera, Light};
use crate::backend::command::DrawCall;
use crate::backend::BufferHandle;

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    /// Degenerate box around a single point
    pub fn point(p: Vec3) -> Self {
        Self { min: p, max: p }
    }

    pub fn from_center_extent(center: Vec3, half_extent: Vec3) -> Self {
        Self::new(center - half_extent, center + half_extent)
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// Bounds of this box after an affine transform
    pub fn transformed(&self, m: &Mat4) -> Self {
        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        for c in self.corners() {
            let p = m.transform_point3(c);
            min = min.min(p);
            max = max.max(p);
        }
        Self { min, max }
    }
}

/// Batch classes, drawn in this order by the shading pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    Opaque,
    AlphaTest,
    Translucent,
}

/// One mesh instance ready to draw.
///
/// Vertex data follows [`crate::backend::VertexLayout::position_normal`] and
/// indices are `u32`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawBatch {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
    pub transform: Mat4,
    /// Object-space bounds
    pub bounds: Aabb,
}

impl DrawBatch {
    pub fn draw_call(&self) -> DrawCall {
        DrawCall {
            vertex_buffer: self.vertex_buffer,
            index_buffer: self.index_buffer,
            index_count: self.index_count,
            first_index: 0,
            transform: self.transform,
            bounds: self.bounds.transformed(&self.transform),
        }
    }
}

/// Camera, lights and draw lists for one frame
#[derive(Debug, Clone, Default)]
pub struct RenderView {
    pub camera: Camera,
    pub width: u32,
    pub height: u32,
    pub lights: Vec<Light>,
    pub opaque: Vec<DrawBatch>,
    pub alpha_test: Vec<DrawBatch>,
    pub translucent: Vec<DrawBatch>,
}

impl RenderView {
    pub fn new(camera: Camera, width: u32, height: u32) -> Self {
        let mut camera = camera;
        camera.set_aspect(width as f32, height as f32);
        Self {
            camera,
            width,
            height,
            ..Default::default()
        }
    }

    pub fn with_lights(mut self, lights: Vec<Light>) -> Self {
        self.lights = lights;
        self
    }

    pub fn add_batch(&mut self, kind: BatchKind, batch: DrawBatch) {
        self.batches_mut(kind).push(batch);
    }

    pub fn batches(&self, kind: BatchKind) -> &[DrawBatch] {
        match kind {
            BatchKind::Opaque => &self.opaque,
            BatchKind::AlphaTest => &self.alpha_test,
            BatchKind::Translucent => &self.translucent,
        }
    }

    fn batches_mut(&mut self, kind: BatchKind) -> &mut Vec<DrawBatch> {
        match kind {
            BatchKind::Opaque => &mut self.opaque,
            BatchKind::AlphaTest => &mut self.alpha_test,
            BatchKind::Translucent => &mut self.translucent,
        }
    }

    /// All batches in draw order
    pub fn all_batches(&self) -> impl Iterator<Item = &DrawBatch> {
        self.opaque
            .iter()
            .chain(self.alpha_test.iter())
            .chain(self.translucent.iter())
    }

    /// Keep the camera aspect in sync with a new viewport size
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.camera.set_aspect(width as f32, height as f32);
    }
}
