//! Shared fixtures for the integration tests.
//!
//! Tests are parameterized by [`Backend`]. Backends that cannot be created on
//! the current machine (no Vulkan driver, feature disabled) are skipped.

#![allow(dead_code)]

use std::sync::Arc;

use glam::{Mat4, Vec3};
use parking_lot::Mutex;

use cluster_renderer::backend::{
    pod_vec_from_bytes, BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend,
    MemoryProperties,
};
use cluster_renderer::cluster::{ClusterGrid, GridBuffers};
use cluster_renderer::scene::{Aabb, BatchKind, Camera, DrawBatch, Light, RenderView};
use cluster_renderer::{ClusterRenderer, RendererConfig, SoftwareBackend, SoftwareConfig, SubmitQueue};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Backends the tests run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// CPU backend, graphics and compute on one family.
    Software,
    /// CPU backend reporting separate graphics and compute families.
    SoftwareSplit,
    /// Vulkan through ash.
    Vulkan,
}

impl Backend {
    pub fn create(self) -> Option<Box<dyn GraphicsBackend>> {
        match self {
            Backend::Software => Some(Box::new(SoftwareBackend::new(SoftwareConfig::default()))),
            Backend::SoftwareSplit => Some(Box::new(SoftwareBackend::new(SoftwareConfig::split_queues()))),
            Backend::Vulkan => create_vulkan(),
        }
    }
}

#[cfg(feature = "vulkan-backend")]
fn create_vulkan() -> Option<Box<dyn GraphicsBackend>> {
    use cluster_renderer::{VulkanBackend, VulkanConfig};

    let config = VulkanConfig {
        validation: true,
        ..Default::default()
    };
    match VulkanBackend::new(config) {
        Ok(backend) => Some(Box::new(backend)),
        Err(err) => {
            eprintln!("Vulkan not available: {err}");
            None
        }
    }
}

#[cfg(not(feature = "vulkan-backend"))]
fn create_vulkan() -> Option<Box<dyn GraphicsBackend>> {
    None
}

pub type DynRenderer = ClusterRenderer<Box<dyn GraphicsBackend>>;

/// Renderer on `backend`, or `None` when the backend is unavailable.
pub fn renderer(backend: Backend, config: RendererConfig) -> Option<DynRenderer> {
    let Some(gpu) = backend.create() else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return None;
    };
    Some(ClusterRenderer::new(gpu, config).expect("renderer init"))
}

/// Vertex and index buffers of an axis-aligned cube.
#[derive(Debug, Clone, Copy)]
pub struct CubeMesh {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
    pub half_extent: f32,
}

impl CubeMesh {
    pub fn new<B: GraphicsBackend + ?Sized>(backend: &mut B, half_extent: f32) -> Self {
        let (vertices, indices) = cube_geometry(half_extent);
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&indices);

        let host = MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT;
        let vertex_buffer = backend
            .create_buffer(
                &BufferDescriptor::new(vertex_bytes.len() as u64, BufferUsage::VERTEX)
                    .with_label("cube_vertices")
                    .with_memory(host),
            )
            .unwrap();
        backend.write_buffer(vertex_buffer, 0, vertex_bytes).unwrap();
        let index_buffer = backend
            .create_buffer(
                &BufferDescriptor::new(index_bytes.len() as u64, BufferUsage::INDEX)
                    .with_label("cube_indices")
                    .with_memory(host),
            )
            .unwrap();
        backend.write_buffer(index_buffer, 0, index_bytes).unwrap();

        Self {
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
            half_extent,
        }
    }

    pub fn batch(&self, position: Vec3) -> DrawBatch {
        DrawBatch {
            vertex_buffer: self.vertex_buffer,
            index_buffer: self.index_buffer,
            index_count: self.index_count,
            transform: Mat4::from_translation(position),
            bounds: Aabb::from_center_extent(Vec3::ZERO, Vec3::splat(self.half_extent)),
        }
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        backend.destroy_buffer(self.vertex_buffer);
        backend.destroy_buffer(self.index_buffer);
    }
}

/// Position + normal per vertex, four vertices per face.
fn cube_geometry(h: f32) -> (Vec<[f32; 6]>, Vec<u32>) {
    let faces: [(Vec3, Vec3, Vec3); 6] = [
        (Vec3::X, Vec3::Y, Vec3::Z),
        (Vec3::NEG_X, Vec3::Y, Vec3::NEG_Z),
        (Vec3::Y, Vec3::Z, Vec3::X),
        (Vec3::NEG_Y, Vec3::Z, Vec3::NEG_X),
        (Vec3::Z, Vec3::X, Vec3::Y),
        (Vec3::NEG_Z, Vec3::X, Vec3::NEG_Y),
    ];
    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, u, v) in faces {
        let base = vertices.len() as u32;
        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let p = (normal + u * su + v * sv) * h;
            vertices.push([p.x, p.y, p.z, normal.x, normal.y, normal.z]);
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (vertices, indices)
}

/// Camera at (0, 0, 5) looking at the origin.
pub fn camera() -> Camera {
    Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO)
}

/// A view with one cube at the origin.
pub fn cube_view(width: u32, height: u32, cube: &CubeMesh, lights: Vec<Light>) -> RenderView {
    cube_view_at(width, height, cube, Vec3::ZERO, lights)
}

pub fn cube_view_at(width: u32, height: u32, cube: &CubeMesh, position: Vec3, lights: Vec<Light>) -> RenderView {
    let mut view = RenderView::new(camera(), width, height).with_lights(lights);
    view.add_batch(BatchKind::Opaque, cube.batch(position));
    view
}

pub fn read_words<B: GraphicsBackend + ?Sized>(backend: &B, buffer: BufferHandle, words: u32) -> Vec<u32> {
    let bytes = backend.read_buffer(buffer, 0, u64::from(words) * 4).unwrap();
    pod_vec_from_bytes(&bytes)
}

/// Grid contents read right after the compute submission.
#[derive(Debug, Clone, Default)]
pub struct GridSnapshot {
    pub flags: Vec<u32>,
    pub counts: Vec<u32>,
    pub total: u32,
    pub offsets: Vec<u32>,
    pub list: Vec<u32>,
    pub compare: Vec<u32>,
}

impl GridSnapshot {
    pub fn read<B: GraphicsBackend + ?Sized>(backend: &B, grid: &GridBuffers, clusters: u32) -> Self {
        let total = read_words(backend, grid.grid_light_count_total, 1)[0];
        Self {
            flags: read_words(backend, grid.grid_flags, clusters),
            counts: read_words(backend, grid.grid_light_counts, clusters),
            total,
            offsets: read_words(backend, grid.grid_light_count_offsets, clusters),
            list: read_words(backend, grid.light_list, total.max(1)),
            compare: read_words(backend, grid.grid_light_counts_compare, clusters),
        }
    }

    pub fn flagged(&self) -> usize {
        self.flags.iter().filter(|&&f| f != 0).count()
    }

    /// Light indices of each cluster in list order.
    pub fn cluster_lights(&self) -> Vec<&[u32]> {
        self.counts
            .iter()
            .zip(&self.offsets)
            .map(|(&count, &offset)| {
                if count == 0 {
                    &[][..]
                } else {
                    &self.list[offset as usize..(offset + count) as usize]
                }
            })
            .collect()
    }

    /// Like [`GridSnapshot::cluster_lights`], each cluster's indices sorted.
    pub fn cluster_light_sets(&self) -> Vec<Vec<u32>> {
        self.cluster_lights()
            .into_iter()
            .map(|lights| {
                let mut lights = lights.to_vec();
                lights.sort_unstable();
                lights
            })
            .collect()
    }
}

/// Snapshots taken after every compute submission, newest last.
pub type Snapshots = Arc<Mutex<Vec<GridSnapshot>>>;

/// Record a [`GridSnapshot`] after each compute submission.
pub fn capture_grid<B: GraphicsBackend>(renderer: &mut ClusterRenderer<B>, width: u32, height: u32) -> Snapshots {
    let grid = renderer.grid_buffers().unwrap();
    let clusters = ClusterGrid::from_viewport(width, height).cluster_count();
    let snapshots = Snapshots::default();
    let sink = Arc::clone(&snapshots);
    renderer.on_submit_completed(move |backend, queue| {
        if queue == SubmitQueue::Compute {
            sink.lock().push(GridSnapshot::read(backend, &grid, clusters));
        }
    });
    snapshots
}
