//! Cluster grid derivation and the per-frame cluster uniform block.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, UVec3, Vec2, Vec3, Vec4};

use crate::scene::{Aabb, Camera};

/// Width of a screen tile in pixels
pub const TILE_WIDTH: u32 = 64;
/// Height of a screen tile in pixels
pub const TILE_HEIGHT: u32 = 64;
/// Number of depth slices
pub const TILE_COUNT_Z: u32 = 256;

/// Largest supported viewport. Grid buffers are sized for it once.
pub const MAX_WIDTH: u32 = 1920;
pub const MAX_HEIGHT: u32 = 1080;

/// A 3-D grid of screen tiles × depth slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterGrid {
    pub tile_width: u32,
    pub tile_height: u32,
    pub tile_count_x: u32,
    pub tile_count_y: u32,
    pub tile_count_z: u32,
}

impl ClusterGrid {
    /// Grid covering a `width` × `height` viewport with the default tile size.
    pub fn from_viewport(width: u32, height: u32) -> Self {
        Self::with_tile_size(width, height, TILE_WIDTH, TILE_HEIGHT)
    }

    pub fn with_tile_size(width: u32, height: u32, tile_width: u32, tile_height: u32) -> Self {
        Self {
            tile_width,
            tile_height,
            tile_count_x: width.div_ceil(tile_width),
            tile_count_y: height.div_ceil(tile_height),
            tile_count_z: TILE_COUNT_Z,
        }
    }

    /// Grid for the largest supported viewport
    pub fn max() -> Self {
        Self::from_viewport(MAX_WIDTH, MAX_HEIGHT)
    }

    pub fn cluster_count(&self) -> u32 {
        self.tile_count_x * self.tile_count_y * self.tile_count_z
    }

    pub fn is_empty(&self) -> bool {
        self.cluster_count() == 0
    }

    /// Linear index of cluster `(x, y, z)`
    pub fn cluster_index(&self, x: u32, y: u32, z: u32) -> u32 {
        x + y * self.tile_count_x + z * self.tile_count_x * self.tile_count_y
    }

    /// Inverse of [`ClusterGrid::cluster_index`]
    pub fn cluster_coords(&self, index: u32) -> UVec3 {
        let plane = self.tile_count_x * self.tile_count_y;
        UVec3::new(
            index % self.tile_count_x,
            (index % plane) / self.tile_count_x,
            index / plane,
        )
    }

    /// Whether this grid fits in buffers sized for [`ClusterGrid::max`]
    pub fn fits_max(&self) -> bool {
        self.cluster_count() <= Self::max().cluster_count()
    }
}

/// Exponential depth slice of a positive view-space depth.
///
/// Slices are spaced so that `near` maps to slice 0 and `far` to the last slice.
pub fn depth_slice(depth: f32, near: f32, far: f32, slices: u32) -> u32 {
    let near = near.max(f32::EPSILON);
    if depth <= near || far <= near {
        return 0;
    }
    let t = (depth / near).ln() / (far / near).ln();
    ((t * slices as f32).floor() as i64).clamp(0, slices as i64 - 1) as u32
}

/// Inclusive range of clusters touched by a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterBounds {
    pub min: UVec3,
    pub max: UVec3,
}

impl ClusterBounds {
    pub fn contains(&self, c: UVec3) -> bool {
        c.cmpge(self.min).all() && c.cmple(self.max).all()
    }

    pub fn cluster_count(&self) -> u32 {
        let d = self.max - self.min + UVec3::ONE;
        d.x * d.y * d.z
    }

    /// Packed as six `u32`: min xyz then max xyz
    pub fn to_words(&self) -> [u32; 6] {
        [
            self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z,
        ]
    }

    /// Unpack six words. An all-zero or inverted record means "no clusters".
    pub fn from_words(words: &[u32]) -> Option<Self> {
        let [a, b, c, d, e, f] = <[u32; 6]>::try_from(words).ok()?;
        let bounds = Self {
            min: UVec3::new(a, b, c),
            max: UVec3::new(d, e, f),
        };
        bounds.min.cmple(bounds.max).all().then_some(bounds)
    }

    /// Record written for lights that touch no cluster
    pub const EMPTY_WORDS: [u32; 6] = [1, 1, 1, 0, 0, 0];
}

/// Per-frame uniform block shared by the clustering, culling and shading shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ClusterUniforms {
    pub view: Mat4,
    pub projection_clip: Mat4,
    pub inv_view_proj: Mat4,
    pub tile_size: Vec2,
    pub grid_dim: [u32; 2],
    pub cam_pos: Vec3,
    pub cam_near: f32,
    pub cam_forward: Vec3,
    pub cam_far: f32,
    pub resolution: Vec2,
    pub num_lights: u32,
    pub _pad: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<ClusterUniforms>(), 256);

impl ClusterUniforms {
    /// Grid dimensions and tile size always come from the same [`ClusterGrid`].
    pub fn new(camera: &Camera, grid: &ClusterGrid, width: u32, height: u32, num_lights: u32) -> Self {
        Self {
            view: camera.view_matrix(),
            projection_clip: camera.clip_projection_matrix(),
            inv_view_proj: camera.inverse_view_projection(),
            tile_size: Vec2::new(grid.tile_width as f32, grid.tile_height as f32),
            grid_dim: [grid.tile_count_x, grid.tile_count_y],
            cam_pos: camera.position,
            cam_near: camera.near(),
            cam_forward: camera.forward(),
            cam_far: camera.far(),
            resolution: Vec2::new(width as f32, height as f32),
            num_lights,
            _pad: 0,
        }
    }

    pub fn grid(&self) -> ClusterGrid {
        ClusterGrid {
            tile_width: self.tile_size.x as u32,
            tile_height: self.tile_size.y as u32,
            tile_count_x: self.grid_dim[0],
            tile_count_y: self.grid_dim[1],
            tile_count_z: TILE_COUNT_Z,
        }
    }

    pub fn depth_slice(&self, depth: f32) -> u32 {
        depth_slice(depth, self.cam_near, self.cam_far, TILE_COUNT_Z)
    }

    /// Cluster containing a world-space point, if it is inside the view volume.
    pub fn cluster_of_point(&self, world: Vec3) -> Option<UVec3> {
        self.clusters_of_view_box(self.view.transform_point3(world), self.view.transform_point3(world))
            .filter(|b| b.min == b.max)
            .map(|b| b.min)
    }

    /// Clusters overlapped by a sphere given in world space.
    pub fn clusters_of_sphere(&self, center: Vec3, radius: f32) -> Option<ClusterBounds> {
        let c = self.view.transform_point3(center);
        let r = Vec3::splat(radius.max(0.0));
        self.clusters_of_view_box(c - r, c + r)
    }

    /// Clusters overlapped by a world-space box.
    pub fn clusters_of_world_box(&self, aabb: &Aabb) -> Option<ClusterBounds> {
        let view_box = aabb.transformed(&self.view);
        self.clusters_of_view_box(view_box.min, view_box.max)
    }

    /// Conservative cluster range of a view-space box.
    ///
    /// The box is clipped to the depth range first; the screen rectangle is
    /// the bound of its projected corners.
    pub fn clusters_of_view_box(&self, min: Vec3, max: Vec3) -> Option<ClusterBounds> {
        let grid = self.grid();
        if grid.is_empty() {
            return None;
        }
        let near = self.cam_near.max(f32::EPSILON);
        let depth_min = (-max.z).max(near);
        let depth_max = (-min.z).min(self.cam_far);
        if depth_min > depth_max {
            return None;
        }

        let mut px_min = Vec2::splat(f32::INFINITY);
        let mut px_max = Vec2::splat(f32::NEG_INFINITY);
        for &z in &[-depth_min, -depth_max] {
            for &y in &[min.y, max.y] {
                for &x in &[min.x, max.x] {
                    let clip = self.projection_clip * Vec4::new(x, y, z, 1.0);
                    let ndc = Vec2::new(clip.x, clip.y) / clip.w;
                    let px = (ndc * 0.5 + Vec2::splat(0.5)) * self.resolution;
                    px_min = px_min.min(px);
                    px_max = px_max.max(px);
                }
            }
        }
        if px_max.x < 0.0
            || px_max.y < 0.0
            || px_min.x >= self.resolution.x
            || px_min.y >= self.resolution.y
        {
            return None;
        }

        let tile = |px: f32, size: f32, count: u32| -> u32 {
            ((px / size).floor().max(0.0) as u32).min(count - 1)
        };
        Some(ClusterBounds {
            min: UVec3::new(
                tile(px_min.x, self.tile_size.x, grid.tile_count_x),
                tile(px_min.y, self.tile_size.y, grid.tile_count_y),
                self.depth_slice(depth_min),
            ),
            max: UVec3::new(
                tile(px_max.x, self.tile_size.x, grid.tile_count_x),
                tile(px_max.y, self.tile_size.y, grid.tile_count_y),
                self.depth_slice(depth_max),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_counts_use_ceiling() {
        let grid = ClusterGrid::from_viewport(1280, 720);
        assert_eq!(grid.tile_count_x, 20);
        assert_eq!(grid.tile_count_y, 12);

        let grid = ClusterGrid::from_viewport(65, 64);
        assert_eq!((grid.tile_count_x, grid.tile_count_y), (2, 1));
    }

    #[test]
    fn test_tile_counts_for_all_sizes_up_to_max() {
        for w in (1..=MAX_WIDTH).step_by(7) {
            for h in (1..=MAX_HEIGHT).step_by(13) {
                let grid = ClusterGrid::from_viewport(w, h);
                assert_eq!(grid.tile_count_x, (w as f64 / TILE_WIDTH as f64).ceil() as u32);
                assert_eq!(grid.tile_count_y, (h as f64 / TILE_HEIGHT as f64).ceil() as u32);
                assert!(grid.fits_max());
            }
        }
    }

    #[test]
    fn test_zero_viewport_is_empty() {
        let grid = ClusterGrid::from_viewport(0, 0);
        assert!(grid.is_empty());
    }

    #[test]
    fn test_max_grid_cluster_count() {
        assert_eq!(ClusterGrid::max().cluster_count(), 30 * 17 * 256);
    }

    #[test]
    fn test_cluster_index_round_trip() {
        let grid = ClusterGrid::from_viewport(1280, 720);
        let index = grid.cluster_index(7, 3, 100);
        assert_eq!(grid.cluster_coords(index), UVec3::new(7, 3, 100));
    }

    #[test]
    fn test_depth_slice_range() {
        assert_eq!(depth_slice(0.1, 0.1, 1000.0, 256), 0);
        assert_eq!(depth_slice(0.01, 0.1, 1000.0, 256), 0);
        assert_eq!(depth_slice(1000.0, 0.1, 1000.0, 256), 255);
        assert_eq!(depth_slice(5000.0, 0.1, 1000.0, 256), 255);
        assert!(depth_slice(5.0, 0.1, 1000.0, 256) < depth_slice(6.0, 0.1, 1000.0, 256));
    }

    #[test]
    fn test_uniforms_match_grid() {
        let camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
        let grid = ClusterGrid::from_viewport(1280, 720);
        let uniforms = ClusterUniforms::new(&camera, &grid, 1280, 720, 3);
        assert_eq!(uniforms.grid_dim, [20, 12]);
        assert_eq!(uniforms.grid(), grid);
        assert_eq!(uniforms.num_lights, 3);
    }

    #[test]
    fn test_origin_maps_to_center_cluster() {
        let mut camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
        camera.set_aspect(1280.0, 720.0);
        let grid = ClusterGrid::from_viewport(1280, 720);
        let uniforms = ClusterUniforms::new(&camera, &grid, 1280, 720, 0);
        let cluster = uniforms.cluster_of_point(Vec3::ZERO).unwrap();
        assert_eq!((cluster.x, cluster.y), (10, 5));
        assert_eq!(cluster.z, uniforms.depth_slice(5.0));
    }

    #[test]
    fn test_sphere_bounds_cover_its_center() {
        let mut camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
        camera.set_aspect(1280.0, 720.0);
        let grid = ClusterGrid::from_viewport(1280, 720);
        let uniforms = ClusterUniforms::new(&camera, &grid, 1280, 720, 1);
        let bounds = uniforms.clusters_of_sphere(Vec3::ZERO, 10.0).unwrap();
        assert!(bounds.contains(uniforms.cluster_of_point(Vec3::ZERO).unwrap()));
        // The sphere encloses the camera, so it spans the whole screen.
        assert_eq!(bounds.min.x, 0);
        assert_eq!(bounds.max.x, 19);
        assert_eq!(bounds.min.z, 0);
    }

    #[test]
    fn test_sphere_behind_camera_touches_nothing() {
        let camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
        let grid = ClusterGrid::from_viewport(1280, 720);
        let uniforms = ClusterUniforms::new(&camera, &grid, 1280, 720, 1);
        assert!(uniforms.clusters_of_sphere(Vec3::new(0.0, 0.0, 20.0), 1.0).is_none());
    }

    #[test]
    fn test_bounds_words() {
        let bounds = ClusterBounds {
            min: UVec3::new(1, 2, 3),
            max: UVec3::new(4, 5, 6),
        };
        assert_eq!(ClusterBounds::from_words(&bounds.to_words()), Some(bounds));
        assert_eq!(ClusterBounds::from_words(&ClusterBounds::EMPTY_WORDS), None);
        assert_eq!(bounds.cluster_count(), 4 * 4 * 4);
    }
}
