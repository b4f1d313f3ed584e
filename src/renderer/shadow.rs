//! Cascaded shadow maps for the sun light.
//!
//! The view frustum is cut into [`SHADOW_CASCADE_COUNT`] depth ranges. Each
//! range is wrapped in a bounding sphere and rendered from the light with an
//! orthographic projection into its own [`SHADOW_MAP_SIZE`]² depth map.

use glam::{Mat4, Vec3, Vec4};

use crate::scene::{Camera, Light, LightType};

pub const SHADOW_CASCADE_COUNT: usize = 4;
/// Width and height of each cascade's depth map
pub const SHADOW_MAP_SIZE: u32 = 2048;
/// Blend between uniform (0) and logarithmic (1) split distances
pub const CASCADE_SPLIT_LAMBDA: f32 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Cascade {
    /// View-space distance where this cascade ends
    pub split_depth: f32,
    /// World to light clip space
    pub view_proj: Mat4,
}

/// Matrices of every cascade for one frame.
pub type ShadowCascades = [Cascade; SHADOW_CASCADE_COUNT];

/// The light that casts shadows: the first directional light of the view.
pub fn sun_light(lights: &[Light]) -> Option<&Light> {
    lights
        .iter()
        .find(|l| l.kind == LightType::Directional && l.direction.length_squared() > 0.0)
}

/// Split positions as fractions of the `near..far` range.
pub fn cascade_splits(near: f32, far: f32, lambda: f32) -> [f32; SHADOW_CASCADE_COUNT] {
    let range = far - near;
    let ratio = far / near;
    let mut splits = [0.0; SHADOW_CASCADE_COUNT];
    for (i, split) in splits.iter_mut().enumerate() {
        let p = (i + 1) as f32 / SHADOW_CASCADE_COUNT as f32;
        let log = near * ratio.powf(p);
        let uniform = near + range * p;
        let d = lambda * (log - uniform) + uniform;
        *split = (d - near) / range;
    }
    splits
}

/// Fit one orthographic light projection around each frustum slice.
pub fn compute_cascades(camera: &Camera, light_dir: Vec3) -> ShadowCascades {
    let near = camera.near().max(f32::EPSILON);
    let far = camera.far().max(near * 2.0);
    let clip_range = far - near;
    let splits = cascade_splits(near, far, CASCADE_SPLIT_LAMBDA);
    let light_dir = light_dir.normalize_or_zero();
    let up = if light_dir.y.abs() > 0.99 { Vec3::Z } else { Vec3::Y };

    // Depth runs 0..1 in clip space.
    let inv_view_proj = camera.inverse_view_projection();
    let mut frustum = [Vec3::ZERO; 8];
    for (i, corner) in frustum.iter_mut().enumerate() {
        let x = if i & 1 == 0 { -1.0 } else { 1.0 };
        let y = if i & 2 == 0 { -1.0 } else { 1.0 };
        let z = if i < 4 { 0.0 } else { 1.0 };
        let world = inv_view_proj * Vec4::new(x, y, z, 1.0);
        *corner = world.truncate() / world.w;
    }

    let mut cascades = [Cascade::default(); SHADOW_CASCADE_COUNT];
    let mut last_split = 0.0;
    for (cascade, &split) in cascades.iter_mut().zip(&splits) {
        let mut corners = frustum;
        for j in 0..4 {
            let ray = frustum[j + 4] - frustum[j];
            corners[j + 4] = frustum[j] + ray * split;
            corners[j] = frustum[j] + ray * last_split;
        }

        let center = corners.iter().copied().sum::<Vec3>() / 8.0;
        let radius = corners
            .iter()
            .map(|c| c.distance(center))
            .fold(0.0f32, f32::max);
        // Snapping the radius keeps the projection size stable as the camera turns.
        let radius = (radius * 16.0).ceil() / 16.0;

        let eye = center - light_dir * radius;
        let view = Mat4::look_at_rh(eye, center, up);
        let projection = Mat4::orthographic_rh(-radius, radius, -radius, radius, 0.0, 2.0 * radius);
        *cascade = Cascade {
            split_depth: near + split * clip_range,
            view_proj: projection * view,
        };
        last_split = split;
    }
    cascades
}
