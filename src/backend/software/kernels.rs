//! CPU versions of the clustering fragment stage and the light cull kernels.
//!
//! Invocations run sequentially, so atomics become plain adds. The results
//! match the GPU kernels up to the order of entries inside one cluster's
//! light list.

use glam::{UVec3, Vec4};

use crate::cluster::{
    ClusterBounds, ClusterUniforms, LIGHT_BOUNDS_WORDS, LIGHT_GROUP_SIZE, LIGHT_LIST_CAPACITY,
    OFFSETS_GROUP_SIZE,
};
use crate::scene::Aabb;

/// The seven grid buffers as word slices, in binding order.
pub struct GridViews<'a> {
    pub grid_flags: &'a mut [u32],
    pub light_bounds: &'a mut [u32],
    pub grid_light_counts: &'a mut [u32],
    pub grid_light_count_total: &'a mut [u32],
    pub grid_light_count_offsets: &'a mut [u32],
    pub light_list: &'a mut [u32],
    pub grid_light_counts_compare: &'a mut [u32],
}

/// Flags every cluster overlapped by a draw's world-space bounds.
pub fn rasterize_clusters(uniforms: &ClusterUniforms, bounds: &Aabb, grid_flags: &mut [u32]) -> u32 {
    let grid = uniforms.grid();
    let Some(range) = uniforms.clusters_of_world_box(bounds) else {
        return 0;
    };
    let mut flagged = 0;
    for_each_cluster(&range, |c| {
        if let Some(flag) = grid_flags.get_mut(grid.cluster_index(c.x, c.y, c.z) as usize) {
            *flag = 1;
            flagged += 1;
        }
    });
    flagged
}

pub fn assign_lights(
    uniforms: &ClusterUniforms,
    pos_ranges: &[Vec4],
    groups: [u32; 3],
    views: &mut GridViews<'_>,
) {
    let grid = uniforms.grid();
    let count = light_invocations(uniforms, pos_ranges, groups);
    for i in 0..count {
        let light = pos_ranges[i];
        let base = i * LIGHT_BOUNDS_WORDS as usize;
        let Some(words) = views.light_bounds.get_mut(base..base + LIGHT_BOUNDS_WORDS as usize) else {
            break;
        };
        let Some(range) = uniforms.clusters_of_sphere(light.truncate(), light.w) else {
            words.copy_from_slice(&ClusterBounds::EMPTY_WORDS);
            continue;
        };
        words.copy_from_slice(&range.to_words());
        for_each_cluster(&range, |c| {
            let idx = grid.cluster_index(c.x, c.y, c.z) as usize;
            if views.grid_flags.get(idx).copied().unwrap_or(0) != 0 {
                views.grid_light_counts[idx] += 1;
            }
        });
    }
}

pub fn calc_grid_offsets(uniforms: &ClusterUniforms, groups: [u32; 3], views: &mut GridViews<'_>) {
    let grid = uniforms.grid();
    let max_x = (groups[0] * OFFSETS_GROUP_SIZE).min(grid.tile_count_x);
    let max_y = (groups[1] * OFFSETS_GROUP_SIZE).min(grid.tile_count_y);
    let max_z = groups[2].min(grid.tile_count_z);
    for z in 0..max_z {
        for y in 0..max_y {
            for x in 0..max_x {
                let idx = grid.cluster_index(x, y, z) as usize;
                if views.grid_flags.get(idx).copied().unwrap_or(0) == 0 {
                    continue;
                }
                let count = views.grid_light_counts[idx];
                if count == 0 {
                    continue;
                }
                views.grid_light_count_offsets[idx] = views.grid_light_count_total[0];
                views.grid_light_count_total[0] += count;
            }
        }
    }
}

pub fn compact_light_list(
    uniforms: &ClusterUniforms,
    pos_ranges: &[Vec4],
    groups: [u32; 3],
    views: &mut GridViews<'_>,
) {
    let grid = uniforms.grid();
    let count = light_invocations(uniforms, pos_ranges, groups);
    for i in 0..count {
        let base = i * LIGHT_BOUNDS_WORDS as usize;
        let Some(range) = views
            .light_bounds
            .get(base..base + LIGHT_BOUNDS_WORDS as usize)
            .and_then(ClusterBounds::from_words)
        else {
            continue;
        };
        for_each_cluster(&range, |c| {
            let idx = grid.cluster_index(c.x, c.y, c.z) as usize;
            if views.grid_flags.get(idx).copied().unwrap_or(0) == 0 {
                return;
            }
            let slot = views.grid_light_counts_compare[idx];
            views.grid_light_counts_compare[idx] += 1;
            let entry = views.grid_light_count_offsets[idx] + slot;
            if entry < LIGHT_LIST_CAPACITY {
                if let Some(dst) = views.light_list.get_mut(entry as usize) {
                    *dst = i as u32;
                }
            }
        });
    }
}

/// Per-light invocations that pass the `i < num_lights` guard.
fn light_invocations(uniforms: &ClusterUniforms, pos_ranges: &[Vec4], groups: [u32; 3]) -> usize {
    let launched = groups[0] as u64 * LIGHT_GROUP_SIZE as u64 * groups[1] as u64 * groups[2] as u64;
    launched
        .min(uniforms.num_lights as u64)
        .min(pos_ranges.len() as u64) as usize
}

fn for_each_cluster(range: &ClusterBounds, mut f: impl FnMut(UVec3)) {
    for z in range.min.z..=range.max.z {
        for y in range.min.y..=range.max.y {
            for x in range.min.x..=range.max.x {
                f(UVec3::new(x, y, z));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterGrid;
    use crate::scene::Camera;
    use glam::Vec3;

    struct Buffers {
        flags: Vec<u32>,
        bounds: Vec<u32>,
        counts: Vec<u32>,
        total: Vec<u32>,
        offsets: Vec<u32>,
        list: Vec<u32>,
        compare: Vec<u32>,
    }

    impl Buffers {
        fn new(clusters: usize, lights: usize) -> Self {
            Self {
                flags: vec![0; clusters],
                bounds: vec![0; lights * 6],
                counts: vec![0; clusters],
                total: vec![0; 1],
                offsets: vec![0; clusters],
                list: vec![0; 4096],
                compare: vec![0; clusters],
            }
        }

        fn views(&mut self) -> GridViews<'_> {
            GridViews {
                grid_flags: &mut self.flags,
                light_bounds: &mut self.bounds,
                grid_light_counts: &mut self.counts,
                grid_light_count_total: &mut self.total,
                grid_light_count_offsets: &mut self.offsets,
                light_list: &mut self.list,
                grid_light_counts_compare: &mut self.compare,
            }
        }
    }

    fn uniforms(num_lights: u32) -> ClusterUniforms {
        let mut camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
        camera.set_aspect(1280.0, 720.0);
        ClusterUniforms::new(&camera, &ClusterGrid::from_viewport(1280, 720), 1280, 720, num_lights)
    }

    fn run_all(u: &ClusterUniforms, lights: &[Vec4], buffers: &mut Buffers) {
        let dispatch = crate::cluster::CullDispatch::new(u.num_lights, &u.grid());
        assign_lights(u, lights, dispatch.assign, &mut buffers.views());
        calc_grid_offsets(u, dispatch.offsets, &mut buffers.views());
        compact_light_list(u, lights, dispatch.compact, &mut buffers.views());
    }

    #[test]
    fn test_rasterize_flags_covered_clusters() {
        let u = uniforms(0);
        let mut buffers = Buffers::new(u.grid().cluster_count() as usize, 0);
        let flagged = rasterize_clusters(&u, &Aabb::from_center_extent(Vec3::ZERO, Vec3::splat(0.1)), &mut buffers.flags);
        assert!(flagged > 0);
        let c = u.cluster_of_point(Vec3::ZERO).unwrap();
        assert_eq!(buffers.flags[u.grid().cluster_index(c.x, c.y, c.z) as usize], 1);
    }

    #[test]
    fn test_single_light_single_cluster() {
        let u = uniforms(1);
        let grid = u.grid();
        let mut buffers = Buffers::new(grid.cluster_count() as usize, 1);
        let c = u.cluster_of_point(Vec3::ZERO).unwrap();
        let idx = grid.cluster_index(c.x, c.y, c.z) as usize;
        buffers.flags[idx] = 1;

        let lights = [Vec4::new(0.0, 0.0, 0.0, 10.0)];
        run_all(&u, &lights, &mut buffers);

        let bounds = ClusterBounds::from_words(&buffers.bounds[0..6]).unwrap();
        assert!(bounds.contains(c));
        assert_eq!(buffers.counts[idx], 1);
        assert_eq!(buffers.total[0], 1);
        assert_eq!(buffers.offsets[idx], 0);
        assert_eq!(buffers.list[0], 0);
        assert_eq!(buffers.compare[idx], 1);
    }

    #[test]
    fn test_unflagged_clusters_get_no_entries() {
        let u = uniforms(2);
        let mut buffers = Buffers::new(u.grid().cluster_count() as usize, 2);
        let lights = [Vec4::new(0.0, 0.0, 0.0, 10.0), Vec4::new(1.0, 0.0, 0.0, 2.0)];
        run_all(&u, &lights, &mut buffers);
        assert_eq!(buffers.total[0], 0);
        assert!(buffers.counts.iter().all(|&c| c == 0));
    }

    #[test]
    fn test_offsets_partition_the_list() {
        let u = uniforms(3);
        let grid = u.grid();
        let mut buffers = Buffers::new(grid.cluster_count() as usize, 3);
        for z in 0..grid.tile_count_z {
            let idx = grid.cluster_index(10, 5, z) as usize;
            buffers.flags[idx] = 1;
        }
        let lights = [
            Vec4::new(0.0, 0.0, 0.0, 1.0),
            Vec4::new(0.2, 0.0, 0.0, 1.0),
            Vec4::new(0.0, 0.0, -20.0, 0.5),
        ];
        run_all(&u, &lights, &mut buffers);

        let mut seen = 0;
        for (idx, &count) in buffers.counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            assert_eq!(buffers.compare[idx], count);
            let offset = buffers.offsets[idx] as usize;
            let entries = &buffers.list[offset..offset + count as usize];
            assert!(entries.iter().all(|&l| (l as usize) < lights.len()));
            seen += count;
        }
        assert_eq!(seen, buffers.total[0]);
        assert!(buffers.total[0] >= 2);
    }

    #[test]
    fn test_light_outside_view_gets_empty_bounds() {
        let u = uniforms(1);
        let mut buffers = Buffers::new(u.grid().cluster_count() as usize, 1);
        run_all(&u, &[Vec4::new(0.0, 0.0, 50.0, 1.0)], &mut buffers);
        assert_eq!(buffers.bounds[0..6], ClusterBounds::EMPTY_WORDS);
        assert_eq!(buffers.total[0], 0);
    }

    #[test]
    fn test_zero_groups_touch_nothing() {
        let u = uniforms(1);
        let mut buffers = Buffers::new(u.grid().cluster_count() as usize, 1);
        assign_lights(&u, &[Vec4::new(0.0, 0.0, 0.0, 10.0)], [0, 1, 1], &mut buffers.views());
        assert!(buffers.bounds.iter().all(|&w| w == 0));
    }
}
