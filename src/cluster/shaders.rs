//! WGSL sources for the clustering, light culling and forward shading programs.
//!
//! All three programs share the uniform block and the resource set layout:
//! set 0 holds the per-frame uniforms and light arrays, set 1 the seven grid
//! buffers in [`GridBuffers::all`](super::GridBuffers::all) order. The shadow
//! depth program reads nothing but its push constant.

use crate::backend::ShaderProgram;

macro_rules! cluster_common {
    () => {
        r#"
const TILE_COUNT_Z: u32 = 256u;
const LIGHT_LIST_CAPACITY: u32 = 1048576u;

struct ClusterUniforms {
    view: mat4x4<f32>,
    proj_clip: mat4x4<f32>,
    inv_view_proj: mat4x4<f32>,
    tile_size: vec2<f32>,
    grid_dim: vec2<u32>,
    cam_pos: vec3<f32>,
    cam_near: f32,
    cam_forward: vec3<f32>,
    cam_far: f32,
    resolution: vec2<f32>,
    num_lights: u32,
    _pad: u32,
};

@group(0) @binding(0) var<uniform> u: ClusterUniforms;
@group(0) @binding(1) var<storage, read> light_pos_ranges: array<vec4<f32>>;
@group(0) @binding(2) var<storage, read> light_colors: array<u32>;

fn depth_slice(depth: f32) -> u32 {
    let near = max(u.cam_near, 1e-6);
    if (depth <= near || u.cam_far <= near) {
        return 0u;
    }
    let t = log(depth / near) / log(u.cam_far / near);
    return u32(clamp(floor(t * f32(TILE_COUNT_Z)), 0.0, f32(TILE_COUNT_Z - 1u)));
}

fn cluster_index(c: vec3<u32>) -> u32 {
    return c.x + c.y * u.grid_dim.x + c.z * u.grid_dim.x * u.grid_dim.y;
}
"#
    };
}

macro_rules! grid_bindings_rw {
    () => {
        r#"
@group(1) @binding(0) var<storage, read_write> grid_flags: array<u32>;
@group(1) @binding(1) var<storage, read_write> light_bounds: array<u32>;
@group(1) @binding(2) var<storage, read_write> grid_light_counts: array<atomic<u32>>;
@group(1) @binding(3) var<storage, read_write> grid_light_count_total: array<atomic<u32>>;
@group(1) @binding(4) var<storage, read_write> grid_light_count_offsets: array<u32>;
@group(1) @binding(5) var<storage, read_write> light_list: array<u32>;
@group(1) @binding(6) var<storage, read_write> grid_light_counts_compare: array<atomic<u32>>;
"#
    };
}

macro_rules! push_constants {
    () => {
        r#"
struct DrawConstants {
    model: mat4x4<f32>,
};

var<push_constant> draw: DrawConstants;
"#
    };
}

/// Marks every cluster covered by opaque geometry.
pub const CLUSTERING_WGSL: &str = concat!(
    cluster_common!(),
    grid_bindings_rw!(),
    push_constants!(),
    r#"
struct ClusterVertexOut {
    @builtin(position) clip: vec4<f32>,
    @location(0) view_pos: vec3<f32>,
};

@vertex
fn vs_clustering(@location(0) position: vec3<f32>, @location(1) normal: vec3<f32>) -> ClusterVertexOut {
    let view_pos = u.view * draw.model * vec4<f32>(position, 1.0);
    var out: ClusterVertexOut;
    out.clip = u.proj_clip * view_pos;
    out.view_pos = view_pos.xyz;
    return out;
}

@fragment
fn fs_clustering(in: ClusterVertexOut) {
    let last = u.grid_dim - vec2<u32>(1u);
    let tile = min(vec2<u32>(in.clip.xy / u.tile_size), last);
    let slice = depth_slice(-in.view_pos.z);
    grid_flags[cluster_index(vec3<u32>(tile, slice))] = 1u;
}
"#
);

/// The three light culling kernels.
pub const LIGHT_CULL_WGSL: &str = concat!(
    cluster_common!(),
    grid_bindings_rw!(),
    r#"
struct ClusterRange {
    lo: vec3<u32>,
    hi: vec3<u32>,
    valid: bool,
};

fn view_box_clusters(bmin: vec3<f32>, bmax: vec3<f32>) -> ClusterRange {
    var range: ClusterRange;
    range.valid = false;
    let near = max(u.cam_near, 1e-6);
    let depth_min = max(-bmax.z, near);
    let depth_max = min(-bmin.z, u.cam_far);
    if (depth_min > depth_max) {
        return range;
    }

    var px_min = vec2<f32>(1e30);
    var px_max = vec2<f32>(-1e30);
    for (var k = 0u; k < 8u; k = k + 1u) {
        let x = select(bmin.x, bmax.x, (k & 1u) != 0u);
        let y = select(bmin.y, bmax.y, (k & 2u) != 0u);
        let z = select(-depth_min, -depth_max, (k & 4u) != 0u);
        let clip = u.proj_clip * vec4<f32>(x, y, z, 1.0);
        let px = (clip.xy / clip.w * 0.5 + vec2<f32>(0.5)) * u.resolution;
        px_min = min(px_min, px);
        px_max = max(px_max, px);
    }
    if (px_max.x < 0.0 || px_max.y < 0.0 || px_min.x >= u.resolution.x || px_min.y >= u.resolution.y) {
        return range;
    }

    let last = vec2<f32>(u.grid_dim - vec2<u32>(1u));
    let tile_min = vec2<u32>(clamp(floor(px_min / u.tile_size), vec2<f32>(0.0), last));
    let tile_max = vec2<u32>(clamp(floor(px_max / u.tile_size), vec2<f32>(0.0), last));
    range.lo = vec3<u32>(tile_min, depth_slice(depth_min));
    range.hi = vec3<u32>(tile_max, depth_slice(depth_max));
    range.valid = true;
    return range;
}

@compute @workgroup_size(32, 1, 1)
fn assign_lights(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= u.num_lights) {
        return;
    }
    let light = light_pos_ranges[i];
    let center = (u.view * vec4<f32>(light.xyz, 1.0)).xyz;
    let extent = vec3<f32>(max(light.w, 0.0));
    let range = view_box_clusters(center - extent, center + extent);

    let base = i * 6u;
    if (!range.valid) {
        light_bounds[base] = 1u;
        light_bounds[base + 1u] = 1u;
        light_bounds[base + 2u] = 1u;
        light_bounds[base + 3u] = 0u;
        light_bounds[base + 4u] = 0u;
        light_bounds[base + 5u] = 0u;
        return;
    }
    light_bounds[base] = range.lo.x;
    light_bounds[base + 1u] = range.lo.y;
    light_bounds[base + 2u] = range.lo.z;
    light_bounds[base + 3u] = range.hi.x;
    light_bounds[base + 4u] = range.hi.y;
    light_bounds[base + 5u] = range.hi.z;

    for (var z = range.lo.z; z <= range.hi.z; z = z + 1u) {
        for (var y = range.lo.y; y <= range.hi.y; y = y + 1u) {
            for (var x = range.lo.x; x <= range.hi.x; x = x + 1u) {
                let idx = cluster_index(vec3<u32>(x, y, z));
                if (grid_flags[idx] != 0u) {
                    atomicAdd(&grid_light_counts[idx], 1u);
                }
            }
        }
    }
}

@compute @workgroup_size(16, 16, 1)
fn calc_grid_offsets(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= u.grid_dim.x || gid.y >= u.grid_dim.y || gid.z >= TILE_COUNT_Z) {
        return;
    }
    let idx = cluster_index(gid);
    if (grid_flags[idx] == 0u) {
        return;
    }
    let count = atomicLoad(&grid_light_counts[idx]);
    if (count == 0u) {
        return;
    }
    grid_light_count_offsets[idx] = atomicAdd(&grid_light_count_total[0], count);
}

@compute @workgroup_size(32, 1, 1)
fn compact_light_list(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= u.num_lights) {
        return;
    }
    let base = i * 6u;
    let lo = vec3<u32>(light_bounds[base], light_bounds[base + 1u], light_bounds[base + 2u]);
    let hi = vec3<u32>(light_bounds[base + 3u], light_bounds[base + 4u], light_bounds[base + 5u]);
    if (any(lo > hi)) {
        return;
    }

    for (var z = lo.z; z <= hi.z; z = z + 1u) {
        for (var y = lo.y; y <= hi.y; y = y + 1u) {
            for (var x = lo.x; x <= hi.x; x = x + 1u) {
                let idx = cluster_index(vec3<u32>(x, y, z));
                if (grid_flags[idx] == 0u) {
                    continue;
                }
                let slot = atomicAdd(&grid_light_counts_compare[idx], 1u);
                let entry = grid_light_count_offsets[idx] + slot;
                if (entry < LIGHT_LIST_CAPACITY) {
                    light_list[entry] = i;
                }
            }
        }
    }
}
"#
);

/// Forward shading that walks each fragment's cluster light list.
pub const FORWARD_WGSL: &str = concat!(
    cluster_common!(),
    push_constants!(),
    r#"
@group(1) @binding(0) var<storage, read> grid_flags: array<u32>;
@group(1) @binding(2) var<storage, read> grid_light_counts: array<u32>;
@group(1) @binding(4) var<storage, read> grid_light_count_offsets: array<u32>;
@group(1) @binding(5) var<storage, read> light_list: array<u32>;

struct ForwardOut {
    @builtin(position) clip: vec4<f32>,
    @location(0) world_pos: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) view_pos: vec3<f32>,
};

@vertex
fn vs_forward(@location(0) position: vec3<f32>, @location(1) normal: vec3<f32>) -> ForwardOut {
    let world = draw.model * vec4<f32>(position, 1.0);
    let view_pos = u.view * world;
    var out: ForwardOut;
    out.clip = u.proj_clip * view_pos;
    out.world_pos = world.xyz;
    out.normal = (draw.model * vec4<f32>(normal, 0.0)).xyz;
    out.view_pos = view_pos.xyz;
    return out;
}

@fragment
fn fs_forward(in: ForwardOut) -> @location(0) vec4<f32> {
    let last = u.grid_dim - vec2<u32>(1u);
    let tile = min(vec2<u32>(in.clip.xy / u.tile_size), last);
    let idx = cluster_index(vec3<u32>(tile, depth_slice(-in.view_pos.z)));
    let n = normalize(in.normal);

    var color = vec3<f32>(0.03);
    if (grid_flags[idx] != 0u) {
        let offset = grid_light_count_offsets[idx];
        let count = grid_light_counts[idx];
        for (var k = 0u; k < count; k = k + 1u) {
            let entry = offset + k;
            if (entry >= LIGHT_LIST_CAPACITY) {
                break;
            }
            let li = light_list[entry];
            let light = light_pos_ranges[li];
            let to_light = light.xyz - in.world_pos;
            let dist = length(to_light);
            if (dist >= light.w) {
                continue;
            }
            let falloff = 1.0 - dist / light.w;
            let ndl = max(dot(n, to_light / max(dist, 1e-4)), 0.0);
            color += unpack4x8unorm(light_colors[li]).rgb * ndl * falloff * falloff;
        }
    }
    return vec4<f32>(color, 1.0);
}
"#
);

/// Depth-only rendering into one shadow cascade.
pub const SHADOW_WGSL: &str = r#"
struct ShadowConstants {
    light_view_proj_model: mat4x4<f32>,
};

var<push_constant> draw: ShadowConstants;

@vertex
fn vs_shadow(@location(0) position: vec3<f32>, @location(1) normal: vec3<f32>) -> @builtin(position) vec4<f32> {
    return draw.light_view_proj_model * vec4<f32>(position, 1.0);
}

@fragment
fn fs_shadow() {
}
"#;

pub const SHADOW_VS: ShaderProgram = ShaderProgram {
    label: "shadow",
    source: SHADOW_WGSL,
    entry_point: "vs_shadow",
};

pub const SHADOW_FS: ShaderProgram = ShaderProgram {
    label: "shadow",
    source: SHADOW_WGSL,
    entry_point: "fs_shadow",
};

pub const CLUSTERING_VS: ShaderProgram = ShaderProgram {
    label: "clustering",
    source: CLUSTERING_WGSL,
    entry_point: "vs_clustering",
};

pub const CLUSTERING_FS: ShaderProgram = ShaderProgram {
    label: "clustering",
    source: CLUSTERING_WGSL,
    entry_point: "fs_clustering",
};

pub const ASSIGN_LIGHTS: ShaderProgram = ShaderProgram {
    label: "calc_light_grids",
    source: LIGHT_CULL_WGSL,
    entry_point: "assign_lights",
};

pub const CALC_GRID_OFFSETS: ShaderProgram = ShaderProgram {
    label: "calc_grid_offsets",
    source: LIGHT_CULL_WGSL,
    entry_point: "calc_grid_offsets",
};

pub const COMPACT_LIGHT_LIST: ShaderProgram = ShaderProgram {
    label: "calc_light_list",
    source: LIGHT_CULL_WGSL,
    entry_point: "compact_light_list",
};

pub const FORWARD_VS: ShaderProgram = ShaderProgram {
    label: "cluster_forward",
    source: FORWARD_WGSL,
    entry_point: "vs_forward",
};

pub const FORWARD_FS: ShaderProgram = ShaderProgram {
    label: "cluster_forward",
    source: FORWARD_WGSL,
    entry_point: "fs_forward",
};

#[cfg(test)]
mod tests {
    use super::*;
    use naga::valid::{Capabilities, ValidationFlags, Validator};

    fn validate(source: &str) -> naga::Module {
        let module = match naga::front::wgsl::parse_str(source) {
            Ok(module) => module,
            Err(e) => panic!("{}", e.emit_to_string(source)),
        };
        Validator::new(ValidationFlags::all(), Capabilities::PUSH_CONSTANT)
            .validate(&module)
            .unwrap_or_else(|e| panic!("validation failed: {e:?}"));
        module
    }

    fn entry_points(module: &naga::Module) -> Vec<&str> {
        module.entry_points.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_shadow_shader_validates() {
        let module = validate(SHADOW_WGSL);
        assert_eq!(entry_points(&module), vec!["vs_shadow", "fs_shadow"]);
        assert!(module.global_variables.iter().all(|(_, v)| v.binding.is_none()));
    }

    #[test]
    fn test_clustering_shader_validates() {
        let module = validate(CLUSTERING_WGSL);
        assert_eq!(entry_points(&module), vec!["vs_clustering", "fs_clustering"]);
    }

    #[test]
    fn test_light_cull_shader_validates() {
        let module = validate(LIGHT_CULL_WGSL);
        assert_eq!(
            entry_points(&module),
            vec!["assign_lights", "calc_grid_offsets", "compact_light_list"]
        );
        let sizes: Vec<[u32; 3]> = module.entry_points.iter().map(|e| e.workgroup_size).collect();
        assert_eq!(sizes, vec![[32, 1, 1], [16, 16, 1], [32, 1, 1]]);
    }

    #[test]
    fn test_forward_shader_validates() {
        let module = validate(FORWARD_WGSL);
        assert_eq!(entry_points(&module), vec!["vs_forward", "fs_forward"]);
    }

    #[test]
    fn test_uniform_block_matches_host_layout() {
        let module = validate(LIGHT_CULL_WGSL);
        let (_, ty) = module
            .types
            .iter()
            .find(|(_, t)| t.name.as_deref() == Some("ClusterUniforms"))
            .expect("uniform block type");
        let naga::TypeInner::Struct { members, span } = &ty.inner else {
            panic!("uniform block is not a struct");
        };
        assert_eq!(*span as usize, std::mem::size_of::<crate::cluster::ClusterUniforms>());
        let cam_pos = members.iter().find(|m| m.name.as_deref() == Some("cam_pos")).unwrap();
        assert_eq!(cam_pos.offset, 208);
    }
}
