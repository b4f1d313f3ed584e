//! Clustered light assignment.
//!
//! The view frustum is split into screen tiles × exponential depth slices.
//! Geometry flags the clusters it touches, then three compute stages build a
//! compact per-cluster light list that the shading pass walks.

pub mod buffers;
pub mod cull;
pub mod grid;
pub mod light;
pub mod shaders;

pub use buffers::{GridBuffers, LIGHT_BOUNDS_WORDS, LIGHT_LIST_CAPACITY};
pub use cull::{CullDispatch, CullTimestamps, LightCuller, LIGHT_GROUP_SIZE, OFFSETS_GROUP_SIZE};
pub use grid::{
    depth_slice, ClusterBounds, ClusterGrid, ClusterUniforms, MAX_HEIGHT, MAX_WIDTH, TILE_COUNT_Z,
    TILE_HEIGHT, TILE_WIDTH,
};
pub use light::{gather_point_lights, GatheredLights, LightBuffers, MAX_NUM_LIGHTS, MIN_NUM_LIGHTS};
