//! Cluster Renderer - a frame-graph renderer with clustered forward lighting
//!
//! The renderer splits the view frustum into a grid of clusters, flags the
//! clusters that contain visible geometry, assigns point lights to them on
//! the compute queue and shades with the compacted per-cluster light lists.
//!
//! Two backends implement [`backend::GraphicsBackend`]:
//! - **Vulkan** via ash (feature `vulkan-backend`, enabled by default)
//! - **Software**: a CPU reference that runs the culling kernels in process,
//!   used for tests and headless validation
//!
//! # Modules
//! - [`frame_graph`]: passes with queue affinity, recorded per submission queue
//! - [`cluster`]: grid math, light gathering, grid buffers and the culling stages
//! - [`renderer`]: the three-submission frame built from the pieces above
//! - [`sync`]: simulate/render hand-off and frame rate limiting

pub mod backend;
pub mod cluster;
pub mod frame_graph;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod sync;

pub use backend::{GraphicsBackend, SoftwareBackend, SoftwareConfig, SubmitQueue};
#[cfg(feature = "vulkan-backend")]
pub use backend::{VulkanBackend, VulkanConfig};
pub use renderer::{
    ClusterRenderer, FrameTimings, GpuTimer, RendererConfig, RendererError, RendererResult,
};
pub use scene::{Camera, Light, RenderView};
pub use sync::{FrameLimiter, FrameSync};
