//! Backend abstraction layer
//!
//! Provides the traits and types that the software and Vulkan backends implement.

pub mod command;
pub mod software;
pub mod traits;
pub mod types;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub use command::*;
pub use software::{SoftwareBackend, SoftwareConfig, SoftwareStats};
pub use traits::*;
pub use types::*;

#[cfg(feature = "vulkan-backend")]
pub use vulkan::{VulkanBackend, VulkanConfig};
