//! Scene data consumed by the renderer

mod camera;
mod light;
mod view;

pub use camera::*;
pub use light::*;
pub use view::*;
