//! GPU resource helpers
//!
//! Per-frame shared buffers and buffer barrier construction.

mod barrier;
mod shared_buffer;

pub use barrier::*;
pub use shared_buffer::*;
