//! CPU-side frame pacing: simulate/render hand-off and frame rate limiting.

mod limiter;
mod semaphore;

pub use limiter::FrameLimiter;
pub use semaphore::{FrameSync, Semaphore};
