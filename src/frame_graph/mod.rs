//! Frame graph and pass scheduling.
//!
//! Passes are recorded in insertion order into one command list per
//! [`SubmitQueue`](crate::backend::SubmitQueue). Render passes and pipelines
//! are created once; framebuffers are created lazily and recreated after a
//! resize.

mod context;
mod graph;
mod pass;

pub use context::{FrameContext, PassContext};
pub use graph::{FrameGraph, FrameGraphError, FrameGraphResult};
pub use pass::{
    ComputePass, FramebufferCreator, FramebufferTarget, GraphicsPass, Pass, PassCallback,
    PipelineCreator, RenderPassCreator, Subpass, SubpassRecorder,
};
