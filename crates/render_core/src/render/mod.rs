//! Rendering: the Vulkan backend and the engine that drives it

pub mod backends;
pub mod engine;

pub use engine::{FrameOutcome, RenderEngine, TimeoutTracker};
