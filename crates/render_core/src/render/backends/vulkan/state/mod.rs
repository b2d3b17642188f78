//! Presentation state: swapchain, synchronization and frame pacing

pub mod frame_pacer;
pub mod swapchain;
pub mod sync;

pub use frame_pacer::{FramePacer, FrameRing, FrameState, RecordingFrame};
pub use swapchain::Swapchain;
pub use sync::{Fence, Semaphore};
