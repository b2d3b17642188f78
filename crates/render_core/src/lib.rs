//! # Render Core
//!
//! GPU resource lifecycle and frame pacing for a Vulkan 1.3 renderer.
//!
//! ## Features
//!
//! - **Slab allocators**: a LIFO scratch [`Arena`](foundation::Arena) and
//!   generation-checked [`Pool`](foundation::Pool) handles
//! - **Device context**: instance, device selection, queue, allocator and
//!   command pools behind a single-owner [`DeviceToken`](prelude::DeviceToken)
//! - **Resources**: buffers, images, staged uploads, mip chains, cubemaps,
//!   mesh and texture managers
//! - **Barrier batching** on synchronization2
//! - **Frame pacing** over a swapchain with frames in flight and resize recovery
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_core::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     render_core::foundation::logging::init_with_filter("info");
//!
//!     let mut window = Window::new("Render Core", 1280, 720)?;
//!     let mut engine = RenderEngine::new(&mut window, RenderCoreConfig::new("demo"))?;
//!
//!     while !window.should_close() {
//!         if window.poll_events() {
//!             engine.handle_resize(&mut window)?;
//!         }
//!         engine.draw_frame(&mut window)?;
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod assets;
pub mod config;
pub mod core;
pub mod foundation;
pub mod render;

/// Common imports for users of the render core
pub mod prelude {
    pub use crate::{
        assets::{AssetError, ImageData, MeshData, Vertex},
        core::{Config, DeviceConfig, PresentConfig, RenderCoreConfig, ResourceLimits},
        foundation::{Arena, Handle, Pool},
        render::{
            backends::vulkan::{
                BarrierBatch, ClearRenderer, DeviceContext, DeviceToken, FramePacer, GpuBuffer, GpuImage, ImageDesc,
                ImageScope, MemoryResidency, MeshManager, MeshRenderer, OrAbort, RecordingFrame, Renderer, Scope,
                StagedUpload, SurfaceProvider, TextureManager, VulkanError, VulkanResult, Window,
            },
            FrameOutcome, RenderEngine,
        },
    };
}
