//! Vulkan backend implementation
//!
//! Organized into initialization, resources, rendering and state modules.

/// Error type shared by the backend
pub mod error;

/// Vulkan initialization types (context, surface, window)
pub mod initialization;

/// GPU resources (buffers, images, uploads, managers)
pub mod resources;

/// Command recording (pools, barriers, shaders, renderers)
pub mod rendering;

/// Presentation state (swapchain, sync, frame pacing)
pub mod state;

pub use error::{ErrorSeverity, OrAbort, VulkanError, VulkanResult};

// Re-export core initialization types
pub use initialization::{DeviceContext, DeviceToken, PhysicalDeviceInfo, PresentationSurface, SurfaceProvider, Window};

// Re-export resource types
pub use resources::{
    GpuBuffer, GpuImage, GpuMesh, ImageDesc, MemoryResidency, MeshHandle, MeshManager, RenderTarget, StagedUpload,
    Texture, TextureHandle, TextureManager,
};

// Re-export rendering types
pub use rendering::{BarrierBatch, ClearRenderer, ImageScope, MeshRenderer, Renderer, Scope};

// Re-export state types
pub use state::{FramePacer, FrameRing, FrameState, RecordingFrame};
