//! GPU resources: buffers, images, uploads and their managers

pub mod buffer;
pub mod cubemap;
pub mod image;
pub mod mesh_manager;
pub mod render_target;
pub mod texture_manager;
pub mod upload;

pub use buffer::{GpuBuffer, MemoryResidency};
pub use cubemap::{cross_copy_regions, cross_layout_regions, face_size_for_cross, FaceRegion};
pub use image::{mip_extent, mip_levels_for, GpuImage, ImageDesc};
pub use mesh_manager::{GpuMesh, MeshHandle, MeshManager};
pub use render_target::{find_depth_format, AttachmentKind, RenderTarget};
pub use texture_manager::{effective_anisotropy, Texture, TextureHandle, TextureManager};
pub use upload::{texel_size, StagedUpload};
