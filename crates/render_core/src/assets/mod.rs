//! Asset loading
//!
//! CPU-side data handed to the upload path: decoded images and plain
//! vertex/index meshes.

pub mod image_loader;
pub mod mesh_data;

pub use image_loader::ImageData;
pub use mesh_data::{MeshData, Vertex};

use thiserror::Error;

/// Asset loading errors
#[derive(Error, Debug)]
pub enum AssetError {
    /// Asset not found
    #[error("Asset not found: {0}")]
    NotFound(String),

    /// Failed to load asset
    #[error("Failed to load asset: {0}")]
    LoadFailed(String),

    /// Invalid asset data
    #[error("Invalid data: {0}")]
    InvalidData(String),
}
