//! Command recording: pools, barriers, shaders and renderers

pub mod barriers;
pub mod commands;
pub mod mesh_renderer;
pub mod renderer;
pub mod shader;

pub use barriers::{full_range, BarrierBatch, ImageScope, Scope};
pub use commands::{CommandPool, OneShotCommands};
pub use mesh_renderer::{Camera, CameraUniform, MeshRenderer};
pub use renderer::{ClearRenderer, Renderer};
pub use shader::ShaderModule;
