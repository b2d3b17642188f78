//! Instance, device and window system setup

pub mod context;
pub mod surface;
pub mod window;

pub use context::{DeviceContext, DeviceToken, PhysicalDeviceInfo};
pub use surface::{PresentationSurface, RawWindowSurface, SurfaceProvider};
pub use window::{Window, WindowError, WindowResult};
