//! GLFW-based window management for Vulkan rendering
//!
//! Creates a window without a client API, reports its framebuffer size and
//! creates the Vulkan surface through GLFW. Implements [`SurfaceProvider`] so
//! it can be handed straight to [`DeviceContext::new`](super::DeviceContext::new).

use ash::{vk, Entry, Instance};
use std::ffi::CString;
use thiserror::Error;

use super::surface::SurfaceProvider;
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Window management errors
#[derive(Error, Debug)]
pub enum WindowError {
    /// GLFW could not be initialized
    #[error("GLFW initialization failed")]
    InitializationFailed,

    /// The window could not be created
    #[error("Window creation failed")]
    CreationFailed,

    /// Any other GLFW failure
    #[error("GLFW error: {0}")]
    GlfwError(String),
}

/// Result type for window operations
pub type WindowResult<T> = Result<T, WindowError>;

/// GLFW window wrapper with proper resource management
pub struct Window {
    glfw: glfw::Glfw,
    window: glfw::PWindow,
    events: glfw::GlfwReceiver<(f64, glfw::WindowEvent)>,
}

impl Window {
    /// Open a resizable window with no client API
    pub fn new(title: &str, width: u32, height: u32) -> WindowResult<Self> {
        let mut glfw = glfw::init(glfw::fail_on_errors).map_err(|_| WindowError::InitializationFailed)?;

        if !glfw.vulkan_supported() {
            return Err(WindowError::GlfwError("Vulkan loader not found".to_string()));
        }

        glfw.window_hint(glfw::WindowHint::ClientApi(glfw::ClientApiHint::NoApi));
        glfw.window_hint(glfw::WindowHint::Resizable(true));

        let (mut window, events) = glfw
            .create_window(width, height, title, glfw::WindowMode::Windowed)
            .ok_or(WindowError::CreationFailed)?;

        window.set_close_polling(true);
        window.set_framebuffer_size_polling(true);

        log::info!("Created {}x{} window '{}'", width, height, title);

        Ok(Self { glfw, window, events })
    }

    /// Whether the user asked to close the window
    pub fn should_close(&self) -> bool {
        self.window.should_close()
    }

    /// Request (or cancel a request) to close the window
    pub fn set_should_close(&mut self, should_close: bool) {
        self.window.set_should_close(should_close);
    }

    /// Process pending window events
    ///
    /// Returns true when a framebuffer resize was among them.
    pub fn poll_events(&mut self) -> bool {
        self.glfw.poll_events();
        glfw::flush_messages(&self.events)
            .any(|(_, event)| matches!(event, glfw::WindowEvent::FramebufferSize(..)))
    }

    /// Resize the window
    pub fn set_size(&mut self, width: u32, height: u32) {
        self.window.set_size(width as i32, height as i32);
    }

    /// Get the framebuffer size in pixels
    pub fn get_framebuffer_size(&self) -> (u32, u32) {
        let (width, height) = self.window.get_framebuffer_size();
        (width.max(0) as u32, height.max(0) as u32)
    }
}

impl SurfaceProvider for Window {
    fn required_instance_extensions(&self) -> VulkanResult<Vec<CString>> {
        let names = self.glfw.get_required_instance_extensions().ok_or_else(|| {
            VulkanError::InitializationFailed("GLFW reported no Vulkan instance extensions".to_string())
        })?;

        names
            .into_iter()
            .map(|name| {
                CString::new(name)
                    .map_err(|e| VulkanError::InitializationFailed(format!("Bad extension name: {}", e)))
            })
            .collect()
    }

    fn create_surface(&mut self, _entry: &Entry, instance: &Instance) -> VulkanResult<vk::SurfaceKHR> {
        let mut surface = vk::SurfaceKHR::null();
        let result = self
            .window
            .create_window_surface(instance.handle(), std::ptr::null(), &mut surface);

        if result == vk::Result::SUCCESS {
            Ok(surface)
        } else {
            Err(VulkanError::InitializationFailed(format!(
                "Failed to create Vulkan surface: {:?}",
                result
            )))
        }
    }

    fn framebuffer_extent(&self) -> vk::Extent2D {
        let (width, height) = self.get_framebuffer_size();
        vk::Extent2D { width, height }
    }

    fn wait_for_valid_extent(&mut self) -> vk::Extent2D {
        let mut extent = self.framebuffer_extent();
        while (extent.width == 0 || extent.height == 0) && !self.should_close() {
            self.glfw.wait_events();
            extent = self.framebuffer_extent();
        }
        extent
    }
}
