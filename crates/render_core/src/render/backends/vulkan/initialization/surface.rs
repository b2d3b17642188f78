//! Vulkan surface management
//!
//! Handles window surface creation and management for presentation. The
//! window side is abstracted behind [`SurfaceProvider`] so the device context
//! never depends on a particular windowing library.

use ash::{extensions::khr, vk, Entry, Instance};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::{CStr, CString};

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Window-side half of surface creation
///
/// Implemented by the GLFW [`Window`](super::Window) and by
/// [`RawWindowSurface`] for any window exposing raw handles.
pub trait SurfaceProvider {
    /// Instance extensions the window system needs
    fn required_instance_extensions(&self) -> VulkanResult<Vec<CString>>;

    /// Create a surface for this window on `instance`
    fn create_surface(&mut self, entry: &Entry, instance: &Instance) -> VulkanResult<vk::SurfaceKHR>;

    /// Current framebuffer size in pixels
    fn framebuffer_extent(&self) -> vk::Extent2D;

    /// Block until the framebuffer has a non-zero size (e.g. while minimized)
    ///
    /// The default returns immediately with whatever extent is current.
    fn wait_for_valid_extent(&mut self) -> vk::Extent2D {
        self.framebuffer_extent()
    }
}

/// Presentable surface owned by the device context
pub struct PresentationSurface {
    surface_loader: khr::Surface,
    surface: vk::SurfaceKHR,
}

impl PresentationSurface {
    /// Create a surface through `provider`
    pub fn new(entry: &Entry, instance: &Instance, provider: &mut dyn SurfaceProvider) -> VulkanResult<Self> {
        let surface_loader = khr::Surface::new(entry, instance);
        let surface = provider.create_surface(entry, instance)?;
        log::debug!("Created presentation surface {:?}", surface);

        Ok(Self { surface_loader, surface })
    }

    /// Get the underlying surface handle
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Get the surface loader
    pub fn loader(&self) -> &khr::Surface {
        &self.surface_loader
    }

    /// Whether `queue_family` on `physical_device` can present to this surface
    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, queue_family: u32) -> VulkanResult<bool> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_support(physical_device, queue_family, self.surface)
                .map_err(VulkanError::from)
        }
    }

    /// Get surface capabilities for a physical device
    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
                .map_err(VulkanError::from)
        }
    }

    /// Get surface formats for a physical device
    pub fn formats(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)
                .map_err(VulkanError::from)
        }
    }

    /// Get surface present modes for a physical device
    pub fn present_modes(&self, physical_device: vk::PhysicalDevice) -> VulkanResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
                .map_err(VulkanError::from)
        }
    }

    /// Destroy the surface
    ///
    /// # Safety
    /// Every swapchain built on the surface must already be destroyed, and the
    /// surface must not be used afterwards.
    pub(crate) unsafe fn destroy(&mut self) {
        if self.surface != vk::SurfaceKHR::null() {
            self.surface_loader.destroy_surface(self.surface, None);
            self.surface = vk::SurfaceKHR::null();
        }
    }
}

/// Surface provider for any window exposing raw handles
///
/// Raw handles carry no size information, so the caller reports the
/// framebuffer extent and updates it on resize.
pub struct RawWindowSurface<'w, W> {
    window: &'w W,
    extent: vk::Extent2D,
}

impl<'w, W> RawWindowSurface<'w, W>
where
    W: HasRawWindowHandle + HasRawDisplayHandle,
{
    /// Wrap `window` with its current framebuffer size
    pub fn new(window: &'w W, width: u32, height: u32) -> Self {
        Self {
            window,
            extent: vk::Extent2D { width, height },
        }
    }

    /// Record a new framebuffer size
    pub fn set_extent(&mut self, width: u32, height: u32) {
        self.extent = vk::Extent2D { width, height };
    }
}

impl<W> SurfaceProvider for RawWindowSurface<'_, W>
where
    W: HasRawWindowHandle + HasRawDisplayHandle,
{
    fn required_instance_extensions(&self) -> VulkanResult<Vec<CString>> {
        let names = ash_window::enumerate_required_extensions(self.window.raw_display_handle())
            .map_err(VulkanError::from)?;

        Ok(names
            .iter()
            // SAFETY: ash-window returns static, NUL-terminated extension names
            .map(|&name| unsafe { CStr::from_ptr(name) }.to_owned())
            .collect())
    }

    fn create_surface(&mut self, entry: &Entry, instance: &Instance) -> VulkanResult<vk::SurfaceKHR> {
        unsafe {
            ash_window::create_surface(
                entry,
                instance,
                self.window.raw_display_handle(),
                self.window.raw_window_handle(),
                None,
            )
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to create surface: {:?}", e)))
        }
    }

    fn framebuffer_extent(&self) -> vk::Extent2D {
        self.extent
    }
}
