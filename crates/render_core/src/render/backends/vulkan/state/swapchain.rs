//! Swapchain creation, image acquisition and presentation

use std::time::Duration;

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Device};

use super::sync::{timeout_nanos, Semaphore};
use crate::render::backends::vulkan::initialization::PresentationSurface;
use crate::render::backends::vulkan::{DeviceContext, VulkanError, VulkanResult};

/// Prefer B8G8R8A8_SRGB with the sRGB nonlinear color space
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|sf| sf.format == vk::Format::B8G8R8A8_SRGB && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
}

/// MAILBOX when vsync is off and available, FIFO otherwise
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync && modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Surface extent, or the window size clamped to the surface limits
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window_extent: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: window_extent
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: window_extent
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more image than the minimum, bounded by the maximum (0 = unbounded)
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        desired.min(caps.max_image_count)
    } else {
        desired
    }
}

/// Swapchain images, their views and per-image ready-to-present semaphores
pub struct Swapchain {
    device: Device,
    loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    ready_to_present: Vec<Semaphore>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
}

impl Swapchain {
    /// Create a swapchain for `surface`
    ///
    /// Pass the current swapchain as `old_swapchain` when rebuilding; it must
    /// still be destroyed by its owner afterwards.
    pub fn new(
        ctx: &DeviceContext,
        surface: &PresentationSurface,
        window_extent: vk::Extent2D,
        vsync: bool,
        old_swapchain: vk::SwapchainKHR,
    ) -> VulkanResult<Self> {
        let physical = ctx.physical_device().device;
        let caps = surface.capabilities(physical)?;
        let formats = surface.formats(physical)?;
        let modes = surface.present_modes(physical)?;

        let format = choose_surface_format(&formats)
            .ok_or_else(|| VulkanError::InitializationFailed("surface reports no formats".to_string()))?;
        let present_mode = choose_present_mode(&modes, vsync);
        let extent = choose_extent(&caps, window_extent);
        if extent.width == 0 || extent.height == 0 {
            return Err(VulkanError::InvalidWindow);
        }
        let image_count = choose_image_count(&caps);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let loader = SwapchainLoader::new(ctx.instance(), ctx.device());
        let swapchain = unsafe { loader.create_swapchain(&create_info, None)? };

        // Partially built; Drop releases whatever exists on the error paths below
        let mut built = Self {
            device: ctx.device().clone(),
            loader,
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            ready_to_present: Vec::new(),
            format,
            extent,
            present_mode,
        };

        built.images = unsafe { built.loader.get_swapchain_images(swapchain)? };
        for &image in &built.images {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { built.device.create_image_view(&view_info, None)? };
            built.image_views.push(view);
            built.ready_to_present.push(Semaphore::new(&built.device)?);
        }

        log::info!(
            "Swapchain created: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            built.images.len(),
            format.format,
            present_mode
        );
        Ok(built)
    }

    /// Acquire the next image, signalling `signal` when it is ready
    ///
    /// Out-of-date and suboptimal swapchains are reported as `InvalidWindow`,
    /// an expired wait as `FrameTimeout`.
    pub fn acquire_next_image(&self, signal: vk::Semaphore, timeout: Duration) -> VulkanResult<u32> {
        let (index, suboptimal) = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout_nanos(timeout), signal, vk::Fence::null())?
        };
        if suboptimal {
            return Err(VulkanError::InvalidWindow);
        }
        Ok(index)
    }

    /// Present `image_index` once its ready-to-present semaphore is signalled
    pub fn present(&self, queue: vk::Queue, image_index: u32) -> VulkanResult<()> {
        let wait = [self.ready_to_present(image_index)?];
        let swapchains = [self.swapchain];
        let indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);

        let suboptimal = unsafe { self.loader.queue_present(queue, &present_info)? };
        if suboptimal {
            return Err(VulkanError::InvalidWindow);
        }
        Ok(())
    }

    /// Semaphore signalled when rendering to `image_index` completes
    pub fn ready_to_present(&self, image_index: u32) -> VulkanResult<vk::Semaphore> {
        self.ready_to_present
            .get(image_index as usize)
            .map(Semaphore::handle)
            .ok_or_else(|| VulkanError::invalid(format!("no swapchain image {}", image_index)))
    }

    /// Raw swapchain handle
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Image at `index`
    pub fn image(&self, index: u32) -> Option<vk::Image> {
        self.images.get(index as usize).copied()
    }

    /// View of the image at `index`
    pub fn image_view(&self, index: u32) -> Option<vk::ImageView> {
        self.image_views.get(index as usize).copied()
    }

    /// Number of images
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Surface format
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Image size
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Present mode in use
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
        // `ready_to_present` semaphores drop with the struct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32, current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: current,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            ..Default::default()
        }
    }

    #[test]
    fn test_prefers_srgb_bgra() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(choose_surface_format(&formats).map(|f| f.format), Some(vk::Format::B8G8R8A8_SRGB));
        assert_eq!(choose_surface_format(&formats[..1]).map(|f| f.format), Some(vk::Format::R8G8B8A8_UNORM));
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn test_present_mode_follows_vsync() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&[vk::PresentModeKHR::FIFO], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_image_count_is_clamped() {
        let fixed = vk::Extent2D { width: 800, height: 600 };
        assert_eq!(choose_image_count(&caps(2, 8, fixed)), 3);
        assert_eq!(choose_image_count(&caps(3, 3, fixed)), 3);
        assert_eq!(choose_image_count(&caps(2, 0, fixed)), 3);
    }

    #[test]
    fn test_extent_uses_window_size_when_surface_is_flexible() {
        let flexible = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        let window = vk::Extent2D { width: 9000, height: 300 };
        assert_eq!(
            choose_extent(&caps(2, 0, flexible), window),
            vk::Extent2D { width: 4096, height: 300 }
        );

        let fixed = vk::Extent2D { width: 800, height: 600 };
        assert_eq!(choose_extent(&caps(2, 0, fixed), window), fixed);
    }
}
