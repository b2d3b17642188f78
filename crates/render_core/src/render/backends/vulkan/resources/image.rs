//! GPU images, views and mip chain generation

use ash::vk;
use vk_mem::Alloc;

use crate::render::backends::vulkan::rendering::barriers::{BarrierBatch, ImageScope};
use crate::render::backends::vulkan::{DeviceContext, VulkanError, VulkanResult};

/// Number of levels in a full mip chain for `extent`: ⌊log2(max(w, h))⌋ + 1
pub fn mip_levels_for(extent: vk::Extent2D) -> u32 {
    let largest = extent.width.max(extent.height).max(1);
    u32::BITS - largest.leading_zeros()
}

/// Size of mip `level` of an image with base size `extent`
pub fn mip_extent(extent: vk::Extent2D, level: u32) -> vk::Extent2D {
    vk::Extent2D {
        width: extent.width.checked_shr(level).unwrap_or(0).max(1),
        height: extent.height.checked_shr(level).unwrap_or(0).max(1),
    }
}

/// Image creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    /// Size of level 0
    pub extent: vk::Extent2D,
    /// Texel format
    pub format: vk::Format,
    /// Number of mip levels
    pub mip_levels: u32,
    /// Number of array layers (6 for cubemaps)
    pub array_layers: u32,
    /// Usage flags
    pub usage: vk::ImageUsageFlags,
    /// Aspect covered by the view
    pub aspect: vk::ImageAspectFlags,
    /// Sample count
    pub samples: vk::SampleCountFlags,
    /// Create as a cube-compatible image with a cube view
    pub cube: bool,
}

impl ImageDesc {
    /// Sampled 2D texture filled by transfers, optionally with a full mip chain
    pub fn texture_2d(extent: vk::Extent2D, format: vk::Format, mipmapped: bool) -> Self {
        let mut usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST;
        if mipmapped {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        Self {
            extent,
            format,
            mip_levels: if mipmapped { mip_levels_for(extent) } else { 1 },
            array_layers: 1,
            usage,
            aspect: vk::ImageAspectFlags::COLOR,
            samples: vk::SampleCountFlags::TYPE_1,
            cube: false,
        }
    }

    /// Sampled cubemap with square faces of `face_size`
    pub fn cubemap(face_size: u32, format: vk::Format, mipmapped: bool) -> Self {
        Self {
            array_layers: 6,
            cube: true,
            ..Self::texture_2d(vk::Extent2D { width: face_size, height: face_size }, format, mipmapped)
        }
    }

    /// Color render target
    pub fn color_attachment(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self {
            extent,
            format,
            mip_levels: 1,
            array_layers: 1,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC,
            aspect: vk::ImageAspectFlags::COLOR,
            samples: vk::SampleCountFlags::TYPE_1,
            cube: false,
        }
    }

    /// Depth render target
    pub fn depth_attachment(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self {
            extent,
            format,
            mip_levels: 1,
            array_layers: 1,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect: vk::ImageAspectFlags::DEPTH,
            samples: vk::SampleCountFlags::TYPE_1,
            cube: false,
        }
    }

    /// Range covering every level and layer
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }

    /// Size in bytes of level 0 across all layers for a 4-byte texel format
    pub fn rgba8_size(&self) -> vk::DeviceSize {
        vk::DeviceSize::from(self.extent.width)
            * vk::DeviceSize::from(self.extent.height)
            * 4
            * vk::DeviceSize::from(self.array_layers)
    }

    fn validate(&self) -> VulkanResult<()> {
        if self.extent.width == 0 || self.extent.height == 0 {
            return Err(VulkanError::invalid("image extent must be non-zero"));
        }
        if self.mip_levels == 0 || self.mip_levels > mip_levels_for(self.extent) {
            return Err(VulkanError::invalid(format!(
                "{} mip levels requested for a {}x{} image",
                self.mip_levels, self.extent.width, self.extent.height
            )));
        }
        if self.cube && (self.array_layers != 6 || self.extent.width != self.extent.height) {
            return Err(VulkanError::invalid("cubemaps need 6 layers of square faces"));
        }
        if self.array_layers == 0 {
            return Err(VulkanError::invalid("image needs at least one layer"));
        }
        Ok(())
    }
}

/// Image, view and memory allocation
pub struct GpuImage {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<vk_mem::Allocation>,
    desc: ImageDesc,
}

impl GpuImage {
    /// Create an image in device-local memory and a view over all of it
    pub fn new(ctx: &DeviceContext, desc: &ImageDesc) -> VulkanResult<Self> {
        desc.validate()?;

        let flags = if desc.cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };

        let image_info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(desc.samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let allocation_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };

        let (image, mut allocation) = unsafe { ctx.allocator().create_image(&image_info, &allocation_info)? };

        let view_type = if desc.cube {
            vk::ImageViewType::CUBE
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(view_type)
            .format(desc.format)
            .subresource_range(desc.full_range());

        let view = match unsafe { ctx.device().create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe { ctx.allocator().destroy_image(image, &mut allocation) };
                return Err(e.into());
            }
        };

        log::trace!(
            "Created {}x{} {:?} image ({} levels, {} layers)",
            desc.extent.width,
            desc.extent.height,
            desc.format,
            desc.mip_levels,
            desc.array_layers
        );

        Ok(Self {
            image,
            view,
            allocation: Some(allocation),
            desc: *desc,
        })
    }

    /// Get image handle
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// View over every level and layer
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Creation parameters
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    /// Size of level 0
    pub fn extent(&self) -> vk::Extent2D {
        self.desc.extent
    }

    /// Texel format
    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    /// Number of mip levels
    pub fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }

    /// Record blits that fill levels 1.. from level 0
    ///
    /// Every level must be in `TRANSFER_DST_OPTIMAL` with level 0 holding the
    /// source texels. All layers are processed together, and every level ends
    /// up in `final_layout`.
    pub fn generate_mipmaps(
        &self,
        ctx: &DeviceContext,
        cmd: vk::CommandBuffer,
        final_layout: vk::ImageLayout,
    ) -> VulkanResult<()> {
        let features = ctx.format_properties(self.desc.format).optimal_tiling_features;
        check_linear_blit(features, self.desc.format)?;

        let device = ctx.device();
        let final_scope = ImageScope::for_layout(final_layout);
        let level_range = |level: u32| vk::ImageSubresourceRange {
            aspect_mask: self.desc.aspect,
            base_mip_level: level,
            level_count: 1,
            base_array_layer: 0,
            layer_count: self.desc.array_layers,
        };
        let level_layers = |level: u32| vk::ImageSubresourceLayers {
            aspect_mask: self.desc.aspect,
            mip_level: level,
            base_array_layer: 0,
            layer_count: self.desc.array_layers,
        };

        for level in 1..self.desc.mip_levels {
            let mut to_src = BarrierBatch::new(ctx.scratch(), 0, 0, 1)?;
            to_src.set_image(
                0,
                self.image,
                level_range(level - 1),
                ImageScope::transfer_dst(),
                ImageScope::transfer_src(),
            )?;
            to_src.build_and_run(device, cmd)?;

            let src = mip_extent(self.desc.extent, level - 1);
            let dst = mip_extent(self.desc.extent, level);
            let blit = vk::ImageBlit {
                src_subresource: level_layers(level - 1),
                src_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D { x: src.width as i32, y: src.height as i32, z: 1 },
                ],
                dst_subresource: level_layers(level),
                dst_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D { x: dst.width as i32, y: dst.height as i32, z: 1 },
                ],
            };

            unsafe {
                device.cmd_blit_image(
                    cmd,
                    self.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );
            }

            let mut to_final = BarrierBatch::new(ctx.scratch(), 0, 0, 1)?;
            to_final.set_image(0, self.image, level_range(level - 1), ImageScope::transfer_src(), final_scope)?;
            to_final.build_and_run(device, cmd)?;
        }

        let mut last = BarrierBatch::new(ctx.scratch(), 0, 0, 1)?;
        last.set_image(
            0,
            self.image,
            level_range(self.desc.mip_levels - 1),
            ImageScope::transfer_dst(),
            final_scope,
        )?;
        last.build_and_run(device, cmd)
    }

    /// Release the view, image and memory
    pub fn destroy(mut self, ctx: &DeviceContext) {
        if let Some(mut allocation) = self.allocation.take() {
            unsafe {
                ctx.device().destroy_image_view(self.view, None);
                ctx.allocator().destroy_image(self.image, &mut allocation);
            }
        }
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        if self.allocation.is_some() {
            log::warn!(
                "GpuImage {:?} ({}x{}) dropped without destroy(); its memory is leaked",
                self.image,
                self.desc.extent.width,
                self.desc.extent.height
            );
        }
    }
}

/// Mip generation blits with linear filtering, which the format must support
pub(crate) fn check_linear_blit(features: vk::FormatFeatureFlags, format: vk::Format) -> VulkanResult<()> {
    if features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR) {
        Ok(())
    } else {
        Err(VulkanError::UnsupportedFormat(format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn test_mip_levels_for() {
        assert_eq!(mip_levels_for(extent(1, 1)), 1);
        assert_eq!(mip_levels_for(extent(2, 1)), 2);
        assert_eq!(mip_levels_for(extent(256, 256)), 9);
        assert_eq!(mip_levels_for(extent(300, 17)), 9);
        assert_eq!(mip_levels_for(extent(1024, 512)), 11);
        assert_eq!(mip_levels_for(extent(0, 0)), 1);
    }

    #[test]
    fn test_mip_extent_halves_and_clamps() {
        let base = extent(256, 64);
        assert_eq!(mip_extent(base, 0), base);
        assert_eq!(mip_extent(base, 1), extent(128, 32));
        assert_eq!(mip_extent(base, 6), extent(4, 1));
        assert_eq!(mip_extent(base, 8), extent(1, 1));
        assert_eq!(mip_extent(base, 40), extent(1, 1));
    }

    #[test]
    fn test_texture_desc_mip_chain() {
        let desc = ImageDesc::texture_2d(extent(256, 256), vk::Format::R8G8B8A8_SRGB, true);
        assert_eq!(desc.mip_levels, 9);
        assert!(desc.usage.contains(vk::ImageUsageFlags::TRANSFER_SRC));
        assert!(desc.validate().is_ok());

        let flat = ImageDesc::texture_2d(extent(256, 256), vk::Format::R8G8B8A8_SRGB, false);
        assert_eq!(flat.mip_levels, 1);
        assert!(!flat.usage.contains(vk::ImageUsageFlags::TRANSFER_SRC));
    }

    #[test]
    fn test_desc_validation() {
        let mut desc = ImageDesc::texture_2d(extent(64, 64), vk::Format::R8G8B8A8_UNORM, false);
        desc.mip_levels = 8;
        assert!(desc.validate().is_err());

        let zero = ImageDesc::color_attachment(extent(0, 600), vk::Format::B8G8R8A8_SRGB);
        assert!(zero.validate().is_err());

        let cube = ImageDesc::cubemap(32, vk::Format::R8G8B8A8_SRGB, true);
        assert_eq!(cube.array_layers, 6);
        assert!(cube.validate().is_ok());
        assert_eq!(cube.rgba8_size(), 32 * 32 * 4 * 6);
    }

    #[test]
    fn test_linear_blit_support_check() {
        assert!(check_linear_blit(
            vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR | vk::FormatFeatureFlags::BLIT_SRC,
            vk::Format::R8G8B8A8_SRGB
        )
        .is_ok());
        assert!(matches!(
            check_linear_blit(vk::FormatFeatureFlags::BLIT_SRC, vk::Format::R32G32B32A32_SINT),
            Err(VulkanError::UnsupportedFormat(vk::Format::R32G32B32A32_SINT))
        ));
    }
}
