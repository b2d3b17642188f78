//! Offscreen color and depth attachments sized to the surface

use ash::vk;

use super::image::{GpuImage, ImageDesc};
use crate::render::backends::vulkan::{DeviceContext, VulkanError, VulkanResult};

/// Depth formats in order of preference
const DEPTH_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// What an attachment is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    /// Color output
    Color,
    /// Depth testing
    Depth,
}

impl AttachmentKind {
    fn desc(self, extent: vk::Extent2D, format: vk::Format) -> ImageDesc {
        match self {
            AttachmentKind::Color => ImageDesc::color_attachment(extent, format),
            AttachmentKind::Depth => ImageDesc::depth_attachment(extent, format),
        }
    }
}

/// First candidate whose optimal tiling supports depth attachments
pub fn pick_depth_format<F>(mut optimal_features: F) -> Option<vk::Format>
where
    F: FnMut(vk::Format) -> vk::FormatFeatureFlags,
{
    DEPTH_CANDIDATES
        .into_iter()
        .find(|&format| optimal_features(format).contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT))
}

/// Depth format supported by the context's device
pub fn find_depth_format(ctx: &DeviceContext) -> VulkanResult<vk::Format> {
    pick_depth_format(|format| ctx.format_properties(format).optimal_tiling_features)
        .ok_or(VulkanError::UnsupportedFormat(vk::Format::D32_SFLOAT))
}

/// A color or depth attachment that follows the surface size
pub struct RenderTarget {
    image: GpuImage,
    kind: AttachmentKind,
}

impl RenderTarget {
    /// Create an attachment of `extent`
    pub fn new(ctx: &DeviceContext, kind: AttachmentKind, format: vk::Format, extent: vk::Extent2D) -> VulkanResult<Self> {
        let image = GpuImage::new(ctx, &kind.desc(extent, format))?;
        log::debug!("Created {:?} target {}x{} ({:?})", kind, extent.width, extent.height, format);
        Ok(Self { image, kind })
    }

    /// Depth attachment in the best supported depth format
    pub fn depth(ctx: &DeviceContext, extent: vk::Extent2D) -> VulkanResult<Self> {
        let format = find_depth_format(ctx)?;
        Self::new(ctx, AttachmentKind::Depth, format, extent)
    }

    /// Recreate the image at `extent`
    ///
    /// The device must no longer be using the old image. Contents are lost
    /// and the new image starts in `UNDEFINED` layout. On failure the old
    /// image is kept.
    pub fn resize(&mut self, ctx: &DeviceContext, extent: vk::Extent2D) -> VulkanResult<()> {
        if extent == self.image.extent() {
            return Ok(());
        }
        let replacement = GpuImage::new(ctx, &self.kind.desc(extent, self.image.format()))?;
        let old = std::mem::replace(&mut self.image, replacement);
        old.destroy(ctx);
        log::debug!("Resized {:?} target to {}x{}", self.kind, extent.width, extent.height);
        Ok(())
    }

    /// Attachment kind
    pub fn kind(&self) -> AttachmentKind {
        self.kind
    }

    /// Image handle
    pub fn image(&self) -> vk::Image {
        self.image.handle()
    }

    /// Image view
    pub fn view(&self) -> vk::ImageView {
        self.image.view()
    }

    /// Texel format
    pub fn format(&self) -> vk::Format {
        self.image.format()
    }

    /// Current size
    pub fn extent(&self) -> vk::Extent2D {
        self.image.extent()
    }

    /// Range covering the whole attachment
    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        self.image.desc().full_range()
    }

    /// Release the image
    pub fn destroy(self, ctx: &DeviceContext) {
        self.image.destroy(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_d32_when_supported() {
        let format = pick_depth_format(|_| vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT);
        assert_eq!(format, Some(vk::Format::D32_SFLOAT));
    }

    #[test]
    fn test_falls_back_to_packed_depth() {
        let format = pick_depth_format(|f| {
            if f == vk::Format::D24_UNORM_S8_UINT {
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::FormatFeatureFlags::SAMPLED_IMAGE
            }
        });
        assert_eq!(format, Some(vk::Format::D24_UNORM_S8_UINT));
        assert_eq!(pick_depth_format(|_| vk::FormatFeatureFlags::empty()), None);
    }

    #[test]
    fn test_attachment_descs() {
        let extent = vk::Extent2D { width: 640, height: 480 };
        let depth = AttachmentKind::Depth.desc(extent, vk::Format::D32_SFLOAT);
        assert_eq!(depth.aspect, vk::ImageAspectFlags::DEPTH);
        assert!(depth.usage.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));

        let color = AttachmentKind::Color.desc(extent, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(color.aspect, vk::ImageAspectFlags::COLOR);
        assert_eq!(color.mip_levels, 1);
    }
}
