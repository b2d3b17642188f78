//! Pooled sampled textures
//!
//! Each [`Texture`] owns its image and sampler. Textures are created from
//! RGBA8 pixels (with a generated mip chain), from horizontal-cross cubemap
//! images, or as 1×1 solid colours used as defaults.

use ash::vk;

use super::cubemap::face_size_for_cross;
use super::image::{GpuImage, ImageDesc};
use super::upload::StagedUpload;
use crate::assets::ImageData;
use crate::foundation::{Handle, Pool, PoolError};
use crate::render::backends::vulkan::{DeviceContext, VulkanResult};

/// Sampled image plus its sampler
pub struct Texture {
    image: GpuImage,
    sampler: vk::Sampler,
}

impl Texture {
    /// Underlying image
    pub fn image(&self) -> &GpuImage {
        &self.image
    }

    /// View over every level and layer
    pub fn view(&self) -> vk::ImageView {
        self.image.view()
    }

    /// Sampler
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Descriptor info for a combined image sampler binding
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.image.view(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// Release the sampler and image
    pub fn destroy(self, ctx: &DeviceContext) {
        unsafe { ctx.device().destroy_sampler(self.sampler, None) };
        self.image.destroy(ctx);
    }
}

/// Handle to a texture owned by a [`TextureManager`]
pub type TextureHandle = Handle<Texture>;

/// Anisotropy actually applied: the requested level clamped to the device limit
pub fn effective_anisotropy(requested: f32, device_limit: f32) -> f32 {
    requested.min(device_limit).max(1.0)
}

/// Fixed-capacity texture storage
pub struct TextureManager {
    textures: Pool<Texture>,
    max_anisotropy: f32,
    white: Option<TextureHandle>,
}

impl TextureManager {
    /// Create a manager holding at most `capacity` textures
    pub fn new(capacity: usize, max_anisotropy: f32) -> Self {
        log::debug!("Texture pool capacity: {}", capacity);
        Self {
            textures: Pool::with_capacity(capacity),
            max_anisotropy,
            white: None,
        }
    }

    /// Upload an RGBA8 image, optionally generating a full mip chain
    pub fn create_texture(
        &mut self,
        ctx: &mut DeviceContext,
        image: &ImageData,
        srgb: bool,
        mipmapped: bool,
    ) -> VulkanResult<TextureHandle> {
        self.ensure_space()?;
        let desc = ImageDesc::texture_2d(
            vk::Extent2D {
                width: image.width,
                height: image.height,
            },
            rgba8_format(srgb),
            mipmapped,
        );

        let gpu_image = GpuImage::new(ctx, &desc)?;
        let uploaded =
            StagedUpload::new(ctx).upload_image(&gpu_image, &image.data, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        self.finish(ctx, gpu_image, uploaded, vk::SamplerAddressMode::REPEAT)
    }

    /// Upload a cubemap from a horizontal-cross image (4×3 faces)
    pub fn create_cubemap(&mut self, ctx: &mut DeviceContext, cross: &ImageData, srgb: bool) -> VulkanResult<TextureHandle> {
        self.ensure_space()?;
        let face_size = face_size_for_cross(cross.width, cross.height)?;
        let desc = ImageDesc::cubemap(face_size, rgba8_format(srgb), true);

        let gpu_image = GpuImage::new(ctx, &desc)?;
        let uploaded = StagedUpload::new(ctx).upload_cubemap(
            &gpu_image,
            &cross.data,
            cross.width,
            cross.height,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        self.finish(ctx, gpu_image, uploaded, vk::SamplerAddressMode::CLAMP_TO_EDGE)
    }

    /// 1×1 texture of a single colour
    pub fn create_solid(&mut self, ctx: &mut DeviceContext, color: [u8; 4]) -> VulkanResult<TextureHandle> {
        self.create_texture(ctx, &ImageData::solid_color(1, 1, color), false, false)
    }

    /// Shared opaque white texture, created on first use
    pub fn default_white(&mut self, ctx: &mut DeviceContext) -> VulkanResult<TextureHandle> {
        if let Some(handle) = self.white.filter(|&h| self.textures.contains(h)) {
            return Ok(handle);
        }
        let handle = self.create_solid(ctx, [255, 255, 255, 255])?;
        self.white = Some(handle);
        Ok(handle)
    }

    /// Look up a live texture
    pub fn get(&self, handle: TextureHandle) -> VulkanResult<&Texture> {
        Ok(self.textures.get(handle)?)
    }

    /// Destroy the texture behind `handle`
    pub fn destroy(&mut self, ctx: &DeviceContext, handle: TextureHandle) -> VulkanResult<()> {
        let texture = self.textures.dealloc(handle)?;
        texture.destroy(ctx);
        Ok(())
    }

    /// Destroy every texture; outstanding handles become stale
    pub fn destroy_all(&mut self, ctx: &DeviceContext) {
        let textures = self.textures.drain();
        if !textures.is_empty() {
            log::debug!("Destroying {} textures", textures.len());
        }
        for texture in textures {
            texture.destroy(ctx);
        }
        self.white = None;
    }

    /// Number of live textures
    pub fn len(&self) -> usize {
        self.textures.len()
    }

    /// Whether no texture is live
    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    /// Maximum number of textures
    pub fn capacity(&self) -> usize {
        self.textures.capacity()
    }

    fn ensure_space(&self) -> VulkanResult<()> {
        if self.textures.is_full() {
            return Err(PoolError::Exhausted {
                capacity: self.textures.capacity(),
            }
            .into());
        }
        Ok(())
    }

    fn finish(
        &mut self,
        ctx: &DeviceContext,
        image: GpuImage,
        uploaded: VulkanResult<()>,
        address_mode: vk::SamplerAddressMode,
    ) -> VulkanResult<TextureHandle> {
        if let Err(e) = uploaded {
            image.destroy(ctx);
            return Err(e);
        }

        let anisotropy = effective_anisotropy(self.max_anisotropy, ctx.max_sampler_anisotropy());
        let sampler = match create_sampler(ctx, image.mip_levels(), anisotropy, address_mode) {
            Ok(sampler) => sampler,
            Err(e) => {
                image.destroy(ctx);
                return Err(e);
            }
        };

        let extent = image.extent();
        let handle = self.textures.alloc(Texture { image, sampler })?;
        log::debug!(
            "Created texture {:?} ({}x{}, anisotropy {})",
            handle,
            extent.width,
            extent.height,
            anisotropy
        );
        Ok(handle)
    }
}

fn rgba8_format(srgb: bool) -> vk::Format {
    if srgb {
        vk::Format::R8G8B8A8_SRGB
    } else {
        vk::Format::R8G8B8A8_UNORM
    }
}

fn create_sampler(
    ctx: &DeviceContext,
    mip_levels: u32,
    anisotropy: f32,
    address_mode: vk::SamplerAddressMode,
) -> VulkanResult<vk::Sampler> {
    let sampler_create_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(address_mode)
        .address_mode_v(address_mode)
        .address_mode_w(address_mode)
        .anisotropy_enable(anisotropy > 1.0)
        .max_anisotropy(anisotropy)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .min_lod(0.0)
        .max_lod(mip_levels as f32);

    let sampler = unsafe { ctx.device().create_sampler(&sampler_create_info, None)? };
    Ok(sampler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_anisotropy_is_clamped_to_device_limit() {
        assert_relative_eq!(effective_anisotropy(16.0, 8.0), 8.0);
        assert_relative_eq!(effective_anisotropy(4.0, 16.0), 4.0);
        assert_relative_eq!(effective_anisotropy(0.5, 16.0), 1.0);
    }

    #[test]
    fn test_rgba8_format_choice() {
        assert_eq!(rgba8_format(true), vk::Format::R8G8B8A8_SRGB);
        assert_eq!(rgba8_format(false), vk::Format::R8G8B8A8_UNORM);
    }
}
