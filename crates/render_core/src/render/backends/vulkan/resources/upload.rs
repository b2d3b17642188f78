//! Blocking transfers through a staging buffer
//!
//! [`StagedUpload`] borrows the device context exclusively. A frame being
//! recorded holds a shared borrow of the context, so a blocking transfer
//! cannot be started in the middle of a frame; use
//! [`GpuBuffer::write_mapped`](super::buffer::GpuBuffer::write_mapped) there.

use ash::vk;

use super::buffer::{check_write_range, release_transfer_buffer, GpuBuffer, MemoryResidency};
use super::cubemap::{cross_copy_regions, face_size_for_cross};
use super::image::{mip_extent, GpuImage};
use crate::render::backends::vulkan::rendering::barriers::{BarrierBatch, ImageScope};
use crate::render::backends::vulkan::{DeviceContext, VulkanError, VulkanResult};

/// Byte size of one texel for the formats uploads support
pub fn texel_size(format: vk::Format) -> Option<u32> {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => Some(1),
        vk::Format::R8G8_UNORM => Some(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB => Some(4),
        vk::Format::R16G16B16A16_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

/// Exclusive upload session on a device context
pub struct StagedUpload<'ctx> {
    ctx: &'ctx mut DeviceContext,
}

impl<'ctx> StagedUpload<'ctx> {
    /// Start an upload session
    pub fn new(ctx: &'ctx mut DeviceContext) -> Self {
        Self { ctx }
    }

    /// Copy `bytes` into `dst` at `offset` and wait for the copy to finish
    pub fn upload_buffer(&mut self, dst: &GpuBuffer, bytes: &[u8], offset: vk::DeviceSize) -> VulkanResult<()> {
        check_write_range(dst.size(), dst.residency(), bytes.len(), offset)?;
        if !dst.usage().contains(vk::BufferUsageFlags::TRANSFER_DST) {
            return Err(VulkanError::invalid("staged upload target lacks TRANSFER_DST usage"));
        }
        if bytes.is_empty() {
            return Ok(());
        }

        let staging = stage(self.ctx, bytes)?;

        let (src, dst_buffer, size) = (staging.handle(), dst.handle(), bytes.len() as vk::DeviceSize);
        let copied = self.ctx.one_shot(|ctx, cmd| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: offset,
                size,
            };
            unsafe { ctx.device().cmd_copy_buffer(cmd, src, dst_buffer, &[region]) };
            Ok(())
        });
        release_transfer_buffer(self.ctx, staging, &copied);
        copied
    }

    /// Fill level 0 of every layer from `bytes`, then build the mip chain
    ///
    /// `bytes` holds the layers back to back. Every level ends up in
    /// `final_layout`.
    pub fn upload_image(&mut self, image: &GpuImage, bytes: &[u8], final_layout: vk::ImageLayout) -> VulkanResult<()> {
        let desc = image.desc();
        let texel = texel_size(desc.format).ok_or(VulkanError::UnsupportedFormat(desc.format))?;
        let layer_size = u64::from(desc.extent.width) * u64::from(desc.extent.height) * u64::from(texel);
        let expected = layer_size * u64::from(desc.array_layers);
        if bytes.len() as u64 != expected {
            return Err(VulkanError::invalid(format!(
                "image upload needs {} bytes, got {}",
                expected,
                bytes.len()
            )));
        }

        let copy = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: desc.aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: desc.array_layers,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            },
        };

        self.copy_into_image(image, bytes, &[copy], final_layout)
    }

    /// Fill a cubemap from a horizontal-cross image of 4×3 faces
    pub fn upload_cubemap(
        &mut self,
        image: &GpuImage,
        cross_bytes: &[u8],
        cross_width: u32,
        cross_height: u32,
        final_layout: vk::ImageLayout,
    ) -> VulkanResult<()> {
        let desc = image.desc();
        if !desc.cube {
            return Err(VulkanError::invalid("cubemap upload target is not a cube image"));
        }
        let face_size = face_size_for_cross(cross_width, cross_height)?;
        if face_size != desc.extent.width {
            return Err(VulkanError::invalid(format!(
                "cross faces are {} texels, cubemap faces are {}",
                face_size, desc.extent.width
            )));
        }

        let texel = texel_size(desc.format).ok_or(VulkanError::UnsupportedFormat(desc.format))?;
        let expected = u64::from(cross_width) * u64::from(cross_height) * u64::from(texel);
        if cross_bytes.len() as u64 != expected {
            return Err(VulkanError::invalid(format!(
                "cross image needs {} bytes, got {}",
                expected,
                cross_bytes.len()
            )));
        }

        let copies = cross_copy_regions(face_size, texel, 0);
        self.copy_into_image(image, cross_bytes, &copies, final_layout)
    }

    /// Copy a device-local buffer back to the host
    ///
    /// The buffer needs `TRANSFER_SRC` usage.
    pub fn read_buffer(&mut self, src: &GpuBuffer) -> VulkanResult<Vec<u8>> {
        if !src.usage().contains(vk::BufferUsageFlags::TRANSFER_SRC) {
            return Err(VulkanError::invalid("read back needs TRANSFER_SRC usage"));
        }

        let (src_buffer, size) = (src.handle(), src.size());
        let readback = readback_buffer(self.ctx, size)?;
        let dst = readback.handle();
        let copied = self.ctx.one_shot(|ctx, cmd| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            };
            unsafe { ctx.device().cmd_copy_buffer(cmd, src_buffer, dst, &[region]) };
            Ok(())
        });
        finish_readback(self.ctx, readback, copied)
    }

    /// Copy one mip level of one layer back to the host
    ///
    /// The image must be in `layout` and have `TRANSFER_SRC` usage; it is left
    /// in `layout` afterwards.
    pub fn read_image_level(
        &mut self,
        image: &GpuImage,
        level: u32,
        layer: u32,
        layout: vk::ImageLayout,
    ) -> VulkanResult<Vec<u8>> {
        let desc = *image.desc();
        if level >= desc.mip_levels || layer >= desc.array_layers {
            return Err(VulkanError::invalid(format!(
                "level {} layer {} outside an image of {} levels and {} layers",
                level, layer, desc.mip_levels, desc.array_layers
            )));
        }
        if !desc.usage.contains(vk::ImageUsageFlags::TRANSFER_SRC) {
            return Err(VulkanError::invalid("image read back needs TRANSFER_SRC usage"));
        }
        let texel = texel_size(desc.format).ok_or(VulkanError::UnsupportedFormat(desc.format))?;
        let extent = mip_extent(desc.extent, level);
        let size = u64::from(extent.width) * u64::from(extent.height) * u64::from(texel);

        let readback = readback_buffer(self.ctx, size)?;
        let dst = readback.handle();
        let range = vk::ImageSubresourceRange {
            aspect_mask: desc.aspect,
            base_mip_level: level,
            level_count: 1,
            base_array_layer: layer,
            layer_count: 1,
        };
        let copied = self.ctx.one_shot(|ctx, cmd| {
            let mut to_src = BarrierBatch::new(ctx.scratch(), 0, 0, 1)?;
            to_src.set_image(
                0,
                image.handle(),
                range,
                ImageScope::for_layout(layout),
                ImageScope::transfer_src(),
            )?;
            to_src.build_and_run(ctx.device(), cmd)?;

            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: desc.aspect,
                    mip_level: level,
                    base_array_layer: layer,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
            };
            unsafe {
                ctx.device().cmd_copy_image_to_buffer(
                    cmd,
                    image.handle(),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst,
                    &[region],
                );
            }

            let mut back = BarrierBatch::new(ctx.scratch(), 0, 0, 1)?;
            back.set_image(
                0,
                image.handle(),
                range,
                ImageScope::transfer_src(),
                ImageScope::for_layout(layout),
            )?;
            back.build_and_run(ctx.device(), cmd)
        });
        finish_readback(self.ctx, readback, copied)
    }

    fn copy_into_image(
        &mut self,
        image: &GpuImage,
        bytes: &[u8],
        copies: &[vk::BufferImageCopy],
        final_layout: vk::ImageLayout,
    ) -> VulkanResult<()> {
        let staging = stage(self.ctx, bytes)?;
        let staging_handle = staging.handle();
        let desc = *image.desc();

        let copied = self.ctx.one_shot(|ctx, cmd| {
            let mut to_dst = BarrierBatch::new(ctx.scratch(), 0, 0, 1)?;
            to_dst.set_image(
                0,
                image.handle(),
                desc.full_range(),
                ImageScope::undefined(),
                ImageScope::transfer_dst(),
            )?;
            to_dst.build_and_run(ctx.device(), cmd)?;

            unsafe {
                ctx.device().cmd_copy_buffer_to_image(
                    cmd,
                    staging_handle,
                    image.handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    copies,
                );
            }

            if desc.mip_levels > 1 {
                image.generate_mipmaps(ctx, cmd, final_layout)
            } else {
                let mut to_final = BarrierBatch::new(ctx.scratch(), 0, 0, 1)?;
                to_final.set_image(
                    0,
                    image.handle(),
                    desc.full_range(),
                    ImageScope::transfer_dst(),
                    ImageScope::for_layout(final_layout),
                )?;
                to_final.build_and_run(ctx.device(), cmd)
            }
        });
        release_transfer_buffer(self.ctx, staging, &copied);
        copied
    }
}

/// Copy `bytes` into a fresh host-linear staging buffer
fn stage(ctx: &DeviceContext, bytes: &[u8]) -> VulkanResult<GpuBuffer> {
    let mut staging = GpuBuffer::new(
        ctx,
        bytes.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryResidency::HostLinear,
    )?;
    if let Err(e) = staging.write_mapped(ctx, bytes, 0) {
        staging.destroy(ctx);
        return Err(e);
    }
    Ok(staging)
}

fn readback_buffer(ctx: &DeviceContext, size: vk::DeviceSize) -> VulkanResult<GpuBuffer> {
    GpuBuffer::new(
        ctx,
        size,
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryResidency::HostRandomAccess,
    )
}

fn finish_readback(ctx: &DeviceContext, mut readback: GpuBuffer, copied: VulkanResult<()>) -> VulkanResult<Vec<u8>> {
    let bytes = if copied.is_ok() {
        readback.read_mapped(ctx)
    } else {
        Ok(Vec::new())
    };
    release_transfer_buffer(ctx, readback, &copied);
    copied.and(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texel_sizes() {
        assert_eq!(texel_size(vk::Format::R8G8B8A8_SRGB), Some(4));
        assert_eq!(texel_size(vk::Format::B8G8R8A8_UNORM), Some(4));
        assert_eq!(texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(texel_size(vk::Format::BC7_SRGB_BLOCK), None);
    }
}
