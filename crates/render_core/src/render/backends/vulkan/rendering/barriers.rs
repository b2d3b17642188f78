//! Pipeline barrier batching
//!
//! A [`BarrierBatch`] reserves every barrier slot from the scratch arena up
//! front, lets the caller fill them, and issues them all with a single
//! `vkCmdPipelineBarrier2`. The batch holds no state past `build_and_run`;
//! its arena slots are released newest-first when it goes out of scope.
//!
//! ```ignore
//! let mut batch = BarrierBatch::new(ctx.scratch(), 0, 0, 2)?;
//! batch.set_image(0, color, color_range, ImageScope::undefined(), ImageScope::color_attachment_write())?;
//! batch.set_image(1, depth, depth_range, ImageScope::undefined(), ImageScope::depth_attachment_write())?;
//! batch.build_and_run(ctx.device(), cmd)?;
//! ```

use ash::{vk, Device};

use crate::foundation::{Arena, ArenaSlice};
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Pipeline stages and accesses on one side of a dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scope {
    /// Pipeline stages
    pub stage: vk::PipelineStageFlags2,
    /// Memory accesses
    pub access: vk::AccessFlags2,
}

impl Scope {
    /// Scope from raw stage and access masks
    pub const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self { stage, access }
    }

    /// Host writes through a mapped pointer
    pub const fn host_write() -> Self {
        Self::new(vk::PipelineStageFlags2::HOST, vk::AccessFlags2::HOST_WRITE)
    }

    /// Host reads through a mapped pointer
    pub const fn host_read() -> Self {
        Self::new(vk::PipelineStageFlags2::HOST, vk::AccessFlags2::HOST_READ)
    }

    /// Copy destination writes
    pub const fn transfer_write() -> Self {
        Self::new(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
    }

    /// Copy source reads
    pub const fn transfer_read() -> Self {
        Self::new(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_READ)
    }

    /// Vertex and index fetch
    pub const fn vertex_input() -> Self {
        Self::new(
            vk::PipelineStageFlags2::VERTEX_INPUT,
            vk::AccessFlags2::from_raw(
                vk::AccessFlags2::VERTEX_ATTRIBUTE_READ.as_raw() | vk::AccessFlags2::INDEX_READ.as_raw(),
            ),
        )
    }

    /// Uniform reads in vertex and fragment shaders
    pub const fn uniform_read() -> Self {
        Self::new(
            vk::PipelineStageFlags2::from_raw(
                vk::PipelineStageFlags2::VERTEX_SHADER.as_raw() | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw(),
            ),
            vk::AccessFlags2::UNIFORM_READ,
        )
    }
}

/// [`Scope`] plus the image layout and owning queue family on that side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageScope {
    /// Pipeline stages
    pub stage: vk::PipelineStageFlags2,
    /// Memory accesses
    pub access: vk::AccessFlags2,
    /// Image layout
    pub layout: vk::ImageLayout,
    /// Queue family, `QUEUE_FAMILY_IGNORED` unless transferring ownership
    pub queue_family: u32,
}

impl ImageScope {
    /// Image scope from raw masks and a layout
    pub const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2, layout: vk::ImageLayout) -> Self {
        Self {
            stage,
            access,
            layout,
            queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }

    /// Previous contents are discarded
    pub const fn undefined() -> Self {
        Self::new(vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE, vk::ImageLayout::UNDEFINED)
    }

    /// Color attachment output
    pub const fn color_attachment_write() -> Self {
        Self::new(
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )
    }

    /// Depth test and write
    pub const fn depth_attachment_write() -> Self {
        Self::new(
            vk::PipelineStageFlags2::from_raw(
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
            ),
            vk::AccessFlags2::from_raw(
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
            ),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )
    }

    /// Handed to the presentation engine
    pub const fn present() -> Self {
        Self::new(vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE, vk::ImageLayout::PRESENT_SRC_KHR)
    }

    /// Copy or blit destination
    pub const fn transfer_dst() -> Self {
        Self::new(
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
    }

    /// Copy or blit source
    pub const fn transfer_src() -> Self {
        Self::new(
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )
    }

    /// Sampled in fragment shaders
    pub const fn shader_read() -> Self {
        Self::new(
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
    }

    /// The usual consumer scope for an image left in `layout`
    pub fn for_layout(layout: vk::ImageLayout) -> Self {
        match layout {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => Self::color_attachment_write(),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => Self::depth_attachment_write(),
            vk::ImageLayout::PRESENT_SRC_KHR => Self::present(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL => Self::transfer_dst(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL => Self::transfer_src(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => Self::shader_read(),
            other => Self::new(
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::from_raw(
                    vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
                ),
                other,
            ),
        }
    }

    /// Same scope owned by `queue_family`
    pub const fn with_queue_family(mut self, queue_family: u32) -> Self {
        self.queue_family = queue_family;
        self
    }
}

/// Fixed-size set of barriers issued as one dependency
///
/// Every declared slot must be filled before [`build_and_run`](Self::build_and_run).
pub struct BarrierBatch<'a> {
    // Declared newest-allocation first so drop releases in LIFO order
    images: ArenaSlice<'a, vk::ImageMemoryBarrier2>,
    buffers: ArenaSlice<'a, vk::BufferMemoryBarrier2>,
    memory: ArenaSlice<'a, vk::MemoryBarrier2>,
}

impl<'a> BarrierBatch<'a> {
    /// Reserve slots for the given number of memory, buffer and image barriers
    pub fn new(arena: &'a Arena, memory_count: usize, buffer_count: usize, image_count: usize) -> VulkanResult<Self> {
        let memory = arena.alloc::<vk::MemoryBarrier2>(memory_count)?;
        let buffers = arena.alloc::<vk::BufferMemoryBarrier2>(buffer_count)?;
        let images = arena.alloc::<vk::ImageMemoryBarrier2>(image_count)?;
        Ok(Self { images, buffers, memory })
    }

    /// Fill memory barrier slot `index`
    pub fn set_memory(&mut self, index: usize, src: Scope, dst: Scope) -> VulkanResult<()> {
        let slot = slot_mut(&mut self.memory, index, "memory")?;
        *slot = vk::MemoryBarrier2::builder()
            .src_stage_mask(src.stage)
            .src_access_mask(src.access)
            .dst_stage_mask(dst.stage)
            .dst_access_mask(dst.access)
            .build();
        Ok(())
    }

    /// Fill buffer barrier slot `index` covering `offset..offset + size`
    pub fn set_buffer(
        &mut self,
        index: usize,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        src: Scope,
        dst: Scope,
    ) -> VulkanResult<()> {
        let slot = slot_mut(&mut self.buffers, index, "buffer")?;
        *slot = vk::BufferMemoryBarrier2::builder()
            .src_stage_mask(src.stage)
            .src_access_mask(src.access)
            .dst_stage_mask(dst.stage)
            .dst_access_mask(dst.access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer)
            .offset(offset)
            .size(size)
            .build();
        Ok(())
    }

    /// Fill image barrier slot `index`, transitioning `src.layout` to `dst.layout`
    pub fn set_image(
        &mut self,
        index: usize,
        image: vk::Image,
        subresource: vk::ImageSubresourceRange,
        src: ImageScope,
        dst: ImageScope,
    ) -> VulkanResult<()> {
        let slot = slot_mut(&mut self.images, index, "image")?;
        *slot = vk::ImageMemoryBarrier2::builder()
            .src_stage_mask(src.stage)
            .src_access_mask(src.access)
            .dst_stage_mask(dst.stage)
            .dst_access_mask(dst.access)
            .old_layout(src.layout)
            .new_layout(dst.layout)
            .src_queue_family_index(src.queue_family)
            .dst_queue_family_index(dst.queue_family)
            .image(image)
            .subresource_range(subresource)
            .build();
        Ok(())
    }

    /// Check that every slot is filled and no image targets `UNDEFINED`
    pub fn validate(&self) -> VulkanResult<()> {
        for (i, barrier) in self.memory.iter().enumerate() {
            if barrier.src_stage_mask.is_empty() && barrier.dst_stage_mask.is_empty() {
                return Err(VulkanError::invalid(format!("memory barrier {} was never set", i)));
            }
        }
        for (i, barrier) in self.buffers.iter().enumerate() {
            if barrier.buffer == vk::Buffer::null() {
                return Err(VulkanError::invalid(format!("buffer barrier {} was never set", i)));
            }
        }
        for (i, barrier) in self.images.iter().enumerate() {
            if barrier.image == vk::Image::null() {
                return Err(VulkanError::invalid(format!("image barrier {} was never set", i)));
            }
            if barrier.new_layout == vk::ImageLayout::UNDEFINED {
                return Err(VulkanError::invalid(format!(
                    "image barrier {} transitions to UNDEFINED",
                    i
                )));
            }
        }
        Ok(())
    }

    /// Validate and record every barrier into `cmd` as one dependency
    pub fn build_and_run(self, device: &Device, cmd: vk::CommandBuffer) -> VulkanResult<()> {
        self.validate()?;

        if self.memory.is_empty() && self.buffers.is_empty() && self.images.is_empty() {
            return Ok(());
        }

        let dependency = vk::DependencyInfo::builder()
            .memory_barriers(&self.memory)
            .buffer_memory_barriers(&self.buffers)
            .image_memory_barriers(&self.images);

        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };
        Ok(())
    }
}

fn slot_mut<'s, T>(slots: &'s mut [T], index: usize, kind: &str) -> VulkanResult<&'s mut T> {
    let len = slots.len();
    slots
        .get_mut(index)
        .ok_or_else(|| VulkanError::invalid(format!("{} barrier index {} out of range ({} slots)", kind, index, len)))
}

/// Subresource range covering `levels` mips and `layers` layers of `aspect`
pub fn full_range(aspect: vk::ImageAspectFlags, levels: u32, layers: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: levels,
        base_array_layer: 0,
        layer_count: layers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn fake_image() -> vk::Image {
        vk::Image::from_raw(0x1000)
    }

    #[test]
    fn test_filled_batch_validates() {
        let arena = Arena::new(4096);
        let mut batch = BarrierBatch::new(&arena, 1, 1, 2).unwrap();
        batch.set_memory(0, Scope::host_write(), Scope::transfer_read()).unwrap();
        batch
            .set_buffer(0, vk::Buffer::from_raw(0x2000), 0, vk::WHOLE_SIZE, Scope::transfer_write(), Scope::vertex_input())
            .unwrap();
        let range = full_range(vk::ImageAspectFlags::COLOR, 1, 1);
        batch
            .set_image(0, fake_image(), range, ImageScope::undefined(), ImageScope::color_attachment_write())
            .unwrap();
        batch
            .set_image(1, fake_image(), range, ImageScope::color_attachment_write(), ImageScope::present())
            .unwrap();
        assert!(batch.validate().is_ok());
    }

    #[test]
    fn test_undefined_destination_layout_is_rejected() {
        let arena = Arena::new(1024);
        let mut batch = BarrierBatch::new(&arena, 0, 0, 1).unwrap();
        let range = full_range(vk::ImageAspectFlags::COLOR, 1, 1);
        batch
            .set_image(0, fake_image(), range, ImageScope::shader_read(), ImageScope::undefined())
            .unwrap();
        assert!(matches!(batch.validate(), Err(VulkanError::InvalidOperation { .. })));
    }

    #[test]
    fn test_unfilled_slot_is_rejected() {
        let arena = Arena::new(1024);
        let mut batch = BarrierBatch::new(&arena, 0, 0, 2).unwrap();
        let range = full_range(vk::ImageAspectFlags::COLOR, 1, 1);
        batch
            .set_image(0, fake_image(), range, ImageScope::undefined(), ImageScope::transfer_dst())
            .unwrap();
        assert!(batch.validate().is_err());

        let batch = BarrierBatch::new(&arena, 1, 0, 0);
        // Previous batch still holds its slots
        assert!(batch.is_ok());
    }

    #[test]
    fn test_out_of_range_slot() {
        let arena = Arena::new(1024);
        let mut batch = BarrierBatch::new(&arena, 1, 0, 0).unwrap();
        assert!(batch.set_memory(1, Scope::host_write(), Scope::host_read()).is_err());
    }

    #[test]
    fn test_batch_releases_arena_on_drop() {
        let arena = Arena::new(4096);
        {
            let _batch = BarrierBatch::new(&arena, 2, 2, 2).unwrap();
            assert!(arena.used() > 0);
        }
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_batch_larger_than_arena_fails() {
        let arena = Arena::new(64);
        let result = BarrierBatch::new(&arena, 0, 0, 8);
        assert!(matches!(result, Err(VulkanError::Arena(_))));
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_scope_for_layout() {
        assert_eq!(
            ImageScope::for_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            ImageScope::shader_read()
        );
        assert_eq!(ImageScope::for_layout(vk::ImageLayout::GENERAL).layout, vk::ImageLayout::GENERAL);
        assert_eq!(ImageScope::present().with_queue_family(3).queue_family, 3);
    }
}
