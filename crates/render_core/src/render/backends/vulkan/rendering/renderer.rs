//! Renderer trait and the clear-only renderer
//!
//! A renderer records one complete frame into a [`RecordingFrame`]: it takes
//! the acquired swapchain image from `UNDEFINED`, renders with dynamic
//! rendering and leaves the image in `PRESENT_SRC_KHR`.

use ash::{vk, Device};

use super::barriers::{full_range, BarrierBatch, ImageScope};
use crate::render::backends::vulkan::resources::MeshManager;
use crate::render::backends::vulkan::state::RecordingFrame;
use crate::render::backends::vulkan::{DeviceContext, VulkanResult};

/// Something that can draw a frame
pub trait Renderer {
    /// Record this frame's commands
    fn draw(&mut self, frame: &RecordingFrame<'_>, meshes: &MeshManager) -> VulkanResult<()>;

    /// Adapt surface-sized resources to a new swapchain extent
    fn resize(&mut self, ctx: &DeviceContext, extent: vk::Extent2D) -> VulkanResult<()>;

    /// Release GPU resources; the device must be idle
    fn destroy(&mut self, ctx: &DeviceContext);
}

/// Scope of a freshly acquired swapchain image
///
/// The acquire semaphore is waited at color attachment output, so the layout
/// transition is ordered after it.
pub(crate) const fn acquired_image() -> ImageScope {
    ImageScope::new(
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        vk::AccessFlags2::NONE,
        vk::ImageLayout::UNDEFINED,
    )
}

/// Color attachment that clears to `clear_color` and stores
pub(crate) fn color_attachment_info(view: vk::ImageView, clear_color: [f32; 4]) -> vk::RenderingAttachmentInfo {
    vk::RenderingAttachmentInfo::builder()
        .image_view(view)
        .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .clear_value(vk::ClearValue {
            color: vk::ClearColorValue { float32: clear_color },
        })
        .build()
}

/// Full-extent render area
pub(crate) fn render_area(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

/// Move the frame's image from color attachment to presentable
pub(crate) fn transition_to_present(ctx: &DeviceContext, frame: &RecordingFrame<'_>) -> VulkanResult<()> {
    let mut to_present = BarrierBatch::new(ctx.scratch(), 0, 0, 1)?;
    to_present.set_image(
        0,
        frame.image(),
        full_range(vk::ImageAspectFlags::COLOR, 1, 1),
        ImageScope::color_attachment_write(),
        ImageScope::present(),
    )?;
    to_present.build_and_run(ctx.device(), frame.command_buffer())
}

/// Clears the swapchain image to a solid color
pub struct ClearRenderer {
    clear_color: [f32; 4],
}

impl ClearRenderer {
    /// Renderer clearing to `clear_color`
    pub fn new(clear_color: [f32; 4]) -> Self {
        Self { clear_color }
    }

    /// Change the clear color
    pub fn set_clear_color(&mut self, clear_color: [f32; 4]) {
        self.clear_color = clear_color;
    }

    /// Current clear color
    pub fn clear_color(&self) -> [f32; 4] {
        self.clear_color
    }

    fn record_clear(&self, device: &Device, frame: &RecordingFrame<'_>) {
        let color = [color_attachment_info(frame.image_view(), self.clear_color)];
        let rendering_info = vk::RenderingInfo::builder()
            .render_area(render_area(frame.extent()))
            .layer_count(1)
            .color_attachments(&color);

        unsafe {
            device.cmd_begin_rendering(frame.command_buffer(), &rendering_info);
            device.cmd_end_rendering(frame.command_buffer());
        }
    }
}

impl Renderer for ClearRenderer {
    fn draw(&mut self, frame: &RecordingFrame<'_>, _meshes: &MeshManager) -> VulkanResult<()> {
        let ctx = frame.context();

        let mut to_attachment = BarrierBatch::new(ctx.scratch(), 0, 0, 1)?;
        to_attachment.set_image(
            0,
            frame.image(),
            full_range(vk::ImageAspectFlags::COLOR, 1, 1),
            acquired_image(),
            ImageScope::color_attachment_write(),
        )?;
        to_attachment.build_and_run(ctx.device(), frame.command_buffer())?;

        self.record_clear(ctx.device(), frame);

        transition_to_present(ctx, frame)
    }

    fn resize(&mut self, _ctx: &DeviceContext, _extent: vk::Extent2D) -> VulkanResult<()> {
        Ok(())
    }

    fn destroy(&mut self, _ctx: &DeviceContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_attachment_clears_and_stores() {
        let info = color_attachment_info(vk::ImageView::null(), [0.1, 0.2, 0.3, 1.0]);
        assert_eq!(info.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(info.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(info.image_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let color = unsafe { info.clear_value.color.float32 };
        assert_eq!(color, [0.1, 0.2, 0.3, 1.0]);
    }

    #[test]
    fn test_acquired_image_chains_with_acquire_wait() {
        let scope = acquired_image();
        assert_eq!(scope.layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(scope.stage, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
    }

    #[test]
    fn test_clear_color_setter() {
        let mut renderer = ClearRenderer::new([0.0; 4]);
        renderer.set_clear_color([1.0, 0.0, 0.0, 1.0]);
        assert_eq!(renderer.clear_color(), [1.0, 0.0, 0.0, 1.0]);
    }
}
