//! Frames in flight
//!
//! [`FramePacer`] owns the swapchain and `F` frame slots, each with a command
//! buffer, an image-available semaphore and an in-flight fence. A frame moves
//! through [`FrameState`]:
//!
//! ```text
//! Idle -> Acquiring -> Recording -> Submitted -> Presenting -> Idle
//! ```
//!
//! Failures before submission return the pacer to `Idle`.

use std::time::Duration;

use ash::vk;

use super::swapchain::Swapchain;
use super::sync::{Fence, Semaphore};
use crate::core::PresentConfig;
use crate::render::backends::vulkan::{DeviceContext, VulkanError, VulkanResult};

/// Where the pacer is in the frame cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Ready for `begin_frame`
    Idle,
    /// Waiting on the slot fence and the swapchain
    Acquiring,
    /// A [`RecordingFrame`] is out
    Recording,
    /// Commands queued
    Submitted,
    /// Presentation queued
    Presenting,
}

impl FrameState {
    /// Whether moving from `self` to `next` is a legal step
    pub fn can_advance_to(self, next: FrameState) -> bool {
        use FrameState::*;
        matches!(
            (self, next),
            (Idle, Acquiring)
                | (Acquiring, Recording)
                | (Acquiring, Idle)
                | (Recording, Submitted)
                | (Recording, Idle)
                | (Submitted, Presenting)
                | (Presenting, Idle)
        )
    }
}

/// Round-robin slot bookkeeping
///
/// Frame `n` (counting from zero) uses slot `n mod F` and waits on the fence
/// that slot's previous frame signalled.
#[derive(Debug, Clone)]
pub struct FrameRing {
    slots: usize,
    next: usize,
    frames_started: u64,
    last_waited: Option<usize>,
}

impl FrameRing {
    /// Ring of `slots` frame slots
    pub fn new(slots: usize) -> Self {
        Self {
            slots: slots.max(1),
            next: 0,
            frames_started: 0,
            last_waited: None,
        }
    }

    /// Slot the next frame will use, without claiming it
    pub fn peek(&self) -> usize {
        self.next
    }

    /// Claim the slot for the next frame and return its index
    pub fn advance(&mut self) -> usize {
        let slot = self.next;
        self.next = (self.next + 1) % self.slots;
        self.frames_started += 1;
        self.last_waited = Some(slot);
        slot
    }

    /// Slot the most recent frame waited on
    pub fn last_waited(&self) -> Option<usize> {
        self.last_waited
    }

    /// Slot the current frame is using
    pub fn current(&self) -> usize {
        self.last_waited.unwrap_or(0)
    }

    /// Number of slots
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Frames started so far
    pub fn frames_started(&self) -> u64 {
        self.frames_started
    }
}

struct FrameSlot {
    command_buffer: vk::CommandBuffer,
    image_available: Semaphore,
    in_flight: Fence,
}

/// A frame between `begin_frame` and `end_frame`
///
/// Holds a shared borrow of the device context for its whole lifetime, so no
/// blocking [`StagedUpload`](crate::render::backends::vulkan::resources::StagedUpload)
/// can start while it is alive:
///
/// ```compile_fail
/// use render_core::prelude::*;
///
/// fn record(frame: &RecordingFrame<'_>, buffer: &mut GpuBuffer) -> VulkanResult<Vec<u8>> {
///     // read_back blocks on the GPU and needs the context exclusively
///     buffer.read_back(frame.context())
/// }
/// ```
///
/// ```compile_fail
/// use render_core::prelude::*;
///
/// fn record(frame: &RecordingFrame<'_>, buffer: &GpuBuffer) -> VulkanResult<()> {
///     StagedUpload::new(frame.context()).upload_buffer(buffer, &[0u8; 4], 0)
/// }
/// ```
pub struct RecordingFrame<'ctx> {
    ctx: &'ctx DeviceContext,
    command_buffer: vk::CommandBuffer,
    slot: usize,
    image_index: u32,
    image: vk::Image,
    image_view: vk::ImageView,
    extent: vk::Extent2D,
    format: vk::Format,
}

impl<'ctx> RecordingFrame<'ctx> {
    /// Device context the frame records against
    pub fn context(&self) -> &'ctx DeviceContext {
        self.ctx
    }

    /// Command buffer in the recording state
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Frame slot index in `0..frames_in_flight`
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Acquired swapchain image index
    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Acquired swapchain image, in `UNDEFINED` layout
    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// View of the acquired image
    pub fn image_view(&self) -> vk::ImageView {
        self.image_view
    }

    /// Swapchain extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Swapchain image format
    pub fn format(&self) -> vk::Format {
        self.format
    }
}

/// Swapchain plus per-slot synchronization
///
/// Drop it before the device context, once the device is idle.
pub struct FramePacer {
    slots: Vec<FrameSlot>,
    swapchain: Swapchain,
    ring: FrameRing,
    state: FrameState,
    timeout: Duration,
    vsync: bool,
    window_extent: vk::Extent2D,
}

impl FramePacer {
    /// Create the swapchain and `config.max_frames_in_flight` slots
    pub fn new(ctx: &DeviceContext, config: &PresentConfig, window_extent: vk::Extent2D) -> VulkanResult<Self> {
        let surface = ctx
            .surface()
            .ok_or_else(|| VulkanError::invalid("frame pacing needs a context with a surface"))?;
        let frames = config.max_frames_in_flight.max(1);

        let swapchain = Swapchain::new(ctx, surface, window_extent, config.vsync, vk::SwapchainKHR::null())?;

        let command_buffers = ctx.command_pool().allocate_command_buffers(ctx.device(), frames as u32)?;
        let mut slots = Vec::with_capacity(frames);
        for command_buffer in command_buffers {
            slots.push(FrameSlot {
                command_buffer,
                image_available: Semaphore::new(ctx.device())?,
                in_flight: Fence::new(ctx.device(), true)?,
            });
        }

        log::info!("Frame pacer ready: {} frames in flight", frames);
        Ok(Self {
            slots,
            swapchain,
            ring: FrameRing::new(frames),
            state: FrameState::Idle,
            timeout: config.frame_timeout(),
            vsync: config.vsync,
            window_extent,
        })
    }

    /// Wait for the next slot, acquire an image and begin recording
    ///
    /// `FrameTimeout` if the slot fence or the acquire does not complete in
    /// time, `InvalidWindow` if the swapchain no longer matches the surface.
    /// Either way the pacer is back to `Idle` and the slot fence is not reset.
    pub fn begin_frame<'ctx>(&mut self, ctx: &'ctx DeviceContext) -> VulkanResult<RecordingFrame<'ctx>> {
        if self.state != FrameState::Idle {
            return Err(VulkanError::invalid(format!(
                "begin_frame called in state {:?}",
                self.state
            )));
        }

        self.set_state(FrameState::Acquiring);
        match self.acquire(ctx) {
            Ok(frame) => {
                self.set_state(FrameState::Recording);
                Ok(frame)
            }
            Err(e) => {
                self.set_state(FrameState::Idle);
                Err(e)
            }
        }
    }

    fn acquire<'ctx>(&mut self, ctx: &'ctx DeviceContext) -> VulkanResult<RecordingFrame<'ctx>> {
        let slot_index = self.ring.peek();
        let slot = &self.slots[slot_index];

        // A timed-out wait leaves the ring on this slot for the next attempt
        slot.in_flight.wait(self.timeout)?;
        self.ring.advance();

        let extent = self.swapchain.extent();
        if extent.width == 0 || extent.height == 0 {
            return Err(VulkanError::InvalidWindow);
        }

        let image_index = self
            .swapchain
            .acquire_next_image(slot.image_available.handle(), self.timeout)?;

        // Only now is this slot certain to be submitted
        slot.in_flight.reset()?;

        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let begun = unsafe {
            ctx.device()
                .reset_command_buffer(slot.command_buffer, vk::CommandBufferResetFlags::empty())
                .and_then(|()| ctx.device().begin_command_buffer(slot.command_buffer, &begin_info))
        };
        if let Err(e) = begun {
            self.release_slot(ctx, slot_index);
            return Err(e.into());
        }

        let (image, image_view) = match (self.swapchain.image(image_index), self.swapchain.image_view(image_index)) {
            (Some(image), Some(view)) => (image, view),
            _ => {
                self.release_slot(ctx, slot_index);
                return Err(VulkanError::invalid(format!("acquired unknown image {}", image_index)));
            }
        };

        Ok(RecordingFrame {
            ctx,
            command_buffer: slot.command_buffer,
            slot: slot_index,
            image_index,
            image,
            image_view,
            extent,
            format: self.swapchain.format().format,
        })
    }

    /// Submit the frame's commands and present its image
    ///
    /// `InvalidWindow` from presentation still counts the frame as submitted;
    /// the caller should resize before the next frame.
    pub fn end_frame(&mut self, frame: RecordingFrame<'_>) -> VulkanResult<()> {
        if self.state != FrameState::Recording || frame.slot != self.ring.current() {
            return Err(VulkanError::invalid(format!(
                "end_frame for slot {} in state {:?}",
                frame.slot, self.state
            )));
        }
        let ctx = frame.ctx;
        let slot = &self.slots[frame.slot];

        let submitted = self.swapchain.ready_to_present(frame.image_index).and_then(|ready| {
            unsafe { ctx.device().end_command_buffer(frame.command_buffer)? };

            let wait = vk::SemaphoreSubmitInfo::builder()
                .semaphore(slot.image_available.handle())
                .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                .build();
            let signal = vk::SemaphoreSubmitInfo::builder()
                .semaphore(ready)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                .build();
            let command_buffer_info = vk::CommandBufferSubmitInfo::builder()
                .command_buffer(frame.command_buffer)
                .build();
            let submit_info = vk::SubmitInfo2::builder()
                .wait_semaphore_infos(std::slice::from_ref(&wait))
                .command_buffer_infos(std::slice::from_ref(&command_buffer_info))
                .signal_semaphore_infos(std::slice::from_ref(&signal))
                .build();

            unsafe {
                ctx.device().queue_submit2(
                    ctx.queue(),
                    std::slice::from_ref(&submit_info),
                    slot.in_flight.handle(),
                )?;
            }
            Ok(())
        });

        if let Err(e) = submitted {
            self.release_slot(ctx, frame.slot);
            self.set_state(FrameState::Idle);
            return Err(e);
        }
        self.set_state(FrameState::Submitted);

        self.set_state(FrameState::Presenting);
        let presented = self.swapchain.present(ctx.queue(), frame.image_index);
        self.set_state(FrameState::Idle);
        presented
    }

    /// Drop a frame without presenting it
    ///
    /// Used when recording fails part way. The acquired image is not
    /// presented, so a resize should follow.
    pub fn abandon_frame(&mut self, frame: RecordingFrame<'_>) {
        if self.state != FrameState::Recording {
            return;
        }
        // The buffer is never submitted; ending it only returns it to a resettable state
        if let Err(e) = unsafe { frame.ctx.device().end_command_buffer(frame.command_buffer) } {
            log::warn!("Failed to end abandoned command buffer in slot {}: {:?}", frame.slot, e);
        }
        self.release_slot(frame.ctx, frame.slot);
        self.set_state(FrameState::Idle);
        log::warn!("Abandoned frame in slot {}", frame.slot);
    }

    /// Rebuild the swapchain for a new window size
    ///
    /// Waits for the device to go idle, passes the old swapchain to the new
    /// one, and recreates the per-slot image-available semaphores since an
    /// abandoned acquire may have left one signalled.
    pub fn resize(&mut self, ctx: &DeviceContext, window_extent: vk::Extent2D) -> VulkanResult<()> {
        if self.state != FrameState::Idle {
            return Err(VulkanError::invalid(format!("resize called in state {:?}", self.state)));
        }
        if window_extent.width == 0 || window_extent.height == 0 {
            return Err(VulkanError::InvalidWindow);
        }
        let surface = ctx
            .surface()
            .ok_or_else(|| VulkanError::invalid("frame pacing needs a context with a surface"))?;

        ctx.wait_idle()?;

        let rebuilt = Swapchain::new(ctx, surface, window_extent, self.vsync, self.swapchain.handle())?;
        // The retired swapchain is destroyed here, after its successor exists
        self.swapchain = rebuilt;
        self.window_extent = window_extent;

        for slot in &mut self.slots {
            slot.image_available = Semaphore::new(ctx.device())?;
        }

        let extent = self.swapchain.extent();
        log::info!("Swapchain resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    /// Current state
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Number of frame slots
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Slot bookkeeping
    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }

    /// Swapchain
    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    /// Swapchain extent
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// Swapchain image format
    pub fn format(&self) -> vk::Format {
        self.swapchain.format().format
    }

    /// Window size the swapchain was last built for
    ///
    /// May differ from [`extent`](Self::extent) when the surface dictates
    /// its own size.
    pub fn window_extent(&self) -> vk::Extent2D {
        self.window_extent
    }

    /// Whether the GPU has finished the last frame submitted from `slot`
    pub fn slot_fence_signalled(&self, slot: usize) -> VulkanResult<bool> {
        let slot = self
            .slots
            .get(slot)
            .ok_or_else(|| VulkanError::invalid(format!("no frame slot {}", slot)))?;
        slot.in_flight.is_signaled()
    }

    /// Bound on fence and acquire waits
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_state(&mut self, next: FrameState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal frame transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    /// Consume the slot's image-available signal and signal its fence
    ///
    /// After a reset fence whose frame will never be submitted, this keeps the
    /// next wait on the slot from stalling.
    fn release_slot(&self, ctx: &DeviceContext, slot_index: usize) {
        let slot = &self.slots[slot_index];
        let wait = vk::SemaphoreSubmitInfo::builder()
            .semaphore(slot.image_available.handle())
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .build();
        let submit_info = vk::SubmitInfo2::builder()
            .wait_semaphore_infos(std::slice::from_ref(&wait))
            .build();
        let result = unsafe {
            ctx.device()
                .queue_submit2(ctx.queue(), std::slice::from_ref(&submit_info), slot.in_flight.handle())
        };
        if let Err(e) = result {
            log::error!("Failed to release frame slot {}: {:?}", slot_index, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_slots_alternate() {
        let mut ring = FrameRing::new(2);
        let waited: Vec<usize> = (0..5).map(|_| ring.advance()).collect();
        assert_eq!(waited, vec![0, 1, 0, 1, 0]);
        assert_eq!(ring.frames_started(), 5);
    }

    #[test]
    fn test_third_frame_waits_on_first_slot() {
        let mut ring = FrameRing::new(2);
        ring.advance();
        ring.advance();
        assert_eq!(ring.advance(), 0);
        assert_eq!(ring.last_waited(), Some(0));
    }

    #[test]
    fn test_every_slot_is_revisited() {
        for slots in 1..=8 {
            let mut ring = FrameRing::new(slots);
            let mut seen = vec![0u32; slots];
            for _ in 0..slots * 3 {
                seen[ring.advance()] += 1;
            }
            assert!(seen.iter().all(|&n| n == 3), "slots {}: {:?}", slots, seen);
        }
    }

    #[test]
    fn test_peek_does_not_claim_a_slot() {
        let mut ring = FrameRing::new(2);
        ring.advance();
        assert_eq!(ring.peek(), 1);
        assert_eq!(ring.peek(), 1);
        assert_eq!(ring.frames_started(), 1);
        assert_eq!(ring.advance(), 1);
        assert_eq!(ring.peek(), 0);
    }

    #[test]
    fn test_zero_slots_is_treated_as_one() {
        let mut ring = FrameRing::new(0);
        assert_eq!(ring.slots(), 1);
        assert_eq!(ring.advance(), 0);
        assert_eq!(ring.advance(), 0);
    }

    #[test]
    fn test_happy_path_transitions() {
        use FrameState::*;
        let cycle = [Idle, Acquiring, Recording, Submitted, Presenting, Idle];
        for pair in cycle.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_failures_return_to_idle() {
        assert!(FrameState::Acquiring.can_advance_to(FrameState::Idle));
        assert!(FrameState::Recording.can_advance_to(FrameState::Idle));
    }

    #[test]
    fn test_illegal_transitions() {
        use FrameState::*;
        assert!(!Idle.can_advance_to(Recording));
        assert!(!Recording.can_advance_to(Acquiring));
        assert!(!Submitted.can_advance_to(Recording));
        assert!(!Idle.can_advance_to(Idle));
    }
}
