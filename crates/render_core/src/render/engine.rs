//! Render engine: device, frame pacing, resource managers and the active renderer

use ash::vk;

use crate::assets::{ImageData, MeshData};
use crate::core::RenderCoreConfig;
use crate::render::backends::vulkan::{
    ClearRenderer, DeviceContext, DeviceToken, FramePacer, MeshHandle, MeshManager, MeshRenderer, Renderer,
    SurfaceProvider, TextureHandle, TextureManager, VulkanError, VulkanResult,
};

/// What happened to a requested frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and presented
    Presented,
    /// The swapchain was out of date and has been rebuilt; nothing was shown
    Resized,
    /// The slot fence or acquire timed out; the frame was skipped
    TimedOut,
}

/// Whether the window size moved away from the one the swapchain was built for
fn window_changed(window: vk::Extent2D, built_for: vk::Extent2D) -> bool {
    window.width != built_for.width || window.height != built_for.height
}

/// Counts consecutive frame timeouts against a limit
#[derive(Debug, Clone)]
pub struct TimeoutTracker {
    consecutive: u32,
    limit: u32,
}

impl TimeoutTracker {
    /// Tracker that gives up after `limit` timeouts in a row
    pub fn new(limit: u32) -> Self {
        Self { consecutive: 0, limit }
    }

    /// Record a timeout; `true` once the limit is reached
    pub fn record_timeout(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.limit
    }

    /// Record a frame that completed
    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Timeouts since the last completed frame
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Owns everything needed to draw frames into one window
///
/// Fields drop in declaration order after [`Drop`] releases the GPU
/// resources, so the pacer goes before the device context.
pub struct RenderEngine {
    renderer: Box<dyn Renderer>,
    meshes: MeshManager,
    textures: TextureManager,
    pacer: FramePacer,
    timeouts: TimeoutTracker,
    config: RenderCoreConfig,
    ctx: DeviceContext,
}

impl RenderEngine {
    /// Create the device context, swapchain and managers for `window`
    ///
    /// Starts with a [`ClearRenderer`] using the configured clear color.
    pub fn new(window: &mut dyn SurfaceProvider, config: RenderCoreConfig) -> VulkanResult<Self> {
        config
            .validate()
            .map_err(|e| VulkanError::InitializationFailed(format!("invalid configuration: {}", e)))?;

        log::info!("Initializing render engine for '{}'", config.device.application_name);

        let token = DeviceToken::acquire()
            .ok_or_else(|| VulkanError::InitializationFailed("a device context already exists".to_string()))?;

        let extent = window.framebuffer_extent();
        let mut ctx = DeviceContext::new(token, &config.device, Some(&mut *window))?;
        ctx.resize_scratch(config.limits.scratch_arena_bytes);
        ctx.set_transfer_timeout(config.present.frame_timeout());

        let pacer = FramePacer::new(&ctx, &config.present, extent)?;
        let meshes = MeshManager::new(config.limits.max_meshes);
        let textures = TextureManager::new(config.limits.max_textures, config.limits.max_anisotropy);

        Ok(Self {
            renderer: Box::new(ClearRenderer::new(config.present.clear_color)),
            meshes,
            textures,
            pacer,
            timeouts: TimeoutTracker::new(config.present.max_consecutive_timeouts),
            config,
            ctx,
        })
    }

    /// Replace the active renderer, destroying the old one
    pub fn set_renderer(&mut self, renderer: Box<dyn Renderer>) -> VulkanResult<()> {
        self.ctx.wait_idle()?;
        let mut old = std::mem::replace(&mut self.renderer, renderer);
        old.destroy(&self.ctx);
        Ok(())
    }

    /// Build a [`MeshRenderer`] for the current swapchain and make it active
    pub fn use_mesh_renderer(&mut self, vertex_spv: &[u8], fragment_spv: &[u8]) -> VulkanResult<()> {
        let renderer = MeshRenderer::new(
            &self.ctx,
            self.pacer.format(),
            self.pacer.extent(),
            self.pacer.frames_in_flight(),
            vertex_spv,
            fragment_spv,
        )?;
        self.set_renderer(Box::new(renderer))
    }

    /// Draw one frame with the active renderer
    ///
    /// A window whose size no longer matches the swapchain, or an out-of-date
    /// swapchain, is rebuilt through `window` and reported as
    /// [`FrameOutcome::Resized`]. Timeouts skip the frame until
    /// `max_consecutive_timeouts` is reached, then fail with `FrameTimeout`.
    pub fn draw_frame(&mut self, window: &mut dyn SurfaceProvider) -> VulkanResult<FrameOutcome> {
        let window_extent = window.framebuffer_extent();
        if window_changed(window_extent, self.pacer.window_extent()) {
            log::debug!(
                "Window is {}x{}, swapchain was built for {}x{}",
                window_extent.width,
                window_extent.height,
                self.pacer.window_extent().width,
                self.pacer.window_extent().height
            );
            self.handle_resize(window)?;
            return Ok(FrameOutcome::Resized);
        }

        let frame = match self.pacer.begin_frame(&self.ctx) {
            Ok(frame) => frame,
            Err(VulkanError::InvalidWindow) => {
                self.handle_resize(window)?;
                return Ok(FrameOutcome::Resized);
            }
            Err(VulkanError::FrameTimeout) => return self.on_timeout(),
            Err(e) => return Err(e),
        };

        if let Err(e) = self.renderer.draw(&frame, &self.meshes) {
            log::error!("Frame recording failed: {}", e);
            self.pacer.abandon_frame(frame);
            return Err(e);
        }

        match self.pacer.end_frame(frame) {
            Ok(()) => {
                self.timeouts.record_success();
                Ok(FrameOutcome::Presented)
            }
            Err(VulkanError::InvalidWindow) => {
                self.timeouts.record_success();
                self.handle_resize(window)?;
                Ok(FrameOutcome::Resized)
            }
            Err(e) => Err(e),
        }
    }

    fn on_timeout(&mut self) -> VulkanResult<FrameOutcome> {
        if self.timeouts.record_timeout() {
            log::error!(
                "{} consecutive frame timeouts; giving up",
                self.timeouts.consecutive()
            );
            return Err(VulkanError::FrameTimeout);
        }
        log::warn!("Frame timed out ({} in a row)", self.timeouts.consecutive());
        Ok(FrameOutcome::TimedOut)
    }

    /// Rebuild the swapchain and every surface-sized resource
    ///
    /// Blocks while the window has a zero-sized framebuffer (minimized).
    pub fn handle_resize(&mut self, window: &mut dyn SurfaceProvider) -> VulkanResult<()> {
        let extent = window.wait_for_valid_extent();
        log::debug!("Handling resize to {}x{}", extent.width, extent.height);

        self.pacer.resize(&self.ctx, extent)?;
        self.renderer.resize(&self.ctx, self.pacer.extent())
    }

    /// Upload a mesh
    pub fn upload_mesh(&mut self, mesh: &MeshData) -> VulkanResult<MeshHandle> {
        self.meshes.upload(&mut self.ctx, mesh)
    }

    /// Destroy a mesh once the device is done with it
    pub fn destroy_mesh(&mut self, handle: MeshHandle) -> VulkanResult<()> {
        self.ctx.wait_idle()?;
        self.meshes.destroy(&self.ctx, handle)
    }

    /// Upload an sRGB, mip-mapped texture
    pub fn upload_texture(&mut self, image: &ImageData) -> VulkanResult<TextureHandle> {
        self.textures.create_texture(&mut self.ctx, image, true, true)
    }

    /// Upload a cubemap from a horizontal-cross image
    pub fn upload_cubemap(&mut self, cross: &ImageData) -> VulkanResult<TextureHandle> {
        self.textures.create_cubemap(&mut self.ctx, cross, true)
    }

    /// 1×1 texture of a single colour
    pub fn solid_texture(&mut self, color: [u8; 4]) -> VulkanResult<TextureHandle> {
        self.textures.create_solid(&mut self.ctx, color)
    }

    /// Destroy a texture once the device is done with it
    pub fn destroy_texture(&mut self, handle: TextureHandle) -> VulkanResult<()> {
        self.ctx.wait_idle()?;
        self.textures.destroy(&self.ctx, handle)
    }

    /// Active renderer
    pub fn renderer_mut(&mut self) -> &mut dyn Renderer {
        self.renderer.as_mut()
    }

    /// Device context
    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    /// Mesh manager
    pub fn meshes(&self) -> &MeshManager {
        &self.meshes
    }

    /// Texture manager
    pub fn textures(&self) -> &TextureManager {
        &self.textures
    }

    /// Frame pacer
    pub fn pacer(&self) -> &FramePacer {
        &self.pacer
    }

    /// Current swapchain extent
    pub fn extent(&self) -> vk::Extent2D {
        self.pacer.extent()
    }

    /// Configuration the engine was built with
    pub fn config(&self) -> &RenderCoreConfig {
        &self.config
    }
}

impl Drop for RenderEngine {
    fn drop(&mut self) {
        log::info!("Shutting down render engine");
        if let Err(e) = self.ctx.wait_idle() {
            log::error!("wait_idle failed during shutdown: {}", e);
        }
        self.renderer.destroy(&self.ctx);
        self.meshes.destroy_all(&self.ctx);
        self.textures.destroy_all(&self.ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_escalate_at_limit() {
        let mut tracker = TimeoutTracker::new(3);
        assert!(!tracker.record_timeout());
        assert!(!tracker.record_timeout());
        assert!(tracker.record_timeout());
    }

    #[test]
    fn test_success_resets_timeout_count() {
        let mut tracker = TimeoutTracker::new(2);
        assert!(!tracker.record_timeout());
        tracker.record_success();
        assert_eq!(tracker.consecutive(), 0);
        assert!(!tracker.record_timeout());
        assert!(tracker.record_timeout());
    }

    #[test]
    fn test_window_change_detection() {
        let built = vk::Extent2D { width: 320, height: 240 };
        assert!(!window_changed(built, built));
        assert!(window_changed(vk::Extent2D { width: 640, height: 360 }, built));
        assert!(window_changed(vk::Extent2D { width: 320, height: 0 }, built));
    }
}
