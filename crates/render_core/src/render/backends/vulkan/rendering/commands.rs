//! Command buffer management
//!
//! Command pools owned by the device context and the one-shot recording guard
//! used by blocking transfers.

use std::time::Duration;

use ash::{vk, Device};

use crate::render::backends::vulkan::state::sync::timeout_nanos;
use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Command pool handle
///
/// Destroyed by the device context during teardown; destroying the pool frees
/// every command buffer allocated from it.
pub struct CommandPool {
    command_pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a command pool on `queue_family_index`
    pub fn new(
        device: &Device,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VulkanResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(flags)
            .queue_family_index(queue_family_index);

        let command_pool = unsafe { device.create_command_pool(&pool_create_info, None)? };

        Ok(Self { command_pool })
    }

    /// Placeholder that owns nothing; `destroy` is a no-op on it
    pub(crate) fn null() -> Self {
        Self {
            command_pool: vk::CommandPool::null(),
        }
    }

    /// Allocate primary command buffers
    pub fn allocate_command_buffers(&self, device: &Device, count: u32) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let command_buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };
        Ok(command_buffers)
    }

    /// Return command buffers to the pool
    pub fn free_command_buffers(&self, device: &Device, command_buffers: &[vk::CommandBuffer]) {
        if !command_buffers.is_empty() {
            unsafe { device.free_command_buffers(self.command_pool, command_buffers) };
        }
    }

    /// Get the command pool handle
    pub fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// Destroy the pool
    ///
    /// # Safety
    /// No command buffer from this pool may be pending on the GPU.
    pub(crate) unsafe fn destroy(&mut self, device: &Device) {
        if self.command_pool != vk::CommandPool::null() {
            device.destroy_command_pool(self.command_pool, None);
            self.command_pool = vk::CommandPool::null();
        }
    }
}

/// Single-use command buffer that is freed on every exit path
///
/// Created in the recording state with ONE_TIME_SUBMIT. `submit_and_wait`
/// ends recording, submits and blocks until the GPU is done; dropping the
/// guard without submitting just frees the buffer.
pub struct OneShotCommands<'a> {
    device: &'a Device,
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
}

impl<'a> OneShotCommands<'a> {
    /// Allocate a command buffer from `pool` and begin recording
    pub fn begin(device: &'a Device, pool: &CommandPool) -> VulkanResult<Self> {
        let command_buffers = pool.allocate_command_buffers(device, 1)?;
        let command_buffer = command_buffers
            .first()
            .copied()
            .ok_or_else(|| VulkanError::InitializationFailed("Driver returned no command buffer".to_string()))?;

        let guard = Self {
            device,
            pool: pool.handle(),
            command_buffer,
        };

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(command_buffer, &begin_info)? };

        Ok(guard)
    }

    /// Command buffer to record into
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// End recording, submit to `queue` and block until execution completes
    ///
    /// `FrameTimeout` if the GPU does not finish within `timeout`. The
    /// command buffer and fence may still be in use then, so both are leaked
    /// rather than freed.
    pub fn submit_and_wait(mut self, queue: vk::Queue, timeout: Duration) -> VulkanResult<()> {
        unsafe { self.device.end_command_buffer(self.command_buffer)? };

        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None)? };

        let command_buffer_info = vk::CommandBufferSubmitInfo::builder()
            .command_buffer(self.command_buffer)
            .build();
        let submit_info = vk::SubmitInfo2::builder()
            .command_buffer_infos(std::slice::from_ref(&command_buffer_info))
            .build();

        let result = unsafe {
            self.device
                .queue_submit2(queue, std::slice::from_ref(&submit_info), fence)
                .and_then(|()| {
                    self.device
                        .wait_for_fences(&[fence], true, timeout_nanos(timeout))
                })
        };

        if result == Err(vk::Result::TIMEOUT) {
            log::error!(
                "One-shot commands did not finish within {:?}; leaking command buffer {:?}",
                timeout,
                self.command_buffer
            );
            self.command_buffer = vk::CommandBuffer::null();
        } else {
            unsafe { self.device.destroy_fence(fence, None) };
        }
        result.map_err(VulkanError::from)
    }
}

impl Drop for OneShotCommands<'_> {
    fn drop(&mut self) {
        if self.command_buffer != vk::CommandBuffer::null() {
            unsafe {
                self.device.free_command_buffers(self.pool, &[self.command_buffer]);
            }
        }
    }
}
