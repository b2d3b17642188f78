//! GPU buffers backed by the context's memory allocator
//!
//! A [`GpuBuffer`] pairs a `vk::Buffer` with its `vk_mem` allocation and a
//! [`MemoryResidency`]. Host-visible buffers are written directly through
//! [`GpuBuffer::write_mapped`]; device-local ones go through a
//! [`StagedUpload`](super::upload::StagedUpload).

use ash::vk;
use vk_mem::Alloc;

use crate::render::backends::vulkan::{DeviceContext, VulkanError, VulkanResult};

/// Where a buffer's memory lives and how the host may touch it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryResidency {
    /// GPU-only memory, written through a staging copy
    DeviceLocal,
    /// Host-visible memory read and written in any order
    HostRandomAccess,
    /// Host-visible memory written front to back (staging, streaming)
    HostLinear,
}

impl MemoryResidency {
    /// Whether the host can map this memory
    pub fn is_host_visible(self) -> bool {
        !matches!(self, Self::DeviceLocal)
    }

    /// Allocation parameters for this residency
    pub fn allocation_info(self) -> vk_mem::AllocationCreateInfo {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        match self {
            Self::DeviceLocal => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            },
            Self::HostRandomAccess => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::Auto,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
                required_flags: host,
                ..Default::default()
            },
            Self::HostLinear => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::Auto,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                required_flags: host,
                ..Default::default()
            },
        }
    }

    /// Buffer usage adjusted for this residency
    ///
    /// Device-local buffers are always valid copy destinations so staged
    /// writes can reach them.
    pub fn buffer_usage(self, usage: vk::BufferUsageFlags) -> vk::BufferUsageFlags {
        match self {
            Self::DeviceLocal => usage | vk::BufferUsageFlags::TRANSFER_DST,
            Self::HostRandomAccess | Self::HostLinear => usage,
        }
    }
}

/// Validate a write of `len` bytes at `offset` into a buffer of `size` bytes
pub(crate) fn check_write_range(
    size: vk::DeviceSize,
    residency: MemoryResidency,
    len: usize,
    offset: vk::DeviceSize,
) -> VulkanResult<()> {
    if residency == MemoryResidency::HostLinear && offset != 0 {
        return Err(VulkanError::invalid("linear host buffers are written from offset 0"));
    }

    let end = (len as vk::DeviceSize)
        .checked_add(offset)
        .ok_or_else(|| VulkanError::invalid("write range overflows"))?;
    if end > size {
        return Err(VulkanError::invalid(format!(
            "write of {} bytes at offset {} exceeds buffer size {}",
            len, offset, size
        )));
    }
    Ok(())
}

/// Buffer plus its memory allocation
pub struct GpuBuffer {
    buffer: vk::Buffer,
    allocation: Option<vk_mem::Allocation>,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    residency: MemoryResidency,
}

impl GpuBuffer {
    /// Create a buffer of `size` bytes
    pub fn new(
        ctx: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        residency: MemoryResidency,
    ) -> VulkanResult<Self> {
        if size == 0 {
            return Err(VulkanError::invalid("buffer size must be non-zero"));
        }

        let usage = residency.buffer_usage(usage);
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let (buffer, allocation) =
            unsafe { ctx.allocator().create_buffer(&buffer_info, &residency.allocation_info())? };

        log::trace!("Created {:?} buffer of {} bytes ({:?})", residency, size, usage);

        Ok(Self {
            buffer,
            allocation: Some(allocation),
            size,
            usage,
            residency,
        })
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Usage flags the buffer was created with
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Memory residency
    pub fn residency(&self) -> MemoryResidency {
        self.residency
    }

    /// Copy `bytes` into host-visible memory at `offset`
    ///
    /// Never blocks on the GPU, so it is usable while a frame is recording.
    /// The caller must make sure the GPU is not reading the range.
    pub fn write_mapped(&mut self, ctx: &DeviceContext, bytes: &[u8], offset: vk::DeviceSize) -> VulkanResult<()> {
        if !self.residency.is_host_visible() {
            return Err(VulkanError::invalid("mapped writes need a host-visible buffer"));
        }
        check_write_range(self.size, self.residency, bytes.len(), offset)?;
        if bytes.is_empty() {
            return Ok(());
        }

        let allocation = self.allocation_mut()?;
        unsafe {
            let mapped = ctx.allocator().map_memory(allocation)?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped.add(offset as usize), bytes.len());
            ctx.allocator().unmap_memory(allocation);
        }
        Ok(())
    }

    /// Write `bytes` at `offset` by whichever path the residency allows
    ///
    /// Host-visible buffers are written in place; device-local buffers are
    /// staged and the call blocks until the copy completes.
    pub fn write(&mut self, ctx: &mut DeviceContext, bytes: &[u8], offset: vk::DeviceSize) -> VulkanResult<()> {
        if self.residency.is_host_visible() {
            self.write_mapped(ctx, bytes, offset)
        } else {
            super::upload::StagedUpload::new(ctx).upload_buffer(self, bytes, offset)
        }
    }

    /// Copy the whole buffer back to the host
    ///
    /// Device-local buffers need `TRANSFER_SRC` usage and are copied through a
    /// temporary host buffer; this blocks until the copy completes, so it
    /// takes the context exclusively like any staged transfer.
    pub fn read_back(&mut self, ctx: &mut DeviceContext) -> VulkanResult<Vec<u8>> {
        if self.residency.is_host_visible() {
            self.read_mapped(ctx)
        } else {
            super::upload::StagedUpload::new(ctx).read_buffer(self)
        }
    }

    /// Release the buffer and its memory
    pub fn destroy(mut self, ctx: &DeviceContext) {
        if let Some(mut allocation) = self.allocation.take() {
            unsafe { ctx.allocator().destroy_buffer(self.buffer, &mut allocation) };
        }
    }

    /// Copy the mapped contents of a host-visible buffer
    pub(crate) fn read_mapped(&mut self, ctx: &DeviceContext) -> VulkanResult<Vec<u8>> {
        if !self.residency.is_host_visible() {
            return Err(VulkanError::invalid("mapped reads need a host-visible buffer"));
        }
        let size = self.size;
        let allocation = self.allocation_mut()?;
        let mut bytes = vec![0u8; size as usize];
        unsafe {
            let mapped = ctx.allocator().map_memory(allocation)?;
            std::ptr::copy_nonoverlapping(mapped, bytes.as_mut_ptr(), bytes.len());
            ctx.allocator().unmap_memory(allocation);
        }
        Ok(bytes)
    }

    fn allocation_mut(&mut self) -> VulkanResult<&mut vk_mem::Allocation> {
        self.allocation
            .as_mut()
            .ok_or_else(|| VulkanError::invalid("buffer already destroyed"))
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if self.allocation.is_some() {
            log::warn!(
                "GpuBuffer {:?} ({} bytes) dropped without destroy(); its memory is leaked",
                self.buffer,
                self.size
            );
        }
    }
}

/// Release a temporary buffer once the transfer that used it has finished
///
/// After a timed-out transfer the GPU may still read or write it, so it is
/// leaked instead.
pub(crate) fn release_transfer_buffer(ctx: &DeviceContext, buffer: GpuBuffer, transfer: &VulkanResult<()>) {
    if matches!(transfer, Err(VulkanError::FrameTimeout)) {
        log::error!("Transfer timed out; leaking temporary buffer {:?}", buffer.handle());
        drop(buffer);
    } else {
        buffer.destroy(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_residency_allocation_mapping() {
        let device = MemoryResidency::DeviceLocal.allocation_info();
        assert!(matches!(device.usage, vk_mem::MemoryUsage::AutoPreferDevice));
        assert!(device.required_flags.is_empty());

        let random = MemoryResidency::HostRandomAccess.allocation_info();
        assert!(matches!(random.usage, vk_mem::MemoryUsage::Auto));
        assert!(random.flags.contains(vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM));
        assert!(random
            .required_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT));

        let linear = MemoryResidency::HostLinear.allocation_info();
        assert!(linear
            .flags
            .contains(vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE));
        assert!(linear.required_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT));
    }

    #[test]
    fn test_device_local_is_copy_destination() {
        let usage = MemoryResidency::DeviceLocal.buffer_usage(vk::BufferUsageFlags::VERTEX_BUFFER);
        assert!(usage.contains(vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::VERTEX_BUFFER));

        let usage = MemoryResidency::HostLinear.buffer_usage(vk::BufferUsageFlags::TRANSFER_SRC);
        assert_eq!(usage, vk::BufferUsageFlags::TRANSFER_SRC);
        assert!(!MemoryResidency::DeviceLocal.is_host_visible());
        assert!(MemoryResidency::HostRandomAccess.is_host_visible());
    }

    #[test]
    fn test_write_range_checks() {
        assert!(check_write_range(16, MemoryResidency::HostRandomAccess, 8, 8).is_ok());
        assert!(check_write_range(16, MemoryResidency::HostRandomAccess, 9, 8).is_err());
        assert!(check_write_range(16, MemoryResidency::HostLinear, 4, 4).is_err());
        assert!(check_write_range(16, MemoryResidency::HostLinear, 16, 0).is_ok());
        assert!(check_write_range(16, MemoryResidency::DeviceLocal, 1, u64::MAX).is_err());
    }
}
