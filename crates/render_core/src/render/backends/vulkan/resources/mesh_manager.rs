//! Pooled GPU meshes
//!
//! Meshes live in a fixed-capacity [`Pool`]; callers hold generation-checked
//! [`MeshHandle`]s and destroy meshes through the same manager.

use ash::vk;
use bytemuck::Pod;

use super::buffer::{GpuBuffer, MemoryResidency};
use super::upload::StagedUpload;
use crate::assets::MeshData;
use crate::foundation::{Handle, Pool, PoolError};
use crate::render::backends::vulkan::{DeviceContext, VulkanError, VulkanResult};

/// Device-local vertex and index buffers of one mesh
pub struct GpuMesh {
    vertex_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
    vertex_count: u32,
    index_count: u32,
}

impl GpuMesh {
    /// Vertex buffer handle
    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertex_buffer.handle()
    }

    /// Index buffer handle (`u32` indices)
    pub fn index_buffer(&self) -> vk::Buffer {
        self.index_buffer.handle()
    }

    /// Number of vertices
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// Number of indices
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Release both buffers
    pub fn destroy(self, ctx: &DeviceContext) {
        self.vertex_buffer.destroy(ctx);
        self.index_buffer.destroy(ctx);
    }
}

/// Handle to a mesh owned by a [`MeshManager`]
pub type MeshHandle = Handle<GpuMesh>;

/// Draw counts are `u32` on the GPU
fn element_count(len: usize, what: &str) -> VulkanResult<u32> {
    u32::try_from(len).map_err(|_| VulkanError::invalid(format!("{} {} exceed the u32 draw range", len, what)))
}

/// Fixed-capacity mesh storage
pub struct MeshManager {
    meshes: Pool<GpuMesh>,
}

impl MeshManager {
    /// Create a manager holding at most `capacity` meshes
    pub fn new(capacity: usize) -> Self {
        log::debug!("Mesh pool capacity: {}", capacity);
        Self {
            meshes: Pool::with_capacity(capacity),
        }
    }

    /// Upload vertices and indices into new device-local buffers
    ///
    /// Blocks until both copies finish.
    pub fn create<V: Pod>(
        &mut self,
        ctx: &mut DeviceContext,
        vertices: &[V],
        indices: &[u32],
    ) -> VulkanResult<MeshHandle> {
        if vertices.is_empty() || indices.is_empty() {
            return Err(VulkanError::invalid("mesh needs vertices and indices"));
        }
        if self.meshes.is_full() {
            return Err(PoolError::Exhausted {
                capacity: self.meshes.capacity(),
            }
            .into());
        }

        let vertex_count = element_count(vertices.len(), "vertices")?;
        let index_count = element_count(indices.len(), "indices")?;

        let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(indices);

        let vertex_buffer = GpuBuffer::new(
            ctx,
            vertex_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryResidency::DeviceLocal,
        )?;
        let index_buffer = match GpuBuffer::new(
            ctx,
            index_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::INDEX_BUFFER,
            MemoryResidency::DeviceLocal,
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                vertex_buffer.destroy(ctx);
                return Err(e);
            }
        };

        let mesh = GpuMesh {
            vertex_buffer,
            index_buffer,
            vertex_count,
            index_count,
        };

        let uploaded = {
            let mut upload = StagedUpload::new(ctx);
            upload
                .upload_buffer(&mesh.vertex_buffer, vertex_bytes, 0)
                .and_then(|()| upload.upload_buffer(&mesh.index_buffer, index_bytes, 0))
        };
        if let Err(e) = uploaded {
            mesh.destroy(ctx);
            return Err(e);
        }

        let handle = self.meshes.alloc(mesh)?;
        log::debug!(
            "Created mesh {:?}: {} vertices, {} indices",
            handle,
            vertices.len(),
            indices.len()
        );
        Ok(handle)
    }

    /// Upload a [`MeshData`]
    pub fn upload(&mut self, ctx: &mut DeviceContext, mesh: &MeshData) -> VulkanResult<MeshHandle> {
        mesh.validate()?;
        self.create(ctx, &mesh.vertices, &mesh.indices)
    }

    /// Look up a live mesh
    pub fn get(&self, handle: MeshHandle) -> VulkanResult<&GpuMesh> {
        Ok(self.meshes.get(handle)?)
    }

    /// Destroy the mesh behind `handle`
    pub fn destroy(&mut self, ctx: &DeviceContext, handle: MeshHandle) -> VulkanResult<()> {
        let mesh = self.meshes.dealloc(handle)?;
        mesh.destroy(ctx);
        Ok(())
    }

    /// Destroy every mesh; outstanding handles become stale
    pub fn destroy_all(&mut self, ctx: &DeviceContext) {
        let meshes = self.meshes.drain();
        if !meshes.is_empty() {
            log::debug!("Destroying {} meshes", meshes.len());
        }
        for mesh in meshes {
            mesh.destroy(ctx);
        }
    }

    /// Number of live meshes
    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    /// Whether no mesh is live
    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }

    /// Maximum number of meshes
    pub fn capacity(&self) -> usize {
        self.meshes.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_count_rejects_oversized_meshes() {
        assert_eq!(element_count(6, "indices").unwrap(), 6);
        assert_eq!(element_count(u32::MAX as usize, "indices").unwrap(), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert!(element_count(u32::MAX as usize + 1, "vertices").is_err());
    }
}
