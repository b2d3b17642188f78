//! Plain vertex/index mesh container
//!
//! Backend-agnostic apart from the vertex input descriptions, which the mesh
//! renderer feeds straight into pipeline creation.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::assets::AssetError;

/// Interleaved vertex: position, normal, texture coordinate
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    /// Object-space position
    pub position: [f32; 3],
    /// Object-space normal
    pub normal: [f32; 3],
    /// Texture coordinate
    pub tex_coord: [f32; 2],
}

impl Vertex {
    /// Create a vertex
    pub const fn new(position: [f32; 3], normal: [f32; 3], tex_coord: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            tex_coord,
        }
    }

    /// Vertex buffer binding 0, advanced per vertex
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Attributes at locations 0 (position), 1 (normal) and 2 (tex coord)
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 12,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 2,
                format: vk::Format::R32G32_SFLOAT,
                offset: 24,
            },
        ]
    }
}

/// CPU-side mesh ready for upload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    /// Vertex array
    pub vertices: Vec<Vertex>,
    /// Triangle list indices into `vertices`
    pub indices: Vec<u32>,
}

impl MeshData {
    /// Build a mesh, checking that indices form triangles inside the vertex array
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Result<Self, AssetError> {
        let mesh = Self { vertices, indices };
        mesh.validate()?;
        Ok(mesh)
    }

    /// Check triangle count and index range
    pub fn validate(&self) -> Result<(), AssetError> {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return Err(AssetError::InvalidData("mesh has no geometry".to_string()));
        }
        if self.indices.len() % 3 != 0 {
            return Err(AssetError::InvalidData(format!(
                "{} indices do not form whole triangles",
                self.indices.len()
            )));
        }
        if let Some(&bad) = self.indices.iter().find(|&&i| i as usize >= self.vertices.len()) {
            return Err(AssetError::InvalidData(format!(
                "index {} out of range for {} vertices",
                bad,
                self.vertices.len()
            )));
        }
        Ok(())
    }

    /// Unit quad in the XY plane facing +Z
    pub fn quad() -> Self {
        let normal = [0.0, 0.0, 1.0];
        Self {
            vertices: vec![
                Vertex::new([-0.5, -0.5, 0.0], normal, [0.0, 1.0]),
                Vertex::new([0.5, -0.5, 0.0], normal, [1.0, 1.0]),
                Vertex::new([0.5, 0.5, 0.0], normal, [1.0, 0.0]),
                Vertex::new([-0.5, 0.5, 0.0], normal, [0.0, 0.0]),
            ],
            indices: vec![0, 1, 2, 2, 3, 0],
        }
    }

    /// Vertex array as bytes
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Index array as bytes
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout_matches_struct() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        assert_eq!(Vertex::binding_description().stride, 32);
        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[2].offset, 24);
    }

    #[test]
    fn test_quad_is_valid() {
        let quad = MeshData::quad();
        assert!(quad.validate().is_ok());
        assert_eq!(quad.vertex_bytes().len(), 4 * 32);
        assert_eq!(quad.index_bytes().len(), 6 * 4);
    }

    #[test]
    fn test_validation_rejects_bad_indices() {
        let vertices = MeshData::quad().vertices;
        assert!(MeshData::new(vertices.clone(), vec![0, 1]).is_err());
        assert!(MeshData::new(vertices.clone(), vec![0, 1, 4]).is_err());
        assert!(MeshData::new(Vec::new(), Vec::new()).is_err());
        assert!(MeshData::new(vertices, vec![3, 2, 1]).is_ok());
    }
}
