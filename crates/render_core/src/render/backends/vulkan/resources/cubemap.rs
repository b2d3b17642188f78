//! Horizontal-cross cubemap layout
//!
//! A cross image is 4 faces wide and 3 faces tall:
//!
//! ```text
//!        +Y
//!    -X  +Z  +X  -Z
//!        -Y
//! ```
//!
//! Faces are emitted in Vulkan layer order (+X, -X, +Y, -Y, +Z, -Z).

use ash::vk;

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Cell (column, row) of each face in the cross, in layer order
const FACE_CELLS: [(u32, u32); 6] = [(2, 1), (0, 1), (1, 0), (1, 2), (1, 1), (3, 1)];

/// Where one face sits in the cross image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceRegion {
    /// Destination array layer
    pub layer: u32,
    /// Top-left texel of the face in the cross image
    pub src_offset: (u32, u32),
}

/// Face regions of a cross whose faces are `face_size` texels square
pub fn cross_layout_regions(face_size: u32) -> [FaceRegion; 6] {
    let mut regions = [FaceRegion { layer: 0, src_offset: (0, 0) }; 6];
    for (layer, (region, &(col, row))) in regions.iter_mut().zip(FACE_CELLS.iter()).enumerate() {
        *region = FaceRegion {
            layer: layer as u32,
            src_offset: (col * face_size, row * face_size),
        };
    }
    regions
}

/// Face size for a cross image of `width` × `height`
pub fn face_size_for_cross(width: u32, height: u32) -> VulkanResult<u32> {
    if width == 0 || width % 4 != 0 || u64::from(height) * 4 != u64::from(width) * 3 {
        return Err(VulkanError::invalid(format!(
            "{}x{} is not a 4x3 cubemap cross",
            width, height
        )));
    }
    Ok(width / 4)
}

/// Buffer-to-image copies taking each face of a staged cross into its layer
///
/// `texel_size` is the byte size of one texel; the staging buffer holds the
/// whole cross with rows of `4 * face_size` texels.
pub fn cross_copy_regions(face_size: u32, texel_size: u32, base_offset: vk::DeviceSize) -> [vk::BufferImageCopy; 6] {
    let row_length = 4 * face_size;
    cross_layout_regions(face_size).map(|face| {
        let (x, y) = face.src_offset;
        let texel_index = vk::DeviceSize::from(y) * vk::DeviceSize::from(row_length) + vk::DeviceSize::from(x);
        vk::BufferImageCopy {
            buffer_offset: base_offset + texel_index * vk::DeviceSize::from(texel_size),
            buffer_row_length: row_length,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: face.layer,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: face_size,
                height: face_size,
                depth: 1,
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_regions_in_layer_order() {
        let regions = cross_layout_regions(64);
        let offsets: Vec<_> = regions.iter().map(|r| r.src_offset).collect();
        assert_eq!(
            offsets,
            vec![(128, 64), (0, 64), (64, 0), (64, 128), (64, 64), (192, 64)]
        );
        assert!(regions.iter().enumerate().all(|(i, r)| r.layer == i as u32));
    }

    #[test]
    fn test_regions_stay_inside_cross() {
        let s = 16;
        for region in cross_layout_regions(s) {
            let (x, y) = region.src_offset;
            assert!(x + s <= 4 * s);
            assert!(y + s <= 3 * s);
        }
    }

    #[test]
    fn test_copy_regions_use_cross_row_length() {
        let copies = cross_copy_regions(8, 4, 0);
        assert!(copies.iter().all(|c| c.buffer_row_length == 32));
        // +X starts at column 2, row 1: texel (16, 8)
        assert_eq!(copies[0].buffer_offset, (8 * 32 + 16) * 4);
        // +Y starts at column 1, row 0
        assert_eq!(copies[2].buffer_offset, 8 * 4);
        assert_eq!(copies[5].image_subresource.base_array_layer, 5);
    }

    #[test]
    fn test_face_size_for_cross() {
        assert_eq!(face_size_for_cross(256, 192).unwrap(), 64);
        assert!(face_size_for_cross(256, 256).is_err());
        assert!(face_size_for_cross(0, 0).is_err());
        assert!(face_size_for_cross(10, 7).is_err());
    }

    #[test]
    fn test_huge_cross_is_rejected_without_overflow() {
        assert!(face_size_for_cross(2_000_000_000, 1_500_000_000).is_ok());
        assert!(face_size_for_cross(2_000_000_000, 1_500_000_001).is_err());
        assert!(face_size_for_cross(4_000_000_000, u32::MAX).is_err());
    }
}
