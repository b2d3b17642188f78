//! SPIR-V shader modules

use std::ffi::CStr;
use std::io::Cursor;
use std::path::Path;

use ash::{vk, Device};

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decode SPIR-V bytes into words, checking size and magic number
pub fn decode_spirv(bytes: &[u8]) -> VulkanResult<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| VulkanError::InvalidShader(format!("unreadable SPIR-V: {}", e)))?;
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(&other) => Err(VulkanError::InvalidShader(format!("bad SPIR-V magic {:#010x}", other))),
        None => Err(VulkanError::InvalidShader("empty SPIR-V module".to_string())),
    }
}

/// Shader module destroyed on drop
pub struct ShaderModule {
    device: Device,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create a module from SPIR-V bytes
    pub fn from_bytes(device: &Device, bytes: &[u8]) -> VulkanResult<Self> {
        let words = decode_spirv(bytes)?;
        log::debug!("Creating shader module from {} words", words.len());

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let module = unsafe { device.create_shader_module(&create_info, None)? };

        Ok(Self {
            device: device.clone(),
            module,
        })
    }

    /// Create a module from a `.spv` file
    pub fn from_file<P: AsRef<Path>>(device: &Device, path: P) -> VulkanResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| VulkanError::InvalidShader(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_bytes(device, &bytes)
    }

    /// Get the module handle
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Stage description for pipeline creation
    pub fn stage_info(&self, stage: vk::ShaderStageFlags, entry_point: &CStr) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(self.module)
            .name(entry_point)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_header_decodes() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        let words = decode_spirv(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(decode_spirv(&[]), Err(VulkanError::InvalidShader(_))));
        assert!(matches!(decode_spirv(&[1, 2, 3]), Err(VulkanError::InvalidShader(_))));
        assert!(matches!(
            decode_spirv(&0xdead_beefu32.to_le_bytes()),
            Err(VulkanError::InvalidShader(_))
        ));
    }
}
