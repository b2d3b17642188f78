//! Vulkan error types
//!
//! Every fallible call in the backend returns [`VulkanResult`]. Errors fall
//! into three classes (see [`ErrorSeverity`]): fatal ones after which GPU
//! bookkeeping can no longer be trusted, recoverable ones the caller is
//! expected to handle (resize, skip a frame, grow a pool), and load-time ones
//! raised while constructing objects.

use ash::vk;
use thiserror::Error;

use crate::assets::AssetError;
use crate::foundation::{ArenaError, PoolError};

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Host allocation failed
    #[error("Out of host memory")]
    OutOfHostMemory,

    /// Device allocation failed
    #[error("Out of device memory")]
    OutOfDeviceMemory,

    /// The logical device was lost
    #[error("Device lost")]
    DeviceLost,

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No physical device met the requirements
    #[error("No compatible device: {0}")]
    NoCompatibleDevice(String),

    /// A required device feature is not supported
    #[error("Required feature unavailable: {0}")]
    FeatureUnavailable(&'static str),

    /// A required instance or device extension is not supported
    #[error("Required extension unavailable: {0}")]
    ExtensionUnavailable(String),

    /// No queue family supports graphics, compute (and presentation)
    #[error("No queue family supports graphics, compute and presentation")]
    QueueFamilyUnavailable,

    /// The surface changed size or is not presentable; resize and retry
    #[error("Window surface is out of date or not presentable")]
    InvalidWindow,

    /// A fence or acquire wait exceeded the frame timeout
    #[error("Timed out waiting for the GPU")]
    FrameTimeout,

    /// Descriptor pool has no sets left
    #[error("Out of descriptor sets")]
    OutOfDescriptorSets,

    /// Format lacks a capability required by the operation
    #[error("Unsupported format: {0:?}")]
    UnsupportedFormat(vk::Format),

    /// SPIR-V blob could not be used
    #[error("Invalid shader: {0}")]
    InvalidShader(String),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Scratch arena exhausted
    #[error(transparent)]
    Arena(#[from] ArenaError),

    /// Resource pool error
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Asset could not be loaded
    #[error(transparent)]
    Asset(#[from] AssetError),
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

/// How callers are expected to react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// No safe continuation; log and abort
    Fatal,
    /// Handle and continue (resize-and-retry, skip frame, grow pool)
    Recoverable,
    /// Raised during construction; discard the attempt
    LoadTime,
}

impl VulkanError {
    /// Shorthand for [`VulkanError::InvalidOperation`]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidOperation { reason: reason.into() }
    }

    /// Classify this error
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::OutOfHostMemory | Self::OutOfDeviceMemory | Self::DeviceLost | Self::Api(_) => {
                ErrorSeverity::Fatal
            }
            Self::InitializationFailed(_) => ErrorSeverity::Fatal,
            Self::InvalidWindow
            | Self::FrameTimeout
            | Self::OutOfDescriptorSets
            | Self::Arena(_)
            | Self::Pool(_) => ErrorSeverity::Recoverable,
            Self::NoCompatibleDevice(_)
            | Self::FeatureUnavailable(_)
            | Self::ExtensionUnavailable(_)
            | Self::QueueFamilyUnavailable
            | Self::UnsupportedFormat(_)
            | Self::InvalidShader(_)
            | Self::InvalidOperation { .. }
            | Self::Asset(_) => ErrorSeverity::LoadTime,
        }
    }

    /// Whether the error leaves the device in an unusable state
    pub fn is_fatal(&self) -> bool {
        self.severity() == ErrorSeverity::Fatal
    }
}

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR
            | vk::Result::SUBOPTIMAL_KHR
            | vk::Result::ERROR_SURFACE_LOST_KHR => Self::InvalidWindow,
            vk::Result::TIMEOUT | vk::Result::NOT_READY => Self::FrameTimeout,
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                Self::OutOfDescriptorSets
            }
            vk::Result::ERROR_FEATURE_NOT_PRESENT => Self::FeatureUnavailable("requested device feature"),
            vk::Result::ERROR_INCOMPATIBLE_DRIVER => {
                Self::NoCompatibleDevice("driver does not support the requested API version".to_string())
            }
            other => Self::Api(other),
        }
    }
}

/// Escalate an error to a process abort with a diagnostic
///
/// For call sites that decide an error is unrecoverable. The message names
/// the failing operation.
pub trait OrAbort<T> {
    /// Unwrap the value or log and abort
    fn or_abort(self, operation: &str) -> T;
}

impl<T> OrAbort<T> for VulkanResult<T> {
    fn or_abort(self, operation: &str) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                log::error!("Fatal error during {operation}: {e}");
                std::process::abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_mapping() {
        assert!(matches!(
            VulkanError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            VulkanError::OutOfDeviceMemory
        ));
        assert!(matches!(
            VulkanError::from(vk::Result::ERROR_OUT_OF_DATE_KHR),
            VulkanError::InvalidWindow
        ));
        assert!(matches!(VulkanError::from(vk::Result::TIMEOUT), VulkanError::FrameTimeout));
        assert!(matches!(
            VulkanError::from(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
            VulkanError::OutOfDescriptorSets
        ));
        assert!(matches!(
            VulkanError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            VulkanError::Api(vk::Result::ERROR_INITIALIZATION_FAILED)
        ));
    }

    #[test]
    fn test_severity_classes() {
        assert_eq!(VulkanError::DeviceLost.severity(), ErrorSeverity::Fatal);
        assert!(VulkanError::OutOfHostMemory.is_fatal());
        assert_eq!(VulkanError::InvalidWindow.severity(), ErrorSeverity::Recoverable);
        assert_eq!(VulkanError::FrameTimeout.severity(), ErrorSeverity::Recoverable);
        assert_eq!(
            VulkanError::from(PoolError::Exhausted { capacity: 4 }).severity(),
            ErrorSeverity::Recoverable
        );
        assert_eq!(
            VulkanError::FeatureUnavailable("samplerAnisotropy").severity(),
            ErrorSeverity::LoadTime
        );
        assert_eq!(VulkanError::invalid("bad").severity(), ErrorSeverity::LoadTime);
    }

    #[test]
    fn test_display_names_the_problem() {
        let e = VulkanError::ExtensionUnavailable("VK_KHR_swapchain".to_string());
        assert!(e.to_string().contains("VK_KHR_swapchain"));
    }
}
