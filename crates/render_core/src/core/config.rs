//! # Render Core Configuration
//!
//! Configuration for device creation, frame pacing and resource limits.
//! Every section has sensible defaults and can be loaded partially from TOML
//! or RON; missing fields fall back to the defaults.
//!
//! ```toml
//! [device]
//! application_name = "Asteroids"
//! enable_validation = true
//!
//! [present]
//! max_frames_in_flight = 2
//! vsync = false
//!
//! [limits]
//! max_textures = 256
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{Config, ConfigError};

/// Device and instance creation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Application name reported to the driver
    pub application_name: String,
    /// Application version (major, minor, patch)
    pub application_version: (u32, u32, u32),
    /// Whether to enable Vulkan validation layers; `None` follows the build type
    pub enable_validation: Option<bool>,
    /// Rank discrete GPUs above integrated ones during selection
    pub prefer_discrete_gpu: bool,
}

impl DeviceConfig {
    /// Create a device configuration for the named application
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            ..Self::default()
        }
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Resolved validation setting
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            application_name: "Render Core Application".to_string(),
            application_version: (1, 0, 0),
            enable_validation: None,
            prefer_discrete_gpu: true,
        }
    }
}

/// Presentation and frame pacing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresentConfig {
    /// Number of in-flight frame slots
    pub max_frames_in_flight: usize,
    /// FIFO presentation when true, MAILBOX (if available) otherwise
    pub vsync: bool,
    /// Bound on fence and acquire waits, in milliseconds
    pub frame_timeout_ms: u64,
    /// Consecutive frame timeouts tolerated before the engine gives up
    pub max_consecutive_timeouts: u32,
    /// Clear color for the color target
    pub clear_color: [f32; 4],
}

impl PresentConfig {
    /// Set the number of frames in flight
    pub fn with_max_frames_in_flight(mut self, frames: usize) -> Self {
        self.max_frames_in_flight = frames;
        self
    }

    /// Enable or disable vsync
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Fence/acquire timeout as a duration
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

impl Default for PresentConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            vsync: true,
            frame_timeout_ms: 1_000,
            max_consecutive_timeouts: 3,
            clear_color: [0.02, 0.02, 0.05, 1.0],
        }
    }
}

/// Fixed capacities for allocators and pools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Size of the device context's scratch arena in bytes
    pub scratch_arena_bytes: usize,
    /// Mesh pool capacity
    pub max_meshes: usize,
    /// Texture pool capacity
    pub max_textures: usize,
    /// Upper bound on sampler anisotropy; clamped to the device limit
    pub max_anisotropy: f32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            scratch_arena_bytes: 64 * 1024,
            max_meshes: 64,
            max_textures: 1024,
            max_anisotropy: 16.0,
        }
    }
}

/// # Complete Render Core Configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderCoreConfig {
    /// Device creation settings
    pub device: DeviceConfig,
    /// Presentation settings
    pub present: PresentConfig,
    /// Allocator and pool capacities
    pub limits: ResourceLimits,
}

impl RenderCoreConfig {
    /// Create a configuration with defaults for the named application
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            device: DeviceConfig::new(app_name),
            ..Self::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.application_name.is_empty() {
            return Err(ConfigError::Invalid("Application name cannot be empty".to_string()));
        }

        if !(1..=8).contains(&self.present.max_frames_in_flight) {
            return Err(ConfigError::Invalid(format!(
                "Frames in flight must be between 1 and 8, got {}",
                self.present.max_frames_in_flight
            )));
        }

        if self.present.frame_timeout_ms == 0 {
            return Err(ConfigError::Invalid("Frame timeout must be non-zero".to_string()));
        }

        if self.limits.scratch_arena_bytes == 0 {
            return Err(ConfigError::Invalid("Scratch arena cannot be empty".to_string()));
        }

        if self.limits.max_meshes == 0 || self.limits.max_textures == 0 {
            return Err(ConfigError::Invalid("Pool capacities must be non-zero".to_string()));
        }

        if self.limits.max_anisotropy < 1.0 {
            return Err(ConfigError::Invalid("Anisotropy must be at least 1.0".to_string()));
        }

        Ok(())
    }
}

impl Config for RenderCoreConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RenderCoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.present.max_frames_in_flight, 2);
        assert_eq!(config.limits.max_meshes, 64);
        assert_eq!(config.limits.max_textures, 1024);
        assert_eq!(config.present.frame_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = RenderCoreConfig::from_toml(
            r#"
            [present]
            max_frames_in_flight = 3

            [limits]
            max_textures = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.present.max_frames_in_flight, 3);
        assert!(config.present.vsync);
        assert_eq!(config.limits.max_textures, 16);
        assert_eq!(config.limits.max_meshes, 64);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = RenderCoreConfig::new("Round Trip");
        let text = config.to_toml().unwrap();
        assert_eq!(RenderCoreConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_save_and_load_ron() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render.ron");

        let mut config = RenderCoreConfig::new("Ron App");
        config.present = config.present.with_vsync(false);
        config.save_to_file(&path).unwrap();

        assert_eq!(RenderCoreConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_unsupported_extension() {
        let err = RenderCoreConfig::load_from_file("render.yaml").unwrap_err();
        // Reading fails first when the file does not exist
        assert!(matches!(err, ConfigError::Io(_) | ConfigError::UnsupportedFormat(_)));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render.json");
        std::fs::write(&path, "{}").unwrap();
        assert!(matches!(
            RenderCoreConfig::load_from_file(&path),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RenderCoreConfig::default();
        config.present.max_frames_in_flight = 0;
        assert!(config.validate().is_err());

        let mut config = RenderCoreConfig::default();
        config.present = config.present.with_max_frames_in_flight(9);
        assert!(config.validate().is_err());

        let mut config = RenderCoreConfig::default();
        config.limits.scratch_arena_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = RenderCoreConfig::default();
        config.present.frame_timeout_ms = 0;
        assert!(config.validate().is_err());
    }
}
