//! # Core Module
//!
//! Shared configuration used by every subsystem of the render core.

pub mod config;

pub use crate::config::{Config, ConfigError};
pub use config::{DeviceConfig, PresentConfig, RenderCoreConfig, ResourceLimits};
