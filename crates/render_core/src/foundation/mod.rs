//! Foundation module - Core utilities and types
//!
//! This module provides fundamental utilities used throughout the renderer:
//! - Scratch memory (LIFO arena)
//! - Fixed-capacity handle pools
//! - Logging utilities

pub mod collections;
pub mod logging;
pub mod memory;

pub use collections::{Handle, Pool, PoolError};
pub use memory::{Arena, ArenaError, ArenaSlice};
