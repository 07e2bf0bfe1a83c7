//! Configuration structures for EmberDB.

use crate::error::{EmberError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default pool size in bytes (64 MB).
pub const DEFAULT_POOL_SIZE: u64 = 64 * 1024 * 1024;

/// Smallest pool size accepted (space for the header plus a few nodes).
pub const MIN_POOL_SIZE: u64 = 4096;

/// Configuration for a persistent memory pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Path of the backing pool file.
    pub path: PathBuf,
    /// Total pool size in bytes, fixed at creation.
    pub size: u64,
    /// Synchronize the undo log and data ranges to stable media at every
    /// commit point. Off by default: the OS page cache already survives a
    /// process crash, and full syncing is only needed for power-failure
    /// durability.
    pub sync_writes: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/ember.pool"),
            size: DEFAULT_POOL_SIZE,
            sync_writes: false,
        }
    }
}

impl PoolConfig {
    /// Creates a configuration for the given path with default sizing.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Validates the configuration before pool creation.
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(EmberError::Config("pool path must not be empty".to_string()));
        }
        if self.size < MIN_POOL_SIZE {
            return Err(EmberError::Config(format!(
                "pool size {} is below the minimum of {} bytes",
                self.size, MIN_POOL_SIZE
            )));
        }
        Ok(())
    }
}
