//! Configuration types for walfs
//!
//! This module defines configuration structures used across components.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest log the engine accepts (must hold one shrink step plus overhead)
pub const MIN_LOG_CAPACITY: u64 = 8;

/// Largest log whose slot table still fits in a single header block
pub const MAX_LOG_CAPACITY: u64 = 510;

/// Root configuration for walfs
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Engine configuration
    #[serde(default)]
    pub engine: EngineConfig,
    /// Disk image configuration
    #[serde(default)]
    pub disk: DiskConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.disk.validate()
    }
}

/// Storage engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of block slots in the on-disk log (fixed at format time)
    pub log_capacity: u64,
    /// Number of blocks reserved for inodes (fixed at format time)
    pub inode_blocks: u64,
    /// Shrinker configuration
    pub shrink: ShrinkConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_capacity: MAX_LOG_CAPACITY,
            inode_blocks: 32, // 1024 inodes
            shrink: ShrinkConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(MIN_LOG_CAPACITY..=MAX_LOG_CAPACITY).contains(&self.log_capacity) {
            return Err(Error::configuration(format!(
                "log_capacity {} outside [{}, {}]",
                self.log_capacity, MIN_LOG_CAPACITY, MAX_LOG_CAPACITY
            )));
        }
        if self.inode_blocks == 0 {
            return Err(Error::configuration("inode_blocks must be positive"));
        }
        if self.shrink.reserve_blocks + 1 >= self.log_capacity {
            return Err(Error::configuration(format!(
                "shrink reserve of {} blocks leaves no room in a {}-block log",
                self.shrink.reserve_blocks, self.log_capacity
            )));
        }
        Ok(())
    }
}

/// Background shrinker configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShrinkConfig {
    /// Log slots kept free in every shrink transaction for the inode block,
    /// the bitmap blocks and the indirect blocks on the path
    pub reserve_blocks: u64,
    /// Commit attempts before a shrink worker gives up until the next open
    pub max_retries: u32,
    /// Initial backoff between commit attempts (doubled each retry)
    pub backoff_ms: u64,
}

impl Default for ShrinkConfig {
    fn default() -> Self {
        Self {
            reserve_blocks: 4,
            max_retries: 8,
            backoff_ms: 10,
        }
    }
}

/// Disk image configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Path to the disk image
    pub path: PathBuf,
    /// Image size in blocks (used when formatting)
    pub blocks: u64,
    /// Call fsync on every write barrier
    pub sync_on_barrier: bool,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./walfs.img"),
            blocks: 100_000,
            sync_on_barrier: true,
        }
    }
}

impl DiskConfig {
    /// Check the disk section
    pub fn validate(&self) -> Result<()> {
        if self.blocks == 0 {
            return Err(Error::configuration("disk blocks must be positive"));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
