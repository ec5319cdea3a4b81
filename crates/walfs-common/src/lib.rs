//! walfs Common - Shared types and utilities
//!
//! This crate provides the types, error definitions and configuration
//! used across all walfs components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, DiskConfig, EngineConfig, LoggingConfig, ShrinkConfig};
pub use error::{Error, Result};
pub use types::*;
