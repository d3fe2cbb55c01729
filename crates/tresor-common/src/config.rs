//! Configuration types for Tresor
//!
//! This module defines configuration structures used across components.

use crate::error::{Error, Result};
use crate::types::{Pba, TreeGeometry, TreeLevel};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration for Tresor
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backing image configuration
    pub image: ImageConfig,
    /// Meta tree configuration
    pub meta_tree: MetaTreeConfig,
    /// Block cache configuration
    pub cache: CacheConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.meta_tree.geometry()?;
        if self.cache.capacity_entries == 0 {
            return Err(Error::Configuration(
                "cache capacity must be at least one entry".into(),
            ));
        }
        if self.meta_tree.first_node_pba == 0 {
            return Err(Error::Configuration(
                "pba 0 marks unused slots and cannot hold a node".into(),
            ));
        }
        Ok(())
    }
}

/// Backing image configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Path to the image file
    pub path: PathBuf,
    /// Image size in blocks
    pub blocks: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tresor.img"),
            blocks: 1024,
        }
    }
}

/// Meta tree shape and placement
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaTreeConfig {
    /// Level of the root block
    pub max_level: TreeLevel,
    /// Children per node block
    pub edges: u32,
    /// Leaf slots in use
    pub leaves: u64,
    /// Pba of the first node block written by the formatter
    pub first_node_pba: Pba,
}

impl Default for MetaTreeConfig {
    fn default() -> Self {
        Self {
            max_level: 2,
            edges: 4,
            leaves: 16,
            first_node_pba: 1,
        }
    }
}

impl MetaTreeConfig {
    /// Validated tree geometry
    pub fn geometry(&self) -> Result<TreeGeometry> {
        TreeGeometry::new(self.max_level, self.edges, self.leaves)
    }
}

/// Block cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached blocks
    pub capacity_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_entries: 64,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
