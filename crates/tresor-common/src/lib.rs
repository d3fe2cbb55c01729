//! Tresor Common - Shared types and utilities
//!
//! This crate provides the on-disk tree types, error definitions,
//! configuration and hashing used across all Tresor components.

pub mod config;
pub mod error;
pub mod hash;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use hash::{check_hash, hash_block};
pub use types::*;
