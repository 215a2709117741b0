//! QuorumIO Common - Shared types and utilities
//!
//! This crate provides the identifiers, error definitions and configuration
//! used across all QuorumIO components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
