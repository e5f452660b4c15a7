//! Snapstore Common - Shared types and utilities
//!
//! This crate provides the scalar types and error definitions used
//! across all snapstore components.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
