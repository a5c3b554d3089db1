#![forbid(unsafe_code)]

//! Core types for the Weft mesh overlay.
//!
//! This crate intentionally stays lightweight and pure Rust.
//! Public modules export typed identifiers, basic error handling,
//! and configuration helpers used across the workspace.
//!
//! Design goals:
//! - Small, dependency-minimized surface
//! - Clear, documented types with safe helpers
//! - Robust config loading with validation

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{BootstrapPeer, MeshConfig};
pub use error::{Error, Result};
pub use types::{MachineId, NatClass, PeerId};
