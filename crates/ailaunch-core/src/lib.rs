//! `ailaunch` Core Library
//!
//! Shared functionality for the launcher:
//! - Persisted launcher settings with most-recent lists
//! - API key masking for display
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod mask;
pub mod tracing_init;

pub use config::{LauncherConfig, RecentField};
pub use error::{Error, Result};
pub use mask::mask_api_key;
