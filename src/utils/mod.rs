//! Shared utilities: configuration and error types

pub mod config;
pub mod error;

pub use config::{CapacityOverride, LauncherConfig};
pub use error::{ConfigError, LauncherError, Result};
