//! # Binix Launcher - child process launching for a multi-process host
//!
//! Starts sandboxed and privileged worker processes hosted by services of an
//! installed package, one fixed-capacity slot pool per (package, sandbox mode).
//!
//! ## Architecture
//!
//! - **process**: slot allocation, pending-spawn queues, the per-connection
//!   lifecycle, the launcher state machine and the thread it runs on
//! - **utils**: configuration and error types
//!
//! All launcher state is owned by one thread. Work is posted to it through a
//! [`LauncherHandle`]; binders report connects, disconnects and setup replies
//! through an [`EventSink`] that feeds the same queue.

pub mod process;
pub mod utils;

// Re-export main types for convenience
pub use process::{
    AllocatorKey, ConnectionId, CreationParams, DEFAULT_PARAMS_ID, Dispatch, EventSink,
    LaunchedProcess, Launcher, LauncherHandle, LauncherThread, ServiceBinder, SpawnRequest,
};
pub use utils::{LauncherConfig, LauncherError, Result};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = "Binix Launcher";
