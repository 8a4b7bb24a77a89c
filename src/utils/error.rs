//! Error types for the Binix child-process launcher

use thiserror::Error;

/// Main error type for launcher operations.
///
/// Errors are cloneable because the same failure is frequently reported twice:
/// once to the synchronous caller of `launch` and once to the request's
/// completion callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LauncherError {
    /// The host refused or failed to start the worker service
    #[error("failed to bind {service} in {package}: {reason}")]
    BindFailure {
        package: String,
        service: String,
        reason: String,
    },

    /// The worker terminated before its setup handshake completed
    #[error("connection {connection} crashed (last pid {pid})")]
    Crashed { connection: String, pid: u32 },

    /// The connection was stopped on request before its setup handshake completed
    #[error("connection {connection} was stopped (last pid {pid})")]
    Stopped { connection: String, pid: u32 },

    /// The setup bundle could not be delivered to the worker
    #[error("setup of {connection} failed: {reason}")]
    SetupFailed { connection: String, reason: String },

    /// Another host process keeps winning the slots we bind to
    #[error("slot {slot_index} of {package} is held by another process ({attempts} attempts)")]
    CrossProcessSlotConflict {
        package: String,
        slot_index: usize,
        attempts: u32,
    },

    /// No creation params are registered under this id
    #[error("unknown creation params id {0}")]
    UnknownCreationParams(i32),

    /// The connection is not (or no longer) in the slot table
    #[error("unknown connection {0}")]
    UnknownConnection(String),

    /// A slot was asked to move backwards in its lifecycle
    #[error("invalid slot transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// The launcher thread is gone
    #[error("launcher thread has shut down")]
    LauncherShutDown,

    /// Blocking on the launcher thread from the launcher thread would deadlock
    #[error("cannot block on the launcher thread from itself")]
    BlockingOnLauncherThread,
}

impl LauncherError {
    /// True when resubmitting the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BindFailure { .. } | Self::Crashed { .. } | Self::SetupFailed { .. }
        )
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for `LauncherConfig`
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A value was syntactically fine but not acceptable
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

/// Convenience Result type for launcher operations
pub type Result<T> = std::result::Result<T, LauncherError>;
