//! Bind flags and requests handed to the host's service-binding facility

use std::fmt;

use super::allocator::ConnectionId;

/// Binding policy for a worker service connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BindFlags {
    /// Start the service if it is not already running
    pub auto_create: bool,
    /// Treat the worker as foreground for scheduling and OOM purposes
    pub important: bool,
    /// The service runs in another installed package's process space
    pub external_service: bool,
}

impl BindFlags {
    /// Flags for an ordinary background worker
    pub fn background() -> Self {
        Self {
            auto_create: true,
            ..Self::default()
        }
    }

    /// Flags for a worker that must stay in the foreground
    pub fn foreground() -> Self {
        Self {
            auto_create: true,
            important: true,
            ..Self::default()
        }
    }

    /// Flags for the given request hints
    pub fn for_request(always_in_foreground: bool, external_service: bool) -> Self {
        let mut flags = if always_in_foreground {
            Self::foreground()
        } else {
            Self::background()
        };
        flags.external_service = external_service;
        flags
    }

    /// Encode as a bit mask
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.auto_create {
            bits |= 0x1;
        }
        if self.important {
            bits |= 0x40;
        }
        if self.external_service {
            bits |= 0x8000_0000;
        }
        bits
    }
}

/// A request to start and bind one worker service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub connection: ConnectionId,
    pub package: String,
    pub service_class: String,
    pub flags: BindFlags,
    pub sandboxed: bool,
}

impl BindRequest {
    /// Slot number the service class name was derived from
    pub fn service_number(&self) -> usize {
        self.connection.slot_index
    }
}

impl fmt::Display for BindRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} (flags {:#x})",
            self.package,
            self.service_class,
            self.flags.bits()
        )
    }
}
