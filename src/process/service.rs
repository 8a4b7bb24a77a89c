//! Worker service abstraction
//!
//! The launcher never talks to the OS directly. It issues non-blocking bind
//! requests through a [`ServiceBinder`] and learns about connection, setup and
//! death asynchronously through [`ServiceEvent`]s posted to an [`EventSink`].

use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, channel};

use thiserror::Error;

use super::allocator::ConnectionId;
use super::bind::BindRequest;
use super::setup::SetupBundle;

/// Opaque handle to a connected worker service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    token: u64,
    bound_to_caller: bool,
}

impl ServiceHandle {
    pub fn new(token: u64, bound_to_caller: bool) -> Self {
        Self {
            token,
            bound_to_caller,
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Whether the worker confirmed that this host process is the one bound to it
    pub fn bind_to_caller(&self) -> bool {
        self.bound_to_caller
    }
}

/// Why the host could not start or talk to a worker service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("service not found")]
    ServiceNotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("service connection is gone")]
    NotConnected,
    #[error("{0}")]
    Other(String),
}

/// Asynchronous notifications from the host's binding facility
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Connected {
        connection: ConnectionId,
        service: ServiceHandle,
    },
    Disconnected {
        connection: ConnectionId,
    },
    SetupComplete {
        connection: ConnectionId,
        pid: u32,
    },
}

impl ServiceEvent {
    pub fn connection(&self) -> &ConnectionId {
        match self {
            Self::Connected { connection, .. }
            | Self::Disconnected { connection }
            | Self::SetupComplete { connection, .. } => connection,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::SetupComplete { .. } => "setup-complete",
        }
    }
}

/// The host facility used to start, configure and release worker services.
///
/// All methods are called on the launcher thread and must not block; results
/// are reported later through the [`EventSink`] the binder was built with.
#[cfg_attr(test, mockall::automock)]
pub trait ServiceBinder {
    /// Start and bind the service named by the request
    fn bind(&mut self, request: &BindRequest) -> Result<(), BindError>;

    /// Deliver the setup bundle to a connected worker
    fn send_setup(&mut self, connection: &ConnectionId, bundle: SetupBundle)
    -> Result<(), BindError>;

    /// Release the binding; unbinding an unknown connection is a no-op
    fn unbind(&mut self, connection: &ConnectionId);
}

/// Where binders post their asynchronous events
#[derive(Clone)]
pub struct EventSink {
    post: Arc<dyn Fn(ServiceEvent) -> bool + Send + Sync>,
}

impl EventSink {
    /// Build a sink from a posting function; it returns false once the receiver is gone
    pub fn new<F>(post: F) -> Self
    where
        F: Fn(ServiceEvent) -> bool + Send + Sync + 'static,
    {
        Self {
            post: Arc::new(post),
        }
    }

    /// A sink backed by a plain channel, for driving a `Launcher` by hand
    pub fn channel() -> (Self, Receiver<ServiceEvent>) {
        let (tx, rx) = channel();
        (Self::new(move |event| tx.send(event).is_ok()), rx)
    }

    /// A sink that drops everything
    pub fn discard() -> Self {
        Self::new(|_| true)
    }

    /// Post an event; returns false if nobody is listening anymore
    pub fn post(&self, event: ServiceEvent) -> bool {
        let kind = event.as_str();
        let delivered = (self.post)(event);
        if !delivered {
            log::debug!("dropping {} event, launcher is gone", kind);
        }
        delivered
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}
