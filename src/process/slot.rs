//! A single connection slot bound to one worker process

use super::allocator::ConnectionId;
use super::bind::{BindFlags, BindRequest};
use super::pending::SpawnRequest;
use super::service::{ServiceBinder, ServiceHandle};
use crate::utils::{LauncherError, Result};

/// Lifecycle of a slot. Transitions only move forward; `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Unbound,
    Binding,
    Bound,
    Connected,
    Terminated,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Unbound => "unbound",
            SlotState::Binding => "binding",
            SlotState::Bound => "bound",
            SlotState::Connected => "connected",
            SlotState::Terminated => "terminated",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SlotState::Unbound => 0,
            SlotState::Binding => 1,
            SlotState::Bound => 2,
            SlotState::Connected => 3,
            SlotState::Terminated => 4,
        }
    }

    /// Whether `next` is the following step, or termination from a live state
    pub fn can_transition_to(&self, next: SlotState) -> bool {
        match (self, next) {
            (SlotState::Terminated, _) => false,
            (_, SlotState::Terminated) => true,
            _ => next.rank() == self.rank() + 1,
        }
    }

    pub fn is_terminated(&self) -> bool {
        *self == SlotState::Terminated
    }
}

/// Point-in-time copy of a slot, safe to hold after the slot is freed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub connection: ConnectionId,
    pub state: SlotState,
    pub process_id: u32,
    pub service_class: String,
    pub service: Option<ServiceHandle>,
    pub is_external: bool,
    pub bind_to_caller_enforced: bool,
    pub conflicted: bool,
}

impl ConnectionSnapshot {
    pub fn service_number(&self) -> usize {
        self.connection.slot_index
    }

    pub fn is_connected(&self) -> bool {
        self.state == SlotState::Connected
    }
}

/// One addressable binding to a worker process
#[derive(Debug)]
pub struct ConnectionSlot {
    id: ConnectionId,
    service_class: String,
    state: SlotState,
    service: Option<ServiceHandle>,
    /// 0 until the worker reports it; kept after termination
    process_id: u32,
    is_external: bool,
    bind_to_caller_enforced: bool,
    flags: BindFlags,
    request: Option<SpawnRequest>,
    setup_sent: bool,
    conflicted: bool,
}

impl ConnectionSlot {
    /// Create an unbound slot
    pub fn new(
        id: ConnectionId,
        service_class: String,
        is_external: bool,
        bind_to_caller_enforced: bool,
    ) -> Self {
        Self {
            id,
            service_class,
            state: SlotState::Unbound,
            service: None,
            process_id: 0,
            is_external,
            bind_to_caller_enforced,
            flags: BindFlags::background(),
            request: None,
            setup_sent: false,
            conflicted: false,
        }
    }

    /// Create a slot for a freshly claimed cell, already waiting to be bound
    pub fn claimed(
        id: ConnectionId,
        service_class: String,
        is_external: bool,
        bind_to_caller_enforced: bool,
    ) -> Self {
        Self {
            state: SlotState::Binding,
            ..Self::new(id, service_class, is_external, bind_to_caller_enforced)
        }
    }

    fn transition(&mut self, next: SlotState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(LauncherError::InvalidTransition {
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        log::debug!(
            "{}: {} -> {}",
            self.id,
            self.state.as_str(),
            next.as_str()
        );
        self.state = next;
        Ok(())
    }

    /// Ask the host to start and bind the worker service.
    ///
    /// On failure the slot is terminated, never left half-bound; the caller is
    /// expected to free it.
    pub fn bind<B>(&mut self, binder: &mut B, flags: BindFlags) -> Result<()>
    where
        B: ServiceBinder + ?Sized,
    {
        if self.state == SlotState::Unbound {
            self.transition(SlotState::Binding)?;
        }
        if self.state != SlotState::Binding {
            return Err(LauncherError::InvalidTransition {
                from: self.state.as_str(),
                to: SlotState::Bound.as_str(),
            });
        }

        self.flags = flags;
        let request = BindRequest {
            connection: self.id.clone(),
            package: self.id.key.package_name.clone(),
            service_class: self.service_class.clone(),
            flags,
            sandboxed: self.id.key.sandboxed,
        };

        match binder.bind(&request) {
            Ok(()) => self.transition(SlotState::Bound),
            Err(err) => {
                log::warn!("bind of {} failed: {}", request, err);
                self.state = SlotState::Terminated;
                Err(LauncherError::BindFailure {
                    package: request.package,
                    service: request.service_class,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// The worker service is connected
    pub fn on_connected(&mut self, service: ServiceHandle) -> Result<()> {
        self.transition(SlotState::Connected)?;
        self.service = Some(service);
        Ok(())
    }

    /// Record the pid reported by the setup handshake; state is unchanged
    pub fn on_setup_complete(&mut self, pid: u32) -> Result<()> {
        if self.state.is_terminated() {
            return Err(LauncherError::InvalidTransition {
                from: self.state.as_str(),
                to: "setup-complete",
            });
        }
        self.process_id = pid;
        Ok(())
    }

    /// The worker crashed
    pub fn on_crashed(&mut self) {
        self.terminate();
    }

    /// The worker disconnected or was stopped
    pub fn on_disconnected(&mut self) {
        self.terminate();
    }

    fn terminate(&mut self) {
        if !self.state.is_terminated() {
            log::debug!("{}: {} -> terminated", self.id, self.state.as_str());
            self.state = SlotState::Terminated;
        }
    }

    /// Slot index; compared by callers to detect slot number races
    pub fn service_number(&self) -> usize {
        self.id.slot_index
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn service(&self) -> Option<ServiceHandle> {
        self.service
    }

    pub fn service_class(&self) -> &str {
        &self.service_class
    }

    pub fn flags(&self) -> BindFlags {
        self.flags
    }

    pub fn is_external(&self) -> bool {
        self.is_external
    }

    pub fn bind_to_caller_enforced(&self) -> bool {
        self.bind_to_caller_enforced
    }

    pub fn is_connected(&self) -> bool {
        self.state == SlotState::Connected
    }

    /// False only when the caller check is enforced and the worker denied us
    pub fn is_bound_to_caller(&self) -> bool {
        !self.bind_to_caller_enforced || self.service.is_some_and(|s| s.bind_to_caller())
    }

    pub fn mark_conflicted(&mut self) {
        self.conflicted = true;
    }

    /// Attach the spawn request this slot will be set up for
    pub fn attach_request(&mut self, request: SpawnRequest) {
        self.request = Some(request);
        self.setup_sent = false;
    }

    pub fn take_request(&mut self) -> Option<SpawnRequest> {
        self.request.take()
    }

    pub fn request(&self) -> Option<&SpawnRequest> {
        self.request.as_ref()
    }

    pub fn has_request(&self) -> bool {
        self.request.is_some()
    }

    pub fn mark_setup_sent(&mut self) {
        self.setup_sent = true;
    }

    pub fn setup_sent(&self) -> bool {
        self.setup_sent
    }


    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            connection: self.id.clone(),
            state: self.state,
            process_id: self.process_id,
            service_class: self.service_class.clone(),
            service: self.service,
            is_external: self.is_external,
            bind_to_caller_enforced: self.bind_to_caller_enforced,
            conflicted: self.conflicted,
        }
    }
}
