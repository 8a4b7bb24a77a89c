//! In-process stand-in for the host OS service-binding facility
//!
//! `SimulatedDevice` models the installed packages, running worker services and
//! slots that some *other* host process has already bound. `SimulatedBinder`
//! is the [`ServiceBinder`] view of it handed to the launcher. Everything the
//! real facility would report asynchronously is posted through the
//! [`EventSink`], never delivered re-entrantly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::allocator::ConnectionId;
use super::bind::BindRequest;
use super::service::{BindError, EventSink, ServiceBinder, ServiceEvent, ServiceHandle};
use super::setup::SetupBundle;

const FIRST_PID: u32 = 1000;

#[derive(Debug)]
struct LiveService {
    request: BindRequest,
    connected: bool,
    pid: u32,
}

#[derive(Debug)]
struct DeviceState {
    missing_packages: HashSet<String>,
    /// (package, slot) bound by another host process, with that worker's pid
    foreign_slots: HashMap<(String, usize), u32>,
    live: HashMap<ConnectionId, LiveService>,
    setups: Vec<(ConnectionId, SetupBundle)>,
    auto_connect: bool,
    auto_setup: bool,
    bind_calls: usize,
    next_pid: u32,
    next_token: u64,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            missing_packages: HashSet::new(),
            foreign_slots: HashMap::new(),
            live: HashMap::new(),
            setups: Vec::new(),
            auto_connect: true,
            auto_setup: true,
            bind_calls: 0,
            next_pid: FIRST_PID,
            next_token: 1,
        }
    }
}

impl DeviceState {
    fn allocate_pid(&mut self) -> u32 {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    fn handle_for(&mut self, request: &BindRequest) -> ServiceHandle {
        let token = self.next_token;
        self.next_token += 1;
        let foreign = self
            .foreign_slots
            .contains_key(&(request.package.clone(), request.service_number()));
        ServiceHandle::new(token, !foreign)
    }
}

/// Shared, cloneable view of the simulated host
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
    sink: EventSink,
}

impl SimulatedDevice {
    pub fn new(sink: EventSink) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState::default())),
            sink,
        }
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A binder backed by this device
    pub fn binder(&self) -> SimulatedBinder {
        SimulatedBinder {
            device: self.clone(),
        }
    }

    /// Make every service of `package` unresolvable
    pub fn uninstall(&self, package: &str) {
        self.state().missing_packages.insert(package.to_string());
    }

    pub fn install(&self, package: &str) {
        self.state().missing_packages.remove(package);
    }

    /// Pretend another host process already bound `slot` of `package`.
    ///
    /// Returns the pid of that foreign worker.
    pub fn hold_slot_elsewhere(&self, package: &str, slot: usize) -> u32 {
        let mut state = self.state();
        let pid = state.allocate_pid();
        state.foreign_slots.insert((package.to_string(), slot), pid);
        pid
    }

    /// Post `Connected` right after each successful bind (default on)
    pub fn set_auto_connect(&self, value: bool) {
        self.state().auto_connect = value;
    }

    /// Answer each setup bundle with `SetupComplete` (default on)
    pub fn set_auto_setup(&self, value: bool) {
        self.state().auto_setup = value;
    }

    /// Connect a bound service by hand; false if it is not bound or already connected
    pub fn connect(&self, id: &ConnectionId) -> bool {
        let event = {
            let mut state = self.state();
            let request = match state.live.get_mut(id) {
                Some(service) if !service.connected => {
                    service.connected = true;
                    service.request.clone()
                }
                _ => return false,
            };
            ServiceEvent::Connected {
                connection: id.clone(),
                service: state.handle_for(&request),
            }
        };
        self.sink.post(event)
    }

    /// Answer a delivered setup bundle by hand; returns the reported pid
    pub fn complete_setup(&self, id: &ConnectionId) -> Option<u32> {
        let pid = {
            let state = self.state();
            let service = state.live.get(id)?;
            if service.pid == 0 {
                return None;
            }
            service.pid
        };
        self.sink.post(ServiceEvent::SetupComplete {
            connection: id.clone(),
            pid,
        });
        Some(pid)
    }

    /// Kill the worker behind a connection; false if it is not bound
    pub fn crash(&self, id: &ConnectionId) -> bool {
        if self.state().live.remove(id).is_none() {
            return false;
        }
        log::debug!("simulated crash of {}", id);
        self.sink.post(ServiceEvent::Disconnected {
            connection: id.clone(),
        })
    }

    /// Kill the worker that reported `pid`
    pub fn crash_pid(&self, pid: u32) -> bool {
        let id = self
            .state()
            .live
            .iter()
            .find(|(_, service)| service.pid == pid)
            .map(|(id, _)| id.clone());
        id.is_some_and(|id| self.crash(&id))
    }

    pub fn live_connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.state().live.keys().cloned().collect();
        ids.sort_by(|a, b| {
            (&a.key, a.slot_index, a.generation).cmp(&(&b.key, b.slot_index, b.generation))
        });
        ids
    }

    pub fn is_bound(&self, id: &ConnectionId) -> bool {
        self.state().live.contains_key(id)
    }

    pub fn setups_received(&self) -> Vec<(ConnectionId, SetupBundle)> {
        self.state().setups.clone()
    }

    pub fn bind_calls(&self) -> usize {
        self.state().bind_calls
    }
}

/// [`ServiceBinder`] backed by a [`SimulatedDevice`]
#[derive(Debug, Clone)]
pub struct SimulatedBinder {
    device: SimulatedDevice,
}

impl SimulatedBinder {
    pub fn device(&self) -> &SimulatedDevice {
        &self.device
    }
}

impl ServiceBinder for SimulatedBinder {
    fn bind(&mut self, request: &BindRequest) -> Result<(), BindError> {
        let event = {
            let mut state = self.device.state();
            state.bind_calls += 1;
            if state.missing_packages.contains(&request.package) {
                return Err(BindError::ServiceNotFound);
            }
            let auto_connect = state.auto_connect;
            let service = state.handle_for(request);
            state.live.insert(
                request.connection.clone(),
                LiveService {
                    request: request.clone(),
                    connected: auto_connect,
                    pid: 0,
                },
            );
            auto_connect.then(|| ServiceEvent::Connected {
                connection: request.connection.clone(),
                service,
            })
        };
        if let Some(event) = event {
            self.device.sink.post(event);
        }
        Ok(())
    }

    fn send_setup(
        &mut self,
        connection: &ConnectionId,
        bundle: SetupBundle,
    ) -> Result<(), BindError> {
        let reply = {
            let mut state = self.device.state();
            let package = match state.live.get(connection) {
                Some(service) if service.connected => service.request.package.clone(),
                _ => return Err(BindError::NotConnected),
            };
            let foreign_pid = state
                .foreign_slots
                .get(&(package, connection.slot_index))
                .copied();
            let pid = match foreign_pid {
                Some(pid) => pid,
                None => state.allocate_pid(),
            };
            let auto_setup = state.auto_setup;
            if let Some(service) = state.live.get_mut(connection) {
                service.pid = pid;
            }
            state.setups.push((connection.clone(), bundle));
            auto_setup.then_some(pid)
        };
        if let Some(pid) = reply {
            self.device.sink.post(ServiceEvent::SetupComplete {
                connection: connection.clone(),
                pid,
            });
        }
        Ok(())
    }

    fn unbind(&mut self, connection: &ConnectionId) {
        self.device.state().live.remove(connection);
    }
}
