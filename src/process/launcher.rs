//! Child process launcher
//!
//! Coordinates the whole lifecycle of worker connections: allocating a slot
//! for each spawn request (or queueing it when the pool is full), binding the
//! worker, delivering the setup bundle, recording the reported pid, and
//! reclaiming slots when workers die so queued requests make progress.
//!
//! The launcher is a plain single-threaded state machine. It is driven either
//! directly (tests, embedders with their own loop) or from the dedicated
//! launcher thread in [`super::thread`].

use std::collections::{HashMap, VecDeque};

use super::allocator::{AllocatorKey, AllocatorRegistry, ConnectionId};
use super::bind::BindFlags;
use super::params::{CreationParams, CreationParamsRegistry, DEFAULT_PARAMS_ID};
use super::pending::{LaunchCallback, LaunchedProcess, SpawnRequest};
use super::service::{ServiceBinder, ServiceEvent, ServiceHandle};
use super::setup::{FileDescriptorInfo, SetupBundle};
use super::slot::{ConnectionSlot, ConnectionSnapshot};
use crate::utils::{LauncherConfig, LauncherError, Result};

/// What happened to a request immediately after submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// A slot was claimed and the bind request issued
    Allocated(ConnectionId),
    /// The pool was full; the request waits in its pending queue
    Queued { pending: usize },
}

impl Dispatch {
    pub fn connection(&self) -> Option<&ConnectionId> {
        match self {
            Dispatch::Allocated(id) => Some(id),
            Dispatch::Queued { .. } => None,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Dispatch::Queued { .. })
    }
}

/// Why a connection left the slot table
#[derive(Debug, Clone, PartialEq, Eq)]
enum Termination {
    Crashed,
    Stopped,
    SetupFailed(String),
    BindFailed,
}

/// Coordinator for worker connections
pub struct Launcher<B: ServiceBinder> {
    config: LauncherConfig,
    registry: AllocatorRegistry,
    params: CreationParamsRegistry,
    binder: B,
    next_generation: u64,
    /// Pre-bound connection waiting for the next default-params launch
    spare: Option<ConnectionId>,
    by_pid: HashMap<u32, ConnectionId>,
    terminated: VecDeque<ConnectionSnapshot>,
}

impl<B: ServiceBinder> Launcher<B> {
    /// Create a launcher over the given binding facility
    pub fn new(config: LauncherConfig, binder: B) -> Self {
        Self {
            registry: AllocatorRegistry::new(config.clone()),
            params: CreationParamsRegistry::new(config.host_package.clone()),
            config,
            binder,
            next_generation: 1,
            spare: None,
            by_pid: HashMap::new(),
            terminated: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    pub fn binder(&self) -> &B {
        &self.binder
    }

    pub fn registry(&self) -> &AllocatorRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut AllocatorRegistry {
        &mut self.registry
    }

    pub fn params(&self) -> &CreationParamsRegistry {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut CreationParamsRegistry {
        &mut self.params
    }

    fn next_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn slot_mut(&mut self, id: &ConnectionId) -> Option<&mut ConnectionSlot> {
        self.registry
            .existing_pool_mut(&id.key)?
            .allocator
            .find_mut(id)
    }

    fn slot(&self, id: &ConnectionId) -> Option<&ConnectionSlot> {
        self.registry.allocator(&id.key)?.find(id)
    }

    /// Start a worker using registered creation params
    pub fn start(
        &mut self,
        params_id: i32,
        sandboxed: bool,
        args: Vec<String>,
        files: Vec<FileDescriptorInfo>,
        child_process_id: i32,
        callback: Option<LaunchCallback>,
    ) -> Result<Dispatch> {
        let Some(params) = self.params.get(params_id) else {
            let err = LauncherError::UnknownCreationParams(params_id);
            if let Some(callback) = callback {
                callback(Err(err.clone()));
            }
            return Err(err);
        };

        let mut request = request_for_params(&params, sandboxed)
            .with_params_id(params_id)
            .with_args(args)
            .with_files(files)
            .with_child_process_id(child_process_id);
        if let Some(callback) = callback {
            request.set_callback(callback);
        }
        self.launch(request)
    }

    /// Allocate, bind and (once connected) set up a worker for `request`.
    ///
    /// A full pool queues the request. A bind failure frees the slot and is
    /// reported both here and to the request's callback; it is not retried.
    pub fn launch(&mut self, request: SpawnRequest) -> Result<Dispatch> {
        let key = request.key.clone();
        let dispatch = self.launch_one(request);
        if dispatch.is_err() {
            self.drain_pending(&key);
        }
        dispatch
    }

    /// `launch` without draining the queue after a bind failure
    fn launch_one(&mut self, mut request: SpawnRequest) -> Result<Dispatch> {
        if let Some(id) = self.take_spare_for(&request) {
            return Ok(self.attach_to_spare(id, request));
        }

        let generation = self.next_generation();
        let key = request.key.clone();
        let pool = self.registry.pool_mut(&key);
        let Some(slot) = pool.allocator.allocate(&request, generation) else {
            pool.pending.enqueue(request);
            let pending = pool.pending.pending_count();
            log::info!("{}: no free slot, spawn queued ({} pending)", key, pending);
            return Ok(Dispatch::Queued { pending });
        };

        let id = slot.id().clone();
        let flags = BindFlags::for_request(request.always_in_foreground, slot.is_external());
        match slot.bind(&mut self.binder, flags) {
            Ok(()) => {
                log::info!("{}: binding {}", id, slot.service_class());
                slot.attach_request(request);
                Ok(Dispatch::Allocated(id))
            }
            Err(err) => {
                request.complete(Err(err.clone()));
                self.release(&id, Termination::BindFailed);
                Err(err)
            }
        }
    }

    fn take_spare_for(&mut self, request: &SpawnRequest) -> Option<ConnectionId> {
        if request.params_id != DEFAULT_PARAMS_ID {
            return None;
        }
        let id = self.spare.as_ref().filter(|id| id.key == request.key)?.clone();
        let usable = self
            .slot(&id)
            .is_some_and(|slot| !slot.state().is_terminated() && !slot.has_request());
        if !usable {
            return None;
        }
        self.spare = None;
        Some(id)
    }

    fn attach_to_spare(&mut self, id: ConnectionId, request: SpawnRequest) -> Dispatch {
        log::info!("{}: using warmed-up connection", id);
        let connected = match self.slot_mut(&id) {
            Some(slot) => {
                slot.attach_request(request);
                slot.is_connected()
            }
            None => false,
        };
        if connected {
            self.send_setup(&id);
        }
        Dispatch::Allocated(id)
    }

    /// Claim a slot without binding it; `None` when the pool is full
    pub fn allocate_connection(&mut self, request: SpawnRequest) -> Option<ConnectionId> {
        let generation = self.next_generation();
        let key = request.key.clone();
        let slot = self
            .registry
            .pool_mut(&key)
            .allocator
            .allocate(&request, generation)?;
        let id = slot.id().clone();
        slot.attach_request(request);
        Some(id)
    }

    /// Claim and bind a slot without scheduling setup.
    ///
    /// Setup is started later with [`Launcher::trigger_setup`]. Returns
    /// `Ok(None)` when the pool is full; nothing is queued.
    pub fn allocate_bound_connection(
        &mut self,
        request: SpawnRequest,
    ) -> Result<Option<ConnectionId>> {
        let generation = self.next_generation();
        let key = request.key.clone();
        let Some(slot) = self
            .registry
            .pool_mut(&key)
            .allocator
            .allocate(&request, generation)
        else {
            return Ok(None);
        };

        let id = slot.id().clone();
        let flags = BindFlags::for_request(request.always_in_foreground, slot.is_external());
        match slot.bind(&mut self.binder, flags) {
            Ok(()) => Ok(Some(id)),
            Err(err) => {
                self.reclaim(&id, Termination::BindFailed);
                Err(err)
            }
        }
    }

    /// Hand a setup bundle to an allocated connection.
    ///
    /// Sent immediately when the worker is connected, otherwise as soon as it
    /// connects.
    pub fn trigger_setup(
        &mut self,
        id: &ConnectionId,
        bundle: SetupBundle,
        callback: Option<LaunchCallback>,
    ) -> Result<()> {
        let slot = match self.slot_mut(id) {
            Some(slot) if slot.has_request() || slot.setup_sent() || slot.process_id() != 0 => {
                Err(LauncherError::InvalidTransition {
                    from: slot.state().as_str(),
                    to: "setup",
                })
            }
            Some(slot) => Ok(slot),
            None => Err(LauncherError::UnknownConnection(id.to_string())),
        };
        let slot = match slot {
            Ok(slot) => slot,
            Err(err) => {
                log::warn!("{}: cannot trigger setup: {}", id, err);
                if let Some(callback) = callback {
                    callback(Err(err.clone()));
                }
                return Err(err);
            }
        };

        let mut request = SpawnRequest::new(id.key.clone())
            .with_args(bundle.args)
            .with_files(bundle.files)
            .with_child_process_id(bundle.child_process_id)
            .bind_to_caller_check(slot.bind_to_caller_enforced())
            .external_service(slot.is_external());
        if let Some(callback) = callback {
            request.set_callback(callback);
        }
        slot.attach_request(request);
        let connected = slot.is_connected();
        if connected {
            self.send_setup(id);
        }
        Ok(())
    }

    /// Pre-bind one default-params sandboxed connection for the next launch
    pub fn warm_up(&mut self) -> Result<Option<ConnectionId>> {
        if let Some(spare) = &self.spare {
            return Ok(Some(spare.clone()));
        }
        let params = self
            .params
            .get(DEFAULT_PARAMS_ID)
            .unwrap_or_else(|| CreationParams::new(self.config.host_package.clone()));
        let request = request_for_params(&params, true);
        let spare = self.allocate_bound_connection(request)?;
        if let Some(id) = &spare {
            log::info!("{}: warmed up", id);
        }
        self.spare = spare.clone();
        Ok(spare)
    }

    pub fn spare_connection(&self) -> Option<&ConnectionId> {
        self.spare.as_ref()
    }

    /// Stop the worker that reported `pid`; false if no live worker has it
    pub fn stop(&mut self, pid: u32) -> bool {
        let Some(id) = self.by_pid.get(&pid).cloned() else {
            log::debug!("stop: no connection for pid {}", pid);
            return false;
        };
        log::info!("stopping pid {} on {}", pid, id);
        self.reclaim(&id, Termination::Stopped);
        true
    }

    /// Stop a connection that may not have reported a pid yet
    pub fn stop_connection(&mut self, id: &ConnectionId) -> bool {
        if self.slot(id).is_none() {
            return false;
        }
        self.reclaim(id, Termination::Stopped);
        true
    }

    /// Apply one asynchronous notification from the binder
    pub fn handle_event(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::Connected {
                connection,
                service,
            } => self.on_service_connected(&connection, service),
            ServiceEvent::Disconnected { connection } => self.on_service_disconnected(&connection),
            ServiceEvent::SetupComplete { connection, pid } => {
                self.on_setup_complete(&connection, pid)
            }
        }
    }

    pub fn on_service_connected(&mut self, id: &ConnectionId, service: ServiceHandle) {
        let max_retries = self.config.max_conflict_retries;
        let Some(slot) = self.slot_mut(id) else {
            log::debug!("{}: ignoring connect for stale connection", id);
            return;
        };
        if let Err(err) = slot.on_connected(service) {
            log::warn!("{}: unexpected connect: {}", id, err);
            return;
        }
        log::debug!("{}: connected", id);

        if slot.is_bound_to_caller() {
            self.send_setup(id);
            return;
        }

        // Another host process owns this slot. Keep it occupied so the retry
        // lands on a different index.
        log::warn!("{}: worker is bound to another process", id);
        slot.mark_conflicted();
        let request = slot.take_request();
        if self.spare.as_ref() == Some(id) {
            self.spare = None;
        }
        let Some(mut request) = request else {
            return;
        };

        request.conflict_attempts += 1;
        if request.conflict_attempts > max_retries {
            log::warn!(
                "{}: giving up after {} slot conflicts",
                id,
                request.conflict_attempts
            );
            let attempts = request.conflict_attempts;
            request.complete(Err(LauncherError::CrossProcessSlotConflict {
                package: id.key.package_name.clone(),
                slot_index: id.slot_index,
                attempts,
            }));
            return;
        }
        // Bind failures are already reported through the callback.
        let _ = self.launch(request);
    }

    pub fn on_service_disconnected(&mut self, id: &ConnectionId) {
        if self.slot(id).is_none() {
            log::debug!("{}: ignoring disconnect for stale connection", id);
            return;
        }
        log::info!("{}: worker disconnected", id);
        self.reclaim(id, Termination::Crashed);
    }

    pub fn on_setup_complete(&mut self, id: &ConnectionId, pid: u32) {
        let Some(slot) = self.slot_mut(id) else {
            log::debug!("{}: ignoring setup reply for stale connection", id);
            return;
        };
        if let Err(err) = slot.on_setup_complete(pid) {
            log::warn!("{}: unexpected setup reply: {}", id, err);
            return;
        }
        let request = slot.take_request();
        log::info!("{}: setup complete, pid {}", id, pid);
        self.by_pid.insert(pid, id.clone());
        if let Some(mut request) = request {
            request.complete(Ok(LaunchedProcess {
                connection: id.clone(),
                pid,
            }));
        }
    }

    fn send_setup(&mut self, id: &ConnectionId) {
        let Some(slot) = self.registry.existing_pool_mut(&id.key) else {
            return;
        };
        let Some(slot) = slot.allocator.find_mut(id) else {
            return;
        };
        if !slot.is_connected() || slot.setup_sent() {
            return;
        }
        let Some(request) = slot.request() else {
            return;
        };

        let bundle = request.setup_bundle(slot.service_number());
        match self.binder.send_setup(id, bundle) {
            Ok(()) => {
                log::debug!("{}: setup sent", id);
                slot.mark_setup_sent();
            }
            Err(err) => {
                log::warn!("{}: failed to send setup: {}", id, err);
                self.reclaim(id, Termination::SetupFailed(err.to_string()));
            }
        }
    }

    /// Terminate, free and report a connection, then refill the freed slot
    fn reclaim(&mut self, id: &ConnectionId, cause: Termination) {
        self.release(id, cause);
        self.drain_pending(&id.key);
    }

    /// Terminate, free and report a connection
    fn release(&mut self, id: &ConnectionId, cause: Termination) {
        let max_replays = self.config.max_crash_replays;
        let Some(pool) = self.registry.existing_pool_mut(&id.key) else {
            return;
        };
        let Some(slot) = pool.allocator.find_mut(id) else {
            return;
        };
        match cause {
            Termination::Crashed => slot.on_crashed(),
            _ => slot.on_disconnected(),
        }
        let Some(mut slot) = pool.allocator.free(id.slot_index) else {
            return;
        };

        let snapshot = slot.snapshot();
        let request = slot.take_request();
        drop(slot);

        if cause != Termination::BindFailed {
            self.binder.unbind(id);
        }
        let pid = snapshot.process_id;
        if pid != 0 && self.by_pid.get(&pid) == Some(id) {
            self.by_pid.remove(&pid);
        }
        if self.spare.as_ref() == Some(id) {
            self.spare = None;
        }
        self.remember(snapshot);

        // A request still attached never got its setup reply.
        if let Some(mut request) = request {
            match cause {
                Termination::Crashed if request.replayed && request.crash_replays < max_replays => {
                    request.crash_replays += 1;
                    log::info!("{}: re-queueing pending spawn after crash", id);
                    if let Some(pool) = self.registry.existing_pool_mut(&id.key) {
                        pool.pending.requeue_front(request);
                    }
                }
                Termination::Crashed => {
                    request.complete(Err(LauncherError::Crashed {
                        connection: id.to_string(),
                        pid,
                    }));
                }
                Termination::Stopped => {
                    request.complete(Err(LauncherError::Stopped {
                        connection: id.to_string(),
                        pid,
                    }));
                }
                Termination::SetupFailed(reason) => {
                    request.complete(Err(LauncherError::SetupFailed {
                        connection: id.to_string(),
                        reason,
                    }));
                }
                Termination::BindFailed => {}
            }
        }
    }

    fn remember(&mut self, snapshot: ConnectionSnapshot) {
        if self.config.terminated_history == 0 {
            return;
        }
        while self.terminated.len() >= self.config.terminated_history {
            self.terminated.pop_front();
        }
        self.terminated.push_back(snapshot);
    }

    /// Replay queued requests for `key`, oldest first, while it has free slots.
    ///
    /// A replay whose bind fails frees its slot again, so the loop moves on to
    /// the next request.
    fn drain_pending(&mut self, key: &AllocatorKey) {
        loop {
            let Some(pool) = self.registry.existing_pool_mut(key) else {
                return;
            };
            if pool.allocator.is_full() {
                return;
            }
            let Some(mut request) = pool.pending.dequeue() else {
                return;
            };
            request.replayed = true;
            log::info!(
                "{}: replaying pending spawn after {:?} ({} still queued)",
                key,
                request.age(),
                pool.pending.pending_count()
            );
            if let Err(err) = self.launch_one(request) {
                log::warn!("{}: pending spawn failed: {}", key, err);
            }
        }
    }

    /// Unbind everything and fail every request still waiting
    pub fn shutdown(&mut self) {
        let mut live = Vec::new();
        let mut orphaned = Vec::new();
        for pool in self.registry.pools_mut() {
            orphaned.extend(pool.pending.drain());
            let indices: Vec<usize> = pool
                .allocator
                .iter()
                .map(ConnectionSlot::service_number)
                .collect();
            for index in indices {
                if let Some(mut slot) = pool.allocator.free(index) {
                    slot.on_disconnected();
                    live.push(slot.id().clone());
                    orphaned.extend(slot.take_request());
                }
            }
        }

        log::info!(
            "launcher shutting down: {} connections, {} waiting requests",
            live.len(),
            orphaned.len()
        );
        for id in &live {
            self.binder.unbind(id);
        }
        for mut request in orphaned {
            request.complete(Err(LauncherError::LauncherShutDown));
        }
        self.by_pid.clear();
        self.spare = None;
    }

    pub fn allocated_connections_count(&self, key: &AllocatorKey) -> usize {
        self.registry.allocated_connections_count(key)
    }

    pub fn pending_spawns_count(&self, key: &AllocatorKey) -> usize {
        self.registry.pending_spawns_count(key)
    }

    pub fn connection_array(&self, key: &AllocatorKey) -> Vec<Option<ConnectionSnapshot>> {
        self.registry.connection_array(key)
    }

    /// Connections whose worker completed setup and is still alive
    pub fn connected_services_count(&self) -> usize {
        self.by_pid.len()
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<ConnectionSnapshot> {
        self.slot(id).map(ConnectionSlot::snapshot)
    }

    /// Most recent terminations, oldest first
    pub fn terminated_connections(&self) -> impl Iterator<Item = &ConnectionSnapshot> {
        self.terminated.iter()
    }

    /// Pid reported by a connection, live or terminated; 0 if it never reported one
    pub fn last_known_pid(&self, id: &ConnectionId) -> Option<u32> {
        if let Some(slot) = self.slot(id) {
            return Some(slot.process_id());
        }
        self.terminated
            .iter()
            .rev()
            .find(|snapshot| &snapshot.connection == id)
            .map(|snapshot| snapshot.process_id)
    }

    pub fn connection_for_pid(&self, pid: u32) -> Option<&ConnectionId> {
        self.by_pid.get(&pid)
    }
}

fn request_for_params(params: &CreationParams, sandboxed: bool) -> SpawnRequest {
    SpawnRequest::new(AllocatorKey::new(params.package_name.clone(), sandboxed))
        .external_service(params.is_external_service)
        .bind_to_caller_check(params.bind_to_caller_check)
}
