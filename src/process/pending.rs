//! Spawn requests and the per-pool queue of requests waiting for a free slot

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use super::allocator::{AllocatorKey, ConnectionId};
use super::params::DEFAULT_PARAMS_ID;
use super::setup::{FileDescriptorInfo, SetupBundle};
use crate::utils::Result;

/// Outcome delivered to a request's callback once setup completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedProcess {
    pub connection: ConnectionId,
    pub pid: u32,
}

impl LaunchedProcess {
    pub fn service_number(&self) -> usize {
        self.connection.slot_index
    }
}

/// Completion callback for a spawn request
pub type LaunchCallback = Box<dyn FnOnce(Result<LaunchedProcess>) + Send + 'static>;

/// A request for a new worker process
pub struct SpawnRequest {
    pub key: AllocatorKey,
    pub params_id: i32,
    pub args: Vec<String>,
    pub files: Vec<FileDescriptorInfo>,
    pub child_process_id: i32,
    pub always_in_foreground: bool,
    pub is_external_service: bool,
    pub bind_to_caller_check: bool,
    callback: Option<LaunchCallback>,
    /// Slots lost to another host process so far
    pub(crate) conflict_attempts: u32,
    /// Times this request was put back after crashing before setup
    pub(crate) crash_replays: u32,
    /// Dequeued from a pending queue at least once
    pub(crate) replayed: bool,
    submitted_at: Instant,
}

impl SpawnRequest {
    /// Create a request for the given pool with default params
    pub fn new(key: AllocatorKey) -> Self {
        Self {
            key,
            params_id: DEFAULT_PARAMS_ID,
            args: Vec::new(),
            files: Vec::new(),
            child_process_id: 0,
            always_in_foreground: false,
            is_external_service: false,
            bind_to_caller_check: false,
            callback: None,
            conflict_attempts: 0,
            crash_replays: 0,
            replayed: false,
            submitted_at: Instant::now(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_files(mut self, files: Vec<FileDescriptorInfo>) -> Self {
        self.files = files;
        self
    }

    pub fn with_child_process_id(mut self, id: i32) -> Self {
        self.child_process_id = id;
        self
    }

    pub fn with_params_id(mut self, id: i32) -> Self {
        self.params_id = id;
        self
    }

    pub fn always_in_foreground(mut self, value: bool) -> Self {
        self.always_in_foreground = value;
        self
    }

    pub fn external_service(mut self, value: bool) -> Self {
        self.is_external_service = value;
        self
    }

    pub fn bind_to_caller_check(mut self, value: bool) -> Self {
        self.bind_to_caller_check = value;
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Result<LaunchedProcess>) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn set_callback(&mut self, callback: LaunchCallback) {
        self.callback = Some(callback);
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Deliver the final outcome; later calls are ignored
    pub fn complete(&mut self, outcome: Result<LaunchedProcess>) {
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
    }

    /// Build the setup bundle for the slot this request landed in
    pub fn setup_bundle(&self, service_number: usize) -> SetupBundle {
        SetupBundle {
            args: self.args.clone(),
            files: self.files.clone(),
            child_process_id: self.child_process_id,
            service_number,
            bind_to_caller_check: self.bind_to_caller_check,
        }
    }

    pub fn conflict_attempts(&self) -> u32 {
        self.conflict_attempts
    }

    pub fn age(&self) -> Duration {
        self.submitted_at.elapsed()
    }
}

impl fmt::Debug for SpawnRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnRequest")
            .field("key", &self.key)
            .field("params_id", &self.params_id)
            .field("args", &self.args)
            .field("child_process_id", &self.child_process_id)
            .field("always_in_foreground", &self.always_in_foreground)
            .field("has_callback", &self.callback.is_some())
            .field("conflict_attempts", &self.conflict_attempts)
            .field("replayed", &self.replayed)
            .finish_non_exhaustive()
    }
}

/// FIFO of requests waiting for a slot in one (package, sandboxed) pool.
///
/// There is no way to cancel a queued request: it stays until a slot frees up
/// or the launcher shuts down.
#[derive(Debug, Default)]
pub struct PendingSpawnQueue {
    queue: VecDeque<SpawnRequest>,
}

impl PendingSpawnQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail
    pub fn enqueue(&mut self, request: SpawnRequest) {
        self.queue.push_back(request);
    }

    /// Put a request back at the head, ahead of everything that arrived later
    pub fn requeue_front(&mut self, request: SpawnRequest) {
        self.queue.push_front(request);
    }

    /// Pop from the head
    pub fn dequeue(&mut self) -> Option<SpawnRequest> {
        self.queue.pop_front()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Remove everything, oldest first; used at shutdown
    pub fn drain(&mut self) -> impl Iterator<Item = SpawnRequest> + '_ {
        self.queue.drain(..)
    }
}
