//! Child process launching
//!
//! Workers are hosted by services of an installed package and reached through
//! a service-binding facility:
//! - `allocator`: fixed-capacity slot pools keyed by package and sandbox mode
//! - `slot`: per-connection lifecycle
//! - `launcher`: spawn, queue, setup and reclaim coordination
//! - `thread`: the single launcher thread everything runs on
//! - `simulated`: in-process binder used by the CLI and tests

mod allocator;
mod bind;
mod launcher;
mod params;
mod pending;
mod service;
mod setup;
mod simulated;
mod slot;
mod thread;

pub use allocator::{
    AllocatorKey, AllocatorPool, AllocatorRegistry, ConnectionAllocator, ConnectionId,
};
pub use bind::{BindFlags, BindRequest};
pub use launcher::{Dispatch, Launcher};
pub use params::{CreationParams, CreationParamsRegistry, DEFAULT_PARAMS_ID};
pub use pending::{LaunchCallback, LaunchedProcess, PendingSpawnQueue, SpawnRequest};
pub use service::{BindError, EventSink, ServiceBinder, ServiceEvent, ServiceHandle};
pub use setup::{FileDescriptorInfo, SetupBundle};
pub use simulated::{SimulatedBinder, SimulatedDevice};
pub use slot::{ConnectionSlot, ConnectionSnapshot, SlotState};
pub use thread::{LAUNCHER_THREAD_NAME, LauncherHandle, LauncherThread};
