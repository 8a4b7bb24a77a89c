//! Connection slot allocation
//!
//! Each (package, sandboxed) pair owns an independent fixed-size slot array
//! and its own pending queue. Exhausting one pool never affects another: an
//! external package running out of sandboxed slots does not stop the host
//! from starting its own workers.

use std::collections::HashMap;
use std::fmt;

use super::pending::{PendingSpawnQueue, SpawnRequest};
use super::slot::{ConnectionSlot, ConnectionSnapshot};
use crate::utils::LauncherConfig;

/// Identifies one allocator pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocatorKey {
    pub package_name: String,
    pub sandboxed: bool,
}

impl AllocatorKey {
    pub fn new(package_name: impl Into<String>, sandboxed: bool) -> Self {
        Self {
            package_name: package_name.into(),
            sandboxed,
        }
    }

    pub fn sandboxed(package_name: impl Into<String>) -> Self {
        Self::new(package_name, true)
    }

    pub fn privileged(package_name: impl Into<String>) -> Self {
        Self::new(package_name, false)
    }
}

impl fmt::Display for AllocatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.sandboxed { "sandboxed" } else { "privileged" };
        write!(f, "{}:{}", self.package_name, mode)
    }
}

/// Stable address of one binding: the pool, the slot, and which use of the slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub key: AllocatorKey,
    pub slot_index: usize,
    /// Distinguishes successive bindings that reuse the same slot index
    pub generation: u64,
}

impl ConnectionId {
    pub fn new(key: AllocatorKey, slot_index: usize, generation: u64) -> Self {
        Self {
            key,
            slot_index,
            generation,
        }
    }

    pub fn service_number(&self) -> usize {
        self.slot_index
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.key, self.slot_index, self.generation)
    }
}

/// Fixed-size slot array for one (package, sandboxed) pool
#[derive(Debug)]
pub struct ConnectionAllocator {
    key: AllocatorKey,
    host_package: String,
    service_class: String,
    slots: Vec<Option<ConnectionSlot>>,
}

impl ConnectionAllocator {
    pub fn new(
        key: AllocatorKey,
        capacity: usize,
        service_class: impl Into<String>,
        host_package: impl Into<String>,
    ) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            key,
            host_package: host_package.into(),
            service_class: service_class.into(),
            slots,
        }
    }

    pub fn key(&self) -> &AllocatorKey {
        &self.key
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Service class bound for the given slot
    pub fn service_class_name(&self, slot_index: usize) -> String {
        format!("{}{}", self.service_class, slot_index)
    }

    /// Claim the lowest free cell for `request`.
    ///
    /// The new slot starts out `Binding`. Returns `None` when every cell is
    /// taken; the caller is expected to queue the request.
    pub fn allocate(
        &mut self,
        request: &SpawnRequest,
        generation: u64,
    ) -> Option<&mut ConnectionSlot> {
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            log::debug!("{}: all {} slots in use", self.key, self.capacity());
            return None;
        };

        let id = ConnectionId::new(self.key.clone(), index, generation);
        let is_external = request.is_external_service || self.key.package_name != self.host_package;
        let slot = ConnectionSlot::claimed(
            id,
            self.service_class_name(index),
            is_external,
            request.bind_to_caller_check,
        );
        log::debug!("{}: allocated slot {}", self.key, index);

        let cell = &mut self.slots[index];
        *cell = Some(slot);
        cell.as_mut()
    }

    /// Release a cell. Freeing a free or out-of-range cell is a no-op.
    pub fn free(&mut self, slot_index: usize) -> Option<ConnectionSlot> {
        let freed = self.slots.get_mut(slot_index).and_then(Option::take);
        match &freed {
            Some(_) => log::debug!("{}: freed slot {}", self.key, slot_index),
            None => log::debug!("{}: slot {} already free", self.key, slot_index),
        }
        freed
    }

    pub fn allocated_count(&self) -> usize {
        self.slots.iter().filter(|cell| cell.is_some()).count()
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    pub fn slot(&self, slot_index: usize) -> Option<&ConnectionSlot> {
        self.slots.get(slot_index).and_then(Option::as_ref)
    }

    pub fn slot_mut(&mut self, slot_index: usize) -> Option<&mut ConnectionSlot> {
        self.slots.get_mut(slot_index).and_then(Option::as_mut)
    }

    /// The slot currently holding `id`, if that binding is still live
    pub fn find(&self, id: &ConnectionId) -> Option<&ConnectionSlot> {
        self.slot(id.slot_index).filter(|slot| slot.id() == id)
    }

    pub fn find_mut(&mut self, id: &ConnectionId) -> Option<&mut ConnectionSlot> {
        self.slot_mut(id.slot_index).filter(|slot| slot.id() == id)
    }

    /// Allocated slots in index order
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionSlot> {
        self.slots.iter().flatten()
    }

    /// Copy of the slot table; `None` marks a free cell
    pub fn connection_array(&self) -> Vec<Option<ConnectionSnapshot>> {
        self.slots
            .iter()
            .map(|cell| cell.as_ref().map(ConnectionSlot::snapshot))
            .collect()
    }
}

/// An allocator together with the requests waiting on it
#[derive(Debug)]
pub struct AllocatorPool {
    pub allocator: ConnectionAllocator,
    pub pending: PendingSpawnQueue,
}

/// Lazily created allocator pools, at most one per key
#[derive(Debug)]
pub struct AllocatorRegistry {
    config: LauncherConfig,
    capacity_overrides: HashMap<AllocatorKey, usize>,
    pools: HashMap<AllocatorKey, AllocatorPool>,
}

impl AllocatorRegistry {
    pub fn new(config: LauncherConfig) -> Self {
        Self {
            config,
            capacity_overrides: HashMap::new(),
            pools: HashMap::new(),
        }
    }

    /// Capacity a pool for `key` has, or will have once created
    pub fn capacity_for(&self, key: &AllocatorKey) -> usize {
        if let Some(pool) = self.pools.get(key) {
            return pool.allocator.capacity();
        }
        self.capacity_overrides
            .get(key)
            .copied()
            .unwrap_or_else(|| self.config.capacity_for(&key.package_name, key.sandboxed))
    }

    /// Override the capacity of a pool that does not exist yet.
    ///
    /// Returns false (and changes nothing) if the pool was already created.
    pub fn set_capacity_for_testing(&mut self, key: AllocatorKey, capacity: usize) -> bool {
        if self.pools.contains_key(&key) || capacity == 0 {
            return false;
        }
        self.capacity_overrides.insert(key, capacity);
        true
    }

    /// The pool for `key`, creating it on first use
    pub fn pool_mut(&mut self, key: &AllocatorKey) -> &mut AllocatorPool {
        let capacity = self.capacity_for(key);
        let config = &self.config;
        self.pools.entry(key.clone()).or_insert_with(|| {
            log::info!("creating allocator {} with {} slots", key, capacity);
            AllocatorPool {
                allocator: ConnectionAllocator::new(
                    key.clone(),
                    capacity,
                    config.service_class_for(key.sandboxed),
                    config.host_package.clone(),
                ),
                pending: PendingSpawnQueue::new(),
            }
        })
    }

    pub fn pool(&self, key: &AllocatorKey) -> Option<&AllocatorPool> {
        self.pools.get(key)
    }

    pub fn existing_pool_mut(&mut self, key: &AllocatorKey) -> Option<&mut AllocatorPool> {
        self.pools.get_mut(key)
    }

    pub fn allocator(&self, key: &AllocatorKey) -> Option<&ConnectionAllocator> {
        self.pools.get(key).map(|pool| &pool.allocator)
    }

    pub fn allocated_connections_count(&self, key: &AllocatorKey) -> usize {
        self.allocator(key).map_or(0, ConnectionAllocator::allocated_count)
    }

    pub fn pending_spawns_count(&self, key: &AllocatorKey) -> usize {
        self.pools
            .get(key)
            .map_or(0, |pool| pool.pending.pending_count())
    }

    /// Slot table copy; an unseen key reports an all-free array of its future capacity
    pub fn connection_array(&self, key: &AllocatorKey) -> Vec<Option<ConnectionSnapshot>> {
        match self.allocator(key) {
            Some(allocator) => allocator.connection_array(),
            None => vec![None; self.capacity_for(key)],
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &AllocatorKey> {
        self.pools.keys()
    }

    pub fn pools_mut(&mut self) -> impl Iterator<Item = &mut AllocatorPool> {
        self.pools.values_mut()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::slot::SlotState;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const HOST: &str = "org.binix.browser";

    fn allocator(capacity: usize) -> ConnectionAllocator {
        ConnectionAllocator::new(
            AllocatorKey::sandboxed(HOST),
            capacity,
            "org.binix.app.SandboxedProcessService",
            HOST,
        )
    }

    fn request() -> SpawnRequest {
        SpawnRequest::new(AllocatorKey::sandboxed(HOST))
    }

    #[test]
    fn test_allocate_lowest_index_first() {
        let mut alloc = allocator(3);
        let first = alloc.allocate(&request(), 1).unwrap();
        assert_eq!(first.service_number(), 0);
        assert_eq!(first.state(), SlotState::Binding);
        assert_eq!(
            first.service_class(),
            "org.binix.app.SandboxedProcessService0"
        );
        assert_eq!(alloc.allocate(&request(), 2).unwrap().service_number(), 1);
        assert_eq!(alloc.allocate(&request(), 3).unwrap().service_number(), 2);
        assert!(alloc.allocate(&request(), 4).is_none());
        assert!(alloc.is_full());

        alloc.free(1);
        assert_eq!(alloc.allocate(&request(), 5).unwrap().service_number(), 1);
    }

    #[test]
    fn test_free_idempotent() {
        let mut alloc = allocator(2);
        alloc.allocate(&request(), 1);
        assert!(alloc.free(0).is_some());
        assert!(alloc.free(0).is_none());
        assert!(alloc.free(99).is_none());
        assert_eq!(alloc.allocated_count(), 0);
    }

    #[test]
    fn test_find_checks_generation() {
        let mut alloc = allocator(1);
        let old = alloc.allocate(&request(), 1).unwrap().id().clone();
        alloc.free(0);
        let new = alloc.allocate(&request(), 2).unwrap().id().clone();
        assert_eq!(old.slot_index, new.slot_index);
        assert!(alloc.find(&old).is_none());
        assert!(alloc.find(&new).is_some());
    }

    #[test]
    fn test_external_package_marked() {
        let mut alloc = ConnectionAllocator::new(
            AllocatorKey::sandboxed("org.external.apk"),
            1,
            "org.external.SandboxedProcessService",
            HOST,
        );
        let slot = alloc
            .allocate(&SpawnRequest::new(AllocatorKey::sandboxed("org.external.apk")), 1)
            .unwrap();
        assert!(slot.is_external());
    }

    #[test]
    fn test_connection_array() {
        let mut alloc = allocator(3);
        alloc.allocate(&request(), 1);
        alloc.allocate(&request(), 2);
        alloc.free(0);
        let array = alloc.connection_array();
        assert_eq!(array.len(), 3);
        assert!(array[0].is_none());
        assert_eq!(array[1].as_ref().unwrap().service_number(), 1);
        assert!(array[2].is_none());
    }

    #[test]
    fn test_registry_keys_are_isolated() {
        let mut registry = AllocatorRegistry::new(LauncherConfig::default());
        let host = AllocatorKey::sandboxed(HOST);
        let external = AllocatorKey::sandboxed("org.external.apk");
        assert!(registry.set_capacity_for_testing(external.clone(), 1));

        let ext_req = SpawnRequest::new(external.clone());
        let host_req = SpawnRequest::new(host.clone());
        assert!(registry.pool_mut(&external).allocator.allocate(&ext_req, 1).is_some());
        assert!(registry.pool_mut(&external).allocator.allocate(&ext_req, 2).is_none());
        let slot = registry.pool_mut(&host).allocator.allocate(&host_req, 3).unwrap();
        assert_eq!(slot.service_number(), 0);

        assert_eq!(registry.allocated_connections_count(&external), 1);
        assert_eq!(registry.allocated_connections_count(&host), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_unseen_key() {
        let registry = AllocatorRegistry::new(LauncherConfig::default());
        let key = AllocatorKey::privileged(HOST);
        assert_eq!(registry.allocated_connections_count(&key), 0);
        assert_eq!(registry.pending_spawns_count(&key), 0);
        assert_eq!(registry.connection_array(&key).len(), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_capacity_override_after_creation_rejected() {
        let mut registry = AllocatorRegistry::new(LauncherConfig::default());
        let key = AllocatorKey::sandboxed(HOST);
        registry.pool_mut(&key);
        assert!(!registry.set_capacity_for_testing(key.clone(), 2));
        assert_eq!(registry.capacity_for(&key), 20);
    }

    proptest! {
        #[test]
        fn prop_count_never_exceeds_capacity(
            capacity in 1usize..8,
            ops in proptest::collection::vec((any::<bool>(), 0usize..10), 0..64),
        ) {
            let mut alloc = allocator(capacity);
            for (generation, (is_alloc, index)) in ops.into_iter().enumerate() {
                if is_alloc {
                    alloc.allocate(&request(), generation as u64);
                } else {
                    alloc.free(index);
                }
                prop_assert!(alloc.allocated_count() <= capacity);
            }
        }

        #[test]
        fn prop_double_free_is_single_free(
            filled in 1usize..6,
            index in 0usize..8,
        ) {
            let mut once = allocator(6);
            let mut twice = allocator(6);
            for g in 0..filled as u64 {
                once.allocate(&request(), g);
                twice.allocate(&request(), g);
            }
            once.free(index);
            twice.free(index);
            twice.free(index);
            prop_assert_eq!(once.allocated_count(), twice.allocated_count());
            prop_assert_eq!(
                once.connection_array().iter().map(Option::is_some).collect::<Vec<_>>(),
                twice.connection_array().iter().map(Option::is_some).collect::<Vec<_>>()
            );
        }

        #[test]
        fn prop_allocates_lowest_free_index(
            occupied in proptest::collection::vec(any::<bool>(), 1..8),
        ) {
            let mut alloc = allocator(occupied.len());
            for g in 0..occupied.len() as u64 {
                alloc.allocate(&request(), g);
            }
            for (index, keep) in occupied.iter().enumerate() {
                if !keep {
                    alloc.free(index);
                }
            }
            let expected = occupied.iter().position(|keep| !keep);
            let got = alloc.allocate(&request(), 100).map(|slot| slot.service_number());
            prop_assert_eq!(got, expected);
        }
    }
}
