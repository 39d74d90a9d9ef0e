//! In-process object registry.
//!
//! Behaves like a shared-memory object store: objects fetched through a
//! connection stay pinned until that connection is dropped, and deleted
//! objects linger for a configurable number of polls before they are
//! reclaimed. Both behaviours are what the publisher's delete-and-poll
//! reconciliation has to cope with against a real store.

use crate::domain::error::TidemarkError;
use crate::domain::object_id::ObjectId;
use crate::ports::registry_port::{ObjectInfo, ObjectRegistry, RegistryConnection};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct StoredObject {
    data: Vec<u8>,
    pins: usize,
    /// Polls left before a deleted, unpinned object disappears.
    pending_delete: Option<u32>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ObjectId, StoredObject>,
}

impl State {
    fn used(&self) -> u64 {
        self.objects.values().map(|o| o.data.len() as u64).sum()
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    arrived: Condvar,
    capacity: u64,
    deletion_lag: u32,
    stuck_deletes: bool,
    available: AtomicBool,
    connects: AtomicUsize,
    puts: AtomicUsize,
}

impl Shared {
    /// One reclamation step, run on every poll-style call.
    fn reclaim(&self, state: &mut State) {
        if self.stuck_deletes {
            return;
        }
        state.objects.retain(|_, obj| {
            if obj.pins > 0 {
                return true;
            }
            match obj.pending_delete {
                Some(0) => false,
                Some(left) => {
                    obj.pending_delete = Some(left - 1);
                    true
                }
                None => true,
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct MemoryRegistry {
    shared: Arc<Shared>,
}

impl MemoryRegistry {
    pub fn new(capacity: u64) -> Self {
        Self::build(capacity, 0, false)
    }

    /// Deleted objects stay visible for `polls` further calls.
    pub fn with_deletion_lag(capacity: u64, polls: u32) -> Self {
        Self::build(capacity, polls, false)
    }

    /// Deletes are accepted but never reclaimed.
    pub fn with_stuck_deletes(capacity: u64) -> Self {
        Self::build(capacity, 0, true)
    }

    fn build(capacity: u64, deletion_lag: u32, stuck_deletes: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                arrived: Condvar::new(),
                capacity,
                deletion_lag,
                stuck_deletes,
                available: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
                puts: AtomicUsize::new(0),
            }),
        }
    }

    /// Simulates the store going away; `connect` fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn put_count(&self) -> usize {
        self.shared.puts.load(Ordering::SeqCst)
    }

    pub fn used_bytes(&self) -> u64 {
        self.shared.state.lock().used()
    }
}

impl ObjectRegistry for MemoryRegistry {
    fn endpoint(&self) -> String {
        "memory".to_string()
    }

    fn connect(&self) -> Result<Box<dyn RegistryConnection>, TidemarkError> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(TidemarkError::registry("memory registry is offline"));
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            pinned: BTreeSet::new(),
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    pinned: BTreeSet<ObjectId>,
}

impl MemoryConnection {
    fn check_online(&self) -> Result<(), TidemarkError> {
        if self.shared.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TidemarkError::registry("memory registry is offline"))
        }
    }
}

impl RegistryConnection for MemoryConnection {
    fn get(&mut self, id: &ObjectId, timeout: Duration) -> Result<Option<Vec<u8>>, TidemarkError> {
        self.check_online()?;
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.shared.state.lock();
        self.shared.reclaim(&mut state);
        loop {
            if let Some(obj) = state.objects.get_mut(id) {
                if obj.pending_delete.is_none() {
                    if self.pinned.insert(*id) {
                        obj.pins += 1;
                    }
                    return Ok(Some(obj.data.clone()));
                }
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || self
                            .shared
                            .arrived
                            .wait_until(&mut state, deadline)
                            .timed_out()
                    {
                        return Ok(None);
                    }
                }
                None => self.shared.arrived.wait(&mut state),
            }
        }
    }

    fn contains(&mut self, id: &ObjectId) -> Result<bool, TidemarkError> {
        self.check_online()?;
        let mut state = self.shared.state.lock();
        self.shared.reclaim(&mut state);
        Ok(state.objects.contains_key(id))
    }

    fn put(&mut self, value: &[u8], id: &ObjectId) -> Result<ObjectId, TidemarkError> {
        self.check_online()?;
        let mut state = self.shared.state.lock();
        if state.objects.contains_key(id) {
            return Err(TidemarkError::ObjectExists {
                object_id: id.to_hex(),
            });
        }

        let needed = value.len() as u64;
        let used = state.used();
        let available = self.shared.capacity.saturating_sub(used);
        if needed > available {
            return Err(TidemarkError::RegistryFull {
                needed,
                available,
                capacity: self.shared.capacity,
            });
        }

        state.objects.insert(
            *id,
            StoredObject {
                data: value.to_vec(),
                pins: 0,
                pending_delete: None,
            },
        );
        self.shared.puts.fetch_add(1, Ordering::SeqCst);
        self.shared.arrived.notify_all();
        Ok(*id)
    }

    fn delete(&mut self, ids: &[ObjectId]) -> Result<(), TidemarkError> {
        self.check_online()?;
        let mut state = self.shared.state.lock();
        for id in ids {
            if let Some(obj) = state.objects.get_mut(id) {
                if obj.pending_delete.is_none() {
                    obj.pending_delete = Some(self.shared.deletion_lag);
                }
            }
        }
        Ok(())
    }

    fn list(&mut self) -> Result<BTreeMap<ObjectId, ObjectInfo>, TidemarkError> {
        self.check_online()?;
        let mut state = self.shared.state.lock();
        self.shared.reclaim(&mut state);
        Ok(state
            .objects
            .iter()
            .map(|(id, obj)| {
                (
                    *id,
                    ObjectInfo {
                        data_size: obj.data.len() as u64,
                    },
                )
            })
            .collect())
    }

    fn capacity(&mut self) -> Result<u64, TidemarkError> {
        self.check_online()?;
        Ok(self.shared.capacity)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        for id in &self.pinned {
            if let Some(obj) = state.objects.get_mut(id) {
                obj.pins = obj.pins.saturating_sub(1);
            }
        }
    }
}
