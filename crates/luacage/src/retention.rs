//! Retention table: keeps every capsule-referenced host object
//! reachable from host roots.
//!
//! Capsules hold only weak handles; each live capsule for an object
//! contributes exactly one strong reference here, keyed by the
//! object's identity. The table is the sandbox's host lock domain:
//! all mutations of the shared bookkeeping go through its mutex, and
//! the mutex is never held across a host-callable invocation.

use std::sync::{Arc, Mutex};

use ahash::AHashMap;

use crate::host::HostObject;

pub(crate) struct Retention {
    entries: Mutex<AHashMap<usize, Vec<Arc<dyn HostObject>>>>,
}

/// Identity of a host object: the address of its heap allocation.
#[inline]
pub(crate) fn object_id(obj: &Arc<dyn HostObject>) -> usize {
    Arc::as_ptr(obj) as *const () as usize
}

impl Retention {
    pub(crate) fn new() -> Self {
        Retention {
            entries: Mutex::new(AHashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AHashMap<usize, Vec<Arc<dyn HostObject>>>> {
        // a panic mid-update cannot leave the map structurally broken,
        // so a poisoned lock is still usable
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pin `obj` for one more live capsule and return its identity key.
    pub(crate) fn retain(&self, obj: &Arc<dyn HostObject>) -> usize {
        let id = object_id(obj);
        self.lock().entry(id).or_default().push(obj.clone());
        id
    }

    /// Drop one pin for `id`, removing the entry once no capsule is
    /// left. Runs from capsule finalisation, possibly during VM
    /// teardown, so every failure mode is a warning rather than an
    /// error.
    pub(crate) fn release(&self, id: usize, type_name: &str) {
        let mut entries = self.lock();
        match entries.get_mut(&id) {
            Some(refs) => {
                // it doesn't matter which reference we pop
                if refs.pop().is_none() {
                    log::warn!("dangling retention entry for {} (id {:#x})", type_name, id);
                }
                if refs.is_empty() {
                    entries.remove(&id);
                }
            }
            None => {
                log::warn!(
                    "no retention entry for {} (id {:#x}); capsule finalised twice?",
                    type_name,
                    id
                );
            }
        }
    }

    /// Number of live capsules referencing `id`.
    pub(crate) fn live(&self, id: usize) -> usize {
        self.lock().get(&id).map_or(0, |refs| refs.len())
    }

    /// Number of distinct pinned objects.
    pub(crate) fn distinct(&self) -> usize {
        self.lock().len()
    }

    /// Total number of pins, i.e. live capsules across all objects.
    pub(crate) fn total(&self) -> usize {
        self.lock().values().map(|refs| refs.len()).sum()
    }
}
