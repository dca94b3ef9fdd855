//! Per-session object handle table.
//!
//! Handles are small nonzero integers, the lowest free one is handed out. The
//! table has its own lock so that enumerating objects never needs the device
//! lock; changes to membership are still only made with the device lock held.

use crate::gem::object::{GemObject, ObjectInfo};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct HandleTable {
    objects: Mutex<BTreeMap<u32, GemObject>>,
}

impl HandleTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u32, GemObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `obj` under a new handle; hands the object back if the handle
    /// space is exhausted.
    pub(crate) fn insert(&self, obj: GemObject) -> Result<u32, GemObject> {
        let mut objects = self.lock();

        let mut handle = 1u32;
        for &used in objects.keys() {
            if used != handle {
                break;
            }
            handle = match handle.checked_add(1) {
                Some(h) => h,
                None => return Err(obj),
            };
        }

        objects.insert(handle, obj);
        Ok(handle)
    }

    pub(crate) fn remove(&self, handle: u32) -> Option<GemObject> {
        self.lock().remove(&handle)
    }

    /// Take every object out of the table.
    pub(crate) fn drain(&self) -> Vec<GemObject> {
        std::mem::take(&mut *self.lock()).into_values().collect()
    }

    pub(crate) fn with_object<R>(
        &self,
        handle: u32,
        f: impl FnOnce(&mut GemObject) -> R,
    ) -> Option<R> {
        self.lock().get_mut(&handle).map(f)
    }

    /// Find the object that owns CPU mapping offset `offset`.
    pub(crate) fn with_offset<R>(
        &self,
        offset: u64,
        f: impl FnOnce(&GemObject) -> R,
    ) -> Option<R> {
        self.lock()
            .values()
            .find(|obj| obj.mmap_offset() == Some(offset))
            .map(f)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of every published object, by handle.
    #[must_use]
    pub fn objects(&self) -> Vec<ObjectInfo> {
        self.lock()
            .iter()
            .map(|(&handle, obj)| obj.info(handle))
            .collect()
    }
}
