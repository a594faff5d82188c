//! Global cache registry: an arena of live caches plus the reap cursor.
//!
//! Arena indices are stable cache ids; page-owner tags refer to them, so a
//! cache that fails to be destroyed must be restored under the same id.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::cache::{CacheId, ObjectCache};

pub(crate) struct CacheRegistry {
    caches: Vec<Option<Arc<ObjectCache>>>,
    /// Place maintainer for reaping: arena index the next scan starts at.
    cursor: usize,
}

impl CacheRegistry {
    pub(crate) const fn new() -> Self {
        Self {
            caches: Vec::new(),
            cursor: 0,
        }
    }

    pub(crate) fn contains_name(&self, name: &str) -> bool {
        self.caches
            .iter()
            .flatten()
            .any(|cache| cache.name == name)
    }

    /// Id the next [`Self::install`] will use.
    pub(crate) fn next_id(&self) -> CacheId {
        self.caches
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.caches.len())
    }

    pub(crate) fn install(&mut self, id: CacheId, cache: Arc<ObjectCache>) {
        if id == self.caches.len() {
            self.caches.push(Some(cache));
        } else {
            debug_assert!(self.caches[id].is_none());
            self.caches[id] = Some(cache);
        }
    }

    pub(crate) fn remove(&mut self, id: CacheId) -> Option<Arc<ObjectCache>> {
        self.caches.get_mut(id)?.take()
    }

    /// Put a cache back after a failed destroy, under its original id.
    pub(crate) fn restore(&mut self, id: CacheId, cache: Arc<ObjectCache>) {
        debug_assert!(self.caches[id].is_none());
        self.caches[id] = Some(cache);
    }

    pub(crate) fn get(&self, id: CacheId) -> Option<&Arc<ObjectCache>> {
        self.caches.get(id)?.as_ref()
    }

    pub(crate) fn all(&self) -> Vec<Arc<ObjectCache>> {
        self.caches.iter().flatten().cloned().collect()
    }

    /// Up to `max` live caches in rotation order from the cursor, with
    /// their arena indices.
    pub(crate) fn rotation(&self, max: usize) -> Vec<(CacheId, Arc<ObjectCache>)> {
        let n = self.caches.len();
        let mut out = Vec::new();
        if n == 0 {
            return out;
        }
        let start = self.cursor % n;
        for off in 0..n {
            if out.len() == max {
                break;
            }
            let idx = (start + off) % n;
            if let Some(cache) = &self.caches[idx] {
                out.push((idx, cache.clone()));
            }
        }
        out
    }

    /// Advance the cursor past the given arena index.
    pub(crate) fn rotate_past(&mut self, id: CacheId) {
        let n = self.caches.len().max(1);
        self.cursor = (id + 1) % n;
    }
}
