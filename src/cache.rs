//! Inode/name metadata cache.
//!
//! Maps (parent inode, normalized name) to the child's inode and
//! attributes so repeated lookups do not round-trip to the daemon. Items
//! expire; the expiration sweep detaches expired items onto a forget list
//! that a self-generated FORGET/BATCH_FORGET context later drains back to
//! the daemon. Pin counts keep items alive past expiration while an
//! operation still holds them.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::ffi::OsStringExt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::SystemTime;

use log::debug;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::ll::fuse_abi as abi;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct NameKey {
    parent: u64,
    name: OsString,
}

/// A cached name binding with the child's wire attributes.
#[derive(Debug)]
pub(crate) struct CacheItem {
    ino: u64,
    attr: abi::fuse_attr,
    generation: u64,
    cache_generation: u64,
    expires: SystemTime,
    pins: AtomicUsize,
}

impl CacheItem {
    pub(crate) fn ino(&self) -> u64 {
        self.ino
    }

    pub(crate) fn attr(&self) -> &abi::fuse_attr {
        &self.attr
    }

    /// Daemon-reported generation of the inode number.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Cache generation at insert; stale when the cache has invalidated
    /// since.
    pub(crate) fn cache_generation(&self) -> u64 {
        self.cache_generation
    }

    fn pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) != 0
    }
}

/// Inodes waiting to be forgotten, detached from the cache maps.
///
/// Dropping the list releases the items; a FORGET context owns one and
/// drains it across emission half-steps.
#[derive(Debug, Default)]
pub(crate) struct ForgetList {
    inodes: SmallVec<[u64; 8]>,
}

impl ForgetList {
    pub(crate) fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.inodes.len()
    }

    /// Pop the next inode to forget.
    pub(crate) fn next_inode(&mut self) -> Option<u64> {
        self.inodes.pop()
    }

    /// Pop up to `max` inodes into a chunk for one BATCH_FORGET message.
    pub(crate) fn next_chunk(&mut self, max: usize) -> SmallVec<[u64; 8]> {
        let keep = self.inodes.len().saturating_sub(max);
        self.inodes.drain(keep..).collect()
    }
}

struct CacheState {
    by_name: HashMap<NameKey, Arc<CacheItem>>,
    by_ino: HashMap<u64, NameKey>,
}

/// The metadata cache. All locking is internal.
pub(crate) struct Cache {
    state: Mutex<CacheState>,
    generation: AtomicU64,
    case_insensitive: bool,
    timeout: Duration,
}

impl Cache {
    pub(crate) fn new(case_insensitive: bool, timeout: Duration) -> Cache {
        Cache {
            state: Mutex::new(CacheState {
                by_name: HashMap::new(),
                by_ino: HashMap::new(),
            }),
            generation: AtomicU64::new(1),
            case_insensitive,
            timeout,
        }
    }

    fn normalize(&self, name: &OsStr) -> OsString {
        if !self.case_insensitive {
            return name.to_os_string();
        }
        match name.to_str() {
            Some(utf8) => OsString::from(utf8.to_lowercase()),
            None => OsString::from_vec(name.as_bytes().to_ascii_lowercase()),
        }
    }

    /// Current invalidation generation.
    pub(crate) fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Resolve a live, unexpired name binding.
    pub(crate) fn lookup(&self, parent: u64, name: &OsStr) -> Option<Arc<CacheItem>> {
        let key = NameKey {
            parent,
            name: self.normalize(name),
        };
        let state = self.state.lock();
        let item = state.by_name.get(&key)?;
        if item.expires <= SystemTime::now() {
            return None;
        }
        Some(Arc::clone(item))
    }

    /// Insert or replace a name binding. Replacement counts as an
    /// invalidation of the old binding.
    pub(crate) fn insert(
        &self,
        parent: u64,
        name: &OsStr,
        attr: &abi::fuse_attr,
        generation: u64,
    ) -> Arc<CacheItem> {
        let key = NameKey {
            parent,
            name: self.normalize(name),
        };
        let mut state = self.state.lock();
        if state.by_name.contains_key(&key) {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        let item = Arc::new(CacheItem {
            ino: attr.ino,
            attr: *attr,
            generation,
            cache_generation: self.generation.load(Ordering::Acquire),
            expires: SystemTime::now() + self.timeout,
            pins: AtomicUsize::new(0),
        });
        state.by_ino.insert(attr.ino, key.clone());
        state.by_name.insert(key, Arc::clone(&item));
        debug!(
            "cached parent {:#x} ino {:#x} cache gen {}",
            parent,
            item.ino(),
            item.cache_generation()
        );
        item
    }

    /// Pin an item so expiration cannot detach it.
    pub(crate) fn reference(&self, item: &CacheItem) {
        item.pins.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a pin taken with [`Cache::reference`].
    pub(crate) fn release(&self, item: &CacheItem) {
        let prev = item.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0);
    }

    /// Drop a name binding and advance the invalidation generation.
    pub(crate) fn invalidate(&self, parent: u64, name: &OsStr) {
        let key = NameKey {
            parent,
            name: self.normalize(name),
        };
        let mut state = self.state.lock();
        if let Some(item) = state.by_name.remove(&key) {
            state.by_ino.remove(&item.ino);
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Detach every expired, unpinned item onto a forget list. Detached
    /// items no longer service lookups; pinned items are retried on the
    /// next sweep.
    pub(crate) fn expiration_sweep(&self, now: SystemTime) -> ForgetList {
        let mut state = self.state.lock();
        let expired: Vec<NameKey> = state
            .by_name
            .iter()
            .filter(|(_, item)| item.expires <= now && !item.pinned())
            .map(|(key, _)| key.clone())
            .collect();
        let mut list = ForgetList::default();
        for key in expired {
            if let Some(item) = state.by_name.remove(&key) {
                state.by_ino.remove(&item.ino);
                list.inodes.push(item.ino);
            }
        }
        if !list.is_empty() {
            self.generation.fetch_add(1, Ordering::AcqRel);
            debug!(
                "expiration sweep detached {} items, generation {}",
                list.len(),
                self.current_generation()
            );
        }
        list
    }

    /// Release a drained (or abandoned) forget list.
    pub(crate) fn delete_items(&self, list: ForgetList) {
        if !list.is_empty() {
            debug!("dropping {} undrained forget entries", list.len());
        }
        drop(list);
    }

    /// Drop everything. Teardown only; no forgets are generated.
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.by_name.clear();
        state.by_ino.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().by_name.len()
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Cache")
            .field("items", &state.by_name.len())
            .field("generation", &self.generation)
            .field("case_insensitive", &self.case_insensitive)
            .field("timeout", &self.timeout)
            .finish()
    }
}
