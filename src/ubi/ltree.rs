//! The LEB lock tree: one reader/writer lock per `(vol_id, lnum)` that is currently in use.
//!
//! Entries are created on first use and dropped once the last user lets go, so the map stays as
//! small as the number of LEBs being worked on.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};

type LebKey = (u32, u32);

struct LtreeEntry {
    /// Threads holding or waiting for `lock`
    users: usize,
    lock: Arc<RwLock<()>>,
}

#[derive(Default)]
pub(crate) struct LockTree {
    entries: Mutex<HashMap<LebKey, LtreeEntry>>,
}

/// The guard itself is only ever dropped
enum Held {
    Read {
        _guard: ArcRwLockReadGuard<RawRwLock, ()>,
    },
    Write {
        _guard: ArcRwLockWriteGuard<RawRwLock, ()>,
    },
}

/// A held LEB lock; released (and the tree entry cleaned up) on drop
pub(crate) struct LebGuard<'a> {
    tree: &'a LockTree,
    key: LebKey,
    held: Option<Held>,
}

impl LockTree {
    /// Find or create the entry for `key`, registering one more user
    fn get(&self, key: LebKey) -> Arc<RwLock<()>> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key).or_insert_with(|| LtreeEntry {
            users: 0,
            lock: Arc::new(RwLock::new(())),
        });
        entry.users += 1;
        entry.lock.clone()
    }

    /// Unregister a user, removing the entry if it was the last one
    fn put(&self, key: LebKey) {
        let mut entries = self.entries.lock();
        if let Entry::Occupied(mut entry) = entries.entry(key) {
            entry.get_mut().users -= 1;
            if entry.get().users == 0 {
                entry.remove();
            }
        }
    }

    pub fn read(&self, vol_id: u32, lnum: u32) -> LebGuard<'_> {
        let key = (vol_id, lnum);
        let lock = self.get(key);
        LebGuard {
            tree: self,
            key,
            held: Some(Held::Read {
                _guard: lock.read_arc(),
            }),
        }
    }

    pub fn write(&self, vol_id: u32, lnum: u32) -> LebGuard<'_> {
        let key = (vol_id, lnum);
        let lock = self.get(key);
        LebGuard {
            tree: self,
            key,
            held: Some(Held::Write {
                _guard: lock.write_arc(),
            }),
        }
    }

    /// Take the write lock only if nobody holds the LEB right now
    pub fn try_write(&self, vol_id: u32, lnum: u32) -> Option<LebGuard<'_>> {
        let key = (vol_id, lnum);
        let lock = self.get(key);
        match lock.try_write_arc() {
            Some(guard) => Some(LebGuard {
                tree: self,
                key,
                held: Some(Held::Write { _guard: guard }),
            }),
            None => {
                self.put(key);
                None
            }
        }
    }

    /// Is anyone besides the caller holding or waiting for this LEB?
    pub fn contended(&self, vol_id: u32, lnum: u32) -> bool {
        self.entries
            .lock()
            .get(&(vol_id, lnum))
            .is_some_and(|entry| entry.users > 1)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl LebGuard<'_> {
    #[cfg(test)]
    fn is_write(&self) -> bool {
        matches!(self.held, Some(Held::Write { .. }))
    }
}

impl Drop for LebGuard<'_> {
    fn drop(&mut self) {
        // Unlock before unregistering, so the entry never disappears while locked
        self.held.take();
        self.tree.put(self.key);
    }
}
