//! In-process lock table implementing the five-level file lock ladder.
//!
//! Every handle opened through one `Vfs` registers here under the file's
//! canonical path. The table decides whether a transition is allowed given
//! what the other handles hold; the OS-level mirror lives in `os.rs`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use super::LockLevel;

/// Identifies one file handle in the table.
pub type HandleId = u64;

#[derive(Debug, Default)]
struct LockEntry {
    holders: HashMap<HandleId, LockLevel>,
}

impl LockEntry {
    fn others(&self, handle: HandleId) -> impl Iterator<Item = LockLevel> + '_ {
        self.holders
            .iter()
            .filter(move |(id, _)| **id != handle)
            .map(|(_, level)| *level)
    }

    fn level_of(&self, handle: HandleId) -> LockLevel {
        self.holders.get(&handle).copied().unwrap_or(LockLevel::None)
    }

    fn set(&mut self, handle: HandleId, level: LockLevel) {
        if level == LockLevel::None {
            self.holders.remove(&handle);
        } else {
            self.holders.insert(handle, level);
        }
    }
}

#[derive(Debug, Default)]
pub struct LockTable {
    entries: DashMap<PathBuf, LockEntry>,
    next_handle: AtomicU64,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> HandleId {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Try to raise `handle` to `requested`. Returns the level the handle
    /// ends up holding; it is lower than `requested` when another handle
    /// blocks the transition.
    ///
    /// A request for EXCLUSIVE that is blocked only by readers leaves the
    /// handle at PENDING so that no new reader can get in.
    pub fn lock(&self, path: &Path, handle: HandleId, requested: LockLevel) -> LockLevel {
        let mut entry = self.entries.entry(path.to_path_buf()).or_default();
        let mut current = entry.level_of(handle);
        if current >= requested {
            return current;
        }

        if current == LockLevel::None {
            if entry.others(handle).any(|l| l >= LockLevel::Pending) {
                return current;
            }
            current = LockLevel::Shared;
            entry.set(handle, current);
        }

        if requested >= LockLevel::Reserved && current < LockLevel::Reserved {
            if entry.others(handle).any(|l| l >= LockLevel::Reserved) {
                return current;
            }
            current = if requested == LockLevel::Reserved {
                LockLevel::Reserved
            } else {
                LockLevel::Pending
            };
            entry.set(handle, current);
        }

        if requested >= LockLevel::Pending && current < LockLevel::Pending {
            current = LockLevel::Pending;
            entry.set(handle, current);
        }

        if requested == LockLevel::Exclusive {
            if entry.others(handle).any(|l| l >= LockLevel::Shared) {
                return current;
            }
            current = LockLevel::Exclusive;
            entry.set(handle, current);
        }

        current
    }

    /// Lower `handle` to at most `level`.
    pub fn unlock(&self, path: &Path, handle: HandleId, level: LockLevel) {
        let now_empty = {
            let Some(mut entry) = self.entries.get_mut(path) else {
                return;
            };
            if entry.level_of(handle) > level {
                entry.set(handle, level);
            }
            entry.holders.is_empty()
        };
        if now_empty {
            self.entries.remove_if(path, |_, entry| entry.holders.is_empty());
        }
    }

    /// True when any handle on `path` holds RESERVED or higher.
    pub fn reserved(&self, path: &Path) -> bool {
        self.entries
            .get(path)
            .is_some_and(|entry| entry.holders.values().any(|l| *l >= LockLevel::Reserved))
    }

    pub fn level(&self, path: &Path, handle: HandleId) -> LockLevel {
        self.entries
            .get(path)
            .map(|entry| entry.level_of(handle))
            .unwrap_or(LockLevel::None)
    }
}
