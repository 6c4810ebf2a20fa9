//! Open-handle table. One opaque id space for everything the driver hands
//! out; what a handle points at is an explicit tag, never a numeric range.

use crate::fetch::RemoteFile;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::fs::File;

/// What an open handle refers to.
pub enum HandleKind {
    /// A real file descriptor on the backing tree. The mutex serializes the
    /// seek+read (or seek+write) sequence per handle.
    Native { file: tokio::sync::Mutex<File> },
    /// A lazily-opened remote stream. Reads are positioned, but still
    /// serialized per handle because the transport connection work happens
    /// inside the critical section.
    Remote {
        file: RemoteFile,
        lock: tokio::sync::Mutex<()>,
        commit_time: SystemTime,
    },
    /// Directory marker from `opendir`; carries no stream.
    Directory,
}

pub struct Handle {
    pub kind: HandleKind,
}

/// Shared table of outstanding handles. Mutation is strictly serialized;
/// reads clone the `Arc` out and proceed without the table lock.
pub struct HandleTable {
    next: AtomicU64,
    map: Mutex<HashMap<u64, Arc<Handle>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            // 0 stays reserved: FUSE treats fh=0 as "no handle".
            next: AtomicU64::new(1),
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, kind: HandleKind) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::SeqCst);
        self.map
            .lock()
            .unwrap()
            .insert(fh, Arc::new(Handle { kind }));
        fh
    }

    pub fn get(&self, fh: u64) -> Option<Arc<Handle>> {
        self.map.lock().unwrap().get(&fh).cloned()
    }

    /// Remove a handle. Removing an id that is already gone is a no-op, so
    /// double-release stays harmless.
    pub fn remove(&self, fh: u64) -> Option<Arc<Handle>> {
        self.map.lock().unwrap().remove(&fh)
    }

    /// Take every outstanding handle (unmount path).
    pub fn drain(&self) -> Vec<Arc<Handle>> {
        self.map.lock().unwrap().drain().map(|(_, h)| h).collect()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_release_is_idempotent() {
        let table = HandleTable::new();
        let a = table.insert(HandleKind::Directory);
        let b = table.insert(HandleKind::Directory);
        assert_ne!(a, b);
        assert!(a > 0 && b > 0);
        assert_eq!(table.len(), 2);
        assert!(table.remove(a).is_some());
        assert!(table.remove(a).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.get(b).is_some());
        assert!(table.get(a).is_none());
    }
}
