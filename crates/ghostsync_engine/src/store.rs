//! Ghost storage.

use crate::error::SyncResult;
use ghostsync_protocol::Ghost;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Storage for ghosts and the bucket's change version.
///
/// Implementations must give read-your-writes consistency per key. No
/// atomicity across keys is required.
pub trait GhostStore: Send + Sync {
    /// Returns the ghost for `id`, or [`Ghost::empty`] when there is none.
    fn get(&self, id: &str) -> SyncResult<Ghost>;

    /// Stores `data` as version `version` of `id` and returns the new ghost.
    fn put(&self, id: &str, version: u64, data: Value) -> SyncResult<Ghost>;

    /// Deletes the ghost for `id`.
    fn remove(&self, id: &str) -> SyncResult<()>;

    /// Calls `f` with every stored ghost.
    fn for_each_ghost(&self, f: &mut dyn FnMut(&Ghost)) -> SyncResult<()>;

    /// Returns the last recorded change version.
    fn change_version(&self) -> SyncResult<Option<String>>;

    /// Records the change version the bucket is synced to.
    fn set_change_version(&self, cv: &str) -> SyncResult<()>;

    /// Forgets the recorded change version.
    fn clear_change_version(&self) -> SyncResult<()>;
}

impl<S: GhostStore + ?Sized> GhostStore for Arc<S> {
    fn get(&self, id: &str) -> SyncResult<Ghost> {
        (**self).get(id)
    }

    fn put(&self, id: &str, version: u64, data: Value) -> SyncResult<Ghost> {
        (**self).put(id, version, data)
    }

    fn remove(&self, id: &str) -> SyncResult<()> {
        (**self).remove(id)
    }

    fn for_each_ghost(&self, f: &mut dyn FnMut(&Ghost)) -> SyncResult<()> {
        (**self).for_each_ghost(f)
    }

    fn change_version(&self) -> SyncResult<Option<String>> {
        (**self).change_version()
    }

    fn set_change_version(&self, cv: &str) -> SyncResult<()> {
        (**self).set_change_version(cv)
    }

    fn clear_change_version(&self) -> SyncResult<()> {
        (**self).clear_change_version()
    }
}

/// In-memory ghost store (for testing).
#[derive(Debug, Default)]
pub struct MemoryGhostStore {
    ghosts: RwLock<BTreeMap<String, Ghost>>,
    change_version: RwLock<Option<String>>,
}

impl MemoryGhostStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored ghosts.
    pub fn len(&self) -> usize {
        self.ghosts.read().len()
    }

    /// Returns true if no ghost is stored.
    pub fn is_empty(&self) -> bool {
        self.ghosts.read().is_empty()
    }

    /// Returns true if a ghost is stored for `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.ghosts.read().contains_key(id)
    }
}

impl GhostStore for MemoryGhostStore {
    fn get(&self, id: &str) -> SyncResult<Ghost> {
        Ok(self
            .ghosts
            .read()
            .get(id)
            .cloned()
            .unwrap_or_else(|| Ghost::empty(id)))
    }

    fn put(&self, id: &str, version: u64, data: Value) -> SyncResult<Ghost> {
        let ghost = Ghost::new(id, version, data);
        self.ghosts.write().insert(id.to_string(), ghost.clone());
        Ok(ghost)
    }

    fn remove(&self, id: &str) -> SyncResult<()> {
        self.ghosts.write().remove(id);
        Ok(())
    }

    fn for_each_ghost(&self, f: &mut dyn FnMut(&Ghost)) -> SyncResult<()> {
        // Snapshot so `f` may call back into the store.
        let ghosts: Vec<Ghost> = self.ghosts.read().values().cloned().collect();
        ghosts.iter().for_each(|ghost| f(ghost));
        Ok(())
    }

    fn change_version(&self) -> SyncResult<Option<String>> {
        Ok(self.change_version.read().clone())
    }

    fn set_change_version(&self, cv: &str) -> SyncResult<()> {
        *self.change_version.write() = Some(cv.to_string());
        Ok(())
    }

    fn clear_change_version(&self) -> SyncResult<()> {
        *self.change_version.write() = None;
        Ok(())
    }
}
