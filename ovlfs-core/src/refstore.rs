//! The in-memory reference store: cached live backing handles per logical
//! inode, plus the attach/detach operations the resolver and the copy-up
//! engine drive. Attribute and `(dev, ino)` persistence live in
//! [`crate::mapstore::MapStore`]; this store only owns what cannot survive
//! an unmount — open handles into the backing FS.

use std::collections::HashMap;
use std::sync::Arc;

use ovlfs_api::port::Handle;
use ovlfs_api::types::DevIno;
use parking_lot::{Mutex, RwLock};

use crate::flags::Side;
use crate::inode::Lino;
use crate::mapstore::MapStore;
use crate::error::Result;

/// The live (non-persisted) half of one logical inode's reference state.
#[derive(Debug)]
struct LiveHandles<H> {
    base: Option<Arc<H>>,
    storage: Option<Arc<H>>,
}

impl<H> Default for LiveHandles<H> {
    fn default() -> Self {
        LiveHandles {
            base: None,
            storage: None,
        }
    }
}

/// Per-mount cache of live backing handles, keyed by logical inode.
///
/// Each inode's slot is guarded by its own `parking_lot::Mutex`, matching
/// the per-inode serialization the concurrency model calls for; the map of
/// slots itself is behind a `parking_lot::RwLock` so unrelated inodes never
/// contend on lookup.
pub struct RefStore<H: Handle> {
    map: Arc<MapStore>,
    live: RwLock<HashMap<Lino, Arc<Mutex<LiveHandles<H>>>>>,
}

impl<H: Handle> RefStore<H> {
    /// Build a reference store over an already-populated map store.
    pub fn new(map: Arc<MapStore>) -> Self {
        RefStore {
            map,
            live: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, lino: Lino) -> Arc<Mutex<LiveHandles<H>>> {
        if let Some(slot) = self.live.read().get(&lino) {
            return slot.clone();
        }
        self.live
            .write()
            .entry(lino)
            .or_insert_with(|| Arc::new(Mutex::new(LiveHandles::default())))
            .clone()
    }

    /// The currently cached handle on `side`, if any.
    pub fn cached_handle(&self, lino: Lino, side: Side) -> Option<Arc<H>> {
        let slot = self.slot(lino);
        let guard = slot.lock();
        match side {
            Side::Base => guard.base.clone(),
            Side::Storage => guard.storage.clone(),
        }
    }

    /// Set the `(dev, ino)` and cache the handle for `lino` on `side`. Any
    /// previously cached handle is dropped (its refcount released) once no
    /// other clone is outstanding. Also updates the persisted map, unless
    /// `skip_map` is set (used when the caller is about to overwrite the
    /// mapping again immediately, e.g. mid copy-up rollback).
    pub fn attach_reference(
        &self,
        lino: Lino,
        side: Side,
        handle: Arc<H>,
        id: DevIno,
        skip_map: bool,
    ) -> Result<()> {
        {
            let slot = self.slot(lino);
            let mut guard = slot.lock();
            match side {
                Side::Base => guard.base = Some(handle),
                Side::Storage => guard.storage = Some(handle),
            }
        }
        if !skip_map {
            self.map.map_inode(lino, id, side)?;
        }
        Ok(())
    }

    /// Drop both cached handles for `lino`. Called from the lifecycle
    /// manager's `clean_inode`.
    pub fn clear_references(&self, lino: Lino) {
        self.live.write().remove(&lino);
    }

    /// Rebind `lino`'s name (its binding in its parent's directory entry
    /// list changed).
    pub fn set_name(&self, lino: Lino, name: &str) -> Result<()> {
        let name = name.to_string();
        self.map.with_inode_mut(lino, move |attrs| attrs.name = name)
    }

    /// Rebind `lino`'s parent (e.g. after an emulated cross-device rename).
    pub fn set_parent(&self, lino: Lino, parent_lino: Lino) -> Result<()> {
        self.map
            .with_inode_mut(lino, move |attrs| attrs.parent_lino = parent_lino)
    }

    /// Access to the shared map store, for components that need both the
    /// persisted attributes and the live handle cache.
    pub fn map_store(&self) -> &Arc<MapStore> {
        &self.map
    }
}
