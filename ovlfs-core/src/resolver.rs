//! The reference resolver: given a logical inode and a side, produce a
//! usable backing handle, walking up the logical tree to find a
//! resolvable ancestor and back down when the direct path is cold.

use std::sync::Arc;

use ovlfs_api::error::BackingError;
use ovlfs_api::port::BackingFs;

use crate::error::{OverlayError, Result};
use crate::flags::{InodeFlags, ResolveFlags, Side};
use crate::inode::{Lino, ROOT_LINO};
use crate::mapstore::MapStore;
use crate::refstore::RefStore;

/// Resolves logical inodes against one backing implementation shared by
/// both the base and storage trees.
pub struct Resolver<B: BackingFs> {
    backing: Arc<B>,
    refs: Arc<RefStore<B::H>>,
    map: Arc<MapStore>,
    base_root: Arc<B::H>,
    storage_root: Arc<B::H>,
    /// This overlay's own device number, if it is itself exposed as a
    /// backing filesystem to another mount. `None` in the common case of a
    /// leaf mount, which skips the self-reference guard entirely.
    own_dev: Option<u64>,
}

impl<B: BackingFs> Resolver<B> {
    /// Build a resolver over already-opened base/storage root handles.
    pub fn new(
        backing: Arc<B>,
        refs: Arc<RefStore<B::H>>,
        map: Arc<MapStore>,
        base_root: Arc<B::H>,
        storage_root: Arc<B::H>,
        own_dev: Option<u64>,
    ) -> Self {
        Resolver {
            backing,
            refs,
            map,
            base_root,
            storage_root,
            own_dev,
        }
    }

    fn root_handle(&self, side: Side) -> Arc<B::H> {
        match side {
            Side::Base => self.base_root.clone(),
            Side::Storage => self.storage_root.clone(),
        }
    }

    fn guard_own_device(&self, handle: &Arc<B::H>) -> Result<()> {
        if let Some(own_dev) = self.own_dev {
            let attrs = self.backing.stat(handle)?;
            if attrs.id.dev == own_dev {
                return Err(OverlayError::Deadlock);
            }
        }
        Ok(())
    }

    /// Produce a backing handle for `lino` on `side`, applying `flags`.
    pub fn resolve(&self, lino: Lino, side: Side, flags: ResolveFlags) -> Result<Arc<B::H>> {
        if lino == ROOT_LINO {
            return Ok(self.root_handle(side));
        }
        if self.map.read_inode(lino)?.flags.contains(InodeFlags::NO_BASE_REF) && side == Side::Base
        {
            return Err(OverlayError::Backing(BackingError::NotFound));
        }

        if let Some(handle) = self.refs.cached_handle(lino, side) {
            return self.finish(handle, flags);
        }

        // Walk up: `history` holds every logical inode (innermost last)
        // that still needs to be resolved by descending from whichever
        // ancestor turns out to be directly resolvable.
        let mut history = vec![lino];
        let mut current = self.map.read_inode(lino)?.parent_lino;
        let anchor_handle = loop {
            if current == ROOT_LINO {
                break self.root_handle(side);
            }
            if let Some(handle) = self.refs.cached_handle(current, side) {
                break handle;
            }
            history.push(current);
            current = self.map.read_inode(current)?.parent_lino;
        };

        let mut current_ancestor = anchor_handle;
        self.guard_own_device(&current_ancestor)?;

        while let Some(m) = history.pop() {
            let attrs = self.map.read_inode(m)?;
            let lookup = self.backing.lookup_child(&current_ancestor, &attrs.name);
            let handle = match lookup {
                Ok(handle) => handle,
                Err(BackingError::NotFound) => {
                    let is_last = history.is_empty();
                    let may_create = if is_last {
                        flags.contains(ResolveFlags::MAKE_LAST)
                    } else {
                        flags.contains(ResolveFlags::MAKE_HIER)
                    };
                    if !may_create || side == Side::Base {
                        return Err(OverlayError::Backing(BackingError::NotFound));
                    }
                    self.backing
                        .mkdir(&current_ancestor, &attrs.name, attrs.mode)?
                }
                Err(e) => return Err(e.into()),
            };
            self.guard_own_device(&handle)?;
            let id = self.backing.stat(&handle)?.id;
            self.refs.attach_reference(m, side, handle.clone(), id, false)?;
            current_ancestor = handle;
        }

        self.finish(current_ancestor, flags)
    }

    fn finish(&self, handle: Arc<B::H>, flags: ResolveFlags) -> Result<Arc<B::H>> {
        let handle = if flags.contains(ResolveFlags::FOLLOW_MOUNTS) {
            self.backing.follow_mount(&handle)?
        } else {
            handle
        };
        let attrs = self.backing.stat(&handle)?;
        if attrs.kind == ovlfs_api::types::FileKind::Directory && attrs.nlink == 0 {
            return Err(OverlayError::Backing(BackingError::NotFound));
        }
        Ok(handle)
    }

    /// Whether any reference (base or storage) on `lino` currently
    /// resolves to a live backing inode. Used by the lifecycle manager's
    /// validity probe.
    pub fn is_valid(&self, lino: Lino) -> bool {
        self.resolve(lino, Side::Base, ResolveFlags::empty()).is_ok()
            || self.resolve(lino, Side::Storage, ResolveFlags::empty()).is_ok()
    }
}
