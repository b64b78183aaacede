//! The inode lifecycle manager: populates attributes the first time a
//! logical inode is touched, drops cached handles when it is forgotten,
//! and probes whether an inode is still reachable from some backing
//! reference at all.

use std::sync::Arc;

use ovlfs_api::port::BackingFs;

use crate::dirstore::DirStore;
use crate::error::Result;
use crate::flags::{DirentFlags, ResolveFlags, Side};
use crate::inode::Lino;
use crate::mapstore::{MapStore, StoredAttrs};
use crate::refstore::RefStore;
use crate::resolver::Resolver;

/// Default block size used to fill in `blksize` when a backing `stat`
/// reports zero (mirroring the host page size in the source).
const DEFAULT_BLKSIZE: u32 = 4096;

/// Drives a logical inode through `fresh -> attached -> clean -> gone`.
pub struct LifecycleManager<B: BackingFs> {
    backing: Arc<B>,
    resolver: Arc<Resolver<B>>,
    refs: Arc<RefStore<B::H>>,
    map: Arc<MapStore>,
    dirs: Arc<DirStore>,
}

impl<B: BackingFs> LifecycleManager<B> {
    /// Build a lifecycle manager sharing an overlay's stores and resolver.
    pub fn new(
        backing: Arc<B>,
        resolver: Arc<Resolver<B>>,
        refs: Arc<RefStore<B::H>>,
        map: Arc<MapStore>,
        dirs: Arc<DirStore>,
    ) -> Self {
        LifecycleManager {
            backing,
            resolver,
            refs,
            map,
            dirs,
        }
    }

    /// Load `lino`'s attributes, refreshing them from the backing FS if
    /// they were never confirmed live (freshly replayed from the persisted
    /// log at mount, never yet `stat`'d).
    pub fn read_inode(&self, lino: Lino) -> Result<StoredAttrs> {
        let mut attrs = self.map.read_inode(lino)?;
        if attrs.fresh {
            return Ok(attrs);
        }
        let handle = self
            .resolver
            .resolve(lino, Side::Storage, ResolveFlags::empty())
            .or_else(|_| self.resolver.resolve(lino, Side::Base, ResolveFlags::empty()));
        if let Ok(handle) = handle {
            let stat = self.backing.stat(&handle)?;
            attrs.mode = stat.perm;
            attrs.uid = stat.uid;
            attrs.gid = stat.gid;
            attrs.size = stat.size;
            attrs.nlink = stat.nlink;
            attrs.atime = stat.atime;
            attrs.mtime = stat.mtime;
            attrs.ctime = stat.ctime;
            attrs.blksize = if stat.blksize == 0 {
                DEFAULT_BLKSIZE
            } else {
                stat.blksize
            };
            attrs.blocks = if stat.blocks == 0 {
                (stat.size + 511) / 512
            } else {
                stat.blocks
            };
        }
        attrs.fresh = true;
        self.map.update_inode(lino, attrs.clone())?;
        Ok(attrs)
    }

    /// Persist `lino`'s current in-memory attributes.
    pub fn write_inode(&self, lino: Lino, attrs: StoredAttrs) -> Result<()> {
        self.map.update_inode(lino, attrs)
    }

    /// Drop cached backing handles and release the in-memory record.
    pub fn clean_inode(&self, lino: Lino) {
        self.refs.clear_references(lino);
    }

    /// Called when the host's last reference to `lino` is dropped. If
    /// `nlink` has reached zero, the logical size is cleared before the
    /// handles are released.
    pub fn put_inode(&self, lino: Lino) -> Result<()> {
        let attrs = self.map.read_inode(lino)?;
        if attrs.nlink == 0 {
            self.map.with_inode_mut(lino, |a| a.size = 0)?;
        }
        self.clean_inode(lino);
        Ok(())
    }

    /// True iff at least one of `lino`'s references still resolves to a
    /// live backing inode.
    pub fn inode_refs_valid(&self, lino: Lino) -> bool {
        self.resolver.is_valid(lino)
    }

    /// Run the validity probe on `lino` and, if it is no longer valid,
    /// convert its slot in `parent_lino`'s directory to a tombstone (if it
    /// was a relink) or hard-remove it otherwise.
    pub fn evict_if_invalid(&self, parent_lino: Lino, name: &str, lino: Lino) -> Result<()> {
        if self.inode_refs_valid(lino) {
            return Ok(());
        }
        let entry = self.dirs.lookup(parent_lino, name);
        let was_relink = entry
            .map(|e| e.flags.contains(DirentFlags::RELINKED))
            .unwrap_or(false);
        if was_relink {
            self.dirs.unlink(parent_lino, name)?;
        } else {
            self.dirs.delete_dirent(parent_lino, name)?;
        }
        self.clean_inode(lino);
        Ok(())
    }
}
