//! The copy-on-write engine: materializes a base-only regular file into
//! storage on first write and re-points the logical inode's references at
//! the new storage-side file.

use std::sync::Arc;

use log::warn;
use ovlfs_api::error::BackingError;
use ovlfs_api::flags::OpenFlags;
use ovlfs_api::port::BackingFs;

use crate::error::{OverlayError, Result};
use crate::flags::{InodeFlags, ResolveFlags, Side};
use crate::inode::Lino;
use crate::mapstore::MapStore;
use crate::refstore::RefStore;
use crate::resolver::Resolver;

const COPY_CHUNK: usize = 4096;

/// Copies a base-only file into storage, one logical inode at a time.
pub struct CopyUpEngine<B: BackingFs> {
    backing: Arc<B>,
    resolver: Arc<Resolver<B>>,
    refs: Arc<RefStore<B::H>>,
    map: Arc<MapStore>,
}

impl<B: BackingFs> CopyUpEngine<B> {
    /// Build a copy-up engine sharing the resolver and stores an `Overlay`
    /// already constructed.
    pub fn new(
        backing: Arc<B>,
        resolver: Arc<Resolver<B>>,
        refs: Arc<RefStore<B::H>>,
        map: Arc<MapStore>,
    ) -> Self {
        CopyUpEngine {
            backing,
            resolver,
            refs,
            map,
        }
    }

    /// Materialize `lino` (a base-only regular file) into storage and
    /// return its new storage handle, open for read/write.
    pub fn copy_up(&self, lino: Lino) -> Result<Arc<B::H>> {
        let attrs = self.map.read_inode(lino)?;
        let logical_size = attrs.size;

        let storage_parent = self.resolver.resolve(
            attrs.parent_lino,
            Side::Storage,
            ResolveFlags::MAKE_HIER | ResolveFlags::MAKE_LAST,
        )?;

        let mut created_here = false;
        let storage_file = match self.backing.lookup_child(&storage_parent, &attrs.name) {
            Ok(handle) => handle,
            Err(BackingError::NotFound) => {
                created_here = true;
                let created = self
                    .backing
                    .create(&storage_parent, &attrs.name, attrs.mode)?;
                if let Err(e) = self.backing.chown(&created, attrs.uid, attrs.gid) {
                    warn!("copy-up: chown of new storage file failed: {e}");
                }
                created
            }
            Err(e) => return Err(e.into()),
        };

        match self.run_copy(lino, &storage_file, logical_size) {
            Ok(()) => Ok(storage_file),
            Err(e) => {
                if created_here {
                    let _ = self.backing.unlink(&storage_parent, &attrs.name);
                }
                Err(e)
            }
        }
    }

    fn run_copy(&self, lino: Lino, storage_file: &Arc<B::H>, logical_size: u64) -> Result<()> {
        let base_handle = self.resolver.resolve(lino, Side::Base, ResolveFlags::empty())?;
        let base_open = self.backing.open(&base_handle, OpenFlags::READ)?;
        let storage_open = self
            .backing
            .open(storage_file, OpenFlags::READ | OpenFlags::WRITE)?;

        let base_backing_size = self.backing.stat(&base_handle)?.size;

        let mut offset = 0u64;
        while offset < logical_size {
            let want = std::cmp::min(COPY_CHUNK as u64, logical_size - offset);
            let data = self.backing.read(&base_open, offset, want)?;
            if data.is_empty() {
                break;
            }
            let written = self.backing.write(&storage_open, offset, &data)?;
            if written as usize != data.len() {
                return Err(OverlayError::Backing(BackingError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "short write during copy-up",
                ))));
            }
            offset += data.len() as u64;
        }

        if offset != logical_size {
            self.backing.truncate(&storage_open, logical_size)?;
        }

        let id = self.backing.stat(&storage_open)?.id;
        self.refs
            .attach_reference(lino, Side::Storage, storage_open, id, false)?;

        if base_backing_size != logical_size {
            self.map.with_inode_mut(lino, |a| a.flags.insert(InodeFlags::SIZE_LIMIT))?;
        }
        Ok(())
    }
}
