//! The persistent bidirectional mapping between logical inode numbers and
//! `(dev, ino)` pairs in the base/storage trees, plus the attribute record
//! every logical inode carries. Survives unmount via the shared
//! [`PersistStore`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ovlfs_api::types::DevIno;

use crate::error::{OverlayError, Result};
use crate::flags::{InodeFlags, Side};
use crate::inode::{Kind, Lino, ROOT_LINO};
use crate::persist::PersistStore;
use crate::record::{kind_tag, PersistedInode, Record};

/// Cached state for one logical inode's attributes, independent of any
/// live backing handle (those live in the reference store instead).
#[derive(Debug, Clone)]
pub struct StoredAttrs {
    pub parent_lino: Lino,
    pub name: String,
    pub kind: Kind,
    pub flags: InodeFlags,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub blocks: u64,
    pub blksize: u32,
    pub rdev: u64,
    pub base_ref: Option<DevIno>,
    pub storage_ref: Option<DevIno>,
    /// False until the lifecycle manager has confirmed these attributes
    /// against a live `stat` of the backing FS (set false immediately
    /// after loading a record from the persisted log at mount time).
    pub fresh: bool,
}

impl StoredAttrs {
    fn to_persisted(&self, lino: Lino) -> PersistedInode {
        let (kind_tag, symlink_target) = encode_kind(&self.kind);
        PersistedInode {
            lino,
            parent_lino: self.parent_lino,
            name: self.name.clone(),
            kind_tag,
            symlink_target,
            flags: self.flags.bits(),
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            size: self.size,
            nlink: self.nlink,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            blocks: self.blocks,
            blksize: self.blksize,
            rdev: self.rdev,
            base_ref: self.base_ref.map(|d| (d.dev, d.ino)),
            storage_ref: self.storage_ref.map(|d| (d.dev, d.ino)),
        }
    }

    fn from_persisted(p: &PersistedInode) -> Result<Self> {
        Ok(StoredAttrs {
            parent_lino: p.parent_lino,
            name: p.name.clone(),
            kind: decode_kind(p.kind_tag, &p.symlink_target, p.rdev)?,
            flags: InodeFlags::from_bits_truncate(p.flags),
            mode: p.mode,
            uid: p.uid,
            gid: p.gid,
            size: p.size,
            nlink: p.nlink,
            atime: p.atime,
            mtime: p.mtime,
            ctime: p.ctime,
            blocks: p.blocks,
            blksize: p.blksize,
            rdev: p.rdev,
            base_ref: p.base_ref.map(|(dev, ino)| DevIno::new(dev, ino)),
            storage_ref: p.storage_ref.map(|(dev, ino)| DevIno::new(dev, ino)),
            fresh: false,
        })
    }
}

fn encode_kind(kind: &Kind) -> (u8, String) {
    match kind {
        Kind::Directory => (kind_tag::DIRECTORY, String::new()),
        Kind::File => (kind_tag::FILE, String::new()),
        Kind::Symlink { target } => (kind_tag::SYMLINK, target.clone()),
        Kind::Special { .. } => (kind_tag::SPECIAL, String::new()),
    }
}

fn decode_kind(tag: u8, symlink_target: &str, rdev: u64) -> Result<Kind> {
    match tag {
        kind_tag::DIRECTORY => Ok(Kind::Directory),
        kind_tag::FILE => Ok(Kind::File),
        kind_tag::SYMLINK => Ok(Kind::Symlink {
            target: symlink_target.to_string(),
        }),
        kind_tag::SPECIAL => Ok(Kind::Special { rdev }),
        _ => Err(OverlayError::CorruptStore("unknown persisted inode kind tag")),
    }
}

struct Inner {
    next_lino: Lino,
    inodes: HashMap<Lino, StoredAttrs>,
    base_reverse: HashMap<(u64, u64), Lino>,
    storage_reverse: HashMap<(u64, u64), Lino>,
}

/// The inode-map store: `add_inode`/`read_inode`/`update_inode` plus the
/// reverse `(dev, ino) -> lino` lookups used when the backing FS surfaces
/// an inode the overlay needs to identify.
pub struct MapStore {
    inner: Mutex<Inner>,
    store: Arc<PersistStore>,
    persist_base_map: bool,
    persist_storage_map: bool,
    /// When set, attribute *updates* (not the initial creation record) are
    /// only written out at the next compaction rather than on every
    /// mutation, matching the `updmntonly` mount option.
    update_on_unmount_only: bool,
}

impl MapStore {
    /// Build a map store over an already-replayed persisted log. If the
    /// log contained no root inode record yet (a brand-new mount), one is
    /// synthesized with the given root attributes.
    pub fn load(
        store: Arc<PersistStore>,
        persist_base_map: bool,
        persist_storage_map: bool,
        update_on_unmount_only: bool,
        root_if_missing: impl FnOnce() -> StoredAttrs,
    ) -> Result<Self> {
        let records = store.replay()?;
        let mut inner = Inner {
            next_lino: ROOT_LINO + 1,
            inodes: HashMap::new(),
            base_reverse: HashMap::new(),
            storage_reverse: HashMap::new(),
        };
        let mut tombstoned_inodes = std::collections::HashSet::new();
        let mut tombstoned_maps = std::collections::HashSet::new();
        for record in &records {
            match record {
                Record::TombstoneInode(lino) => {
                    tombstoned_inodes.insert(*lino);
                }
                Record::TombstoneMap(lino, is_storage) => {
                    tombstoned_maps.insert((*lino, *is_storage));
                }
                _ => {}
            }
        }
        for record in records {
            match record {
                Record::Inode(p) => {
                    if tombstoned_inodes.contains(&p.lino) {
                        continue;
                    }
                    inner.next_lino = inner.next_lino.max(p.lino + 1);
                    inner.inodes.insert(p.lino, StoredAttrs::from_persisted(&p)?);
                }
                Record::Map(m) => {
                    if tombstoned_maps.contains(&(m.lino, m.is_storage_side)) {
                        continue;
                    }
                    let reverse = if m.is_storage_side {
                        &mut inner.storage_reverse
                    } else {
                        &mut inner.base_reverse
                    };
                    reverse.insert((m.dev, m.ino), m.lino);
                }
                _ => {}
            }
        }
        if !inner.inodes.contains_key(&ROOT_LINO) {
            inner.inodes.insert(ROOT_LINO, root_if_missing());
        }
        Ok(MapStore {
            inner: Mutex::new(inner),
            store,
            persist_base_map,
            persist_storage_map,
            update_on_unmount_only,
        })
    }

    /// Allocate a fresh logical inode under `parent_lino`, persist it, and
    /// return its number.
    pub fn add_inode(&self, parent_lino: Lino, name: &str, kind: Kind, mode: u32) -> Result<Lino> {
        let mut inner = self.inner.lock().unwrap();
        let lino = inner.next_lino;
        inner.next_lino += 1;
        let attrs = StoredAttrs {
            parent_lino,
            name: name.to_string(),
            kind,
            flags: InodeFlags::NO_BASE_REF,
            mode,
            uid: 0,
            gid: 0,
            size: 0,
            nlink: 1,
            atime: 0,
            mtime: 0,
            ctime: 0,
            blocks: 0,
            blksize: 0,
            rdev: 0,
            base_ref: None,
            storage_ref: None,
            fresh: true,
        };
        self.store.append(&Record::Inode(attrs.to_persisted(lino)))?;
        inner.inodes.insert(lino, attrs);
        Ok(lino)
    }

    /// Load a copy of the inode's attributes, plus whether they are
    /// confirmed fresh against the backing FS.
    pub fn read_inode(&self, lino: Lino) -> Result<StoredAttrs> {
        let inner = self.inner.lock().unwrap();
        inner
            .inodes
            .get(&lino)
            .cloned()
            .ok_or(OverlayError::BadHandle)
    }

    /// Persist a full attribute replacement for `lino`. If
    /// `update_on_unmount_only` is set, the in-memory state is updated but
    /// the log append is skipped; the next compaction picks it up from
    /// [`MapStore::live_records`].
    pub fn update_inode(&self, lino: Lino, attrs: StoredAttrs) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.inodes.contains_key(&lino) {
            return Err(OverlayError::BadHandle);
        }
        if !self.update_on_unmount_only {
            self.store.append(&Record::Inode(attrs.to_persisted(lino)))?;
        }
        inner.inodes.insert(lino, attrs);
        Ok(())
    }

    /// Mutate `lino`'s attributes in place via `edit`, then persist the
    /// result. Convenience wrapper around read-modify-`update_inode`.
    pub fn with_inode_mut<F>(&self, lino: Lino, edit: F) -> Result<()>
    where
        F: FnOnce(&mut StoredAttrs),
    {
        let mut attrs = self.read_inode(lino)?;
        edit(&mut attrs);
        self.update_inode(lino, attrs)
    }

    /// Drop `lino`'s record entirely (used once the lifecycle manager has
    /// evicted it after `nlink` reached 0).
    pub fn forget_inode(&self, lino: Lino) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.inodes.remove(&lino).is_none() {
            return Err(OverlayError::BadHandle);
        }
        self.store.append(&Record::TombstoneInode(lino))
    }

    /// Record that `lino` corresponds to `(dev, ino)` on `side`. A no-op
    /// when the relevant persist option is off, matching the source's
    /// `storemaps`/`basemap`/`stgmap` switches.
    pub fn map_inode(&self, lino: Lino, id: DevIno, side: Side) -> Result<()> {
        let persist = match side {
            Side::Base => self.persist_base_map,
            Side::Storage => self.persist_storage_map,
        };
        let mut inner = self.inner.lock().unwrap();
        let reverse = match side {
            Side::Base => &mut inner.base_reverse,
            Side::Storage => &mut inner.storage_reverse,
        };
        reverse.insert((id.dev, id.ino), lino);
        if let Some(entry) = inner.inodes.get_mut(&lino) {
            match side {
                Side::Base => entry.base_ref = Some(id),
                Side::Storage => entry.storage_ref = Some(id),
            }
        }
        if persist {
            self.store.append(&Record::Map(crate::record::PersistedMap {
                lino,
                dev: id.dev,
                ino: id.ino,
                is_storage_side: side == Side::Storage,
            }))?;
        }
        Ok(())
    }

    /// Reverse lookup: which logical inode does `(dev, ino)` on `side` map
    /// to, if any.
    pub fn map_lookup(&self, id: DevIno, side: Side) -> Option<Lino> {
        let inner = self.inner.lock().unwrap();
        let reverse = match side {
            Side::Base => &inner.base_reverse,
            Side::Storage => &inner.storage_reverse,
        };
        reverse.get(&(id.dev, id.ino)).copied()
    }

    /// The `(dev, ino)` this inode currently maps to on `side`, if any.
    pub fn get_mapping(&self, lino: Lino, side: Side) -> Result<Option<DevIno>> {
        let attrs = self.read_inode(lino)?;
        Ok(match side {
            Side::Base => attrs.base_ref,
            Side::Storage => attrs.storage_ref,
        })
    }

    /// Snapshot every live inode and reverse-map record, for compaction.
    pub fn live_records(&self) -> Vec<Record> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Record> = inner
            .inodes
            .iter()
            .map(|(lino, attrs)| Record::Inode(attrs.to_persisted(*lino)))
            .collect();
        if self.persist_base_map {
            out.extend(inner.base_reverse.iter().map(|(&(dev, ino), &lino)| {
                Record::Map(crate::record::PersistedMap {
                    lino,
                    dev,
                    ino,
                    is_storage_side: false,
                })
            }));
        }
        if self.persist_storage_map {
            out.extend(inner.storage_reverse.iter().map(|(&(dev, ino), &lino)| {
                Record::Map(crate::record::PersistedMap {
                    lino,
                    dev,
                    ino,
                    is_storage_side: true,
                })
            }));
        }
        out
    }
}
