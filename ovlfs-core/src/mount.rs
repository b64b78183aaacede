//! Mount options and the `Overlay` façade: the one object a host embeds to
//! get a running overlay out of a base root, an optional storage root, and
//! a path for the persisted record log.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ovlfs_api::port::BackingFs;
use ovlfs_api::types::DevIno;

use crate::copyup::CopyUpEngine;
use crate::dirstore::DirStore;
use crate::error::Result;
use crate::flags::{InodeFlags, Side};
use crate::inode::{Kind, Lino, ROOT_LINO};
use crate::lifecycle::LifecycleManager;
use crate::mapstore::{MapStore, StoredAttrs};
use crate::persist::{PersistStore, RecordLog};
use crate::refstore::RefStore;
use crate::registry::Registry;
use crate::resolver::Resolver;

/// Reserved logical inode standing in for the base root when looked up
/// through the configured magic name. Never allocated by [`MapStore`],
/// whose counter starts at `ROOT_LINO + 1` and only grows.
pub const MAGIC_BASE_LINO: Lino = Lino::MAX - 1;
/// Reserved logical inode standing in for the storage root.
pub const MAGIC_STORAGE_LINO: Lino = Lino::MAX;

/// Mount-time configuration, mirroring the source's fstab-style option
/// string one field at a time.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Path to the read-only base tree, recorded for the host's reference;
    /// the actual handle is opened by the host and passed to
    /// [`Overlay::mount`] directly.
    pub base_root: PathBuf,
    /// Path to the read-write storage tree, if one is configured.
    pub storage: Option<PathBuf>,
    /// Mount entirely without a storage tree: every write fails, and no
    /// inode is ever copied up.
    pub no_storage: bool,
    /// Name of the persistence method to acquire from the [`Registry`].
    /// Defaults to [`Registry::BUILTIN_RECORD_LOG`].
    pub stg_method: String,
    /// Soft cap, in bytes, on the persisted record log before a caller
    /// should consider compacting. Advisory only; nothing in this crate
    /// enforces it automatically.
    pub max_mem: Option<u64>,
    /// Resolve through submounts encountered under either tree.
    pub follow_mounts: bool,
    /// Only append attribute-update records at unmount (gated compaction)
    /// rather than on every mutation.
    pub update_on_unmount_only: bool,
    /// Persist the base-side `(dev, ino)` reverse map.
    pub store_base_map: bool,
    /// Persist the storage-side `(dev, ino)` reverse map.
    pub store_storage_map: bool,
    /// Recognize the two magic names under the mount root.
    pub magic: bool,
    /// Name that resolves directly to the base root.
    pub magic_base_name: String,
    /// Name that resolves directly to the storage root.
    pub magic_storage_name: String,
    /// Omit the magic names from directory listings of the mount root.
    pub hide_magic: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            base_root: PathBuf::new(),
            storage: None,
            no_storage: false,
            stg_method: Registry::BUILTIN_RECORD_LOG.to_string(),
            max_mem: None,
            follow_mounts: true,
            update_on_unmount_only: false,
            store_base_map: true,
            store_storage_map: true,
            magic: false,
            magic_base_name: ".ovl_base".to_string(),
            magic_storage_name: ".ovl_storage".to_string(),
            hide_magic: true,
        }
    }
}

/// One attribute snapshot a dispatcher call hands back to the host,
/// independent of [`crate::mapstore::StoredAttrs`]'s persisted shape.
#[derive(Debug, Clone, Copy)]
pub struct InodeAttrs {
    /// This inode's own number.
    pub lino: Lino,
    /// File kind, mirroring `ovlfs_api::types::FileKind`.
    pub kind: ovlfs_api::types::FileKind,
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
}

/// A per-open file record, handed to the host after [`Overlay::open`] and
/// threaded back through `read`/`write`/`close`.
#[derive(Debug)]
pub struct OpenFile<H> {
    pub(crate) handle: Arc<H>,
    pub(crate) lino: Lino,
    /// True while this open handle is still pointing at the base side; a
    /// write through it triggers copy-up and flips this to `false`.
    pub(crate) is_base: bool,
}

impl<H> OpenFile<H> {
    /// The logical inode this file handle was opened against.
    pub fn lino(&self) -> Lino {
        self.lino
    }

    /// Whether this handle currently reads through the base side.
    pub fn is_base(&self) -> bool {
        self.is_base
    }
}

/// The overlay engine: every store, the resolver, the copy-up engine, and
/// the lifecycle manager, wired together over one backing implementation.
pub struct Overlay<B: BackingFs> {
    pub(crate) backing: Arc<B>,
    pub(crate) base_root: Arc<B::H>,
    pub(crate) storage_root: Arc<B::H>,
    pub(crate) map: Arc<MapStore>,
    pub(crate) dirs: Arc<DirStore>,
    pub(crate) refs: Arc<RefStore<B::H>>,
    pub(crate) resolver: Arc<Resolver<B>>,
    pub(crate) copyup: CopyUpEngine<B>,
    pub(crate) lifecycle: LifecycleManager<B>,
    pub(crate) persist: Arc<PersistStore>,
    pub(crate) options: MountOptions,
}

fn root_attrs<B: BackingFs>(
    backing: &B,
    base_root: &Arc<B::H>,
    storage_root: &Arc<B::H>,
) -> Result<StoredAttrs> {
    let base_stat = backing.stat(base_root)?;
    let storage_stat = backing.stat(storage_root)?;
    Ok(StoredAttrs {
        parent_lino: ROOT_LINO,
        name: String::new(),
        kind: Kind::Directory,
        flags: InodeFlags::empty(),
        mode: base_stat.perm,
        uid: base_stat.uid,
        gid: base_stat.gid,
        size: 0,
        nlink: 2,
        atime: base_stat.atime,
        mtime: base_stat.mtime,
        ctime: base_stat.ctime,
        blocks: 0,
        blksize: 4096,
        rdev: 0,
        base_ref: Some(base_stat.id),
        storage_ref: Some(storage_stat.id),
        fresh: true,
    })
}

impl<B: BackingFs> Overlay<B> {
    /// Mount an overlay: replays (or creates) the persisted record log at
    /// `persist_path`, then wires up every store against already-opened
    /// `base_root`/`storage_root` handles.
    ///
    /// The registry is consulted only to reserve `options.stg_method`'s
    /// name for the duration of the mount; the one persistence backend
    /// this crate ships with is always the record log regardless of which
    /// name was registered under.
    pub fn mount(
        options: MountOptions,
        registry: &Registry,
        backing: Arc<B>,
        base_root: Arc<B::H>,
        storage_root: Arc<B::H>,
        persist_path: impl AsRef<Path>,
    ) -> Result<Self> {
        registry.acquire(&options.stg_method)?;

        let log = RecordLog::open_or_create(persist_path)?;
        let persist = Arc::new(PersistStore::new(log));

        let base_id = backing.stat(&base_root)?.id;
        let storage_id = backing.stat(&storage_root)?.id;

        let map = Arc::new(MapStore::load(
            persist.clone(),
            options.store_base_map,
            options.store_storage_map,
            options.update_on_unmount_only,
            || root_attrs(&*backing, &base_root, &storage_root).expect("stat of mount roots"),
        )?);
        let dirs = Arc::new(DirStore::load(persist.clone())?);
        let refs = Arc::new(RefStore::new(map.clone()));
        refs.attach_reference(ROOT_LINO, Side::Base, base_root.clone(), base_id, false)?;
        refs.attach_reference(ROOT_LINO, Side::Storage, storage_root.clone(), storage_id, false)?;

        let resolver = Arc::new(Resolver::new(
            backing.clone(),
            refs.clone(),
            map.clone(),
            base_root.clone(),
            storage_root.clone(),
            None,
        ));
        let copyup = CopyUpEngine::new(backing.clone(), resolver.clone(), refs.clone(), map.clone());
        let lifecycle = LifecycleManager::new(
            backing.clone(),
            resolver.clone(),
            refs.clone(),
            map.clone(),
            dirs.clone(),
        );

        Ok(Overlay {
            backing,
            base_root,
            storage_root,
            map,
            dirs,
            refs,
            resolver,
            copyup,
            lifecycle,
            persist,
            options,
        })
    }

    /// Compact the persisted log down to exactly the live records and flush
    /// it to disk, releasing the registry's hold on `stg_method`. Returns
    /// the base/storage root handles so the host can close them.
    pub fn unmount(self, registry: &Registry) -> Result<(Arc<B::H>, Arc<B::H>)> {
        let mut records = self.map.live_records();
        records.extend(self.dirs.live_records());
        self.persist.compact(&records)?;
        self.persist.flush()?;
        registry.release(&self.options.stg_method);
        Ok((self.base_root, self.storage_root))
    }

    /// The mount's configuration, as given to [`Overlay::mount`].
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub(crate) fn attrs_view(&self, lino: Lino, attrs: &StoredAttrs) -> InodeAttrs {
        InodeAttrs {
            lino,
            kind: attrs.kind.file_kind(),
            mode: attrs.mode,
            uid: attrs.uid,
            gid: attrs.gid,
            size: attrs.size,
            nlink: attrs.nlink,
            atime: attrs.atime,
            mtime: attrs.mtime,
            ctime: attrs.ctime,
            blocks: attrs.blocks,
            blksize: attrs.blksize,
            rdev: attrs.rdev,
        }
    }

    pub(crate) fn magic_lino_for(&self, dir_lino: Lino, name: &str) -> Option<Lino> {
        if !self.options.magic || dir_lino != ROOT_LINO {
            return None;
        }
        if name == self.options.magic_base_name {
            Some(MAGIC_BASE_LINO)
        } else if name == self.options.magic_storage_name {
            Some(MAGIC_STORAGE_LINO)
        } else {
            None
        }
    }

    pub(crate) fn magic_root_handle(&self, lino: Lino) -> Option<Arc<B::H>> {
        match lino {
            MAGIC_BASE_LINO => Some(self.base_root.clone()),
            MAGIC_STORAGE_LINO => Some(self.storage_root.clone()),
            _ => None,
        }
    }

    pub(crate) fn magic_attrs(&self, lino: Lino) -> Result<InodeAttrs> {
        let handle = self.magic_root_handle(lino).expect("magic lino");
        let stat = self.backing.stat(&handle)?;
        Ok(InodeAttrs {
            lino,
            kind: stat.kind,
            mode: stat.perm,
            uid: stat.uid,
            gid: stat.gid,
            size: stat.size,
            nlink: stat.nlink,
            atime: stat.atime,
            mtime: stat.mtime,
            ctime: stat.ctime,
            blocks: stat.blocks,
            blksize: stat.blksize,
            rdev: stat.rdev,
        })
    }
}

/// `(dev, ino)` a `rename` collision tie-break needs when deciding whether
/// two logical inodes already name the same concrete backing file.
pub(crate) fn same_backing(a: Option<DevIno>, b: Option<DevIno>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a == b)
}
