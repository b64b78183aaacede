//! The file-op dispatcher: every operation a host's VFS glue calls once a
//! mount is up, implemented as methods on [`crate::mount::Overlay`].
//!
//! `open` resolves storage first and falls back to base, remembering which
//! side answered so `write` knows whether to copy up first. `lookup`
//! recognizes `.`, `..`, and (if configured) the magic root names before
//! falling through to the directory-entry store.

use std::time::{SystemTime, UNIX_EPOCH};

use std::sync::Arc;

use ovlfs_api::error::BackingError;
use ovlfs_api::flags::OpenFlags;
use ovlfs_api::port::BackingFs;
use ovlfs_api::types::{Attrs, FileKind, SetAttr};

use crate::error::{OverlayError, Result};
use crate::flags::{DirentFlags, InodeFlags, ResolveFlags, Side};
use crate::inode::{Kind, Lino, ROOT_LINO};
use crate::mount::{same_backing, InodeAttrs, OpenFile, Overlay, MAGIC_BASE_LINO, MAGIC_STORAGE_LINO};

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn is_magic(lino: Lino) -> bool {
    lino == MAGIC_BASE_LINO || lino == MAGIC_STORAGE_LINO
}

impl<B: BackingFs> Overlay<B> {
    /// Resolve `name` within `dir_lino`: `.`, `..`, an optional magic root
    /// name, an already-known directory entry, or (the first time this
    /// name is seen) whatever the backing trees hold under that name.
    pub fn lookup(&self, dir_lino: Lino, name: &str) -> Result<Lino> {
        if name == "." {
            return Ok(dir_lino);
        }
        if name == ".." {
            if is_magic(dir_lino) {
                return Ok(ROOT_LINO);
            }
            return Ok(self.map.read_inode(dir_lino)?.parent_lino);
        }
        if let Some(magic_lino) = self.magic_lino_for(dir_lino, name) {
            return Ok(magic_lino);
        }
        if let Some((target, flags)) = self.dirs.lookup_raw(dir_lino, name) {
            if flags.contains(DirentFlags::UNLINKED) {
                return Err(OverlayError::Backing(BackingError::NotFound));
            }
            return Ok(target);
        }
        self.discover_child(dir_lino, name)?
            .ok_or(OverlayError::Backing(BackingError::NotFound))
    }

    /// Whether `name`'s positive dirent under `dir_lino` is a resurrection
    /// of a previously tombstoned slot (set by [`Overlay::create`] and the
    /// other creation calls when they land on a tombstone rather than an
    /// empty slot).
    pub fn dirent_relinked(&self, dir_lino: Lino, name: &str) -> Result<bool> {
        let (_, flags) = self
            .dirs
            .lookup_raw(dir_lino, name)
            .ok_or(OverlayError::Backing(BackingError::NotFound))?;
        Ok(flags.contains(DirentFlags::RELINKED))
    }

    /// Translate a backing `stat`'s kind into our tagged [`Kind`], reading
    /// the symlink target out when needed.
    fn kind_from_stat(&self, handle: &Arc<B::H>, stat: &Attrs) -> Result<Kind> {
        Ok(match stat.kind {
            FileKind::Directory => Kind::Directory,
            FileKind::Regular => Kind::File,
            FileKind::Symlink => Kind::Symlink {
                target: self.backing.readlink(handle)?,
            },
            _ => Kind::Special { rdev: stat.rdev },
        })
    }

    /// First encounter of `name` under `dir_lino`: check both backing
    /// trees directly, allocate a logical inode for whatever is found (or
    /// reuse one already mapped to the same `(dev, ino)`, covering a
    /// backing hard link reached by two different paths), and record a
    /// plain (non-relinked) dirent so this only happens once per name.
    fn discover_child(&self, dir_lino: Lino, name: &str) -> Result<Option<Lino>> {
        let storage_hit = self
            .resolver
            .resolve(dir_lino, Side::Storage, ResolveFlags::empty())
            .ok()
            .and_then(|parent| self.backing.lookup_child(&parent, name).ok());
        let base_hit = self
            .resolver
            .resolve(dir_lino, Side::Base, ResolveFlags::empty())
            .ok()
            .and_then(|parent| self.backing.lookup_child(&parent, name).ok());

        let (primary_handle, primary_side) = match (&storage_hit, &base_hit) {
            (Some(h), _) => (h.clone(), Side::Storage),
            (None, Some(h)) => (h.clone(), Side::Base),
            (None, None) => return Ok(None),
        };
        let primary_stat = self.backing.stat(&primary_handle)?;

        if let Some(existing) = self.map.map_lookup(primary_stat.id, primary_side) {
            self.dirs.add_dirent(dir_lino, name, existing)?;
            return Ok(Some(existing));
        }

        let kind = self.kind_from_stat(&primary_handle, &primary_stat)?;
        let lino = self.map.add_inode(dir_lino, name, kind, primary_stat.perm)?;
        let has_base = base_hit.is_some();
        self.map.with_inode_mut(lino, move |a| {
            if has_base {
                a.flags.remove(InodeFlags::NO_BASE_REF);
            }
            a.uid = primary_stat.uid;
            a.gid = primary_stat.gid;
            a.size = primary_stat.size;
            a.nlink = primary_stat.nlink;
            a.atime = primary_stat.atime;
            a.mtime = primary_stat.mtime;
            a.ctime = primary_stat.ctime;
            a.blocks = primary_stat.blocks;
            a.blksize = primary_stat.blksize;
            a.rdev = primary_stat.rdev;
        })?;

        if let Some(handle) = storage_hit {
            let id = if primary_side == Side::Storage {
                primary_stat.id
            } else {
                self.backing.stat(&handle)?.id
            };
            self.refs.attach_reference(lino, Side::Storage, handle, id, false)?;
        }
        if let Some(handle) = base_hit {
            let id = if primary_side == Side::Base {
                primary_stat.id
            } else {
                self.backing.stat(&handle)?.id
            };
            self.refs.attach_reference(lino, Side::Base, handle, id, false)?;
        }
        self.dirs.add_dirent(dir_lino, name, lino)?;
        Ok(Some(lino))
    }

    /// Make sure every name either backing tree holds under `dir_lino` has
    /// a dirent recorded, before streaming a fresh listing from cursor 0.
    fn sync_directory(&self, dir_lino: Lino) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        if let Ok(parent) = self.resolver.resolve(dir_lino, Side::Storage, ResolveFlags::empty()) {
            if let Ok(list) = self.backing.readdir(&parent) {
                names.extend(list);
            }
        }
        if let Ok(parent) = self.resolver.resolve(dir_lino, Side::Base, ResolveFlags::empty()) {
            if let Ok(list) = self.backing.readdir(&parent) {
                names.extend(list);
            }
        }
        for name in names {
            if self.dirs.lookup_raw(dir_lino, &name).is_none() {
                self.discover_child(dir_lino, &name)?;
            }
        }
        Ok(())
    }

    /// Current attributes of `lino`.
    pub fn stat(&self, lino: Lino) -> Result<InodeAttrs> {
        if is_magic(lino) {
            return self.magic_attrs(lino);
        }
        let attrs = self.lifecycle.read_inode(lino)?;
        Ok(self.attrs_view(lino, &attrs))
    }

    /// Stream one directory entry at a time, advancing `cursor`. Magic
    /// entries are synthesized at the end of the mount root's listing
    /// unless `hide_magic` is set. Returns `None` once exhausted.
    pub fn readdir(&self, dir_lino: Lino, cursor: usize) -> Result<Option<(String, Lino, usize)>> {
        if is_magic(dir_lino) {
            let handle = self.magic_root_handle(dir_lino).expect("magic lino");
            let names = self.backing.readdir(&handle)?;
            return Ok(names.get(cursor).map(|n| (n.clone(), 0, cursor + 1)));
        }
        if cursor == 0 {
            self.sync_directory(dir_lino)?;
        }
        let magic_enabled = dir_lino == ROOT_LINO && self.options().magic && !self.options().hide_magic;
        // Magic cursors start one past the ordinary index space: `usize::MAX`
        // selects the base name, `usize::MAX - 1` the storage name. That way
        // the magic rows are keyed off `iterate`'s own exhaustion (`None`)
        // rather than a separately computed live-entry count, which would
        // drift out of sync with the real cursor once any entry is removed.
        if cursor < usize::MAX - 1 {
            if let Some((name, view, next)) = self.dirs.iterate(dir_lino, cursor, false) {
                return Ok(Some((name, view.target_lino, next)));
            }
            if magic_enabled {
                let base_name = self.options().magic_base_name.clone();
                return Ok(Some((base_name, MAGIC_BASE_LINO, usize::MAX - 1)));
            }
            return Ok(None);
        }
        if magic_enabled && cursor == usize::MAX - 1 {
            let storage_name = self.options().magic_storage_name.clone();
            return Ok(Some((storage_name, MAGIC_STORAGE_LINO, usize::MAX)));
        }
        Ok(None)
    }

    /// Open `lino` for I/O, preferring the storage side and falling back to
    /// base. Magic roots open directly against their backing root.
    pub fn open(&self, lino: Lino, flags: OpenFlags) -> Result<OpenFile<B::H>> {
        if is_magic(lino) {
            let root = self.magic_root_handle(lino).expect("magic lino");
            let opened = self.backing.open(&root, flags)?;
            return Ok(OpenFile {
                handle: opened,
                lino,
                is_base: lino == MAGIC_BASE_LINO,
            });
        }
        let (raw, is_base) = match self.resolver.resolve(lino, Side::Storage, ResolveFlags::empty()) {
            Ok(handle) => (handle, false),
            Err(e) if e.is_not_found() => {
                let handle = self.resolver.resolve(lino, Side::Base, ResolveFlags::empty())?;
                (handle, true)
            }
            Err(e) => return Err(e),
        };
        let opened = self.backing.open(&raw, flags)?;
        Ok(OpenFile {
            handle: opened,
            lino,
            is_base,
        })
    }

    /// Read up to `len` bytes at `offset`, clipped to the logical size and
    /// zero-filled past whatever the backing file actually holds.
    pub fn read(&self, open: &OpenFile<B::H>, offset: u64, len: u64) -> Result<Vec<u8>> {
        if is_magic(open.lino) {
            return Ok(self.backing.read(&open.handle, offset, len)?);
        }
        let attrs = self.map.read_inode(open.lino)?;
        let len = if attrs.flags.contains(InodeFlags::SIZE_LIMIT) {
            let avail = attrs.size.saturating_sub(offset);
            len.min(avail)
        } else {
            len
        };
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut data = self.backing.read(&open.handle, offset, len)?;
        if (data.len() as u64) < len {
            data.resize(len as usize, 0);
        }
        let _ = self.map.with_inode_mut(open.lino, |a| a.atime = now_secs());
        Ok(data)
    }

    /// Write `data` at `offset`. A write through a base-side handle
    /// triggers copy-up first, after which `open` points at the new
    /// storage file for the rest of its lifetime.
    pub fn write(&self, open: &mut OpenFile<B::H>, offset: u64, data: &[u8]) -> Result<u64> {
        if is_magic(open.lino) {
            return Ok(self.backing.write(&open.handle, offset, data)?);
        }
        if open.is_base {
            if self.options().no_storage {
                return Err(OverlayError::Backing(BackingError::Invalid(
                    "mount has no storage tree",
                )));
            }
            let storage_handle = self.copyup.copy_up(open.lino)?;
            open.handle = storage_handle;
            open.is_base = false;
        }
        let written = self.backing.write(&open.handle, offset, data)?;
        let new_end = offset + written;
        self.map.with_inode_mut(open.lino, |a| {
            a.mtime = now_secs();
            a.ctime = a.mtime;
            if new_end > a.size {
                a.size = new_end;
            }
        })?;
        Ok(written)
    }

    /// Create a directory named `name` under `dir_lino`, on the storage
    /// side only.
    pub fn mkdir(&self, dir_lino: Lino, name: &str, mode: u32) -> Result<Lino> {
        self.check_positive_absent(dir_lino, name)?;
        let storage_parent = self.resolver.resolve(
            dir_lino,
            Side::Storage,
            ResolveFlags::MAKE_HIER | ResolveFlags::MAKE_LAST,
        )?;
        let handle = self.backing.mkdir(&storage_parent, name, mode)?;
        let id = self.backing.stat(&handle)?.id;
        let lino = self.map.add_inode(dir_lino, name, Kind::Directory, mode)?;
        self.refs.attach_reference(lino, Side::Storage, handle, id, false)?;
        self.dirs.add_dirent(dir_lino, name, lino)?;
        Ok(lino)
    }

    /// Create a regular file named `name` under `dir_lino`, returning its
    /// logical inode and an already-open storage handle.
    pub fn create(&self, dir_lino: Lino, name: &str, mode: u32) -> Result<(Lino, OpenFile<B::H>)> {
        self.check_positive_absent(dir_lino, name)?;
        if self.options().no_storage {
            return Err(OverlayError::Backing(BackingError::Invalid(
                "mount has no storage tree",
            )));
        }
        let storage_parent = self.resolver.resolve(
            dir_lino,
            Side::Storage,
            ResolveFlags::MAKE_HIER | ResolveFlags::MAKE_LAST,
        )?;
        let handle = self.backing.create(&storage_parent, name, mode)?;
        let id = self.backing.stat(&handle)?.id;
        let lino = self
            .map
            .add_inode(dir_lino, name, Kind::File, mode)?;
        self.refs
            .attach_reference(lino, Side::Storage, handle.clone(), id, false)?;
        self.dirs.add_dirent(dir_lino, name, lino)?;
        Ok((
            lino,
            OpenFile {
                handle,
                lino,
                is_base: false,
            },
        ))
    }

    /// Create a device node or named pipe named `name` under `dir_lino`.
    pub fn mknod(&self, dir_lino: Lino, name: &str, mode: u32, rdev: u64) -> Result<Lino> {
        self.check_positive_absent(dir_lino, name)?;
        let storage_parent = self.resolver.resolve(
            dir_lino,
            Side::Storage,
            ResolveFlags::MAKE_HIER | ResolveFlags::MAKE_LAST,
        )?;
        let handle = self.backing.mknod(&storage_parent, name, mode, rdev)?;
        let id = self.backing.stat(&handle)?.id;
        let lino = self
            .map
            .add_inode(dir_lino, name, Kind::Special { rdev }, mode)?;
        self.refs.attach_reference(lino, Side::Storage, handle, id, false)?;
        self.dirs.add_dirent(dir_lino, name, lino)?;
        Ok(lino)
    }

    /// Create a symlink named `name` under `dir_lino`, pointing at `target`.
    pub fn symlink(&self, dir_lino: Lino, name: &str, target: &str) -> Result<Lino> {
        self.check_positive_absent(dir_lino, name)?;
        let storage_parent = self.resolver.resolve(
            dir_lino,
            Side::Storage,
            ResolveFlags::MAKE_HIER | ResolveFlags::MAKE_LAST,
        )?;
        let handle = self.backing.symlink(&storage_parent, name, target)?;
        let id = self.backing.stat(&handle)?.id;
        let lino = self.map.add_inode(
            dir_lino,
            name,
            Kind::Symlink {
                target: target.to_string(),
            },
            0o777,
        )?;
        self.refs.attach_reference(lino, Side::Storage, handle, id, false)?;
        self.dirs.add_dirent(dir_lino, name, lino)?;
        Ok(lino)
    }

    /// Read a symlink's target, preferring a cached target over a fresh
    /// backing round trip.
    pub fn readlink(&self, lino: Lino) -> Result<String> {
        let attrs = self.map.read_inode(lino)?;
        match attrs.kind {
            Kind::Symlink { target } => Ok(target),
            _ => Err(OverlayError::Backing(BackingError::Invalid(
                "not a symlink",
            ))),
        }
    }

    /// Add another name for `target_lino` under `dir_lino`. Bookkeeping
    /// only: the backing port has no hard-link primitive to forward to.
    pub fn link(&self, dir_lino: Lino, name: &str, target_lino: Lino) -> Result<()> {
        self.check_positive_absent(dir_lino, name)?;
        self.dirs.add_dirent(dir_lino, name, target_lino)?;
        self.map.with_inode_mut(target_lino, |a| a.nlink += 1)
    }

    /// Remove a non-directory entry named `name` from `dir_lino`.
    pub fn unlink(&self, dir_lino: Lino, name: &str) -> Result<()> {
        let target_lino = self.lookup(dir_lino, name)?;
        self.map
            .with_inode_mut(target_lino, |a| a.nlink = a.nlink.saturating_sub(1))?;
        self.dirs.unlink(dir_lino, name)?;
        if let Ok(storage_parent) = self.resolver.resolve(dir_lino, Side::Storage, ResolveFlags::empty()) {
            let _ = self.backing.unlink(&storage_parent, name);
        }
        Ok(())
    }

    /// Remove an empty directory entry named `name` from `dir_lino`.
    pub fn rmdir(&self, dir_lino: Lino, name: &str) -> Result<()> {
        let target_lino = self.lookup(dir_lino, name)?;
        let attrs = self.map.read_inode(target_lino)?;
        if !matches!(attrs.kind, Kind::Directory) {
            return Err(OverlayError::Backing(BackingError::NotADirectory));
        }
        self.sync_directory(target_lino)?;
        if self.dirs.count(target_lino, false) > 0 {
            return Err(OverlayError::Backing(BackingError::NotEmpty));
        }
        self.dirs.unlink(dir_lino, name)?;
        if let Ok(storage_parent) = self.resolver.resolve(dir_lino, Side::Storage, ResolveFlags::empty()) {
            let _ = self.backing.rmdir(&storage_parent, name);
        }
        Ok(())
    }

    /// Rename `old_name` under `old_dir` to `new_name` under `new_dir`.
    /// Tries the backing rename first; on `CrossDevice` (only possible
    /// across distinct directories) the move is emulated in the
    /// directory-entry store alone, leaving both backing files in place.
    pub fn rename(&self, old_dir: Lino, old_name: &str, new_dir: Lino, new_name: &str) -> Result<()> {
        let target_lino = self.lookup(old_dir, old_name)?;
        if let Ok(existing_lino) = self.lookup(new_dir, new_name) {
            if same_backing(
                self.map.get_mapping(target_lino, Side::Storage)?,
                self.map.get_mapping(existing_lino, Side::Storage)?,
            ) {
                return Ok(());
            }
        }

        if old_dir == new_dir {
            self.dirs.move_entry(old_dir, old_name, new_dir, new_name)?;
            if let Ok(storage_parent) = self.resolver.resolve(old_dir, Side::Storage, ResolveFlags::empty()) {
                let _ = self.backing.rename(&storage_parent, old_name, &storage_parent, new_name);
            }
            return Ok(());
        }

        // Best-effort mirror on the backing side. A `CrossDevice` failure
        // (or simply having nothing to rename on one side) is not an
        // error here: per the emulation policy, the logical bookkeeping
        // below is the only thing that has to move. The backing entry's
        // name is never rewritten in that case.
        if let (Ok(old_parent), Ok(new_parent)) = (
            self.resolver.resolve(old_dir, Side::Storage, ResolveFlags::empty()),
            self.resolver.resolve(
                new_dir,
                Side::Storage,
                ResolveFlags::MAKE_HIER | ResolveFlags::MAKE_LAST,
            ),
        ) {
            match self.backing.rename(&old_parent, old_name, &new_parent, new_name) {
                Ok(()) | Err(BackingError::NotFound) | Err(BackingError::CrossDevice) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.dirs.move_entry(old_dir, old_name, new_dir, new_name)?;
        self.refs.set_parent(target_lino, new_dir)?;
        self.refs.set_name(target_lino, new_name)?;
        // The cached handle (if any) may still point at the old backing
        // path; drop it so the next resolve re-derives it from the
        // updated parent/name.
        self.refs.clear_references(target_lino);
        Ok(())
    }

    /// Apply `changes` to the storage side (if present) and unconditionally
    /// to the logical inode record. A size change sets `SIZE_LIMIT`.
    pub fn setattr(&self, lino: Lino, changes: &SetAttr) -> Result<()> {
        if let Ok(storage_handle) = self.resolver.resolve(lino, Side::Storage, ResolveFlags::empty()) {
            self.backing.setattr(&storage_handle, changes)?;
        }
        self.map.with_inode_mut(lino, |a| {
            if let Some(perm) = changes.perm {
                a.mode = perm;
            }
            if let Some(uid) = changes.uid {
                a.uid = uid;
            }
            if let Some(gid) = changes.gid {
                a.gid = gid;
            }
            if let Some(size) = changes.size {
                a.size = size;
                a.flags.insert(InodeFlags::SIZE_LIMIT);
            }
            if let Some(atime) = changes.atime {
                a.atime = atime;
            }
            if let Some(mtime) = changes.mtime {
                a.mtime = mtime;
            }
            a.ctime = now_secs();
        })
    }

    /// Truncate (or extend) `lino` to `length`, copying up first if it is
    /// still base-only.
    pub fn truncate(&self, lino: Lino, length: u64) -> Result<()> {
        let attrs = self.map.read_inode(lino)?;
        let handle = if attrs.storage_ref.is_some() {
            self.resolver.resolve(lino, Side::Storage, ResolveFlags::empty())?
        } else {
            self.copyup.copy_up(lino)?
        };
        self.backing.truncate(&handle, length)?;
        self.map.with_inode_mut(lino, |a| {
            a.size = length;
            a.flags.insert(InodeFlags::SIZE_LIMIT);
            a.mtime = now_secs();
            a.ctime = a.mtime;
        })
    }

    /// Change ownership of `lino`.
    pub fn chown(&self, lino: Lino, uid: u32, gid: u32) -> Result<()> {
        self.setattr(
            lino,
            &SetAttr {
                uid: Some(uid),
                gid: Some(gid),
                ..Default::default()
            },
        )
    }

    fn check_positive_absent(&self, dir_lino: Lino, name: &str) -> Result<()> {
        match self.lookup(dir_lino, name) {
            Ok(_) => Err(OverlayError::Backing(BackingError::Exists)),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Helper so callers can tell a resolved kind apart without importing
/// `ovlfs_api::types::FileKind` themselves.
pub fn is_directory(kind: FileKind) -> bool {
    matches!(kind, FileKind::Directory)
}
