//! Concrete Backing FS port implementation against real OS directories.
//!
//! `LocalFs` is the port the overlay core exercises in every test and the
//! implementation a real mount would configure for its base and storage
//! roots. It is deliberately path-based rather than fd-based: a
//! [`LocalHandle`] carries the resolved absolute path plus a metadata
//! snapshot, and lazily owns an open `File` only once something actually
//! reads or writes through it.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{BackingError, Result};
use crate::flags::OpenFlags;
use crate::port::{BackingFs, Handle};
use crate::types::{Attrs, DevIno, FileKind, SetAttr};

/// A handle into a [`LocalFs`]-backed tree: a resolved path, a metadata
/// snapshot taken when the handle was produced, and an optional open file
/// for handles that have been through [`LocalFs::open`]/`create`.
#[derive(Debug)]
pub struct LocalHandle {
    path: PathBuf,
    attrs: Attrs,
    file: Mutex<Option<File>>,
}

impl Handle for LocalHandle {}

impl LocalHandle {
    fn from_path(path: PathBuf, follow_symlink: bool) -> Result<Self> {
        let meta = if follow_symlink {
            fs::metadata(&path)?
        } else {
            fs::symlink_metadata(&path)?
        };
        Ok(LocalHandle {
            path,
            attrs: attrs_from_metadata(&meta),
            file: Mutex::new(None),
        })
    }
}

fn kind_from_metadata(meta: &fs::Metadata) -> FileKind {
    let ft = meta.file_type();
    if ft.is_dir() {
        FileKind::Directory
    } else if ft.is_symlink() {
        FileKind::Symlink
    } else {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            FileKind::Regular
        }
    }
}

fn attrs_from_metadata(meta: &fs::Metadata) -> Attrs {
    Attrs {
        id: DevIno::new(meta.dev(), meta.ino()),
        kind: kind_from_metadata(meta),
        perm: meta.mode() & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.size(),
        nlink: meta.nlink() as u32,
        atime: meta.atime(),
        mtime: meta.mtime(),
        ctime: meta.ctime(),
        blocks: meta.blocks(),
        blksize: meta.blksize() as u32,
        rdev: meta.rdev(),
    }
}

fn open_options_for(flags: OpenFlags) -> OpenOptions {
    let mut opts = OpenOptions::new();
    opts.read(flags.contains(OpenFlags::READ))
        .write(flags.contains(OpenFlags::WRITE))
        .append(flags.contains(OpenFlags::APPEND))
        .truncate(flags.contains(OpenFlags::TRUNCATE))
        .create(flags.contains(OpenFlags::CREATE))
        .create_new(flags.contains(OpenFlags::CREATE) && flags.contains(OpenFlags::EXCL));
    opts
}

/// Backing FS port implementation rooted at real directories on disk.
///
/// `LocalFs` carries no root path of its own: every operation is relative
/// to the handle it is given, and the mount layer is responsible for
/// producing the initial base-root / storage-root handles via
/// [`LocalFs::root_handle`].
#[derive(Debug, Default)]
pub struct LocalFs;

impl LocalFs {
    /// Build a root handle for an already-existing directory path. Used by
    /// the mount layer to produce the base-root and storage-root handles
    /// `Overlay::mount` is given.
    pub fn root_handle(path: impl AsRef<Path>) -> Result<Arc<LocalHandle>> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(BackingError::Invalid("root path is not a directory"));
        }
        Ok(Arc::new(LocalHandle::from_path(path.to_path_buf(), false)?))
    }
}

impl BackingFs for LocalFs {
    type H = LocalHandle;

    fn lookup_child(&self, dir: &Arc<LocalHandle>, name: &str) -> Result<Arc<LocalHandle>> {
        if dir.attrs.kind != FileKind::Directory {
            return Err(BackingError::NotADirectory);
        }
        let child = dir.path.join(name);
        if !child.symlink_metadata().is_ok() {
            return Err(BackingError::NotFound);
        }
        Ok(Arc::new(LocalHandle::from_path(child, false)?))
    }

    fn open(&self, handle: &Arc<LocalHandle>, flags: OpenFlags) -> Result<Arc<LocalHandle>> {
        if handle.attrs.kind == FileKind::Directory {
            return Ok(handle.clone());
        }
        let file = open_options_for(flags).open(&handle.path)?;
        let attrs = attrs_from_metadata(&file.metadata()?);
        Ok(Arc::new(LocalHandle {
            path: handle.path.clone(),
            attrs,
            file: Mutex::new(Some(file)),
        }))
    }

    fn read(&self, handle: &Arc<LocalHandle>, offset: u64, len: u64) -> Result<Vec<u8>> {
        use std::io::{Read, Seek, SeekFrom};
        let mut guard = handle.file.lock().unwrap();
        let file = guard.as_mut().ok_or(BackingError::Invalid("handle has no open file"))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        let mut total = 0usize;
        loop {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
            if total == buf.len() {
                break;
            }
        }
        buf.truncate(total);
        Ok(buf)
    }

    fn write(&self, handle: &Arc<LocalHandle>, offset: u64, data: &[u8]) -> Result<u64> {
        use std::io::{Seek, SeekFrom, Write};
        let mut guard = handle.file.lock().unwrap();
        let file = guard.as_mut().ok_or(BackingError::Invalid("handle has no open file"))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(data.len() as u64)
    }

    fn create(&self, dir: &Arc<LocalHandle>, name: &str, mode: u32) -> Result<Arc<LocalHandle>> {
        if dir.attrs.kind != FileKind::Directory {
            return Err(BackingError::NotADirectory);
        }
        let path = dir.path.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        set_unix_mode(&file, mode)?;
        let attrs = attrs_from_metadata(&file.metadata()?);
        Ok(Arc::new(LocalHandle {
            path,
            attrs,
            file: Mutex::new(Some(file)),
        }))
    }

    fn mkdir(&self, dir: &Arc<LocalHandle>, name: &str, mode: u32) -> Result<Arc<LocalHandle>> {
        if dir.attrs.kind != FileKind::Directory {
            return Err(BackingError::NotADirectory);
        }
        let path = dir.path.join(name);
        fs::create_dir(&path)?;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(mode & 0o7777);
        fs::set_permissions(&path, perms)?;
        Ok(Arc::new(LocalHandle::from_path(path, false)?))
    }

    fn mknod(&self, dir: &Arc<LocalHandle>, name: &str, mode: u32, rdev: u64) -> Result<Arc<LocalHandle>> {
        if dir.attrs.kind != FileKind::Directory {
            return Err(BackingError::NotADirectory);
        }
        let path = dir.path.join(name);
        let c_path = std::ffi::CString::new(path.as_os_str().to_string_lossy().as_bytes())
            .map_err(|_| BackingError::Invalid("path contains a NUL byte"))?;
        let rc = unsafe { libc::mknod(c_path.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) };
        if rc != 0 {
            return Err(BackingError::Io(std::io::Error::last_os_error()));
        }
        Ok(Arc::new(LocalHandle::from_path(path, false)?))
    }

    fn symlink(&self, dir: &Arc<LocalHandle>, name: &str, target: &str) -> Result<Arc<LocalHandle>> {
        if dir.attrs.kind != FileKind::Directory {
            return Err(BackingError::NotADirectory);
        }
        let path = dir.path.join(name);
        std::os::unix::fs::symlink(target, &path)?;
        Ok(Arc::new(LocalHandle::from_path(path, false)?))
    }

    fn readlink(&self, handle: &Arc<LocalHandle>) -> Result<String> {
        let target = fs::read_link(&handle.path)?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn unlink(&self, dir: &Arc<LocalHandle>, name: &str) -> Result<()> {
        let path = dir.path.join(name);
        fs::remove_file(&path).map_err(|e| map_not_found(e))
    }

    fn rmdir(&self, dir: &Arc<LocalHandle>, name: &str) -> Result<()> {
        let path = dir.path.join(name);
        fs::remove_dir(&path).map_err(|e| map_not_found(e))
    }

    fn rename(
        &self,
        old_dir: &Arc<LocalHandle>,
        old_name: &str,
        new_dir: &Arc<LocalHandle>,
        new_name: &str,
    ) -> Result<()> {
        if old_dir.attrs.id.dev != new_dir.attrs.id.dev {
            return Err(BackingError::CrossDevice);
        }
        let old_path = old_dir.path.join(old_name);
        let new_path = new_dir.path.join(new_name);
        fs::rename(&old_path, &new_path).map_err(|e| map_not_found(e))
    }

    fn stat(&self, handle: &Arc<LocalHandle>) -> Result<Attrs> {
        Ok(handle.attrs)
    }

    fn setattr(&self, handle: &Arc<LocalHandle>, changes: &SetAttr) -> Result<()> {
        if let Some(perm) = changes.perm {
            let mut perms = fs::metadata(&handle.path)?.permissions();
            perms.set_mode(perm & 0o7777);
            fs::set_permissions(&handle.path, perms)?;
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            self.chown(
                handle,
                changes.uid.unwrap_or(handle.attrs.uid),
                changes.gid.unwrap_or(handle.attrs.gid),
            )?;
        }
        if let Some(size) = changes.size {
            self.truncate(handle, size)?;
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            set_times(&handle.path, changes.atime, changes.mtime)?;
        }
        Ok(())
    }

    fn truncate(&self, handle: &Arc<LocalHandle>, length: u64) -> Result<()> {
        let guard = handle.file.lock().unwrap();
        if let Some(file) = guard.as_ref() {
            file.set_len(length)?;
        } else {
            let file = OpenOptions::new().write(true).open(&handle.path)?;
            file.set_len(length)?;
        }
        Ok(())
    }

    fn chown(&self, handle: &Arc<LocalHandle>, uid: u32, gid: u32) -> Result<()> {
        let c_path = std::ffi::CString::new(handle.path.as_os_str().to_string_lossy().as_bytes())
            .map_err(|_| BackingError::Invalid("path contains a NUL byte"))?;
        let rc = unsafe { libc::chown(c_path.as_ptr(), uid as libc::uid_t, gid as libc::gid_t) };
        if rc != 0 {
            return Err(BackingError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn readdir(&self, dir: &Arc<LocalHandle>) -> Result<Vec<String>> {
        if dir.attrs.kind != FileKind::Directory {
            return Err(BackingError::NotADirectory);
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir.path)? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn follow_mount(&self, handle: &Arc<LocalHandle>) -> Result<Arc<LocalHandle>> {
        // Real directory paths already cross bind/submounts transparently
        // at the syscall level; there is nothing further to resolve here.
        // Refusing to ever resolve onto this overlay's own device number is
        // the resolver's job in `ovlfs-core`, which is the only place that
        // knows that number.
        Ok(handle.clone())
    }
}

fn set_unix_mode(file: &File, mode: u32) -> Result<()> {
    let mut perms = file.metadata()?.permissions();
    perms.set_mode(mode & 0o7777);
    file.set_permissions(perms)?;
    Ok(())
}

fn set_times(path: &Path, atime: Option<i64>, mtime: Option<i64>) -> Result<()> {
    let c_path = std::ffi::CString::new(path.as_os_str().to_string_lossy().as_bytes())
        .map_err(|_| BackingError::Invalid("path contains a NUL byte"))?;
    let mk = |secs: Option<i64>| libc::timespec {
        tv_sec: secs.unwrap_or(0) as libc::time_t,
        tv_nsec: if secs.is_some() { 0 } else { libc::UTIME_OMIT },
    };
    let times = [mk(atime), mk(mtime)];
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) };
    if rc != 0 {
        return Err(BackingError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn map_not_found(e: std::io::Error) -> BackingError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BackingError::NotFound
    } else {
        BackingError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> (tempfile::TempDir, Arc<LocalHandle>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let handle = LocalFs::root_handle(dir.path()).expect("root handle");
        (dir, handle)
    }

    #[test]
    fn create_then_lookup_roundtrips() {
        let fs = LocalFs::default();
        let (_dir, root) = root();
        let file = fs.create(&root, "greeting", 0o644).expect("create");
        fs.write(&file, 0, b"hello").expect("write");
        let looked_up = fs.lookup_child(&root, "greeting").expect("lookup");
        assert_eq!(looked_up.attrs.kind, FileKind::Regular);
        let opened = fs.open(&looked_up, OpenFlags::READ).expect("open");
        let data = fs.read(&opened, 0, 5).expect("read");
        assert_eq!(data, b"hello");
    }

    #[test]
    fn lookup_missing_child_is_not_found() {
        let fs = LocalFs::default();
        let (_dir, root) = root();
        let err = fs.lookup_child(&root, "nope").unwrap_err();
        assert!(matches!(err, BackingError::NotFound));
    }

    #[test]
    fn rmdir_on_nonempty_directory_fails() {
        let fs = LocalFs::default();
        let (_dir, root) = root();
        let sub = fs.mkdir(&root, "d", 0o755).expect("mkdir");
        fs.create(&sub, "f", 0o644).expect("create");
        let err = fs.rmdir(&root, "d").unwrap_err();
        assert!(matches!(err, BackingError::Io(_)));
    }

    #[test]
    fn readdir_lists_created_entries() {
        let fs = LocalFs::default();
        let (_dir, root) = root();
        fs.create(&root, "a", 0o644).unwrap();
        fs.mkdir(&root, "b", 0o755).unwrap();
        let mut names = fs.readdir(&root).unwrap();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
