//! The Backing FS port itself: the trait every base/storage tree must
//! implement for the overlay core to resolve references and copy files up
//! into storage.

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::Result;
use crate::flags::OpenFlags;
use crate::types::{Attrs, SetAttr};

/// A reference-counted handle into a backing filesystem: either a
/// directory or an open file. Handles are cheap to clone (they share the
/// underlying open resource) and are released when the last clone drops.
pub trait Handle: Debug + Send + Sync {}

/// The uniform operation set the overlay core calls against the base and
/// the storage tree. Implementations MUST be safe to call concurrently on
/// distinct handles (see the specification's concurrency model, §5); the
/// core serializes mutations that touch a single logical inode, not calls
/// into this port.
pub trait BackingFs: Send + Sync {
    /// The handle type returned by this backing filesystem.
    type H: Handle + 'static;

    /// Resolve `name` as a child of `dir`. Returns
    /// [`crate::error::BackingError::NotFound`] for a negative entry.
    fn lookup_child(&self, dir: &Arc<Self::H>, name: &str) -> Result<Arc<Self::H>>;

    /// Open an existing file or directory handle for I/O.
    fn open(&self, handle: &Arc<Self::H>, flags: OpenFlags) -> Result<Arc<Self::H>>;

    /// Read up to `len` bytes starting at `offset`. May return fewer bytes
    /// than requested only at end of file.
    fn read(&self, handle: &Arc<Self::H>, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, returning the number of bytes written. A
    /// short write is reported to the caller, not silently retried; the
    /// overlay's copy-up engine treats it as an error.
    fn write(&self, handle: &Arc<Self::H>, offset: u64, data: &[u8]) -> Result<u64>;

    /// Create a new regular file named `name` under `dir`.
    fn create(&self, dir: &Arc<Self::H>, name: &str, mode: u32) -> Result<Arc<Self::H>>;

    /// Create a new directory named `name` under `dir`.
    fn mkdir(&self, dir: &Arc<Self::H>, name: &str, mode: u32) -> Result<Arc<Self::H>>;

    /// Create a special file (fifo, device node) named `name` under `dir`.
    fn mknod(&self, dir: &Arc<Self::H>, name: &str, mode: u32, rdev: u64) -> Result<Arc<Self::H>>;

    /// Create a symlink named `name` under `dir`, pointing at `target`.
    fn symlink(&self, dir: &Arc<Self::H>, name: &str, target: &str) -> Result<Arc<Self::H>>;

    /// Read the target of a symlink handle.
    fn readlink(&self, handle: &Arc<Self::H>) -> Result<String>;

    /// Remove a non-directory entry named `name` under `dir`.
    fn unlink(&self, dir: &Arc<Self::H>, name: &str) -> Result<()>;

    /// Remove an empty directory entry named `name` under `dir`.
    fn rmdir(&self, dir: &Arc<Self::H>, name: &str) -> Result<()>;

    /// Rename `old_name` under `old_dir` to `new_name` under `new_dir`.
    /// Fails with [`crate::error::BackingError::CrossDevice`] when the two
    /// directories live on distinct backing devices.
    fn rename(
        &self,
        old_dir: &Arc<Self::H>,
        old_name: &str,
        new_dir: &Arc<Self::H>,
        new_name: &str,
    ) -> Result<()>;

    /// Stat a handle.
    fn stat(&self, handle: &Arc<Self::H>) -> Result<Attrs>;

    /// Apply a partial attribute change to a handle.
    fn setattr(&self, handle: &Arc<Self::H>, changes: &SetAttr) -> Result<()>;

    /// Truncate (or extend with zeroes) a regular file handle to `length`.
    fn truncate(&self, handle: &Arc<Self::H>, length: u64) -> Result<()>;

    /// Change ownership of a handle.
    fn chown(&self, handle: &Arc<Self::H>, uid: u32, gid: u32) -> Result<()>;

    /// List the names of the directory's live entries, in backing order.
    /// Used by the overlay's `readdir` to merge base and storage listings.
    fn readdir(&self, dir: &Arc<Self::H>) -> Result<Vec<String>>;

    /// If a distinct filesystem is mounted on `handle`, return its root.
    /// Otherwise return `handle` unchanged. Never crosses into the overlay
    /// mount itself; implementations detect that case by device number and
    /// return [`crate::error::BackingError::Invalid`].
    fn follow_mount(&self, handle: &Arc<Self::H>) -> Result<Arc<Self::H>>;
}
