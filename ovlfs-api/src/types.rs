//! Shared value types that cross the Backing FS port boundary.
//!
//! These mirror a POSIX `stat(2)` structure closely enough that both the
//! `LocalFs` backing and the overlay core's logical inode record (in
//! `ovlfs-core`) can be built from the same vocabulary, the way the teacher
//! crate's `DInode` and `SuperBlock` are shared between the block layer and
//! everything built on top of it.

use serde::{Deserialize, Serialize};

/// Identifies a concrete inode in one of the underlying (base or storage)
/// filesystems: the `(device, inode)` pair named throughout the
/// specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevIno {
    /// Device number of the backing filesystem.
    pub dev: u64,
    /// Inode number within that device.
    pub ino: u64,
}

impl DevIno {
    /// Build a `(dev, ino)` pair.
    pub fn new(dev: u64, ino: u64) -> Self {
        DevIno { dev, ino }
    }
}

/// The kind of a file, mirroring the POSIX `S_IF*` family without
/// depending on any particular host's constant values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    /// Regular file.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Character device (`rdev` is meaningful).
    CharDevice,
    /// Block device (`rdev` is meaningful).
    BlockDevice,
    /// Named pipe.
    Fifo,
    /// Unix domain socket.
    Socket,
}

/// Attributes of a backing (or logical) file, mirroring `struct stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attrs {
    /// `(dev, ino)` identifying this concrete file, when known.
    pub id: DevIno,
    /// File kind.
    pub kind: FileKind,
    /// Permission bits (the low 12 bits of `st_mode`).
    pub perm: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// File size in bytes.
    pub size: u64,
    /// Hard link count.
    pub nlink: u32,
    /// Last access time, seconds since the epoch.
    pub atime: i64,
    /// Last modification time, seconds since the epoch.
    pub mtime: i64,
    /// Last status-change time, seconds since the epoch.
    pub ctime: i64,
    /// Number of 512-byte blocks allocated.
    pub blocks: u64,
    /// Preferred I/O block size.
    pub blksize: u32,
    /// Device number, meaningful only for `CharDevice`/`BlockDevice`.
    pub rdev: u64,
}

impl Attrs {
    /// `ceil(size / 512)`, used to fill in `blocks` when a backing call
    /// does not report it directly.
    pub fn blocks_for_size(size: u64) -> u64 {
        (size + 511) / 512
    }
}

/// A partial attribute update, as accepted by
/// [`crate::port::BackingFs::setattr`]. Every field is optional so only
/// the attributes the caller actually wants to change are touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttr {
    /// New permission bits.
    pub perm: Option<u32>,
    /// New owning user id.
    pub uid: Option<u32>,
    /// New owning group id.
    pub gid: Option<u32>,
    /// New size (implies truncate/extend).
    pub size: Option<u64>,
    /// New access time, seconds since the epoch.
    pub atime: Option<i64>,
    /// New modification time, seconds since the epoch.
    pub mtime: Option<i64>,
}
