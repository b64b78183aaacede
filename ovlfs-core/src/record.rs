//! The persisted record kinds written to the record log: one variant per
//! component that needs to survive an unmount (inode attributes, directory
//! entries, reverse map entries), plus a tombstone kind so a record can be
//! logically removed without rewriting the whole log before the next
//! compaction.

use serde::{Deserialize, Serialize};

use crate::inode::Lino;

/// One persisted inode's attributes, mirroring [`crate::inode::Record`]
/// minus its live backing handles (those cannot survive an unmount).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedInode {
    pub lino: Lino,
    pub parent_lino: Lino,
    pub name: String,
    pub kind_tag: u8,
    pub symlink_target: String,
    pub flags: u32,
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
    pub base_ref: Option<(u64, u64)>,
    pub storage_ref: Option<(u64, u64)>,
}

/// Tag values for [`PersistedInode::kind_tag`].
pub mod kind_tag {
    pub const DIRECTORY: u8 = 0;
    pub const FILE: u8 = 1;
    pub const SYMLINK: u8 = 2;
    pub const SPECIAL: u8 = 3;
}

/// One persisted directory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedDirent {
    pub dir_lino: Lino,
    pub name: String,
    pub target_lino: Lino,
    pub flags: u32,
}

/// One persisted reverse-map entry: `lino` resolves to `(dev, ino)` on the
/// named side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedMap {
    pub lino: Lino,
    pub dev: u64,
    pub ino: u64,
    pub is_storage_side: bool,
}

/// A single frame in the record log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Record {
    Inode(PersistedInode),
    Dirent(PersistedDirent),
    Map(PersistedMap),
    /// Logically erases a previously written `Inode` record for this lino.
    /// Left in place until the next compaction.
    TombstoneInode(Lino),
    /// Logically erases a previously written `Dirent` record.
    TombstoneDirent(Lino, String),
    /// Logically erases a previously written `Map` record.
    TombstoneMap(Lino, bool),
}
