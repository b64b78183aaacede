//! Named flag sets for the logical inode graph (distinct from
//! `ovlfs_api::flags::OpenFlags`, which governs the backing port instead).

use bitflags::bitflags;

bitflags! {
    /// Flags carried on a logical inode record.
    #[derive(Default)]
    pub struct InodeFlags: u32 {
        /// The logical size is authoritative; reads past it are zero-filled
        /// rather than falling through to a longer backing file.
        const SIZE_LIMIT = 0b0000_0001;
        /// This logical inode must never be resolved against the base
        /// side, regardless of any stale `base_ref` still on the record.
        const NO_BASE_REF = 0b0000_0010;
    }
}

bitflags! {
    /// Flags carried on a single directory entry.
    #[derive(Default)]
    pub struct DirentFlags: u32 {
        /// Tombstone: hides a same-named base-side entry without removing
        /// it; the slot's `target_lino` is preserved for resurrection.
        const UNLINKED = 0b0000_0001;
        /// The slot was unlinked and then rebound to a new logical inode;
        /// treated as unlinked for base-resolution purposes.
        const RELINKED = 0b0000_0010;
    }
}

bitflags! {
    /// Policy knobs passed to the resolver for a single resolution call.
    pub struct ResolveFlags: u32 {
        /// Materialize missing intermediate ancestor directories on the
        /// storage side while walking down. Never applies on the base side.
        const MAKE_HIER = 0b0000_0001;
        /// Materialize the target itself, as a directory, if missing.
        const MAKE_LAST = 0b0000_0010;
        /// Follow a submount mounted on the resolved handle.
        const FOLLOW_MOUNTS = 0b0000_0100;
    }
}

impl Default for ResolveFlags {
    fn default() -> Self {
        ResolveFlags::FOLLOW_MOUNTS
    }
}

/// Which underlying tree a reference or resolution targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The read-only base tree.
    Base,
    /// The read-write storage tree.
    Storage,
}
