//! The Backing FS port: the minimal operation set the overlay core needs
//! from whichever filesystem hosts the base and storage trees, plus the
//! shared value types that flow across that boundary.
//!
//! This crate is deliberately narrow. It does not know anything about
//! logical inodes, tombstones, or copy-up; that is `ovlfs-core`'s job. It
//! only describes the contract a backing filesystem must satisfy, and
//! provides one concrete implementation of that contract (`local::LocalFs`)
//! against real OS directories.

#![deny(missing_docs)]

pub mod error;
pub mod flags;
pub mod local;
pub mod port;
pub mod types;

pub use error::{BackingError, Result};
pub use flags::OpenFlags;
pub use port::{BackingFs, Handle};
pub use types::{Attrs, DevIno, FileKind, SetAttr};
