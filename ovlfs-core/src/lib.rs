//! The overlay engine: reference resolution, inode lifecycle, and
//! copy-on-write over whatever [`ovlfs_api::port::BackingFs`] the host
//! provides for the base and storage trees.
//!
//! [`mount::Overlay`] is the crate's single entry point: construct it with
//! [`mount::Overlay::mount`], drive it through the methods in
//! [`dispatcher`], and give it back with [`mount::Overlay::unmount`] when
//! the host is done.

pub mod copyup;
pub mod dirstore;
pub mod dispatcher;
pub mod error;
pub mod flags;
pub mod inode;
pub mod lifecycle;
pub mod mapstore;
pub mod mount;
pub mod persist;
pub mod record;
pub mod refstore;
pub mod registry;
pub mod resolver;

pub use error::{OverlayError, Result};
pub use flags::{DirentFlags, InodeFlags, ResolveFlags, Side};
pub use inode::{Kind, Lino, ROOT_LINO};
pub use mount::{InodeAttrs, MountOptions, OpenFile, Overlay, MAGIC_BASE_LINO, MAGIC_STORAGE_LINO};
pub use registry::Registry;
