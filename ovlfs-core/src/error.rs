//! The engine's error type: wraps [`ovlfs_api::error::BackingError`] the way
//! the teacher crate layers a block-level error inside a higher-level one,
//! and adds the error kinds that only make sense once there is a logical
//! inode graph to reason about.

use ovlfs_api::error::BackingError;
use thiserror::Error;

/// Error type returned by every `ovlfs-core` operation.
#[derive(Error, Debug)]
pub enum OverlayError {
    /// Propagated unchanged from the backing FS port.
    #[error(transparent)]
    Backing(#[from] BackingError),

    /// The persisted record log is corrupt or has an unsupported record tag.
    #[error("corrupt persisted store: {0}")]
    CorruptStore(&'static str),

    /// Serialization of a persisted record failed.
    #[error("record serialization failure")]
    Serialize(#[from] bincode::Error),

    /// I/O failure on the record log itself, as opposed to on the backing
    /// FS port.
    #[error("record log I/O error")]
    Io(#[from] std::io::Error),

    /// A caller supplied a logical inode number this mount has no record of.
    #[error("no such logical inode")]
    BadHandle,

    /// The resolver would have had to walk back into this overlay's own
    /// mount to resolve a reference.
    #[error("resolver self-reference")]
    Deadlock,

    /// `mknod` was attempted against a handle that is itself an overlay
    /// inode, which would recurse.
    #[error("operation would recurse into this overlay")]
    Loop,

    /// Unregistering a persistence method that is still in use, or
    /// registering one under a name already taken.
    #[error("storage method busy")]
    Busy,
}

impl OverlayError {
    /// Map this error to the errno-style kind named in the specification's
    /// error table, for callers that want a stable symbolic name rather
    /// than matching on the full variant set.
    pub fn errno(&self) -> &'static str {
        match self {
            OverlayError::Backing(BackingError::NotFound) => "ENOENT",
            OverlayError::Backing(BackingError::NotADirectory) => "ENOTDIR",
            OverlayError::Backing(BackingError::Exists) => "EEXIST",
            OverlayError::Backing(BackingError::NotEmpty) => "ENOTEMPTY",
            OverlayError::Backing(BackingError::CrossDevice) => "EXDEV",
            OverlayError::Backing(BackingError::Invalid(_)) => "EINVAL",
            OverlayError::Backing(BackingError::NoSpace) => "ENOSPC",
            OverlayError::Backing(BackingError::Io(_)) => "EIO",
            OverlayError::CorruptStore(_) => "EIO",
            OverlayError::Serialize(_) => "EIO",
            OverlayError::Io(_) => "EIO",
            OverlayError::BadHandle => "EBADF",
            OverlayError::Deadlock => "EDEADLK",
            OverlayError::Loop => "ELOOP",
            OverlayError::Busy => "EBUSY",
        }
    }

    /// True for the one error the resolver recovers from internally while
    /// walking ancestors; every other kind propagates immediately.
    pub fn is_not_found(&self) -> bool {
        matches!(self, OverlayError::Backing(BackingError::NotFound))
    }
}

/// Generic alias for a `Result` with the error type [`OverlayError`].
pub type Result<T> = std::result::Result<T, OverlayError>;
