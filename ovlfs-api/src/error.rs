//! Error kinds a Backing FS port call can raise.
//!
//! Mirrors the way the teacher crate keeps a single flat error enum at the
//! bottom layer (`error_given::APIError`) with `#[from]` wrapping of the
//! lower-level `io::Error`, and lets every higher layer add its own wrapper
//! variant around this one.

use std::io;
use thiserror::Error;

/// Error type returned by every [`crate::port::BackingFs`] operation.
///
/// Variant names follow the error *kinds* named in the overlay
/// specification (`NotFound`, `Exists`, `CrossDevice`, ...) rather than
/// the POSIX errno names, so that callers can match on them without
/// depending on a particular host's errno numbering.
#[derive(Error, Debug)]
pub enum BackingError {
    /// No such entry, reference, or handle.
    #[error("not found")]
    NotFound,

    /// Operation required a directory context but the handle is not one.
    #[error("not a directory")]
    NotADirectory,

    /// A positive entry already exists where a negative one was required.
    #[error("already exists")]
    Exists,

    /// `rmdir` attempted on a directory with live entries.
    #[error("directory not empty")]
    NotEmpty,

    /// `rename` would cross backing devices and emulation was not requested.
    #[error("cross-device link")]
    CrossDevice,

    /// Malformed arguments or an internally inconsistent handle.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    /// Out of disk space / inodes in the backing filesystem.
    #[error("no space left on device")]
    NoSpace,

    /// Underlying I/O failure, including short writes.
    #[error("I/O error")]
    Io(#[from] io::Error),
}

/// Generic alias for a `Result` with the error type [`BackingError`].
pub type Result<T> = std::result::Result<T, BackingError>;
