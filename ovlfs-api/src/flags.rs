//! Named flag sets shared across the port and the engine.

use bitflags::bitflags;

bitflags! {
    /// Flags passed to [`crate::port::BackingFs::open`] / `create`.
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 0b0000_0001;
        /// Open for writing.
        const WRITE = 0b0000_0010;
        /// Create the file if it does not exist.
        const CREATE = 0b0000_0100;
        /// Fail if the file already exists (used with `CREATE`).
        const EXCL = 0b0000_1000;
        /// Truncate an existing file to zero length on open.
        const TRUNCATE = 0b0001_0000;
        /// Force writes to start at the current end of file.
        const APPEND = 0b0010_0000;
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        OpenFlags::READ
    }
}
