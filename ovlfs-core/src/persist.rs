//! The record log: a growable, memory-mapped file holding the persisted
//! records for one mount, following the same `Device`-over-`MmapMut`
//! pattern as the teacher crate's block device, adapted for a
//! variable-length append log rather than fixed-size blocks.
//!
//! Layout: an 8-byte little-endian header giving the number of live bytes
//! that follow, then a sequence of `(u32 length, bincode bytes)` frames.
//! The file may be larger than `header + live bytes`; the remainder is
//! reserved, zeroed growing room so appends do not have to remap on every
//! call.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use memmap::{MmapMut, MmapOptions};

use crate::error::{OverlayError, Result};
use crate::record::Record;

const HEADER_LEN: u64 = 8;
const INITIAL_CAPACITY: u64 = 4096;

/// A growable append log of [`Record`] frames, backed by a memory-mapped
/// file.
#[derive(Debug)]
pub struct RecordLog {
    path: PathBuf,
    file: File,
    contents: MmapMut,
    /// Number of live payload bytes following the header.
    used: u64,
}

impl RecordLog {
    /// Create a fresh, empty record log at `path`. Fails if the file
    /// already exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(HEADER_LEN + INITIAL_CAPACITY)?;
        let mut contents = unsafe { MmapOptions::new().map_mut(&file)? };
        contents[0..8].copy_from_slice(&0u64.to_le_bytes());
        Ok(RecordLog {
            path,
            file,
            contents,
            used: 0,
        })
    }

    /// Open an existing record log at `path`, replaying its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len < HEADER_LEN {
            return Err(OverlayError::CorruptStore("record log shorter than its header"));
        }
        let contents = unsafe { MmapOptions::new().map_mut(&file)? };
        let used = u64::from_le_bytes(contents[0..8].try_into().unwrap());
        if HEADER_LEN + used > len {
            return Err(OverlayError::CorruptStore("record log header exceeds file length"));
        }
        Ok(RecordLog {
            path,
            file,
            contents,
            used,
        })
    }

    /// Open the log at `path` if it exists, otherwise create a fresh one.
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            RecordLog::open(path)
        } else {
            RecordLog::create(path)
        }
    }

    /// Append one record, growing the backing file if needed.
    pub fn append(&mut self, record: &Record) -> Result<()> {
        let body = bincode::serialize(record)?;
        let frame_len = 4 + body.len() as u64;
        self.ensure_capacity(self.used + frame_len)?;

        let start = (HEADER_LEN + self.used) as usize;
        self.contents[start..start + 4].copy_from_slice(&(body.len() as u32).to_le_bytes());
        self.contents[start + 4..start + 4 + body.len()].copy_from_slice(&body);
        self.used += frame_len;
        self.contents[0..8].copy_from_slice(&self.used.to_le_bytes());
        Ok(())
    }

    /// Replay every live frame in the log, in write order.
    pub fn replay(&self) -> Result<Vec<Record>> {
        let mut out = Vec::new();
        let mut off = HEADER_LEN;
        let end = HEADER_LEN + self.used;
        while off < end {
            let len_bytes: [u8; 4] = self.contents[off as usize..off as usize + 4]
                .try_into()
                .unwrap();
            let len = u32::from_le_bytes(len_bytes) as u64;
            off += 4;
            let body = &self.contents[off as usize..(off + len) as usize];
            let record: Record = bincode::deserialize(body)?;
            out.push(record);
            off += len;
        }
        Ok(out)
    }

    /// Rewrite the whole log to contain exactly `records`, discarding any
    /// tombstoned or superseded frames. Performed at unmount (or whenever
    /// the caller decides the log has grown too large relative to its live
    /// content).
    pub fn compact(&mut self, records: &[Record]) -> Result<()> {
        self.contents[0..8].copy_from_slice(&0u64.to_le_bytes());
        self.used = 0;
        for record in records {
            self.append(record)?;
        }
        Ok(())
    }

    /// Flush pending writes to disk without closing the log.
    pub fn flush(&self) -> Result<()> {
        self.contents.flush()?;
        Ok(())
    }

    /// Path of the file backing this log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_capacity(&mut self, needed: u64) -> Result<()> {
        let capacity = self.contents.len() as u64 - HEADER_LEN;
        if needed <= capacity {
            return Ok(());
        }
        let mut new_capacity = capacity.max(INITIAL_CAPACITY);
        while new_capacity < needed {
            new_capacity *= 2;
        }
        self.file.set_len(HEADER_LEN + new_capacity)?;
        self.file.flush()?;
        self.contents = unsafe { MmapOptions::new().map_mut(&self.file)? };
        Ok(())
    }
}

impl Drop for RecordLog {
    fn drop(&mut self) {
        let _ = self.contents.flush();
    }
}

/// Thread-safe handle onto one mount's record log, shared by the inode-map
/// store and the directory-entry store. Matches the "single global mutex
/// for the persisted structures" of the concurrency model: every append or
/// compaction, regardless of which component asked for it, is serialized
/// here.
#[derive(Debug)]
pub struct PersistStore {
    log: std::sync::Mutex<RecordLog>,
}

impl PersistStore {
    /// Wrap an already-opened record log.
    pub fn new(log: RecordLog) -> Self {
        PersistStore {
            log: std::sync::Mutex::new(log),
        }
    }

    /// Append one record.
    pub fn append(&self, record: &Record) -> Result<()> {
        self.log.lock().unwrap().append(record)
    }

    /// Replay every live record, in write order.
    pub fn replay(&self) -> Result<Vec<Record>> {
        self.log.lock().unwrap().replay()
    }

    /// Rewrite the log to contain exactly `records`.
    pub fn compact(&self, records: &[Record]) -> Result<()> {
        self.log.lock().unwrap().compact(records)
    }

    /// Flush pending writes without closing the log.
    pub fn flush(&self) -> Result<()> {
        self.log.lock().unwrap().flush()
    }

    /// Path of the file backing this store's log.
    pub fn path(&self) -> PathBuf {
        self.log.lock().unwrap().path().to_path_buf()
    }
}
