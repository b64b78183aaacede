//! The per-directory ordered entry list: `(name, target_lino, flags)`
//! triples, with `UNLINKED` tombstones and `RELINKED` resurrection
//! tracked per slot.
//!
//! Entries live in a `Vec<Option<Slot>>` per directory rather than a plain
//! `Vec<Slot>` so that a hard removal never shifts a later entry's index;
//! `iterate`'s cursor is just that index, and stays valid across mutations
//! unrelated to the slot it points at.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{OverlayError, Result};
use ovlfs_api::error::BackingError;
use crate::flags::DirentFlags;
use crate::inode::Lino;
use crate::persist::PersistStore;
use crate::record::{PersistedDirent, Record};

#[derive(Debug, Clone)]
struct Slot {
    name: String,
    target_lino: Lino,
    flags: DirentFlags,
}

/// A directory entry as handed back to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirentView {
    pub target_lino: Lino,
    pub flags: DirentFlags,
}

struct Inner {
    dirs: HashMap<Lino, Vec<Option<Slot>>>,
}

impl Inner {
    fn slots_mut(&mut self, dir_lino: Lino) -> &mut Vec<Option<Slot>> {
        self.dirs.entry(dir_lino).or_insert_with(Vec::new)
    }

    fn find(&self, dir_lino: Lino, name: &str) -> Option<usize> {
        self.dirs.get(&dir_lino).and_then(|slots| {
            slots
                .iter()
                .position(|s| s.as_ref().map(|s| s.name == name).unwrap_or(false))
        })
    }
}

/// The directory-entry store.
pub struct DirStore {
    inner: Mutex<Inner>,
    store: Arc<PersistStore>,
}

impl DirStore {
    /// Build a directory-entry store over an already-replayed persisted
    /// log (sharing the log with [`crate::mapstore::MapStore`]).
    pub fn load(store: Arc<PersistStore>) -> Result<Self> {
        let records = store.replay()?;
        let mut latest: HashMap<(Lino, String), PersistedDirent> = HashMap::new();
        let mut tombstoned = std::collections::HashSet::new();
        for record in &records {
            if let Record::TombstoneDirent(dir_lino, name) = record {
                tombstoned.insert((*dir_lino, name.clone()));
            }
        }
        for record in records {
            if let Record::Dirent(d) = record {
                latest.insert((d.dir_lino, d.name.clone()), d);
            }
        }
        let mut dirs: HashMap<Lino, Vec<Option<Slot>>> = HashMap::new();
        for ((dir_lino, name), d) in latest {
            if tombstoned.contains(&(dir_lino, name.clone())) {
                continue;
            }
            dirs.entry(dir_lino).or_insert_with(Vec::new).push(Some(Slot {
                name: d.name,
                target_lino: d.target_lino,
                flags: DirentFlags::from_bits_truncate(d.flags),
            }));
        }
        Ok(DirStore {
            inner: Mutex::new(Inner { dirs }),
            store,
        })
    }

    fn persist(&self, dir_lino: Lino, slot: &Slot) -> Result<()> {
        self.store.append(&Record::Dirent(PersistedDirent {
            dir_lino,
            name: slot.name.clone(),
            target_lino: slot.target_lino,
            flags: slot.flags.bits(),
        }))
    }

    /// Look up `name` within `dir_lino`. Returns `NotFound` for a missing
    /// or tombstoned slot, matching the dispatcher's lookup contract.
    pub fn lookup(&self, dir_lino: Lino, name: &str) -> Result<DirentView> {
        let inner = self.inner.lock().unwrap();
        let idx = inner
            .find(dir_lino, name)
            .ok_or(OverlayError::Backing(BackingError::NotFound))?;
        let slot = inner.dirs[&dir_lino][idx].as_ref().unwrap();
        if slot.flags.contains(DirentFlags::UNLINKED) {
            return Err(OverlayError::Backing(BackingError::NotFound));
        }
        Ok(DirentView {
            target_lino: slot.target_lino,
            flags: slot.flags,
        })
    }

    /// Look up `name` within `dir_lino` regardless of tombstone state.
    /// `None` means no slot has ever been recorded for this name (the
    /// dispatcher still needs to check the backing trees); `Some` means a
    /// slot exists, tombstoned or not, and the backing trees must not be
    /// consulted again for this name.
    pub fn lookup_raw(&self, dir_lino: Lino, name: &str) -> Option<(Lino, DirentFlags)> {
        let inner = self.inner.lock().unwrap();
        let idx = inner.find(dir_lino, name)?;
        let slot = inner.dirs[&dir_lino][idx].as_ref().unwrap();
        Some((slot.target_lino, slot.flags))
    }

    /// Insert a positive entry. A pre-existing tombstone of the same name
    /// is converted to a relink rather than getting a second slot.
    pub fn add_dirent(&self, dir_lino: Lino, name: &str, target_lino: Lino) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.find(dir_lino, name) {
            let is_tombstone = inner.dirs[&dir_lino][idx]
                .as_ref()
                .map(|s| s.flags.contains(DirentFlags::UNLINKED))
                .unwrap_or(false);
            if !is_tombstone {
                return Err(OverlayError::Backing(BackingError::Exists));
            }
            let slot = Slot {
                name: name.to_string(),
                target_lino,
                flags: DirentFlags::RELINKED,
            };
            self.persist(dir_lino, &slot)?;
            inner.dirs.get_mut(&dir_lino).unwrap()[idx] = Some(slot);
            return Ok(());
        }
        let slot = Slot {
            name: name.to_string(),
            target_lino,
            flags: DirentFlags::empty(),
        };
        self.persist(dir_lino, &slot)?;
        inner.slots_mut(dir_lino).push(Some(slot));
        Ok(())
    }

    /// Fast-path rename when old and new directories coincide.
    pub fn rename_within(&self, dir_lino: Lino, old_name: &str, new_name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let old_idx = inner
            .find(dir_lino, old_name)
            .ok_or(OverlayError::Backing(BackingError::NotFound))?;
        let target_lino = inner.dirs[&dir_lino][old_idx].as_ref().unwrap().target_lino;

        if let Some(dest_idx) = inner.find(dir_lino, new_name) {
            let dest_slot = Slot {
                name: new_name.to_string(),
                target_lino,
                flags: DirentFlags::empty(),
            };
            self.persist(dir_lino, &dest_slot)?;
            inner.dirs.get_mut(&dir_lino).unwrap()[dest_idx] = Some(dest_slot);
        } else {
            let dest_slot = Slot {
                name: new_name.to_string(),
                target_lino,
                flags: DirentFlags::empty(),
            };
            self.persist(dir_lino, &dest_slot)?;
            inner.slots_mut(dir_lino).push(Some(dest_slot));
        }
        self.store
            .append(&Record::TombstoneDirent(dir_lino, old_name.to_string()))?;
        inner.dirs.get_mut(&dir_lino).unwrap()[old_idx] = None;
        Ok(())
    }

    /// General rename: moves `old_name` under `old_dir` to `new_name` under
    /// `new_dir`, which may be the same directory. Overwrites an existing
    /// positive entry at the destination. Returns the moved target's lino.
    pub fn move_entry(
        &self,
        old_dir: Lino,
        old_name: &str,
        new_dir: Lino,
        new_name: &str,
    ) -> Result<Lino> {
        if old_dir == new_dir {
            self.rename_within(old_dir, old_name, new_name)?;
            return Ok(self.lookup(old_dir, new_name)?.target_lino);
        }
        let mut inner = self.inner.lock().unwrap();
        let old_idx = inner
            .find(old_dir, old_name)
            .ok_or(OverlayError::Backing(BackingError::NotFound))?;
        let target_lino = inner.dirs[&old_dir][old_idx].as_ref().unwrap().target_lino;

        let dest_slot = Slot {
            name: new_name.to_string(),
            target_lino,
            flags: DirentFlags::empty(),
        };
        self.persist(new_dir, &dest_slot)?;
        if let Some(dest_idx) = inner.find(new_dir, new_name) {
            inner.dirs.get_mut(&new_dir).unwrap()[dest_idx] = Some(dest_slot);
        } else {
            inner.slots_mut(new_dir).push(Some(dest_slot));
        }

        self.store
            .append(&Record::TombstoneDirent(old_dir, old_name.to_string()))?;
        inner.dirs.get_mut(&old_dir).unwrap()[old_idx] = None;
        Ok(target_lino)
    }

    /// Tombstone `name` within `dir_lino`. Idempotent in effect: a second
    /// call against an already-tombstoned name leaves state unchanged but
    /// still reports `NotFound`, matching `lookup`'s view of the slot.
    pub fn unlink(&self, dir_lino: Lino, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner
            .find(dir_lino, name)
            .ok_or(OverlayError::Backing(BackingError::NotFound))?;
        let persisted = {
            let dirs = inner.dirs.get_mut(&dir_lino).unwrap();
            let slot = dirs[idx].as_mut().unwrap();
            if slot.flags.contains(DirentFlags::UNLINKED) {
                return Err(OverlayError::Backing(BackingError::NotFound));
            }
            slot.flags.insert(DirentFlags::UNLINKED);
            slot.clone()
        };
        self.persist(dir_lino, &persisted)
    }

    /// Hard-remove `name`'s slot entirely, tombstoned or not. Used once the
    /// lifecycle manager determines the target has lost all references.
    pub fn delete_dirent(&self, dir_lino: Lino, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner
            .find(dir_lino, name)
            .ok_or(OverlayError::Backing(BackingError::NotFound))?;
        inner.dirs.get_mut(&dir_lino).unwrap()[idx] = None;
        self.store
            .append(&Record::TombstoneDirent(dir_lino, name.to_string()))
    }

    /// Number of entries in `dir_lino`, optionally counting tombstones.
    pub fn count(&self, dir_lino: Lino, include_unlinked: bool) -> usize {
        let inner = self.inner.lock().unwrap();
        match inner.dirs.get(&dir_lino) {
            None => 0,
            Some(slots) => slots
                .iter()
                .filter(|s| match s {
                    None => false,
                    Some(s) => include_unlinked || !s.flags.contains(DirentFlags::UNLINKED),
                })
                .count(),
        }
    }

    /// Advance from `cursor` (an opaque slot index; `0` starts iteration)
    /// to the next visible entry, returning it with its name and the
    /// cursor to resume from.
    pub fn iterate(
        &self,
        dir_lino: Lino,
        cursor: usize,
        include_unlinked: bool,
    ) -> Option<(String, DirentView, usize)> {
        let inner = self.inner.lock().unwrap();
        let slots = inner.dirs.get(&dir_lino)?;
        for (idx, slot) in slots.iter().enumerate().skip(cursor) {
            if let Some(slot) = slot {
                if include_unlinked || !slot.flags.contains(DirentFlags::UNLINKED) {
                    return Some((
                        slot.name.clone(),
                        DirentView {
                            target_lino: slot.target_lino,
                            flags: slot.flags,
                        },
                        idx + 1,
                    ));
                }
            }
        }
        None
    }

    /// Snapshot every live entry across every directory, for compaction.
    pub fn live_records(&self) -> Vec<Record> {
        let inner = self.inner.lock().unwrap();
        inner
            .dirs
            .iter()
            .flat_map(|(&dir_lino, slots)| {
                slots.iter().filter_map(move |slot| {
                    slot.as_ref().map(|slot| {
                        Record::Dirent(PersistedDirent {
                            dir_lino,
                            name: slot.name.clone(),
                            target_lino: slot.target_lino,
                            flags: slot.flags.bits(),
                        })
                    })
                })
            })
            .collect()
    }
}
