//! The storage-method registry: a process-wide, named, reference-counted
//! list of persistence backends, mirroring the source's
//! `ovlfs_storage_sys_struct` linked list without the process-wide global
//! — ownership lives on the [`Registry`] value the host constructs once.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{OverlayError, Result};

struct Entry {
    use_count: usize,
}

/// Registry of named persistence backends. Only one backend ships with
/// this crate (the record-log format used throughout `ovlfs-core`), but
/// mounting code can register alternates under other names before calling
/// `Overlay::mount` with a chosen `stg_method`.
pub struct Registry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Registry {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a persistence method under `name`. Fails with
    /// [`OverlayError::Busy`] if the name is already taken.
    pub fn register(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(name) {
            return Err(OverlayError::Busy);
        }
        entries.insert(name.to_string(), Entry { use_count: 0 });
        Ok(())
    }

    /// Unregister `name`. Fails with [`OverlayError::Busy`] if any mount
    /// still holds it acquired.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(name) {
            None => Err(OverlayError::BadHandle),
            Some(entry) if entry.use_count > 0 => Err(OverlayError::Busy),
            Some(_) => {
                entries.remove(name);
                Ok(())
            }
        }
    }

    /// Acquire a use of `name` for the duration of one mount, bumping its
    /// reference count.
    pub fn acquire(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(name).ok_or(OverlayError::BadHandle)?;
        entry.use_count += 1;
        Ok(())
    }

    /// Release a use of `name` acquired via [`Registry::acquire`].
    pub fn release(&self, name: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(name) {
            entry.use_count = entry.use_count.saturating_sub(1);
        }
    }

    /// Name of the one backend this crate ships with.
    pub const BUILTIN_RECORD_LOG: &'static str = "record_log";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_register_is_busy() {
        let reg = Registry::new();
        reg.register("a").unwrap();
        assert!(matches!(reg.register("a"), Err(OverlayError::Busy)));
    }

    #[test]
    fn unregister_in_use_is_busy() {
        let reg = Registry::new();
        reg.register("a").unwrap();
        reg.acquire("a").unwrap();
        assert!(matches!(reg.unregister("a"), Err(OverlayError::Busy)));
        reg.release("a");
        assert!(reg.unregister("a").is_ok());
    }
}
