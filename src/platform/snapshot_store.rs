//! Secondary durable store for snapshots
//!
//! Holds named string records. Completion is reported through a callback:
//! IndexedDB finishes asynchronously, the native stores call back before
//! returning.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use super::storage::StorageError;
use crate::persistence::envelope::SnapshotEnvelope;

pub type SaveCallback = Box<dyn FnOnce(Result<(), StorageError>)>;
pub type LoadCallback = Box<dyn FnOnce(Result<Option<String>, StorageError>)>;

pub trait SnapshotStore {
    fn save(&self, record: &str, payload: String, done: SaveCallback);
    fn load(&self, record: &str, done: LoadCallback);
}

/// In-memory snapshot store with failure injection.
///
/// In deferred mode completions queue up until [`MemorySnapshotStore::complete_pending`],
/// which models the asynchronous completion of a browser store.
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    records: Rc<RefCell<HashMap<String, String>>>,
    fail_saves: Rc<Cell<u32>>,
    saves: Rc<Cell<u32>>,
    deferred: Rc<Cell<bool>>,
    pending: Rc<RefCell<Vec<Box<dyn FnOnce()>>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` saves
    pub fn fail_next_saves(&self, n: u32) {
        self.fail_saves.set(n);
    }

    pub fn set_deferred(&self, deferred: bool) {
        self.deferred.set(deferred);
    }

    /// Run queued completions; returns how many ran
    pub fn complete_pending(&self) -> usize {
        let pending: Vec<_> = self.pending.borrow_mut().drain(..).collect();
        let n = pending.len();
        for f in pending {
            f();
        }
        n
    }

    /// Successful saves so far
    pub fn save_count(&self) -> u32 {
        self.saves.get()
    }

    pub fn record(&self, record: &str) -> Option<String> {
        self.records.borrow().get(record).cloned()
    }

    pub fn put_record(&self, record: &str, payload: impl Into<String>) {
        self.records.borrow_mut().insert(record.to_string(), payload.into());
    }

    fn finish(&self, f: Box<dyn FnOnce()>) {
        if self.deferred.get() {
            self.pending.borrow_mut().push(f);
        } else {
            f();
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, record: &str, payload: String, done: SaveCallback) {
        let result = if self.fail_saves.get() > 0 {
            self.fail_saves.set(self.fail_saves.get() - 1);
            Err(StorageError::Rejected {
                key: record.to_string(),
                reason: "injected failure".into(),
            })
        } else {
            self.records.borrow_mut().insert(record.to_string(), payload);
            self.saves.set(self.saves.get() + 1);
            Ok(())
        };
        self.finish(Box::new(move || done(result)));
    }

    fn load(&self, record: &str, done: LoadCallback) {
        let result = self.record(record);
        self.finish(Box::new(move || done(Ok(result))));
    }
}

/// JSON files in a directory with tmp/backup rotation:
/// write `<record>.json.tmp`, move the old `<record>.json` to
/// `<record>.json.bak`, then rename the tmp file into place. Loading
/// returns the first of the two files holding an envelope that opens.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, record: &str) -> PathBuf {
        self.dir.join(format!("{record}.json"))
    }

    fn sibling(path: &Path, suffix: &str) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn write(&self, record: &str, payload: &str) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(record);
        let tmp = Self::sibling(&path, ".tmp");
        fs::write(&tmp, payload)?;
        if path.exists() {
            fs::rename(&path, Self::sibling(&path, ".bak"))?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read(&self, record: &str) -> Result<Option<String>, StorageError> {
        let path = self.path(record);
        for candidate in [path.clone(), Self::sibling(&path, ".bak")] {
            match fs::read_to_string(&candidate) {
                Ok(text) => match SnapshotEnvelope::open(&text) {
                    Ok(_) => return Ok(Some(text)),
                    Err(e) => log::warn!("Skipping snapshot file {}: {e}", candidate.display()),
                },
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => log::warn!("Cannot read snapshot file {}: {e}", candidate.display()),
            }
        }
        Ok(None)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, record: &str, payload: String, done: SaveCallback) {
        done(self.write(record, &payload));
    }

    fn load(&self, record: &str, done: LoadCallback) {
        done(self.read(record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::envelope::Snapshot;

    fn sealed(reason: &str) -> String {
        let snapshot = Snapshot {
            entries: [("vault:coins:1".to_string(), "500".to_string())].into(),
            timestamp_ms: 1,
            reason: reason.into(),
        };
        SnapshotEnvelope::seal(snapshot).unwrap().to_json().unwrap()
    }

    fn save_sync(store: &dyn SnapshotStore, record: &str, payload: &str) -> Result<(), StorageError> {
        let out = Rc::new(RefCell::new(None));
        let o = out.clone();
        store.save(record, payload.to_string(), Box::new(move |r| *o.borrow_mut() = Some(r)));
        out.borrow_mut().take().expect("save completed")
    }

    fn load_sync(store: &dyn SnapshotStore, record: &str) -> Option<String> {
        let out = Rc::new(RefCell::new(None));
        let o = out.clone();
        store.load(record, Box::new(move |r| *o.borrow_mut() = Some(r)));
        let result = out.borrow_mut().take().expect("load completed");
        result.unwrap()
    }

    #[test]
    fn test_memory_store_failure_injection() {
        let store = MemorySnapshotStore::new();
        store.fail_next_saves(1);
        assert!(save_sync(&store, "snap", "a").is_err());
        assert!(save_sync(&store, "snap", "b").is_ok());
        assert_eq!(store.save_count(), 1);
        assert_eq!(load_sync(&store, "snap").as_deref(), Some("b"));
    }

    #[test]
    fn test_memory_store_deferred_completion() {
        let store = MemorySnapshotStore::new();
        store.set_deferred(true);
        let done = Rc::new(Cell::new(false));
        let d = done.clone();
        store.save("snap", "x".into(), Box::new(move |r| d.set(r.is_ok())));
        assert!(!done.get());
        assert_eq!(store.complete_pending(), 1);
        assert!(done.get());
    }

    #[test]
    fn test_file_store_rotates_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());

        save_sync(&store, "snap", &sealed("first")).unwrap();
        save_sync(&store, "snap", &sealed("second")).unwrap();

        let path = store.path("snap");
        assert_eq!(fs::read_to_string(&path).unwrap(), sealed("second"));
        assert_eq!(fs::read_to_string(FileSnapshotStore::sibling(&path, ".bak")).unwrap(), sealed("first"));
        assert!(!FileSnapshotStore::sibling(&path, ".tmp").exists());
    }

    #[test]
    fn test_file_store_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());

        save_sync(&store, "snap", &sealed("first")).unwrap();
        save_sync(&store, "snap", &sealed("second")).unwrap();
        fs::remove_file(store.path("snap")).unwrap();

        assert_eq!(load_sync(&store, "snap"), Some(sealed("first")));
        assert_eq!(load_sync(&store, "missing"), None);
    }

    #[test]
    fn test_file_store_skips_corrupt_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());

        save_sync(&store, "snap", &sealed("first")).unwrap();
        save_sync(&store, "snap", &sealed("second")).unwrap();
        fs::write(store.path("snap"), sealed("second").replace("500", "900")).unwrap();
        assert_eq!(load_sync(&store, "snap"), Some(sealed("first")));

        fs::write(store.path("snap"), "").unwrap();
        assert_eq!(load_sync(&store, "snap"), Some(sealed("first")));

        fs::write(FileSnapshotStore::sibling(&store.path("snap"), ".bak"), "{").unwrap();
        assert_eq!(load_sync(&store, "snap"), None);
    }
}
