//! Primary key/value storage
//!
//! A synchronous string store: LocalStorage in the browser, an in-memory map
//! elsewhere. All methods take `&self`; implementations use interior
//! mutability because the store is shared by every vault component.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("write to {key:?} rejected: {reason}")]
    Rejected { key: String, reason: String },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Synchronous key/value substrate
pub trait KeyValueStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
    /// Every key currently stored
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Rc<T> {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).set_item(key, value)
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        (**self).remove_item(key)
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        (**self).keys()
    }
}

/// Read every entry whose key starts with `prefix`
pub fn entries_with_prefix(
    store: &dyn KeyValueStore,
    prefix: &str,
) -> Result<BTreeMap<String, String>, StorageError> {
    let mut entries = BTreeMap::new();
    for key in store.keys()?.into_iter().filter(|k| k.starts_with(prefix)) {
        if let Some(value) = store.get_item(&key)? {
            entries.insert(key, value);
        }
    }
    Ok(entries)
}

/// In-memory store. Clones share the same map, so a test can hold one
/// handle and tamper with entries behind the vault's back.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    items: Rc<RefCell<BTreeMap<String, String>>>,
    available: Rc<Cell<bool>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self {
            items: Rc::default(),
            available: Rc::new(Cell::new(true)),
        }
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a disabled or inaccessible store
    pub fn set_available(&self, available: bool) {
        self.available.set(available);
    }

    /// Copy of every entry
    pub fn dump(&self) -> BTreeMap<String, String> {
        self.items.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.items.borrow_mut().clear();
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.available.get() {
            Ok(())
        } else {
            Err(StorageError::Unavailable("memory storage disabled".into()))
        }
    }
}

impl KeyValueStore for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check()?;
        Ok(self.items.borrow().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check()?;
        self.items.borrow_mut().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.items.borrow_mut().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.check()?;
        Ok(self.items.borrow().keys().cloned().collect())
    }
}

/// Browser LocalStorage
#[cfg(target_arch = "wasm32")]
pub struct WebStorage {
    storage: web_sys::Storage,
}

#[cfg(target_arch = "wasm32")]
impl WebStorage {
    /// `window.localStorage`, if the browser allows it
    pub fn local() -> Option<Self> {
        let storage = web_sys::window()?.local_storage().ok()??;
        Some(Self { storage })
    }
}

#[cfg(target_arch = "wasm32")]
fn js_error(err: wasm_bindgen::JsValue) -> String {
    err.as_string().unwrap_or_else(|| format!("{err:?}"))
}

#[cfg(target_arch = "wasm32")]
impl KeyValueStore for WebStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.storage
            .get_item(key)
            .map_err(|e| StorageError::Unavailable(js_error(e)))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.storage.set_item(key, value).map_err(|e| StorageError::Rejected {
            key: key.to_string(),
            reason: js_error(e),
        })
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.storage
            .remove_item(key)
            .map_err(|e| StorageError::Unavailable(js_error(e)))
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let len = self
            .storage
            .length()
            .map_err(|e| StorageError::Unavailable(js_error(e)))?;
        let mut keys = Vec::with_capacity(len as usize);
        for i in 0..len {
            if let Ok(Some(key)) = self.storage.key(i) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}
