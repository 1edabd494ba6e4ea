//! Vault configuration
//!
//! Timings and clock-skew tolerances. Persisted separately from save data in
//! LocalStorage, outside the vault namespace so it never enters a signature
//! or a snapshot.

use serde::{Deserialize, Serialize};

use crate::consts::*;
use crate::keys::Slot;
#[cfg(target_arch = "wasm32")]
use crate::platform::storage::WebStorage;
use crate::platform::storage::{KeyValueStore, StorageError};

/// Tunables for the vault and its background timers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Key namespace for every persisted entry
    pub namespace: String,
    /// Slot used when no active-slot pointer is stored
    pub default_slot: Slot,

    // === Timers ===
    /// Watcher poll period
    pub watch_interval_ms: u32,
    /// Signature verification period
    pub integrity_interval_ms: u32,
    /// Clock-skew check period
    pub clock_check_interval_ms: u32,
    /// Quiet period before a dirty snapshot is flushed
    pub backup_debounce_ms: u32,
    /// Longest a dirty snapshot may be deferred by repeated writes
    pub backup_max_delay_ms: u32,

    // === Backup ===
    /// Record name in the secondary store
    pub snapshot_record: String,

    // === Clock skew ===
    /// Wall-clock regression tolerated before flagging
    pub clock_backward_tolerance_ms: f64,
    /// Unexplained forward wall-clock divergence tolerated before flagging
    pub clock_forward_tolerance_ms: f64,
    /// Wall-clock elapsed may be up to this multiple of monotonic elapsed
    pub clock_forward_variance: f64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            default_slot: Slot::FIRST,

            watch_interval_ms: WATCH_INTERVAL_MS,
            integrity_interval_ms: INTEGRITY_INTERVAL_MS,
            clock_check_interval_ms: CLOCK_CHECK_INTERVAL_MS,
            backup_debounce_ms: BACKUP_DEBOUNCE_MS,
            backup_max_delay_ms: BACKUP_MAX_DELAY_MS,

            snapshot_record: SNAPSHOT_RECORD.to_string(),

            clock_backward_tolerance_ms: CLOCK_BACKWARD_TOLERANCE_MS,
            clock_forward_tolerance_ms: CLOCK_FORWARD_TOLERANCE_MS,
            clock_forward_variance: CLOCK_FORWARD_VARIANCE,
        }
    }
}

impl VaultConfig {
    /// Parse a (possibly partial) JSON config; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// LocalStorage key
    const STORAGE_KEY: &'static str = "slot_vault_config";

    /// Read the config kept in `storage`, falling back to defaults
    pub fn load_from(storage: &dyn KeyValueStore) -> Self {
        match storage.get_item(Self::STORAGE_KEY) {
            Ok(Some(json)) => match Self::from_json(&json) {
                Ok(config) => {
                    log::info!("Loaded vault config");
                    return config;
                }
                Err(e) => log::warn!("Ignoring malformed vault config: {e}"),
            },
            Ok(None) => {}
            Err(e) => log::warn!("Cannot read vault config: {e}"),
        }

        log::info!("Using default vault config");
        Self::default()
    }

    pub fn save_to(&self, storage: &dyn KeyValueStore) -> Result<(), StorageError> {
        let json = self.to_json()?;
        storage.set_item(Self::STORAGE_KEY, &json)
    }

    /// Load config from LocalStorage (WASM only)
    #[cfg(target_arch = "wasm32")]
    pub fn load() -> Self {
        match WebStorage::local() {
            Some(storage) => Self::load_from(&storage),
            None => {
                log::info!("No LocalStorage, using default vault config");
                Self::default()
            }
        }
    }

    /// Save config to LocalStorage (WASM only)
    #[cfg(target_arch = "wasm32")]
    pub fn save(&self) {
        let Some(storage) = WebStorage::local() else {
            log::warn!("No LocalStorage, vault config not saved");
            return;
        };
        match self.save_to(&storage) {
            Ok(()) => log::info!("Vault config saved"),
            Err(e) => log::warn!("Failed to save vault config: {e}"),
        }
    }

    /// Native stubs
    #[cfg(not(target_arch = "wasm32"))]
    pub fn load() -> Self {
        Self::default()
    }

    #[cfg(not(target_arch = "wasm32"))]
    pub fn save(&self) {
        // No-op for native
    }
}
