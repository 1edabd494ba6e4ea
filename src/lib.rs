//! Slot Vault - save-slot balance persistence for incremental games
//!
//! Core modules:
//! - `amount`: Arbitrary-precision balances with an infinite sentinel
//! - `keys`: Slots, currencies and the namespaced key layout
//! - `events`: Change bus shared by every component
//! - `persistence`: Bank, watchers, integrity verification, backup
//! - `platform`: Browser/native platform abstraction
//! - `vault`: The context wiring it all together

pub mod amount;
pub mod config;
pub mod events;
pub mod keys;
pub mod persistence;
pub mod platform;
pub mod vault;

pub use amount::{Amount, Factor};
pub use config::VaultConfig;
pub use events::{AnomalyKind, EventBus, EventFilter, SubscriptionId, VaultEvent};
pub use keys::{Currency, KeyLayout, Slot};
pub use vault::{Lifecycle, Vault, VaultPlatform};

/// Vault configuration defaults
pub mod consts {
    /// Key namespace (`vault:coins:1`, ...)
    pub const DEFAULT_NAMESPACE: &str = "vault";

    /// Watcher poll period
    pub const WATCH_INTERVAL_MS: u32 = 250;
    /// Signature re-verification period
    pub const INTEGRITY_INTERVAL_MS: u32 = 5000;
    /// Clock-skew check period
    pub const CLOCK_CHECK_INTERVAL_MS: u32 = 1000;

    /// Backup debounce after the last write
    pub const BACKUP_DEBOUNCE_MS: u32 = 1000;
    /// Upper bound on how long writes can keep pushing a backup back
    pub const BACKUP_MAX_DELAY_MS: u32 = 5000;
    /// Snapshot record name in the secondary store
    pub const SNAPSHOT_RECORD: &str = "vault_snapshot";

    /// Wall clock may step back this far (NTP corrections) unflagged
    pub const CLOCK_BACKWARD_TOLERANCE_MS: f64 = 2000.0;
    pub const CLOCK_FORWARD_TOLERANCE_MS: f64 = 10000.0;
    /// Wall elapsed vs monotonic elapsed ratio before a forward jump counts
    pub const CLOCK_FORWARD_VARIANCE: f64 = 2.0;
}
