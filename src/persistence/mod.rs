//! Save-data persistence with integrity verification
//!
//! Features:
//! - Tolerant value codec (balances, fixed-point multipliers)
//! - Write interception hooks around the primary store
//! - Slot-scoped balances and multipliers with locking
//! - Shared polling watcher for external changes
//! - Per-slot signatures and a latched modified flag
//! - Versioned snapshot envelope with a BLAKE3 digest
//! - Debounced, crash-consistent backup with restore on boot

pub mod backup;
pub mod bank;
pub mod codec;
pub mod envelope;
pub mod hooked;
pub mod integrity;
pub mod watcher;

pub use backup::BackupManager;
pub use bank::{Bank, CurrencyHandle, LockSet, SetOptions};
pub use envelope::{EnvelopeError, Snapshot, SnapshotEnvelope};
pub use hooked::{HookedStorage, NoProbe, OriginProbe, WriteHook};
pub use integrity::{ClockGuard, IntegrityVerifier, VerifyOutcome, compute_signature};
pub use watcher::{WatchChange, WatchId, WatchOptions, WatcherScheduler};
