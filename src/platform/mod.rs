//! Platform abstraction layer
//!
//! Handles browser/native differences for:
//! - Key/value storage (LocalStorage on web, memory elsewhere)
//! - Wall-clock and monotonic time
//! - Interval and timeout timers
//! - Snapshot storage (IndexedDB on web, files or memory elsewhere)
//! - Page lifecycle events and the JS surface (web only)

pub mod snapshot_store;
pub mod storage;
pub mod time;
pub mod timers;

#[cfg(target_arch = "wasm32")]
pub mod idb;
#[cfg(target_arch = "wasm32")]
pub mod web;

pub use snapshot_store::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use storage::{KeyValueStore, MemoryStorage, StorageError};
pub use time::{Clock, ManualClock};
pub use timers::{ManualTimers, TimerHost, TimerId};
