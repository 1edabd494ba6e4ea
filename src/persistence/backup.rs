//! Crash-consistent backup
//!
//! Every namespaced write marks the vault dirty and (re)starts a debounce
//! timer; when it fires, one snapshot covering the whole window goes to the
//! secondary store. Suspend signals flush immediately instead. Repeated
//! writes can postpone a flush by at most `backup_max_delay_ms`.
//!
//! At boot, before any flush, the latest snapshot fills in keys missing from
//! a primary store that looks empty or partially lost. Present keys are never
//! overwritten.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::config::VaultConfig;
use crate::keys::{Currency, EntryKind, KeyLayout, Slot};
use crate::platform::snapshot_store::SnapshotStore;
use crate::platform::storage::{KeyValueStore, StorageError, entries_with_prefix};
use crate::platform::time::Clock;
use crate::platform::timers::{TimerHost, TimerId};

use super::envelope::{Snapshot, SnapshotEnvelope};
use super::hooked::WriteHook;

#[derive(Default)]
struct State {
    dirty: bool,
    /// Monotonic time of the first unflushed change
    dirty_since: Option<f64>,
    pending_reason: Option<String>,
    timer: Option<TimerId>,
    /// Completed snapshot writes
    flushes: u32,
    flushed_once: bool,
    restore_checked: bool,
    restoring: bool,
}

struct Shared {
    primary: Rc<dyn KeyValueStore>,
    snapshots: Rc<dyn SnapshotStore>,
    timers: Rc<dyn TimerHost>,
    clock: Rc<dyn Clock>,
    layout: KeyLayout,
    record: String,
    debounce_ms: u32,
    max_delay_ms: u32,
    state: RefCell<State>,
}

#[derive(Clone)]
pub struct BackupManager {
    shared: Rc<Shared>,
}

impl BackupManager {
    pub fn new(
        config: &VaultConfig,
        primary: Rc<dyn KeyValueStore>,
        snapshots: Rc<dyn SnapshotStore>,
        timers: Rc<dyn TimerHost>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Rc::new(Shared {
                primary,
                snapshots,
                timers,
                clock,
                layout: KeyLayout::new(config.namespace.clone()),
                record: config.snapshot_record.clone(),
                debounce_ms: config.backup_debounce_ms,
                max_delay_ms: config.backup_max_delay_ms.max(config.backup_debounce_ms),
                state: RefCell::new(State::default()),
            }),
        }
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    /// Every namespaced entry of the primary store, or `None` if it cannot be read
    pub fn capture_snapshot(&self, reason: &str) -> Option<Snapshot> {
        let prefix = self.shared.layout.prefix();
        match entries_with_prefix(self.shared.primary.as_ref(), &prefix) {
            Ok(entries) => Some(Snapshot {
                entries,
                timestamp_ms: self.shared.clock.wall_ms().max(0.0) as u64,
                reason: reason.to_string(),
            }),
            Err(e) => {
                log::warn!("Cannot capture snapshot: {e}");
                None
            }
        }
    }

    /// Schedule a debounced flush
    pub fn mark_dirty(&self, reason: &str) {
        self.flush(reason, false);
    }

    /// Write a snapshot now (`immediate`) or after the debounce window
    pub fn flush(&self, reason: &str, immediate: bool) {
        if immediate {
            let (timer, skip) = {
                let mut state = self.shared.state.borrow_mut();
                (state.timer.take(), !state.dirty && state.flushed_once)
            };
            if let Some(timer) = timer {
                self.shared.timers.clear(timer);
            }
            if skip {
                log::debug!("Snapshot unchanged, skipping {reason} flush");
                return;
            }
            self.perform(reason);
            return;
        }

        let now = self.shared.clock.monotonic_ms();
        let (stale, delay) = {
            let mut state = self.shared.state.borrow_mut();
            state.dirty = true;
            state.pending_reason = Some(reason.to_string());
            let since = *state.dirty_since.get_or_insert(now);
            let remaining = (since + f64::from(self.shared.max_delay_ms) - now).max(0.0);
            let delay = f64::from(self.shared.debounce_ms).min(remaining) as u32;
            (state.timer.take(), delay)
        };
        if let Some(timer) = stale {
            self.shared.timers.clear(timer);
        }

        let weak = Rc::downgrade(&self.shared);
        let timer = self.shared.timers.set_timeout(
            delay,
            Box::new(move || {
                if let Some(backup) = Self::upgrade(&weak) {
                    let reason = {
                        let mut state = backup.shared.state.borrow_mut();
                        state.timer = None;
                        state.pending_reason.take()
                    };
                    backup.perform(reason.as_deref().unwrap_or("debounce"));
                }
            }),
        );
        self.shared.state.borrow_mut().timer = Some(timer);
    }

    fn perform(&self, reason: &str) {
        if self.shared.state.borrow().restoring {
            log::debug!("Restore in progress, deferring {reason} flush");
            return;
        }
        let Some(snapshot) = self.capture_snapshot(reason) else {
            return;
        };
        let payload = match SnapshotEnvelope::seal(snapshot).and_then(|e| e.to_json()) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Cannot serialize snapshot: {e}");
                return;
            }
        };

        {
            let mut state = self.shared.state.borrow_mut();
            state.dirty = false;
            state.dirty_since = None;
            state.pending_reason = None;
            state.flushed_once = true;
        }

        let weak = Rc::downgrade(&self.shared);
        let reason = reason.to_string();
        self.shared.snapshots.save(
            &self.shared.record,
            payload,
            Box::new(move |result: Result<(), StorageError>| {
                let Some(backup) = Self::upgrade(&weak) else { return };
                match result {
                    Ok(()) => {
                        backup.shared.state.borrow_mut().flushes += 1;
                        log::info!("Snapshot written ({reason})");
                    }
                    Err(e) => {
                        log::warn!("Snapshot write rejected, will retry: {e}");
                        backup.flush("retry", false);
                    }
                }
            }),
        );
    }

    /// True if primary storage looks empty or lost the active slot's primary balance
    fn needs_restore(&self, active: Slot) -> bool {
        let layout = &self.shared.layout;
        let entries = match entries_with_prefix(self.shared.primary.as_ref(), &layout.prefix()) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Cannot inspect primary storage for restore: {e}");
                return false;
            }
        };
        if entries.is_empty() {
            return true;
        }
        let primary_key = layout.value_key(Currency::PRIMARY, active);
        !entries.contains_key(&primary_key) && entries.keys().any(|k| layout.slot_of(k) == Some(active))
    }

    /// Restore missing keys from the latest snapshot, once per process and
    /// only before the first flush. Restored entries are written to `writer`.
    /// `on_restored` receives the number of keys written once
    /// the (possibly asynchronous) load completes. Returns true if a restore
    /// was started.
    pub fn restore_if_needed(
        &self,
        writer: Rc<dyn KeyValueStore>,
        active: Slot,
        on_restored: impl FnOnce(usize) + 'static,
    ) -> bool {
        {
            let mut state = self.shared.state.borrow_mut();
            if state.restore_checked || state.flushed_once {
                return false;
            }
            state.restore_checked = true;
        }
        if !self.needs_restore(active) {
            return false;
        }

        log::info!("Primary storage looks incomplete, loading snapshot");
        self.shared.state.borrow_mut().restoring = true;
        let weak = Rc::downgrade(&self.shared);
        self.shared.snapshots.load(
            &self.shared.record,
            Box::new(move |result: Result<Option<String>, StorageError>| {
                let Some(backup) = Self::upgrade(&weak) else { return };
                let restored = match result {
                    Ok(Some(json)) => match SnapshotEnvelope::open(&json) {
                        Ok(snapshot) => backup.apply(writer.as_ref(), &snapshot),
                        Err(e) => {
                            log::warn!("Discarding unusable snapshot: {e}");
                            0
                        }
                    },
                    Ok(None) => {
                        log::info!("No snapshot to restore from");
                        0
                    }
                    Err(e) => {
                        log::warn!("Cannot load snapshot: {e}");
                        0
                    }
                };

                let dirty = {
                    let mut state = backup.shared.state.borrow_mut();
                    state.restoring = false;
                    state.dirty
                };
                if restored > 0 || dirty {
                    backup.mark_dirty("restore");
                }
                on_restored(restored);
            }),
        );
        true
    }

    /// Write snapshot entries that are absent from primary storage
    fn apply(&self, writer: &dyn KeyValueStore, snapshot: &Snapshot) -> usize {
        let layout = &self.shared.layout;
        let mut restored = 0;
        for (key, value) in &snapshot.entries {
            match layout.kind_of(key) {
                None | Some(EntryKind::Signature | EntryKind::Heartbeat) => continue,
                Some(_) => {}
            }
            match self.shared.primary.get_item(key) {
                Ok(None) => {}
                Ok(Some(_)) => continue,
                Err(e) => {
                    log::warn!("Cannot check {key} before restore: {e}");
                    continue;
                }
            }
            match writer.set_item(key, value) {
                Ok(()) => restored += 1,
                Err(e) => log::warn!("Cannot restore {key}: {e}"),
            }
        }
        log::info!(
            "Restored {restored} entries from snapshot taken at {} ({})",
            snapshot.timestamp_ms,
            snapshot.reason
        );
        restored
    }

    /// Completed snapshot writes
    pub fn flush_count(&self) -> u32 {
        self.shared.state.borrow().flushes
    }

    pub fn is_dirty(&self) -> bool {
        self.shared.state.borrow().dirty
    }

    /// True while a debounced flush is scheduled
    pub fn has_pending_flush(&self) -> bool {
        self.shared.state.borrow().timer.is_some()
    }

    pub fn is_restoring(&self) -> bool {
        self.shared.state.borrow().restoring
    }

    /// Cancel the debounce timer
    pub fn stop(&self) {
        let timer = self.shared.state.borrow_mut().timer.take();
        if let Some(timer) = timer {
            self.shared.timers.clear(timer);
        }
    }
}

impl WriteHook for BackupManager {
    fn after_write(&self, _key: &str, _value: Option<&str>) {
        self.mark_dirty("write");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::persistence::hooked::HookedStorage;
    use crate::platform::snapshot_store::MemorySnapshotStore;
    use crate::platform::storage::MemoryStorage;
    use crate::platform::time::ManualClock;
    use crate::platform::timers::ManualTimers;
    use std::cell::Cell;

    struct Fixture {
        raw: MemoryStorage,
        hooked: Rc<HookedStorage>,
        snapshots: MemorySnapshotStore,
        timers: ManualTimers,
        backup: BackupManager,
    }

    fn fixture() -> Fixture {
        let config = VaultConfig::default();
        let raw = MemoryStorage::new();
        let snapshots = MemorySnapshotStore::new();
        let clock = ManualClock::default();
        let timers = ManualTimers::with_clock(clock.clone());
        let backup = BackupManager::new(
            &config,
            Rc::new(raw.clone()),
            Rc::new(snapshots.clone()),
            Rc::new(timers.clone()),
            Rc::new(clock),
        );
        let hooked = Rc::new(HookedStorage::new(
            Rc::new(raw.clone()),
            KeyLayout::new(config.namespace.clone()),
            EventBus::new(),
        ));
        hooked.add_hook(Rc::new(backup.clone()));
        Fixture {
            raw,
            hooked,
            snapshots,
            timers,
            backup,
        }
    }

    fn stored_snapshot(f: &Fixture) -> Snapshot {
        SnapshotEnvelope::open(&f.snapshots.record("vault_snapshot").unwrap()).unwrap()
    }

    fn seal(entries: &[(&str, &str)]) -> String {
        let snapshot = Snapshot {
            entries: entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            timestamp_ms: 1,
            reason: "test".into(),
        };
        SnapshotEnvelope::seal(snapshot).unwrap().to_json().unwrap()
    }

    #[test]
    fn test_debounce_coalesces_writes() {
        let f = fixture();
        for n in 0..5 {
            f.hooked.set_item("vault:coins:1", &n.to_string()).unwrap();
            f.timers.advance(200.0);
        }
        assert_eq!(f.snapshots.save_count(), 0);
        f.timers.advance(1000.0);
        assert_eq!(f.snapshots.save_count(), 1);
        assert_eq!(stored_snapshot(&f).entries["vault:coins:1"], "4");
        assert!(!f.backup.is_dirty());
    }

    #[test]
    fn test_max_delay_bounds_postponement() {
        let f = fixture();
        for n in 0..30 {
            f.hooked.set_item("vault:coins:1", &n.to_string()).unwrap();
            f.timers.advance(500.0);
        }
        // 15 s of continuous writes with a 5 s cap
        assert!(f.snapshots.save_count() >= 2);
    }

    #[test]
    fn test_suspend_replaces_pending_debounce() {
        let f = fixture();
        f.hooked.set_item("vault:coins:1", "10").unwrap();
        assert!(f.backup.has_pending_flush());

        f.backup.flush("pagehide", true);
        assert_eq!(f.snapshots.save_count(), 1);
        assert!(!f.backup.has_pending_flush());

        f.timers.advance(10_000.0);
        f.backup.flush("beforeunload", true);
        assert_eq!(f.snapshots.save_count(), 1);
        assert_eq!(stored_snapshot(&f).reason, "pagehide");
    }

    #[test]
    fn test_rejected_save_is_retried() {
        let f = fixture();
        f.snapshots.fail_next_saves(1);
        f.hooked.set_item("vault:coins:1", "10").unwrap();
        f.timers.advance(1000.0);
        assert_eq!(f.snapshots.save_count(), 0);
        assert!(f.backup.is_dirty());

        f.timers.advance(1000.0);
        assert_eq!(f.snapshots.save_count(), 1);
        assert_eq!(f.backup.flush_count(), 1);
    }

    #[test]
    fn test_capture_fails_when_storage_unavailable() {
        let f = fixture();
        f.raw.set_available(false);
        assert!(f.backup.capture_snapshot("test").is_none());
        f.backup.flush("pagehide", true);
        assert_eq!(f.snapshots.save_count(), 0);
    }

    #[test]
    fn test_restore_into_empty_primary() {
        let f = fixture();
        f.snapshots.put_record("vault_snapshot", seal(&[("vault:coins:1", "500")]));
        let restored = Rc::new(Cell::new(None));
        let r = restored.clone();

        assert!(f.backup.restore_if_needed(f.hooked.clone(), Slot::FIRST, move |n| r.set(Some(n))));
        assert_eq!(restored.get(), Some(1));
        assert_eq!(f.raw.dump(), [("vault:coins:1".to_string(), "500".to_string())].into());
        assert!(f.backup.is_dirty());
    }

    #[test]
    fn test_restore_never_overwrites_present_keys() {
        let f = fixture();
        f.raw.set_item("vault:gems:1", "3").unwrap();
        f.snapshots.put_record(
            "vault_snapshot",
            seal(&[
                ("vault:coins:1", "500"),
                ("vault:gems:1", "99"),
                ("vault:sig:1", "stale"),
                ("vault:modified:1", "1"),
            ]),
        );

        assert!(f.backup.restore_if_needed(f.hooked.clone(), Slot::FIRST, |_| {}));
        assert_eq!(f.raw.get_item("vault:coins:1").unwrap().as_deref(), Some("500"));
        assert_eq!(f.raw.get_item("vault:gems:1").unwrap().as_deref(), Some("3"));
        assert_eq!(f.raw.get_item("vault:sig:1").unwrap(), None);
        assert_eq!(f.raw.get_item("vault:modified:1").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_restore_skipped_when_primary_intact() {
        let f = fixture();
        f.raw.set_item("vault:coins:1", "1").unwrap();
        f.snapshots.put_record("vault_snapshot", seal(&[("vault:gems:1", "500")]));
        assert!(!f.backup.restore_if_needed(f.hooked.clone(), Slot::FIRST, |_| {}));
        assert_eq!(f.raw.get_item("vault:gems:1").unwrap(), None);
    }

    #[test]
    fn test_restore_runs_once_and_not_after_flush() {
        let f = fixture();
        f.backup.flush("pagehide", true);
        f.snapshots.put_record("vault_snapshot", seal(&[("vault:coins:1", "500")]));
        assert!(!f.backup.restore_if_needed(f.hooked.clone(), Slot::FIRST, |_| {}));

        let g = fixture();
        assert!(g.backup.restore_if_needed(g.hooked.clone(), Slot::FIRST, |_| {}));
        assert!(!g.backup.restore_if_needed(g.hooked.clone(), Slot::FIRST, |_| {}));
    }

    #[test]
    fn test_corrupt_snapshot_ignored() {
        let f = fixture();
        let json = seal(&[("vault:coins:1", "500")]).replace("500", "900");
        f.snapshots.put_record("vault_snapshot", json);
        let restored = Rc::new(Cell::new(None));
        let r = restored.clone();
        f.backup.restore_if_needed(f.hooked.clone(), Slot::FIRST, move |n| r.set(Some(n)));
        assert_eq!(restored.get(), Some(0));
        assert!(f.raw.is_empty());
    }

    #[test]
    fn test_flush_deferred_until_async_restore_completes() {
        let f = fixture();
        f.snapshots.set_deferred(true);
        f.snapshots.put_record("vault_snapshot", seal(&[("vault:coins:1", "500")]));
        f.backup.restore_if_needed(f.hooked.clone(), Slot::FIRST, |_| {});
        assert!(f.backup.is_restoring());

        f.hooked.set_item("vault:gems:1", "1").unwrap();
        f.timers.advance(2000.0);
        assert_eq!(f.snapshots.complete_pending(), 1);
        assert!(!f.backup.is_restoring());

        f.timers.advance(2000.0);
        f.snapshots.complete_pending();
        let entries = stored_snapshot(&f).entries;
        assert_eq!(entries["vault:coins:1"], "500");
        assert_eq!(entries["vault:gems:1"], "1");
    }
}
