//! The vault context
//!
//! Owns one instance of every component and wires them together:
//!
//! ```text
//!   Bank ──► HookedStorage ──► primary store
//!               │  ├─ IntegrityVerifier (re-sign, pending writes)
//!               │  └─ BackupManager     (dirty mark, debounce)
//!               └─► EventBus ◄── WatcherScheduler (external changes)
//! ```
//!
//! Several vaults can coexist (one per test, one per namespace); nothing is
//! process-global.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use crate::amount::Amount;
use crate::config::VaultConfig;
use crate::events::{EventBus, EventFilter, SubscriptionId, VaultEvent};
use crate::keys::{Currency, KeyLayout, Slot};
use crate::persistence::backup::BackupManager;
use crate::persistence::bank::{Bank, CurrencyHandle, LockSet};
use crate::persistence::hooked::{HookedStorage, NoProbe, OriginProbe};
use crate::persistence::integrity::IntegrityVerifier;
use crate::persistence::watcher::{WatchChange, WatchId, WatchOptions, WatcherScheduler};
use crate::platform::snapshot_store::SnapshotStore;
use crate::platform::storage::{KeyValueStore, MemoryStorage};
use crate::platform::time::{Clock, ManualClock};
use crate::platform::timers::{ManualTimers, TimerHost};

/// Substrates the vault runs on
pub struct VaultPlatform {
    pub storage: Rc<dyn KeyValueStore>,
    pub snapshots: Rc<dyn SnapshotStore>,
    pub timers: Rc<dyn TimerHost>,
    pub clock: Rc<dyn Clock>,
    pub probe: Rc<dyn OriginProbe>,
}

impl VaultPlatform {
    /// Hand-driven substrates: in-memory storage, manual timers and clock
    pub fn manual(
        storage: MemoryStorage,
        snapshots: impl SnapshotStore + 'static,
        timers: ManualTimers,
        clock: ManualClock,
    ) -> Self {
        Self {
            storage: Rc::new(storage),
            snapshots: Rc::new(snapshots),
            timers: Rc::new(timers),
            clock: Rc::new(clock),
            probe: Rc::new(NoProbe),
        }
    }
}

/// Host lifecycle signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Hidden,
    PageHide,
    Freeze,
    BeforeUnload,
    Visible,
    Resume,
    Focus,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Hidden => "hidden",
            Lifecycle::PageHide => "pagehide",
            Lifecycle::Freeze => "freeze",
            Lifecycle::BeforeUnload => "beforeunload",
            Lifecycle::Visible => "visible",
            Lifecycle::Resume => "resume",
            Lifecycle::Focus => "focus",
        }
    }

    /// The page may be discarded after this signal
    pub fn is_suspend(&self) -> bool {
        matches!(
            self,
            Lifecycle::Hidden | Lifecycle::PageHide | Lifecycle::Freeze | Lifecycle::BeforeUnload
        )
    }
}

/// A watcher whose key follows the active slot
#[derive(Debug, Clone, Copy)]
enum Binding {
    Value(Currency),
    Multiplier(Currency),
}

impl Binding {
    fn key(&self, layout: &KeyLayout, slot: Slot) -> String {
        match *self {
            Binding::Value(currency) => layout.value_key(currency, slot),
            Binding::Multiplier(currency) => layout.multiplier_key(currency, slot),
        }
    }
}

pub struct Vault {
    config: VaultConfig,
    layout: KeyLayout,
    raw: Rc<dyn KeyValueStore>,
    storage: Rc<HookedStorage>,
    bus: EventBus,
    watchers: WatcherScheduler,
    bank: Bank,
    verifier: IntegrityVerifier,
    backup: BackupManager,
    active: Rc<Cell<Slot>>,
    bound: RefCell<Vec<(WatchId, Binding)>>,
    booted: Cell<bool>,
    me: Weak<Vault>,
}

impl Vault {
    pub fn new(config: VaultConfig, platform: VaultPlatform) -> Rc<Self> {
        let layout = KeyLayout::new(config.namespace.clone());
        let raw: Rc<dyn KeyValueStore> = match platform.storage.keys() {
            Ok(_) => platform.storage,
            Err(e) => {
                log::warn!("Primary storage unavailable ({e}), keeping state in memory only");
                Rc::new(MemoryStorage::new())
            }
        };

        let bus = EventBus::new();
        let storage = Rc::new(
            HookedStorage::new(raw.clone(), layout.clone(), bus.clone()).with_probe(platform.probe),
        );
        let verifier = IntegrityVerifier::new(
            &config,
            raw.clone(),
            bus.clone(),
            platform.clock.clone(),
            platform.timers.clone(),
        );
        let backup = BackupManager::new(
            &config,
            raw.clone(),
            platform.snapshots,
            platform.timers.clone(),
            platform.clock,
        );
        storage.add_hook(Rc::new(verifier.clone()));
        storage.add_hook(Rc::new(backup.clone()));

        let watchers = WatcherScheduler::new(raw.clone(), platform.timers, config.watch_interval_ms);
        let active = Rc::new(Cell::new(Self::read_active_slot(
            raw.as_ref(),
            &layout,
            config.default_slot,
        )));
        let writer: Rc<dyn KeyValueStore> = storage.clone();
        let bank = Bank::new(
            writer,
            layout.clone(),
            watchers.clone(),
            bus.clone(),
            LockSet::new(),
            active.clone(),
        );

        Rc::new_cyclic(|me| Vault {
            config,
            layout,
            raw,
            storage,
            bus,
            watchers,
            bank,
            verifier,
            backup,
            active,
            bound: RefCell::new(Vec::new()),
            booted: Cell::new(false),
            me: me.clone(),
        })
    }

    fn read_active_slot(raw: &dyn KeyValueStore, layout: &KeyLayout, default: Slot) -> Slot {
        raw.get_item(&layout.active_slot_key())
            .ok()
            .flatten()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    }

    /// Restore lost data, start integrity checks and the watchers that
    /// re-publish external changes. Runs once.
    pub fn boot(&self) {
        if self.booted.replace(true) {
            return;
        }
        let slot = self.active.get();
        log::info!("Vault '{}' booting on slot {slot}", self.layout.namespace());

        // Restored entries bypass the write hooks; the verifier judges them
        // once the restore completes
        self.verifier.begin_restore();
        let me = self.me.clone();
        let started = self.backup.restore_if_needed(self.raw.clone(), slot, move |restored| {
            if let Some(vault) = me.upgrade() {
                vault.after_restore(restored);
            }
        });
        if !started {
            self.verifier.end_restore();
        }

        self.verifier.track(self.active.get());
        self.verifier.reset_clock_anchors();

        for currency in Currency::ALL {
            self.bind_value_publisher(currency);
            self.bind_multiplier_publisher(currency);
        }
    }

    fn after_restore(&self, restored: usize) {
        self.verifier.end_restore();
        if restored == 0 {
            return;
        }
        let stored = Self::read_active_slot(self.raw.as_ref(), &self.layout, self.active.get());
        if stored != self.active.get() {
            self.activate(stored);
        }
        self.watchers.poll();
        self.verifier.verify_slot(self.active.get());
    }

    fn bind_value_publisher(&self, currency: Currency) {
        let (bus, active) = (self.bus.clone(), self.active.clone());
        self.watch_bound(Binding::Value(currency), WatchOptions::amount(), move |change| {
            if !change.value_changed {
                return;
            }
            let previous = change.previous.clone().unwrap_or_default();
            bus.publish(&VaultEvent::ValueChanged {
                currency,
                slot: active.get(),
                value: change.value.clone(),
                delta: &change.value - &previous,
                previous,
            });
        });
    }

    fn bind_multiplier_publisher(&self, currency: Currency) {
        let (bus, active) = (self.bus.clone(), self.active.clone());
        self.watch_bound(Binding::Multiplier(currency), WatchOptions::multiplier(), move |change| {
            if change.value_changed {
                bus.publish(&VaultEvent::MultiplierChanged {
                    currency,
                    slot: active.get(),
                    mult: change.value.clone(),
                });
            }
        });
    }

    fn watch_bound(
        &self,
        binding: Binding,
        options: WatchOptions<Amount>,
        callback: impl Fn(&WatchChange<Amount>) + 'static,
    ) -> WatchId {
        let key = binding.key(&self.layout, self.active.get());
        let id = self.watchers.watch(key, options, callback);
        self.bound.borrow_mut().push((id, binding));
        id
    }

    /// Watch a balance in whichever slot is active
    pub fn watch_currency(
        &self,
        currency: Currency,
        callback: impl Fn(&WatchChange<Amount>) + 'static,
    ) -> WatchId {
        self.watch_bound(Binding::Value(currency), WatchOptions::amount(), callback)
    }

    /// Watch a whole multiplier in whichever slot is active
    pub fn watch_multiplier(
        &self,
        currency: Currency,
        callback: impl Fn(&WatchChange<Amount>) + 'static,
    ) -> WatchId {
        self.watch_bound(Binding::Multiplier(currency), WatchOptions::multiplier(), callback)
    }

    pub fn unwatch(&self, id: WatchId) -> bool {
        self.bound.borrow_mut().retain(|(bound, _)| *bound != id);
        self.watchers.unwatch(id)
    }

    /// Make `slot` active: persist the pointer, rebind slot watchers, move
    /// integrity tracking
    pub fn switch_slot(&self, slot: Slot) {
        if slot == self.active.get() {
            return;
        }
        if let Err(e) = self.storage.set_item(&self.layout.active_slot_key(), &slot.to_string()) {
            log::warn!("Cannot persist active slot: {e}");
        }
        self.activate(slot);
    }

    fn activate(&self, slot: Slot) {
        let previous = self.active.replace(slot);
        let bound = self.bound.borrow().clone();
        for (id, binding) in bound {
            self.watchers.rebind(id, binding.key(&self.layout, slot));
        }
        self.verifier.untrack(previous);
        self.verifier.track(slot);
        log::info!("Switched from slot {previous} to slot {slot}");
        self.bus.publish(&VaultEvent::SlotSwitched {
            slot,
            previous: Some(previous),
        });
    }

    /// React to a host lifecycle signal
    pub fn lifecycle(&self, signal: Lifecycle) {
        log::debug!("Lifecycle signal: {}", signal.as_str());
        match signal {
            s if s.is_suspend() => self.backup.flush(s.as_str(), true),
            Lifecycle::Visible | Lifecycle::Resume => {
                self.verifier.reset_clock_anchors();
                self.verifier.verify_slot(self.active.get());
                self.watchers.poll();
                self.backup.mark_dirty(signal.as_str());
            }
            _ => self.backup.mark_dirty(signal.as_str()),
        }
    }

    /// A namespaced key was changed outside this vault (another tab).
    /// `None` means the whole store was cleared.
    pub fn external_mutation(&self, key: Option<&str>) {
        if let Some(key) = key {
            if !self.layout.owns(key) {
                return;
            }
            self.bus.publish(&VaultEvent::StorageMutation {
                key: key.to_string(),
                slot: self.layout.slot_of(key),
                trusted: false,
            });
        }
        self.backup.mark_dirty("external");
        self.watchers.poll();
    }

    /// The host paused its own scheduler; elapsed time is legitimate
    pub fn host_paused(&self) {
        self.verifier.reset_clock_anchors();
    }

    pub fn host_resumed(&self) {
        self.verifier.reset_clock_anchors();
    }

    pub fn active_slot(&self) -> Slot {
        self.active.get()
    }

    pub fn bank(&self) -> &Bank {
        &self.bank
    }

    /// Shorthand for `bank().currency(currency)`
    pub fn currency(&self, currency: Currency) -> CurrencyHandle<'_> {
        self.bank.currency(currency)
    }

    pub fn subscribe(&self, filter: EventFilter, listener: impl Fn(&VaultEvent) + 'static) -> SubscriptionId {
        self.bus.subscribe(filter, listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Freeze a currency's balance and multiplier in `slot`
    pub fn lock_currency(&self, currency: Currency, slot: Slot) {
        let locks = self.bank.locks();
        locks.lock(self.layout.value_key(currency, slot));
        locks.lock(self.layout.multiplier_key(currency, slot));
    }

    pub fn unlock_currency(&self, currency: Currency, slot: Slot) {
        let locks = self.bank.locks();
        locks.unlock(&self.layout.value_key(currency, slot));
        locks.unlock(&self.layout.multiplier_key(currency, slot));
    }

    pub fn is_modified(&self, slot: Slot) -> bool {
        self.verifier.is_modified(slot)
    }

    /// Slots holding at least one balance, multiplier or other save entry.
    /// Verifier bookkeeping alone does not count.
    pub fn slots_in_use(&self) -> Vec<Slot> {
        let keys = self.raw.keys().unwrap_or_else(|e| {
            log::warn!("Cannot list keys: {e}");
            Vec::new()
        });
        let slots: BTreeSet<Slot> = keys
            .iter()
            .filter(|k| !self.layout.is_integrity_entry(k))
            .filter_map(|k| self.layout.slot_of(k))
            .collect();
        slots.into_iter().collect()
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// The decorated store every authorized write goes through
    pub fn storage(&self) -> &Rc<HookedStorage> {
        &self.storage
    }

    pub fn watchers(&self) -> &WatcherScheduler {
        &self.watchers
    }

    pub fn verifier(&self) -> &IntegrityVerifier {
        &self.verifier
    }

    pub fn backup(&self) -> &BackupManager {
        &self.backup
    }

    /// Flush a final snapshot and stop every timer
    pub fn shutdown(&self) {
        self.backup.flush("shutdown", true);
        self.backup.stop();
        self.watchers.stop();
        self.verifier.stop();
        self.bound.borrow_mut().clear();
        log::info!("Vault '{}' shut down", self.layout.namespace());
    }
}
