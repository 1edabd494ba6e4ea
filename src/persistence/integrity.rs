//! Integrity verifier
//!
//! Fingerprints each slot's entries and latches a persisted "modified" flag
//! when the stored entries stop matching the last recorded signature, or when
//! the wall clock misbehaves against monotonic time.
//!
//! The verifier learns about every authorized write through [`WriteHook`] and
//! re-signs the slot immediately, so the vault's own progress never looks like
//! tampering. It reads and writes its own entries (signature, flag, heartbeat)
//! on the undecorated store.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::rc::{Rc, Weak};

use crate::config::VaultConfig;
use crate::events::{AnomalyKind, EventBus, VaultEvent};
use crate::keys::{KeyLayout, Slot};
use crate::platform::storage::{KeyValueStore, StorageError, entries_with_prefix};
use crate::platform::time::Clock;
use crate::platform::timers::{TimerHost, TimerId};

use super::hooked::WriteHook;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const ROLLING_BASE: u64 = 131;

/// Stored value of a latched modified flag
const FLAG_SET: &str = "1";

/// Order-independent fingerprint of a set of `key=value` strings.
///
/// Each entry gets a polynomial rolling hash seeded by its position in sorted
/// order; the per-entry hashes are folded into an accumulator seeded with the
/// entry count. The count is also appended to the result.
pub fn compute_signature<S: AsRef<str>>(entries: &[S]) -> String {
    let mut sorted: Vec<&str> = entries.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();

    let count = sorted.len() as u64;
    let mut acc = FNV_OFFSET ^ count;
    for (i, entry) in sorted.iter().enumerate() {
        let mut h = FNV_OFFSET ^ i as u64;
        for b in entry.bytes() {
            h = h.wrapping_mul(ROLLING_BASE).wrapping_add(u64::from(b));
        }
        acc = (acc ^ h).wrapping_mul(FNV_PRIME).rotate_left(23);
    }
    format!("{acc:016x}-{count:x}")
}

/// Signature of a slot's entry map
pub fn signature_of(entries: &BTreeMap<String, String>) -> String {
    let lines: Vec<String> = entries.iter().map(|(k, v)| format!("{k}={v}")).collect();
    compute_signature(&lines)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Entries match the recorded signature
    Clean,
    /// No signature was recorded; one was written for the current entries
    Baseline,
    /// Entries changed behind the vault's back
    Tampered(AnomalyKind),
    /// An authorized write to the slot is in flight
    Deferred,
    /// The store could not be read
    Unavailable,
}

/// Compares wall-clock progress with monotonic progress between checks
#[derive(Debug, Clone)]
pub struct ClockGuard {
    backward_tolerance_ms: f64,
    forward_tolerance_ms: f64,
    variance: f64,
    wall_anchor: f64,
    mono_anchor: f64,
}

impl ClockGuard {
    pub fn new(config: &VaultConfig, clock: &dyn Clock) -> Self {
        Self {
            backward_tolerance_ms: config.clock_backward_tolerance_ms,
            forward_tolerance_ms: config.clock_forward_tolerance_ms,
            variance: config.clock_forward_variance,
            wall_anchor: clock.wall_ms(),
            mono_anchor: clock.monotonic_ms(),
        }
    }

    /// Start measuring from now
    pub fn reset(&mut self, clock: &dyn Clock) {
        self.wall_anchor = clock.wall_ms();
        self.mono_anchor = clock.monotonic_ms();
    }

    /// Check progress since the last anchor, then re-anchor
    pub fn check(&mut self, clock: &dyn Clock) -> Option<AnomalyKind> {
        let wall_elapsed = clock.wall_ms() - self.wall_anchor;
        let mono_elapsed = clock.monotonic_ms() - self.mono_anchor;
        self.reset(clock);

        if wall_elapsed < -self.backward_tolerance_ms {
            Some(AnomalyKind::ClockRegression)
        } else if wall_elapsed > mono_elapsed * self.variance
            && wall_elapsed - mono_elapsed > self.forward_tolerance_ms
        {
            Some(AnomalyKind::ClockSkew)
        } else {
            None
        }
    }

    /// True if a heartbeat written at `heartbeat_ms` lies in the future
    /// beyond the backward tolerance
    pub fn heartbeat_regressed(&self, heartbeat_ms: f64, now_ms: f64) -> bool {
        heartbeat_ms - now_ms > self.backward_tolerance_ms
    }
}

struct State {
    /// Entries last verified or written, per initialized slot
    expected: HashMap<Slot, BTreeMap<String, String>>,
    /// Keys between `before_write` and `after_write`
    pending: HashSet<String>,
    /// Set while a backup restore is refilling the store
    restoring: bool,
    /// Values signed keys held before their first write during a restore
    shadow: BTreeMap<String, Option<String>>,
    tracked: BTreeSet<Slot>,
    guard: ClockGuard,
    verify_timer: Option<TimerId>,
    clock_timer: Option<TimerId>,
}

struct Shared {
    store: Rc<dyn KeyValueStore>,
    layout: KeyLayout,
    bus: EventBus,
    clock: Rc<dyn Clock>,
    timers: Rc<dyn TimerHost>,
    verify_interval_ms: u32,
    clock_interval_ms: u32,
    state: RefCell<State>,
}

#[derive(Clone)]
pub struct IntegrityVerifier {
    shared: Rc<Shared>,
}

impl IntegrityVerifier {
    pub fn new(
        config: &VaultConfig,
        store: Rc<dyn KeyValueStore>,
        bus: EventBus,
        clock: Rc<dyn Clock>,
        timers: Rc<dyn TimerHost>,
    ) -> Self {
        let guard = ClockGuard::new(config, clock.as_ref());
        Self {
            shared: Rc::new(Shared {
                store,
                layout: KeyLayout::new(config.namespace.clone()),
                bus,
                clock,
                timers,
                verify_interval_ms: config.integrity_interval_ms,
                clock_interval_ms: config.clock_check_interval_ms,
                state: RefCell::new(State {
                    expected: HashMap::new(),
                    pending: HashSet::new(),
                    restoring: false,
                    shadow: BTreeMap::new(),
                    tracked: BTreeSet::new(),
                    guard,
                    verify_timer: None,
                    clock_timer: None,
                }),
            }),
        }
    }

    /// Signed entries of `slot`, excluding the verifier's own entries
    pub fn slot_entries(&self, slot: Slot) -> Result<BTreeMap<String, String>, StorageError> {
        let layout = &self.shared.layout;
        let mut entries = entries_with_prefix(self.shared.store.as_ref(), &layout.prefix())?;
        entries.retain(|key, _| layout.slot_of(key) == Some(slot) && !layout.is_integrity_entry(key));
        Ok(entries)
    }

    pub fn stored_signature(&self, slot: Slot) -> Option<String> {
        let key = self.shared.layout.signature_key(slot);
        self.shared.store.get_item(&key).ok().flatten()
    }

    pub fn is_modified(&self, slot: Slot) -> bool {
        let key = self.shared.layout.modified_key(slot);
        self.shared.store.get_item(&key).ok().flatten().as_deref() == Some(FLAG_SET)
    }

    pub fn tracked_slots(&self) -> Vec<Slot> {
        self.shared.state.borrow().tracked.iter().copied().collect()
    }

    /// Compare `slot` with its recorded signature
    pub fn verify_slot(&self, slot: Slot) -> VerifyOutcome {
        let (outcome, latched) = self.verify_quietly(slot);
        if let Some(reason) = latched {
            self.announce(slot, reason);
        }
        outcome
    }

    /// Verify every tracked slot
    pub fn verify_tracked(&self) -> Vec<(Slot, VerifyOutcome)> {
        self.tracked_slots()
            .into_iter()
            .map(|slot| (slot, self.verify_slot(slot)))
            .collect()
    }

    /// Hold verification while a backup restore refills the store.
    /// Restored entries are written around the hooks; writes that do go
    /// through them meanwhile are remembered with their prior values.
    pub fn begin_restore(&self) {
        let mut state = self.shared.state.borrow_mut();
        state.restoring = true;
        state.shadow.clear();
    }

    /// Verify every tracked slot and every slot written during the restore.
    /// Writes made meanwhile are judged by the values they replaced, so
    /// neither the restore nor the vault's own progress latches the flag.
    pub fn end_restore(&self) {
        let shadow = {
            let mut state = self.shared.state.borrow_mut();
            if !state.restoring {
                return;
            }
            state.restoring = false;
            std::mem::take(&mut state.shadow)
        };
        let mut slots: BTreeSet<Slot> = self.tracked_slots().into_iter().collect();
        slots.extend(shadow.keys().filter_map(|key| self.shared.layout.slot_of(key)));
        for slot in slots {
            if let (_, Some(reason)) = self.verify_against(slot, &shadow) {
                self.announce(slot, reason);
            }
        }
    }

    pub fn is_restoring(&self) -> bool {
        self.shared.state.borrow().restoring
    }

    fn verify_quietly(&self, slot: Slot) -> (VerifyOutcome, Option<AnomalyKind>) {
        self.verify_against(slot, &BTreeMap::new())
    }

    /// Compare the stored signature with the slot's entries after replacing
    /// the keys in `prior` by their prior values, then sign what is stored
    fn verify_against(
        &self,
        slot: Slot,
        prior: &BTreeMap<String, Option<String>>,
    ) -> (VerifyOutcome, Option<AnomalyKind>) {
        let layout = &self.shared.layout;
        let held = {
            let state = self.shared.state.borrow();
            state.restoring || state.pending.iter().any(|key| layout.slot_of(key) == Some(slot))
        };
        if held {
            return (VerifyOutcome::Deferred, None);
        }

        let actual = match self.slot_entries(slot) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Cannot verify slot {slot}: {e}");
                return (VerifyOutcome::Unavailable, None);
            }
        };
        let sig_key = layout.signature_key(slot);
        let stored = match self.shared.store.get_item(&sig_key) {
            Ok(stored) => stored,
            Err(e) => {
                log::warn!("Cannot read signature of slot {slot}: {e}");
                return (VerifyOutcome::Unavailable, None);
            }
        };
        let mut reference = actual.clone();
        for (key, value) in prior.iter().filter(|(key, _)| layout.slot_of(key) == Some(slot)) {
            match value {
                Some(value) => reference.insert(key.clone(), value.clone()),
                None => reference.remove(key),
            };
        }
        let signature = signature_of(&reference);

        let (outcome, latched) = match stored.as_deref() {
            None if reference.is_empty() => (VerifyOutcome::Clean, None),
            None => (VerifyOutcome::Baseline, None),
            Some(stored) if stored == signature => (VerifyOutcome::Clean, None),
            Some(_) => {
                let reason = if reference.is_empty() {
                    AnomalyKind::DataWiped
                } else {
                    AnomalyKind::SignatureMismatch
                };
                let latched = self.latch(slot, reason);
                (VerifyOutcome::Tampered(reason), latched.then_some(reason))
            }
        };

        let current = signature_of(&actual);
        let unsigned_and_empty = stored.is_none() && actual.is_empty();
        if stored.as_deref() != Some(current.as_str()) && !unsigned_and_empty {
            self.write_signature(slot, &current);
        }

        self.shared.state.borrow_mut().expected.insert(slot, actual);
        (outcome, latched)
    }

    fn write_signature(&self, slot: Slot, signature: &str) {
        let key = self.shared.layout.signature_key(slot);
        if let Err(e) = self.shared.store.set_item(&key, signature) {
            log::warn!("Cannot record signature of slot {slot}: {e}");
        }
    }

    /// Set the modified flag unless it is already set. Returns true if this
    /// call set it.
    fn latch(&self, slot: Slot, reason: AnomalyKind) -> bool {
        if self.is_modified(slot) {
            return false;
        }
        let key = self.shared.layout.modified_key(slot);
        if let Err(e) = self.shared.store.set_item(&key, FLAG_SET) {
            log::warn!("Cannot persist modified flag for slot {slot}: {e}");
        }
        log::warn!("Slot {slot} modified externally ({})", reason.as_str());
        true
    }

    fn announce(&self, slot: Slot, reason: AnomalyKind) {
        self.shared.bus.publish(&VaultEvent::SlotModified { slot, reason });
    }

    /// Run the clock-skew check and refresh every tracked slot's heartbeat
    pub fn check_clock(&self) -> Option<AnomalyKind> {
        let clock = self.shared.clock.as_ref();
        let anomaly = self.shared.state.borrow_mut().guard.check(clock);

        let mut latched = Vec::new();
        for slot in self.tracked_slots() {
            if let Some(reason) = anomaly {
                if self.latch(slot, reason) {
                    latched.push(slot);
                }
            }
            self.write_heartbeat(slot);
        }
        if let Some(reason) = anomaly {
            for slot in latched {
                self.announce(slot, reason);
            }
        }
        anomaly
    }

    /// Forget elapsed time, e.g. after the host paused its own scheduler
    pub fn reset_clock_anchors(&self) {
        let clock = self.shared.clock.as_ref();
        self.shared.state.borrow_mut().guard.reset(clock);
    }

    fn write_heartbeat(&self, slot: Slot) {
        let key = self.shared.layout.heartbeat_key(slot);
        let now = self.shared.clock.wall_ms().max(0.0) as u64;
        if let Err(e) = self.shared.store.set_item(&key, &now.to_string()) {
            log::debug!("Cannot write heartbeat for slot {slot}: {e}");
        }
    }

    /// A heartbeat from the future means the wall clock went back since the
    /// slot was last active
    fn check_heartbeat(&self, slot: Slot) -> Option<AnomalyKind> {
        let key = self.shared.layout.heartbeat_key(slot);
        let heartbeat: f64 = self.shared.store.get_item(&key).ok().flatten()?.trim().parse().ok()?;
        let now = self.shared.clock.wall_ms();
        let regressed = self.shared.state.borrow().guard.heartbeat_regressed(heartbeat, now);
        if regressed && self.latch(slot, AnomalyKind::ClockRegression) {
            Some(AnomalyKind::ClockRegression)
        } else {
            None
        }
    }

    /// Start verifying `slot` periodically
    pub fn track(&self, slot: Slot) {
        let newly = self.shared.state.borrow_mut().tracked.insert(slot);
        if newly {
            log::debug!("Tracking integrity of slot {slot}");
        }
        if let Some(reason) = self.check_heartbeat(slot) {
            self.announce(slot, reason);
        }
        self.verify_slot(slot);
        self.write_heartbeat(slot);
        self.ensure_timers();
    }

    pub fn untrack(&self, slot: Slot) {
        let idle = {
            let mut state = self.shared.state.borrow_mut();
            state.tracked.remove(&slot);
            state.tracked.is_empty()
        };
        if idle {
            self.stop_timers();
        }
    }

    /// True while the verification and clock timers are scheduled
    pub fn is_running(&self) -> bool {
        let state = self.shared.state.borrow();
        state.verify_timer.is_some() && state.clock_timer.is_some()
    }

    /// Stop all background work
    pub fn stop(&self) {
        self.shared.state.borrow_mut().tracked.clear();
        self.stop_timers();
    }

    fn ensure_timers(&self) {
        let mut state = self.shared.state.borrow_mut();
        if state.tracked.is_empty() {
            return;
        }
        if state.verify_timer.is_none() {
            let weak = Rc::downgrade(&self.shared);
            state.verify_timer = Some(self.shared.timers.set_interval(
                self.shared.verify_interval_ms,
                Box::new(move || {
                    if let Some(verifier) = Self::upgrade(&weak) {
                        verifier.verify_tracked();
                    }
                }),
            ));
        }
        if state.clock_timer.is_none() {
            let weak = Rc::downgrade(&self.shared);
            state.clock_timer = Some(self.shared.timers.set_interval(
                self.shared.clock_interval_ms,
                Box::new(move || {
                    if let Some(verifier) = Self::upgrade(&weak) {
                        verifier.check_clock();
                    }
                }),
            ));
        }
    }

    fn stop_timers(&self) {
        let timers: Vec<TimerId> = {
            let mut state = self.shared.state.borrow_mut();
            [state.verify_timer.take(), state.clock_timer.take()]
                .into_iter()
                .flatten()
                .collect()
        };
        for timer in timers {
            self.shared.timers.clear(timer);
        }
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    /// The slot of a key the verifier signs, if it is one
    fn signed_slot(&self, key: &str) -> Option<Slot> {
        let layout = &self.shared.layout;
        if layout.is_integrity_entry(key) {
            return None;
        }
        layout.slot_of(key)
    }
}

impl WriteHook for IntegrityVerifier {
    fn before_write(&self, key: &str) {
        let Some(slot) = self.signed_slot(key) else { return };
        if self.shared.state.borrow().restoring {
            let seen = self.shared.state.borrow().shadow.contains_key(key);
            if !seen {
                let prior = self.shared.store.get_item(key).ok().flatten();
                self.shared.state.borrow_mut().shadow.insert(key.to_string(), prior);
            }
            return;
        }
        // Establish a baseline before the first write so the write itself
        // cannot mask earlier external changes
        let initialized = self.shared.state.borrow().expected.contains_key(&slot);
        if !initialized {
            self.verify_slot(slot);
        }
        self.shared.state.borrow_mut().pending.insert(key.to_string());
    }

    fn after_write(&self, key: &str, value: Option<&str>) {
        let Some(slot) = self.signed_slot(key) else { return };
        let signature = {
            let mut state = self.shared.state.borrow_mut();
            if state.restoring {
                return;
            }
            state.pending.remove(key);
            let expected = state.expected.entry(slot).or_default();
            match value {
                Some(value) => {
                    expected.insert(key.to_string(), value.to_string());
                }
                None => {
                    expected.remove(key);
                }
            }
            signature_of(expected)
        };
        self.write_signature(slot, &signature);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use crate::persistence::hooked::HookedStorage;
    use crate::platform::storage::MemoryStorage;
    use crate::platform::time::ManualClock;
    use crate::platform::timers::ManualTimers;
    use proptest::prelude::*;

    struct Fixture {
        raw: MemoryStorage,
        hooked: HookedStorage,
        verifier: IntegrityVerifier,
        clock: ManualClock,
        timers: ManualTimers,
        anomalies: Rc<RefCell<Vec<(Slot, AnomalyKind)>>>,
    }

    fn slot(n: u32) -> Slot {
        Slot::new(n).unwrap()
    }

    fn fixture() -> Fixture {
        let config = VaultConfig::default();
        let raw = MemoryStorage::new();
        let bus = EventBus::new();
        let clock = ManualClock::default();
        let timers = ManualTimers::with_clock(clock.clone());
        let verifier = IntegrityVerifier::new(
            &config,
            Rc::new(raw.clone()),
            bus.clone(),
            Rc::new(clock.clone()),
            Rc::new(timers.clone()),
        );
        let hooked = HookedStorage::new(Rc::new(raw.clone()), KeyLayout::new(config.namespace.clone()), bus.clone());
        hooked.add_hook(Rc::new(verifier.clone()));

        let anomalies = Rc::new(RefCell::new(Vec::new()));
        let a = anomalies.clone();
        bus.subscribe(EventFilter::all(), move |e| {
            if let VaultEvent::SlotModified { slot, reason } = e {
                a.borrow_mut().push((*slot, *reason));
            }
        });

        Fixture {
            raw,
            hooked,
            verifier,
            clock,
            timers,
            anomalies,
        }
    }

    #[test]
    fn test_signature_is_order_independent() {
        assert_eq!(compute_signature(&["a=1", "b=2"]), compute_signature(&["b=2", "a=1"]));
        assert_ne!(compute_signature(&["a=1", "b=2"]), compute_signature(&["a=1", "b=3"]));
        assert_ne!(compute_signature(&["a=1"]), compute_signature(&["a=1", "a=1"]));
        assert!(compute_signature::<&str>(&[]).ends_with("-0"));
    }

    #[test]
    fn test_writes_during_restore_judged_by_prior_values() {
        let f = fixture();
        f.raw.set_item("vault:coins:1", "1").unwrap();
        f.raw.set_item("vault:gems:1", "7").unwrap();
        assert_eq!(f.verifier.verify_slot(slot(1)), VerifyOutcome::Baseline);
        f.raw.remove_item("vault:gems:1").unwrap();

        f.verifier.begin_restore();
        f.hooked.set_item("vault:coins:1", "4").unwrap();
        assert_eq!(f.verifier.verify_slot(slot(1)), VerifyOutcome::Deferred);
        f.raw.set_item("vault:gems:1", "7").unwrap();
        f.verifier.end_restore();

        assert!(!f.verifier.is_modified(slot(1)));
        assert!(f.anomalies.borrow().is_empty());
        assert_eq!(f.verifier.verify_slot(slot(1)), VerifyOutcome::Clean);
    }

    proptest! {
        #[test]
        fn prop_signature_ignores_order(mut entries in proptest::collection::vec("[a-z]{1,6}=[0-9]{1,4}", 0..12)) {
            let forward = compute_signature(&entries);
            entries.reverse();
            prop_assert_eq!(forward, compute_signature(&entries));
        }
    }

    #[test]
    fn test_own_writes_never_flag() {
        let f = fixture();
        f.verifier.track(slot(1));
        for n in 0..20 {
            f.hooked.set_item("vault:coins:1", &(n * 10).to_string()).unwrap();
            f.hooked.set_item("vault:gems:1", &n.to_string()).unwrap();
            assert_eq!(f.verifier.verify_slot(slot(1)), VerifyOutcome::Clean);
        }
        f.hooked.remove_item("vault:gems:1").unwrap();
        assert_eq!(f.verifier.verify_slot(slot(1)), VerifyOutcome::Clean);
        assert!(!f.verifier.is_modified(slot(1)));
    }

    #[test]
    fn test_external_rewrite_latches_once() {
        let f = fixture();
        f.hooked.set_item("vault:coins:1", "100").unwrap();
        f.verifier.track(slot(1));

        f.raw.set_item("vault:coins:1", "100000").unwrap();
        assert_eq!(
            f.verifier.verify_slot(slot(1)),
            VerifyOutcome::Tampered(AnomalyKind::SignatureMismatch)
        );
        assert!(f.verifier.is_modified(slot(1)));
        assert_eq!(f.verifier.verify_slot(slot(1)), VerifyOutcome::Clean);
        assert_eq!(*f.anomalies.borrow(), vec![(slot(1), AnomalyKind::SignatureMismatch)]);
    }

    #[test]
    fn test_flag_is_latched_across_anomalies() {
        let f = fixture();
        f.hooked.set_item("vault:coins:1", "1").unwrap();
        f.verifier.track(slot(1));

        f.raw.set_item("vault:coins:1", "2").unwrap();
        f.verifier.verify_slot(slot(1));
        f.raw.set_item("vault:coins:1", "3").unwrap();
        f.verifier.verify_slot(slot(1));

        assert_eq!(f.anomalies.borrow().len(), 1);
        assert_eq!(f.raw.get_item("vault:modified:1").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_wiped_slot_is_reported() {
        let f = fixture();
        f.hooked.set_item("vault:coins:1", "5").unwrap();
        f.hooked.set_item("vault:gems:1", "5").unwrap();
        f.verifier.track(slot(1));

        f.raw.remove_item("vault:coins:1").unwrap();
        f.raw.remove_item("vault:gems:1").unwrap();
        assert_eq!(f.verifier.verify_slot(slot(1)), VerifyOutcome::Tampered(AnomalyKind::DataWiped));
    }

    #[test]
    fn test_baseline_written_for_unsigned_slot() {
        let f = fixture();
        f.raw.set_item("vault:coins:2", "7").unwrap();
        assert_eq!(f.verifier.verify_slot(slot(2)), VerifyOutcome::Baseline);
        assert!(f.verifier.stored_signature(slot(2)).is_some());
        assert_eq!(f.verifier.verify_slot(slot(2)), VerifyOutcome::Clean);
        assert!(f.anomalies.borrow().is_empty());
    }

    #[test]
    fn test_tamper_before_first_write_is_not_masked() {
        let f = fixture();
        f.hooked.set_item("vault:coins:1", "10").unwrap();
        // A fresh verifier instance, as after a reload
        let g = fixture();
        for (k, v) in f.raw.dump() {
            g.raw.set_item(&k, &v).unwrap();
        }
        g.raw.set_item("vault:coins:1", "999").unwrap();

        g.hooked.set_item("vault:gems:1", "1").unwrap();
        assert_eq!(*g.anomalies.borrow(), vec![(slot(1), AnomalyKind::SignatureMismatch)]);
    }

    #[test]
    fn test_periodic_verification() {
        let f = fixture();
        f.hooked.set_item("vault:coins:1", "10").unwrap();
        f.verifier.track(slot(1));
        assert!(f.verifier.is_running());

        f.raw.set_item("vault:coins:1", "11").unwrap();
        f.timers.advance(5000.0);
        assert_eq!(f.anomalies.borrow().len(), 1);

        f.verifier.untrack(slot(1));
        assert!(!f.verifier.is_running());
        assert_eq!(f.timers.active_count(), 0);
    }

    #[test]
    fn test_clock_regression_latches() {
        let f = fixture();
        f.verifier.track(slot(1));
        f.clock.jump_wall(-5000.0);
        assert_eq!(f.verifier.check_clock(), Some(AnomalyKind::ClockRegression));
        assert_eq!(*f.anomalies.borrow(), vec![(slot(1), AnomalyKind::ClockRegression)]);
    }

    #[test]
    fn test_small_jitter_tolerated() {
        let f = fixture();
        f.verifier.track(slot(1));
        f.clock.advance(1000.0);
        f.clock.jump_wall(-1500.0);
        assert_eq!(f.verifier.check_clock(), None);
        f.clock.advance(1000.0);
        f.clock.jump_wall(5000.0);
        assert_eq!(f.verifier.check_clock(), None);
    }

    #[test]
    fn test_forward_skew_latches_unless_anchors_reset() {
        let f = fixture();
        f.verifier.track(slot(1));

        f.clock.advance(1000.0);
        f.clock.jump_wall(60_000.0);
        f.verifier.reset_clock_anchors();
        assert_eq!(f.verifier.check_clock(), None);

        f.clock.advance(1000.0);
        f.clock.jump_wall(60_000.0);
        assert_eq!(f.verifier.check_clock(), Some(AnomalyKind::ClockSkew));
        assert!(f.verifier.is_modified(slot(1)));
    }

    #[test]
    fn test_future_heartbeat_latches_on_track() {
        let f = fixture();
        let future = f.clock.wall_ms() as u64 + 3_600_000;
        f.raw.set_item("vault:heartbeat:1", &future.to_string()).unwrap();
        f.verifier.track(slot(1));
        assert_eq!(*f.anomalies.borrow(), vec![(slot(1), AnomalyKind::ClockRegression)]);
        let heartbeat: u64 = f.raw.get_item("vault:heartbeat:1").unwrap().unwrap().parse().unwrap();
        assert_eq!(heartbeat, f.clock.wall_ms() as u64);
    }

    #[test]
    fn test_verifier_entries_excluded_from_signature() {
        let f = fixture();
        f.hooked.set_item("vault:coins:1", "10").unwrap();
        f.verifier.track(slot(1));
        f.timers.advance(3000.0);
        let entries = f.verifier.slot_entries(slot(1)).unwrap();
        assert_eq!(entries.keys().collect::<Vec<_>>(), vec!["vault:coins:1"]);
        assert_eq!(f.verifier.verify_slot(slot(1)), VerifyOutcome::Clean);
    }
}
