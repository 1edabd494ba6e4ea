//! Keyed state store
//!
//! Balances and multipliers per currency and slot. [`Bank::currency`] hands
//! out a typed [`CurrencyHandle`] bound to the active slot;
//! [`Bank::currency_in`] binds an explicit one.
//!
//! A balance write runs in a fixed order: clamp, persist (the verifier
//! re-signs inside the write hook), re-read the effective value, prime the
//! watchers, compute the delta, publish. Priming before publishing keeps the
//! next poll from reporting the same change a second time.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use crate::amount::{Amount, Factor};
use crate::events::{EventBus, VaultEvent};
use crate::keys::{Currency, KeyLayout, Slot};
use crate::platform::storage::{KeyValueStore, StorageError};

use super::codec;
use super::watcher::WatcherScheduler;

/// Storage keys frozen by an external authority (debug tools, moderation).
/// Writes to a locked key are ignored.
#[derive(Debug, Clone, Default)]
pub struct LockSet {
    keys: Rc<RefCell<HashSet<String>>>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, key: impl Into<String>) {
        self.keys.borrow_mut().insert(key.into());
    }

    pub fn unlock(&self, key: &str) -> bool {
        self.keys.borrow_mut().remove(key)
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.keys.borrow().contains(key)
    }
}

/// Extra inputs for [`CurrencyHandle::set_with`]
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Reported when the observed difference is not positive
    pub explicit_delta: Option<Amount>,
    /// Previous value already known to the caller, saves a read
    pub previous_hint: Option<Amount>,
}

#[derive(Clone)]
pub struct Bank {
    storage: Rc<dyn KeyValueStore>,
    layout: KeyLayout,
    watchers: WatcherScheduler,
    bus: EventBus,
    locks: LockSet,
    active: Rc<Cell<Slot>>,
}

impl Bank {
    pub fn new(
        storage: Rc<dyn KeyValueStore>,
        layout: KeyLayout,
        watchers: WatcherScheduler,
        bus: EventBus,
        locks: LockSet,
        active: Rc<Cell<Slot>>,
    ) -> Self {
        Self {
            storage,
            layout,
            watchers,
            bus,
            locks,
            active,
        }
    }

    pub fn active_slot(&self) -> Slot {
        self.active.get()
    }

    /// Handle for `currency` in the active slot
    pub fn currency(&self, currency: Currency) -> CurrencyHandle<'_> {
        self.currency_in(currency, self.active.get())
    }

    pub fn currency_in(&self, currency: Currency, slot: Slot) -> CurrencyHandle<'_> {
        CurrencyHandle {
            bank: self,
            currency,
            slot,
        }
    }

    pub fn locks(&self) -> &LockSet {
        &self.locks
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    fn read(&self, key: &str) -> Option<String> {
        self.storage.get_item(key).unwrap_or_else(|e| {
            log::debug!("Cannot read {key}: {e}");
            None
        })
    }

    /// Persist `encoded`, then return what the store actually holds
    fn persist(&self, key: &str, encoded: &str) -> Result<Option<String>, StorageError> {
        self.storage.set_item(key, encoded)?;
        let raw = self.read(key);
        self.watchers.prime(key, raw.as_deref());
        Ok(raw)
    }
}

/// One currency in one slot
pub struct CurrencyHandle<'a> {
    bank: &'a Bank,
    currency: Currency,
    slot: Slot,
}

impl CurrencyHandle<'_> {
    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn value_key(&self) -> String {
        self.bank.layout.value_key(self.currency, self.slot)
    }

    pub fn multiplier_key(&self) -> String {
        self.bank.layout.multiplier_key(self.currency, self.slot)
    }

    /// Current balance; zero if absent or undecodable
    pub fn get(&self) -> Amount {
        codec::decode_amount(self.bank.read(&self.value_key()).as_deref())
    }

    pub fn set(&self, value: Amount) -> Amount {
        self.set_with(value, SetOptions::default())
    }

    /// Store a new balance and return the value actually persisted
    pub fn set_with(&self, value: Amount, options: SetOptions) -> Amount {
        let key = self.value_key();
        if self.bank.locks.is_locked(&key) {
            log::debug!("{key} is locked, ignoring write");
            return self.get();
        }
        let previous = options.previous_hint.unwrap_or_else(|| self.get());

        let clamped = value.clamp_non_negative();
        let raw = match self.bank.persist(&key, &codec::encode_amount(&clamped)) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Write to {key} failed, keeping previous value: {e}");
                return previous;
            }
        };
        let effective = codec::decode_amount(raw.as_deref());

        let observed = &effective - &previous;
        let delta = if observed.is_positive() {
            observed
        } else {
            options.explicit_delta.unwrap_or(observed)
        };

        if effective != previous || !delta.is_zero() {
            self.bank.bus.publish(&VaultEvent::ValueChanged {
                currency: self.currency,
                slot: self.slot,
                value: effective.clone(),
                previous,
                delta,
            });
        }
        effective
    }

    /// Add `amount` to the balance
    pub fn add(&self, amount: Amount) -> Amount {
        let current = self.get();
        let next = &current + &amount;
        self.set_with(
            next,
            SetOptions {
                explicit_delta: Some(amount),
                previous_hint: Some(current),
            },
        )
    }

    /// Deduct `cost` if the balance covers it
    pub fn spend(&self, cost: &Amount) -> bool {
        if self.bank.locks.is_locked(&self.value_key()) {
            return false;
        }
        let current = self.get();
        if current < *cost {
            return false;
        }
        let next = &current - cost;
        self.set_with(
            next,
            SetOptions {
                explicit_delta: None,
                previous_hint: Some(current),
            },
        );
        true
    }

    /// The fixed-point multiplier (scaled by `10^18`)
    pub fn scaled_multiplier(&self) -> Amount {
        codec::decode_multiplier(self.bank.read(&self.multiplier_key()).as_deref())
    }

    /// The whole multiplier, at least 1
    pub fn multiplier(&self) -> Amount {
        codec::whole_multiplier(&self.scaled_multiplier())
    }

    /// Store a whole multiplier; values below 1 reset to 1
    pub fn set_multiplier(&self, whole: impl Into<Amount>) -> Amount {
        self.store_multiplier(codec::scale_multiplier(&whole.into()))
    }

    /// Multiply the multiplier by an integer or decimal factor and return the
    /// new whole multiplier
    pub fn multiply_multiplier(&self, factor: impl Into<Factor>) -> Amount {
        if self.bank.locks.is_locked(&self.multiplier_key()) {
            return self.multiplier();
        }
        let scaled = codec::multiply_scaled(&self.scaled_multiplier(), &factor.into());
        self.store_multiplier(scaled)
    }

    /// `amount` scaled by the whole multiplier
    pub fn apply_multiplier(&self, amount: &Amount) -> Amount {
        if amount.is_zero() {
            return Amount::zero();
        }
        let mult = self.multiplier();
        if mult.is_infinite() {
            return Amount::Infinite;
        }
        if mult == Amount::one() {
            return amount.clone();
        }
        amount * &mult
    }

    fn store_multiplier(&self, scaled: Amount) -> Amount {
        let key = self.multiplier_key();
        if self.bank.locks.is_locked(&key) {
            log::debug!("{key} is locked, ignoring write");
            return self.multiplier();
        }
        let scaled = codec::normalize_multiplier(scaled);
        let current = self.scaled_multiplier();
        if scaled == current {
            return codec::whole_multiplier(&current);
        }

        let raw = match self.bank.persist(&key, &codec::encode_multiplier(&scaled)) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Write to {key} failed, keeping previous multiplier: {e}");
                return codec::whole_multiplier(&current);
            }
        };
        let effective = codec::decode_multiplier(raw.as_deref());
        let mult = codec::whole_multiplier(&effective);
        if effective != current {
            self.bank.bus.publish(&VaultEvent::MultiplierChanged {
                currency: self.currency,
                slot: self.slot,
                mult: mult.clone(),
            });
        }
        mult
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use crate::persistence::watcher::WatchOptions;
    use crate::platform::storage::MemoryStorage;
    use crate::platform::timers::ManualTimers;

    struct Fixture {
        raw: MemoryStorage,
        bank: Bank,
        watchers: WatcherScheduler,
        events: Rc<RefCell<Vec<VaultEvent>>>,
    }

    fn fixture() -> Fixture {
        let raw = MemoryStorage::new();
        let storage: Rc<dyn KeyValueStore> = Rc::new(raw.clone());
        let bus = EventBus::new();
        let watchers = WatcherScheduler::new(storage.clone(), Rc::new(ManualTimers::new()), 250);
        let bank = Bank::new(
            storage,
            KeyLayout::new("vault"),
            watchers.clone(),
            bus.clone(),
            LockSet::new(),
            Rc::new(Cell::new(Slot::FIRST)),
        );
        let events = Rc::new(RefCell::new(Vec::new()));
        let e = events.clone();
        bus.subscribe(EventFilter::all(), move |ev| e.borrow_mut().push(ev.clone()));
        Fixture {
            raw,
            bank,
            watchers,
            events,
        }
    }

    fn amt(n: i64) -> Amount {
        Amount::from(n)
    }

    #[test]
    fn test_get_defaults_to_zero() {
        let f = fixture();
        assert_eq!(f.bank.currency(Currency::Coins).get(), Amount::zero());
        f.raw.set_item("vault:coins:1", "garbage").unwrap();
        assert_eq!(f.bank.currency(Currency::Coins).get(), Amount::zero());
    }

    #[test]
    fn test_negative_write_clamps_to_zero() {
        let f = fixture();
        for currency in Currency::ALL {
            let handle = f.bank.currency(currency);
            handle.set(amt(40));
            assert_eq!(handle.set(amt(-7)), Amount::zero());
            assert_eq!(handle.get(), Amount::zero());
        }
    }

    #[test]
    fn test_set_emits_once_with_delta() {
        let f = fixture();
        let coins = f.bank.currency(Currency::Coins);
        coins.set(amt(100));
        coins.set(amt(100));
        coins.set(amt(60));

        let events = f.events.borrow();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            VaultEvent::ValueChanged {
                currency: Currency::Coins,
                slot: Slot::FIRST,
                value: amt(100),
                previous: amt(0),
                delta: amt(100),
            }
        );
        match &events[1] {
            VaultEvent::ValueChanged { delta, .. } => assert_eq!(*delta, amt(-40)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_explicit_delta_used_when_observed_not_positive() {
        let f = fixture();
        let coins = f.bank.currency(Currency::Coins);
        coins.set(amt(10));
        coins.set_with(
            amt(10),
            SetOptions {
                explicit_delta: Some(amt(5)),
                previous_hint: None,
            },
        );
        match f.events.borrow().last() {
            Some(VaultEvent::ValueChanged { value, delta, .. }) => {
                assert_eq!(*value, amt(10));
                assert_eq!(*delta, amt(5));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_write_then_poll_reports_once() {
        let f = fixture();
        let fired = Rc::new(Cell::new(0));
        let c = fired.clone();
        f.watchers.watch("vault:coins:1", WatchOptions::amount(), move |_| c.set(c.get() + 1));

        f.bank.currency(Currency::Coins).set(amt(25));
        assert_eq!(f.watchers.poll(), 0);
        assert_eq!(fired.get(), 0);
        assert_eq!(f.events.borrow().len(), 1);
    }

    #[test]
    fn test_locked_key_ignores_writes() {
        let f = fixture();
        let coins = f.bank.currency(Currency::Coins);
        coins.set(amt(10));
        coins.set_multiplier(3u32);
        f.bank.locks().lock(coins.value_key());
        f.bank.locks().lock(coins.multiplier_key());
        let before = f.events.borrow().len();

        assert_eq!(coins.set(amt(999)), amt(10));
        assert_eq!(coins.add(amt(5)), amt(10));
        assert!(!coins.spend(&amt(1)));
        assert_eq!(coins.set_multiplier(9u32), amt(3));
        assert_eq!(coins.multiply_multiplier(2u32), amt(3));
        assert_eq!(f.events.borrow().len(), before);

        assert!(f.bank.locks().unlock(&coins.value_key()));
        assert_eq!(coins.add(amt(5)), amt(15));
    }

    #[test]
    fn test_add_and_spend() {
        let f = fixture();
        let gems = f.bank.currency(Currency::Gems);
        assert_eq!(gems.add(amt(30)), amt(30));
        assert!(gems.spend(&amt(20)));
        assert!(!gems.spend(&amt(11)));
        assert_eq!(gems.get(), amt(10));
    }

    #[test]
    fn test_multiplier_defaults_and_never_zero() {
        let f = fixture();
        let coins = f.bank.currency(Currency::Coins);
        assert_eq!(coins.multiplier(), amt(1));
        coins.set_multiplier(4u32);
        assert_eq!(coins.multiply_multiplier(0u32), amt(1));
        assert_eq!(coins.set_multiplier(0u32), amt(1));
    }

    #[test]
    fn test_decimal_multiplier_keeps_fraction() {
        let f = fixture();
        let coins = f.bank.currency(Currency::Coins);
        coins.set_multiplier(2u32);
        assert_eq!(coins.multiply_multiplier(1.5), amt(3));
        assert_eq!(coins.multiply_multiplier(0.5), amt(1));
        // 1.5 is kept internally: doubling gives 3, not 2
        assert_eq!(coins.multiply_multiplier(2u32), amt(3));
        assert_eq!(coins.multiply_multiplier(0.1), amt(1));
        assert!(f.raw.get_item("vault:mult_coins:1").unwrap().unwrap().starts_with(codec::MULTIPLIER_TAG));
    }

    #[test]
    fn test_multiplier_event_only_on_change() {
        let f = fixture();
        let coins = f.bank.currency(Currency::Coins);
        coins.set_multiplier(5u32);
        coins.set_multiplier(5u32);
        let mult_events: Vec<_> = f
            .events
            .borrow()
            .iter()
            .filter(|e| matches!(e, VaultEvent::MultiplierChanged { .. }))
            .cloned()
            .collect();
        assert_eq!(
            mult_events,
            vec![VaultEvent::MultiplierChanged {
                currency: Currency::Coins,
                slot: Slot::FIRST,
                mult: amt(5),
            }]
        );
    }

    #[test]
    fn test_apply_multiplier() {
        let f = fixture();
        let coins = f.bank.currency(Currency::Coins);
        assert_eq!(coins.apply_multiplier(&amt(10)), amt(10));
        coins.set_multiplier(5u32);
        assert_eq!(coins.apply_multiplier(&amt(10)), amt(50));

        let before = f.raw.dump();
        assert_eq!(coins.apply_multiplier(&Amount::zero()), Amount::zero());
        assert_eq!(f.raw.dump(), before);

        coins.set_multiplier(Amount::Infinite);
        assert_eq!(coins.apply_multiplier(&amt(3)), Amount::Infinite);
    }

    #[test]
    fn test_explicit_slot_is_independent() {
        let f = fixture();
        let slot2 = Slot::new(2).unwrap();
        f.bank.currency(Currency::Coins).set(amt(1));
        f.bank.currency_in(Currency::Coins, slot2).set(amt(2));
        assert_eq!(f.raw.get_item("vault:coins:2").unwrap().as_deref(), Some("2"));
        assert_eq!(f.bank.currency(Currency::Coins).get(), amt(1));
    }

    #[test]
    fn test_failed_write_returns_previous() {
        let f = fixture();
        let coins = f.bank.currency(Currency::Coins);
        coins.set(amt(8));
        f.raw.set_available(false);
        assert_eq!(
            coins.set_with(
                amt(20),
                SetOptions {
                    explicit_delta: None,
                    previous_hint: Some(amt(8)),
                },
            ),
            amt(8)
        );
        assert_eq!(f.events.borrow().len(), 1);
    }
}
