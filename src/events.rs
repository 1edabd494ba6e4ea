//! Change notification bus
//!
//! In-process publish/subscribe for vault events. Nothing here is persisted.
//! Delivery is synchronous and follows registration order; a subscriber that
//! panics is logged and skipped so the remaining subscribers still receive
//! the event.

use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use crate::amount::Amount;
use crate::keys::{Currency, Slot};

/// Why a slot was marked as modified externally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    /// Stored entries no longer match the recorded signature
    SignatureMismatch,
    /// Every entry of a signed slot disappeared
    DataWiped,
    /// Wall clock went backwards
    ClockRegression,
    /// Wall clock ran ahead of monotonic time
    ClockSkew,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::SignatureMismatch => "signature mismatch",
            AnomalyKind::DataWiped => "data wiped",
            AnomalyKind::ClockRegression => "clock regression",
            AnomalyKind::ClockSkew => "clock skew",
        }
    }
}

/// Events published by the vault
#[derive(Debug, Clone, PartialEq)]
pub enum VaultEvent {
    ValueChanged {
        currency: Currency,
        slot: Slot,
        value: Amount,
        previous: Amount,
        delta: Amount,
    },
    MultiplierChanged {
        currency: Currency,
        slot: Slot,
        /// Whole (floored) multiplier
        mult: Amount,
    },
    SlotSwitched {
        slot: Slot,
        previous: Option<Slot>,
    },
    SlotModified {
        slot: Slot,
        reason: AnomalyKind,
    },
    /// A raw write to a namespaced key went through the storage layer
    StorageMutation {
        key: String,
        slot: Option<Slot>,
        trusted: bool,
    },
}

impl VaultEvent {
    /// Key used for subscriber filtering: the currency id for value and
    /// multiplier events, the storage key for raw mutations
    pub fn key(&self) -> Option<&str> {
        match self {
            VaultEvent::ValueChanged { currency, .. } | VaultEvent::MultiplierChanged { currency, .. } => {
                Some(currency.id())
            }
            VaultEvent::StorageMutation { key, .. } => Some(key),
            VaultEvent::SlotSwitched { .. } | VaultEvent::SlotModified { .. } => None,
        }
    }

    pub fn slot(&self) -> Option<Slot> {
        match self {
            VaultEvent::ValueChanged { slot, .. }
            | VaultEvent::MultiplierChanged { slot, .. }
            | VaultEvent::SlotSwitched { slot, .. }
            | VaultEvent::SlotModified { slot, .. } => Some(*slot),
            VaultEvent::StorageMutation { slot, .. } => *slot,
        }
    }
}

/// Optional key and slot filters; an unset filter matches everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub key: Option<String>,
    pub slot: Option<Slot>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            slot: None,
        }
    }

    pub fn currency(currency: Currency) -> Self {
        Self::key(currency.id())
    }

    pub fn slot(slot: Slot) -> Self {
        Self { key: None, slot: Some(slot) }
    }

    pub fn with_slot(mut self, slot: Slot) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn matches(&self, event: &VaultEvent) -> bool {
        let key_ok = self.key.as_deref().is_none_or(|k| event.key() == Some(k));
        let slot_ok = self.slot.is_none_or(|s| event.slot() == Some(s));
        key_ok && slot_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Rc<dyn Fn(&VaultEvent)>;

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    listener: Listener,
}

#[derive(Default)]
struct BusInner {
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

/// Shared handle to the bus; clones publish to the same subscribers
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Rc<RefCell<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, filter: EventFilter, listener: impl Fn(&VaultEvent) + 'static) -> SubscriptionId {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.subscribers.push(Subscriber {
            id,
            filter,
            listener: Rc::new(listener),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != id);
        inner.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().subscribers.len()
    }

    /// Deliver `event` to every matching subscriber; returns how many received it.
    ///
    /// Subscribers may subscribe, unsubscribe or publish from inside a listener.
    pub fn publish(&self, event: &VaultEvent) -> usize {
        let listeners: Vec<Listener> = self
            .inner
            .borrow()
            .subscribers
            .iter()
            .filter(|s| s.filter.matches(event))
            .map(|s| s.listener.clone())
            .collect();

        listeners
            .into_iter()
            .filter(|listener| run_isolated("event subscriber", || listener(event)))
            .count()
    }
}

/// Run a callback, logging instead of propagating a panic. Returns false if it panicked.
pub(crate) fn run_isolated(what: &str, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("{what} panicked: {msg}");
            false
        }
    }
}
