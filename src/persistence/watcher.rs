//! Polling watcher scheduler
//!
//! The primary store has no change notification, so watched keys are sampled
//! on one shared interval timer. The timer starts with the first registration
//! and stops when the last one is removed.
//!
//! Each registration decodes the raw string with its own decoder and compares
//! with its own equality function, so raw-string, numeric and JSON watchers can
//! share the same key and the same tick. The first observation only primes the
//! registration's cache unless it opted into an initial callback.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::{Rc, Weak};

use serde::de::DeserializeOwned;

use crate::amount::Amount;
use crate::events::run_isolated;
use crate::platform::storage::KeyValueStore;
use crate::platform::timers::{TimerHost, TimerId};

use super::codec;

/// Handle for one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

/// A change seen by one registration
#[derive(Debug, Clone, PartialEq)]
pub struct WatchChange<T> {
    pub key: String,
    pub value: T,
    /// `None` on the initial callback
    pub previous: Option<T>,
    pub raw: Option<String>,
    pub previous_raw: Option<String>,
    pub raw_changed: bool,
    pub value_changed: bool,
}

type Decoder<T> = Rc<dyn Fn(Option<&str>) -> T>;
type Equality<T> = Rc<dyn Fn(&T, &T) -> bool>;

/// How a registration reads and compares its key
pub struct WatchOptions<T> {
    decode: Decoder<T>,
    equals: Equality<T>,
    fire_initial: bool,
}

impl<T: PartialEq + 'static> WatchOptions<T> {
    pub fn new(decode: impl Fn(Option<&str>) -> T + 'static) -> Self {
        Self {
            decode: Rc::new(decode),
            equals: Rc::new(|a: &T, b: &T| a == b),
            fire_initial: false,
        }
    }
}

impl<T> WatchOptions<T> {
    /// Replace the default `==` comparison
    pub fn with_equality(mut self, equals: impl Fn(&T, &T) -> bool + 'static) -> Self {
        self.equals = Rc::new(equals);
        self
    }

    /// Fire once with the value found at registration time
    pub fn fire_initial(mut self, fire: bool) -> Self {
        self.fire_initial = fire;
        self
    }
}

impl WatchOptions<Option<String>> {
    /// The raw stored string
    pub fn raw() -> Self {
        Self::new(|raw| raw.map(str::to_owned))
    }
}

impl WatchOptions<Amount> {
    /// A balance, decoded like the bank decodes it
    pub fn amount() -> Self {
        Self::new(codec::decode_amount)
    }

    /// The whole (floored) part of a stored multiplier
    pub fn multiplier() -> Self {
        Self::new(|raw| codec::whole_multiplier(&codec::decode_multiplier(raw)))
    }
}

impl<T: DeserializeOwned + PartialEq + 'static> WatchOptions<Option<T>> {
    /// A JSON document; unparsable content reads as `None`
    pub fn json() -> Self {
        Self::new(|raw| raw.and_then(|text| serde_json::from_str(text).ok()))
    }
}

type Firing = Box<dyn FnOnce()>;

/// Type-erased registration state
trait Registration {
    /// Compare `raw` with the cache; returns the callback to run if it changed
    fn observe(&mut self, key: &str, raw: Option<&str>) -> Option<Firing>;
    /// Replace the cache without firing
    fn prime(&mut self, raw: Option<&str>);
    /// Forget the cache; the next observation primes again
    fn reset(&mut self);
}

struct Typed<T> {
    options: WatchOptions<T>,
    callback: Rc<dyn Fn(&WatchChange<T>)>,
    last: Option<(Option<String>, T)>,
}

impl<T: Clone + 'static> Registration for Typed<T> {
    fn observe(&mut self, key: &str, raw: Option<&str>) -> Option<Firing> {
        let value = (self.options.decode)(raw);
        let raw = raw.map(str::to_owned);

        let change = match self.last.take() {
            None => {
                self.last = Some((raw.clone(), value.clone()));
                if !self.options.fire_initial {
                    return None;
                }
                WatchChange {
                    key: key.to_string(),
                    value,
                    previous: None,
                    raw,
                    previous_raw: None,
                    raw_changed: true,
                    value_changed: true,
                }
            }
            Some((previous_raw, previous)) => {
                let raw_changed = previous_raw != raw;
                let value_changed = !(self.options.equals)(&previous, &value);
                if !raw_changed && !value_changed {
                    self.last = Some((previous_raw, previous));
                    return None;
                }
                self.last = Some((raw.clone(), value.clone()));
                WatchChange {
                    key: key.to_string(),
                    value,
                    previous: Some(previous),
                    raw,
                    previous_raw,
                    raw_changed,
                    value_changed,
                }
            }
        };

        let callback = self.callback.clone();
        Some(Box::new(move || callback(&change)))
    }

    fn prime(&mut self, raw: Option<&str>) {
        let value = (self.options.decode)(raw);
        self.last = Some((raw.map(str::to_owned), value));
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

struct Entry {
    key: String,
    registration: Box<dyn Registration>,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<WatchId, Entry>,
    timer: Option<TimerId>,
    next_id: u64,
}

struct Shared {
    storage: Rc<dyn KeyValueStore>,
    timers: Rc<dyn TimerHost>,
    interval_ms: u32,
    state: RefCell<State>,
}

/// Shared polling loop. Clones drive the same registrations.
#[derive(Clone)]
pub struct WatcherScheduler {
    shared: Rc<Shared>,
}

impl WatcherScheduler {
    pub fn new(storage: Rc<dyn KeyValueStore>, timers: Rc<dyn TimerHost>, interval_ms: u32) -> Self {
        Self {
            shared: Rc::new(Shared {
                storage,
                timers,
                interval_ms,
                state: RefCell::new(State::default()),
            }),
        }
    }

    fn read(&self, key: &str) -> Option<Option<String>> {
        match self.shared.storage.get_item(key) {
            Ok(raw) => Some(raw),
            Err(e) => {
                log::debug!("Watcher cannot read {key}: {e}");
                None
            }
        }
    }

    /// Register interest in `key`. The current value primes the cache and is
    /// only reported if `options` asks for an initial callback.
    pub fn watch<T: Clone + 'static>(
        &self,
        key: impl Into<String>,
        options: WatchOptions<T>,
        callback: impl Fn(&WatchChange<T>) + 'static,
    ) -> WatchId {
        let key = key.into();
        let raw = self.read(&key).flatten();
        let mut registration = Typed {
            options,
            callback: Rc::new(callback),
            last: None,
        };
        let initial = registration.observe(&key, raw.as_deref());

        let id = {
            let mut state = self.shared.state.borrow_mut();
            state.next_id += 1;
            let id = WatchId(state.next_id);
            state.entries.insert(
                id,
                Entry {
                    key,
                    registration: Box::new(registration),
                },
            );
            id
        };
        self.ensure_timer();

        if let Some(fire) = initial {
            run_isolated("watcher callback", fire);
        }
        id
    }

    pub fn unwatch(&self, id: WatchId) -> bool {
        let (removed, idle_timer) = {
            let mut state = self.shared.state.borrow_mut();
            let removed = state.entries.remove(&id).is_some();
            let idle_timer = if state.entries.is_empty() { state.timer.take() } else { None };
            (removed, idle_timer)
        };
        if let Some(timer) = idle_timer {
            self.shared.timers.clear(timer);
        }
        removed
    }

    /// Point a registration at another key. Its cache restarts from the new
    /// key's current value without firing.
    pub fn rebind(&self, id: WatchId, key: impl Into<String>) -> bool {
        let key = key.into();
        let raw = self.read(&key).flatten();
        let mut state = self.shared.state.borrow_mut();
        let Some(entry) = state.entries.get_mut(&id) else {
            return false;
        };
        entry.key = key;
        entry.registration.reset();
        entry.registration.prime(raw.as_deref());
        true
    }

    /// Tell every registration on `key` that `raw` is already known, so a
    /// trusted write is not reported again by the next poll
    pub fn prime(&self, key: &str, raw: Option<&str>) {
        let mut state = self.shared.state.borrow_mut();
        for entry in state.entries.values_mut().filter(|e| e.key == key) {
            entry.registration.prime(raw);
        }
    }

    /// Sample every watched key once; returns how many callbacks fired
    pub fn poll(&self) -> usize {
        let keys: BTreeSet<String> = self
            .shared
            .state
            .borrow()
            .entries
            .values()
            .map(|e| e.key.clone())
            .collect();

        let mut firings = Vec::new();
        for key in keys {
            let Some(raw) = self.read(&key) else { continue };
            let mut state = self.shared.state.borrow_mut();
            for entry in state.entries.values_mut().filter(|e| e.key == key) {
                firings.extend(entry.registration.observe(&key, raw.as_deref()));
            }
        }

        let fired = firings.len();
        for fire in firings {
            run_isolated("watcher callback", fire);
        }
        fired
    }

    pub fn watched_keys(&self) -> Vec<String> {
        let keys: BTreeSet<String> = self
            .shared
            .state
            .borrow()
            .entries
            .values()
            .map(|e| e.key.clone())
            .collect();
        keys.into_iter().collect()
    }

    pub fn registration_count(&self) -> usize {
        self.shared.state.borrow().entries.len()
    }

    /// True while the shared poll timer is scheduled
    pub fn is_running(&self) -> bool {
        self.shared.state.borrow().timer.is_some()
    }

    /// Drop every registration and the poll timer
    pub fn stop(&self) {
        let timer = {
            let mut state = self.shared.state.borrow_mut();
            state.entries.clear();
            state.timer.take()
        };
        if let Some(timer) = timer {
            self.shared.timers.clear(timer);
        }
    }

    fn ensure_timer(&self) {
        let mut state = self.shared.state.borrow_mut();
        if state.timer.is_some() || state.entries.is_empty() {
            return;
        }
        let weak: Weak<Shared> = Rc::downgrade(&self.shared);
        let timer = self.shared.timers.set_interval(
            self.shared.interval_ms,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    WatcherScheduler { shared }.poll();
                }
            }),
        );
        state.timer = Some(timer);
    }
}
