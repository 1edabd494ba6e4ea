//! Timer host
//!
//! `setInterval`/`setTimeout` in the browser, a hand-advanced queue
//! everywhere else. Callbacks run with no timer state borrowed, so a callback
//! may schedule or clear timers (including its own).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use super::time::ManualClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

pub trait TimerHost {
    fn set_interval(&self, period_ms: u32, callback: Box<dyn FnMut()>) -> TimerId;
    fn set_timeout(&self, delay_ms: u32, callback: Box<dyn FnOnce()>) -> TimerId;
    fn clear(&self, id: TimerId);
}

enum Callback {
    Once(Box<dyn FnOnce()>),
    Repeat(Box<dyn FnMut()>),
}

struct Pending {
    due_ms: f64,
    period_ms: Option<u32>,
    /// `None` while the callback is running
    callback: Option<Callback>,
}

#[derive(Default)]
struct ManualInner {
    now_ms: f64,
    next_id: u64,
    entries: BTreeMap<TimerId, Pending>,
}

/// Deterministic timer queue driven by [`ManualTimers::advance`].
/// Clones share the same queue.
#[derive(Clone, Default)]
pub struct ManualTimers {
    inner: Rc<RefCell<ManualInner>>,
    clock: Option<ManualClock>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timers that also move `clock` forward as time advances
    pub fn with_clock(clock: ManualClock) -> Self {
        Self {
            inner: Rc::default(),
            clock: Some(clock),
        }
    }

    pub fn now_ms(&self) -> f64 {
        self.inner.borrow().now_ms
    }

    /// Number of scheduled timers
    pub fn active_count(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.inner.borrow().entries.contains_key(&id)
    }

    fn move_to(&self, t: f64) {
        let mut inner = self.inner.borrow_mut();
        if t > inner.now_ms {
            if let Some(clock) = &self.clock {
                clock.advance(t - inner.now_ms);
            }
            inner.now_ms = t;
        }
    }

    /// Run every timer due within the next `ms` milliseconds, in due order
    pub fn advance(&self, ms: f64) {
        let target = self.now_ms() + ms;
        loop {
            let next = {
                let inner = self.inner.borrow();
                inner
                    .entries
                    .iter()
                    .filter(|(_, p)| p.callback.is_some() && p.due_ms <= target)
                    .min_by(|a, b| a.1.due_ms.total_cmp(&b.1.due_ms).then(a.0.cmp(b.0)))
                    .map(|(id, p)| (*id, p.due_ms))
            };
            let Some((id, due)) = next else { break };
            self.move_to(due);

            let callback = {
                let mut inner = self.inner.borrow_mut();
                let period = inner.entries.get(&id).map(|p| p.period_ms);
                match period {
                    Some(None) => inner.entries.remove(&id).and_then(|p| p.callback),
                    Some(Some(period)) => inner.entries.get_mut(&id).and_then(|p| {
                        p.due_ms += period.max(1) as f64;
                        p.callback.take()
                    }),
                    None => None,
                }
            };

            match callback {
                Some(Callback::Once(f)) => f(),
                Some(Callback::Repeat(mut f)) => {
                    f();
                    // Cleared from inside its own callback: drop it
                    if let Some(p) = self.inner.borrow_mut().entries.get_mut(&id) {
                        p.callback = Some(Callback::Repeat(f));
                    }
                }
                None => {}
            }
        }
        self.move_to(target);
    }

    fn schedule(&self, delay_ms: u32, period_ms: Option<u32>, callback: Callback) -> TimerId {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let id = TimerId(inner.next_id);
        let due_ms = inner.now_ms + delay_ms as f64;
        inner.entries.insert(
            id,
            Pending {
                due_ms,
                period_ms,
                callback: Some(callback),
            },
        );
        id
    }
}

impl TimerHost for ManualTimers {
    fn set_interval(&self, period_ms: u32, callback: Box<dyn FnMut()>) -> TimerId {
        let period = period_ms.max(1);
        self.schedule(period, Some(period), Callback::Repeat(callback))
    }

    fn set_timeout(&self, delay_ms: u32, callback: Box<dyn FnOnce()>) -> TimerId {
        self.schedule(delay_ms, None, Callback::Once(callback))
    }

    fn clear(&self, id: TimerId) {
        self.inner.borrow_mut().entries.remove(&id);
    }
}

#[cfg(target_arch = "wasm32")]
mod browser {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    use wasm_bindgen::JsCast;
    use wasm_bindgen::closure::Closure;

    use super::{TimerHost, TimerId};

    struct LiveTimer {
        handle: i32,
        repeating: bool,
        closure: Closure<dyn FnMut()>,
    }

    #[derive(Default)]
    struct BrowserTimerState {
        next_id: u64,
        running: Option<TimerId>,
        live: HashMap<TimerId, LiveTimer>,
        /// Closures of finished or cleared timers, dropped once not running
        retired: Vec<(TimerId, Closure<dyn FnMut()>)>,
    }

    impl BrowserTimerState {
        fn purge(&mut self) {
            let running = self.running;
            self.retired.retain(|(id, _)| Some(*id) == running);
        }
    }

    /// `window.setInterval` / `window.setTimeout`
    pub struct BrowserTimers {
        window: web_sys::Window,
        state: Rc<RefCell<BrowserTimerState>>,
    }

    impl BrowserTimers {
        pub fn new(window: web_sys::Window) -> Self {
            Self {
                window,
                state: Rc::default(),
            }
        }

        fn allocate(&self) -> TimerId {
            let mut state = self.state.borrow_mut();
            state.purge();
            state.next_id += 1;
            TimerId(state.next_id)
        }

        fn wrap(&self, id: TimerId, once: bool, mut callback: Box<dyn FnMut()>) -> Closure<dyn FnMut()> {
            let weak = Rc::downgrade(&self.state);
            Closure::wrap(Box::new(move || {
                if let Some(state) = weak.upgrade() {
                    let mut state = state.borrow_mut();
                    state.running = Some(id);
                    if once {
                        if let Some(timer) = state.live.remove(&id) {
                            state.retired.push((id, timer.closure));
                        }
                    }
                }
                callback();
                if let Some(state) = weak.upgrade() {
                    state.borrow_mut().running = None;
                }
            }) as Box<dyn FnMut()>)
        }
    }

    impl TimerHost for BrowserTimers {
        fn set_interval(&self, period_ms: u32, callback: Box<dyn FnMut()>) -> TimerId {
            let id = self.allocate();
            let closure = self.wrap(id, false, callback);
            match self
                .window
                .set_interval_with_callback_and_timeout_and_arguments_0(
                    closure.as_ref().unchecked_ref(),
                    period_ms as i32,
                ) {
                Ok(handle) => {
                    self.state.borrow_mut().live.insert(
                        id,
                        LiveTimer {
                            handle,
                            repeating: true,
                            closure,
                        },
                    );
                }
                Err(e) => log::warn!("setInterval failed: {e:?}"),
            }
            id
        }

        fn set_timeout(&self, delay_ms: u32, callback: Box<dyn FnOnce()>) -> TimerId {
            let id = self.allocate();
            let mut callback = Some(callback);
            let closure = self.wrap(
                id,
                true,
                Box::new(move || {
                    if let Some(f) = callback.take() {
                        f();
                    }
                }),
            );
            match self
                .window
                .set_timeout_with_callback_and_timeout_and_arguments_0(
                    closure.as_ref().unchecked_ref(),
                    delay_ms as i32,
                ) {
                Ok(handle) => {
                    self.state.borrow_mut().live.insert(
                        id,
                        LiveTimer {
                            handle,
                            repeating: false,
                            closure,
                        },
                    );
                }
                Err(e) => log::warn!("setTimeout failed: {e:?}"),
            }
            id
        }

        fn clear(&self, id: TimerId) {
            let mut state = self.state.borrow_mut();
            state.purge();
            if let Some(timer) = state.live.remove(&id) {
                if timer.repeating {
                    self.window.clear_interval_with_handle(timer.handle);
                } else {
                    self.window.clear_timeout_with_handle(timer.handle);
                }
                state.retired.push((id, timer.closure));
            }
        }
    }
}

#[cfg(target_arch = "wasm32")]
pub use browser::BrowserTimers;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::time::Clock;
    use std::cell::Cell;

    #[test]
    fn test_interval_fires_each_period() {
        let timers = ManualTimers::new();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        timers.set_interval(100, Box::new(move || c.set(c.get() + 1)));

        timers.advance(99.0);
        assert_eq!(count.get(), 0);
        timers.advance(1.0);
        assert_eq!(count.get(), 1);
        timers.advance(350.0);
        assert_eq!(count.get(), 4);
    }

    #[test]
    fn test_timeout_fires_once_and_can_be_cleared() {
        let timers = ManualTimers::new();
        let fired = Rc::new(Cell::new(0));

        let f = fired.clone();
        timers.set_timeout(50, Box::new(move || f.set(f.get() + 1)));
        let f = fired.clone();
        let cancelled = timers.set_timeout(50, Box::new(move || f.set(f.get() + 100)));
        timers.clear(cancelled);

        timers.advance(1000.0);
        assert_eq!(fired.get(), 1);
        assert_eq!(timers.active_count(), 0);
    }

    #[test]
    fn test_interval_can_clear_itself() {
        let timers = ManualTimers::new();
        let count = Rc::new(Cell::new(0));
        let id = Rc::new(Cell::new(None));

        let (t, c, i) = (timers.clone(), count.clone(), id.clone());
        let handle = timers.set_interval(
            10,
            Box::new(move || {
                c.set(c.get() + 1);
                if c.get() == 3 {
                    if let Some(id) = i.get() {
                        t.clear(id);
                    }
                }
            }),
        );
        id.set(Some(handle));

        timers.advance(100.0);
        assert_eq!(count.get(), 3);
        assert!(!timers.is_scheduled(handle));
    }

    #[test]
    fn test_callback_can_schedule_more_work() {
        let timers = ManualTimers::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let (t, o) = (timers.clone(), order.clone());
        timers.set_timeout(
            10,
            Box::new(move || {
                o.borrow_mut().push("first");
                let o = o.clone();
                t.set_timeout(10, Box::new(move || o.borrow_mut().push("second")));
            }),
        );

        timers.advance(25.0);
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn test_clock_follows_timers() {
        let clock = ManualClock::new(0.0);
        let timers = ManualTimers::with_clock(clock.clone());
        let seen = Rc::new(Cell::new(0.0));
        let (s, c) = (seen.clone(), clock.clone());
        timers.set_timeout(40, Box::new(move || s.set(c.monotonic_ms())));

        timers.advance(100.0);
        assert_eq!(seen.get(), 40.0);
        assert_eq!(clock.monotonic_ms(), 100.0);
    }
}
