//! Wall-clock and monotonic time sources

use std::cell::Cell;
use std::rc::Rc;

/// Millisecond time source
pub trait Clock {
    /// Milliseconds since the Unix epoch (can jump)
    fn wall_ms(&self) -> f64;
    /// Milliseconds since an arbitrary origin (never goes backwards)
    fn monotonic_ms(&self) -> f64;
}

/// Hand-driven clock for tests and deterministic replays.
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    wall: Rc<Cell<f64>>,
    mono: Rc<Cell<f64>>,
}

impl ManualClock {
    pub fn new(wall_start_ms: f64) -> Self {
        Self {
            wall: Rc::new(Cell::new(wall_start_ms)),
            mono: Rc::new(Cell::new(0.0)),
        }
    }

    /// Advance both clocks together
    pub fn advance(&self, ms: f64) {
        self.wall.set(self.wall.get() + ms);
        self.mono.set(self.mono.get() + ms);
    }

    /// Move only the wall clock (user changed system time, device slept)
    pub fn jump_wall(&self, ms: f64) {
        self.wall.set(self.wall.get() + ms);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1_700_000_000_000.0)
    }
}

impl Clock for ManualClock {
    fn wall_ms(&self) -> f64 {
        self.wall.get()
    }

    fn monotonic_ms(&self) -> f64 {
        self.mono.get()
    }
}

/// Native system clock
#[cfg(not(target_arch = "wasm32"))]
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: std::time::Instant,
}

#[cfg(not(target_arch = "wasm32"))]
impl Default for SystemClock {
    fn default() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl Clock for SystemClock {
    fn wall_ms(&self) -> f64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }

    fn monotonic_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

/// `Date.now()` and `performance.now()`
#[cfg(target_arch = "wasm32")]
pub struct BrowserClock {
    performance: Option<web_sys::Performance>,
}

#[cfg(target_arch = "wasm32")]
impl BrowserClock {
    pub fn new(window: &web_sys::Window) -> Self {
        Self {
            performance: window.performance(),
        }
    }
}

#[cfg(target_arch = "wasm32")]
impl Clock for BrowserClock {
    fn wall_ms(&self) -> f64 {
        js_sys::Date::now()
    }

    fn monotonic_ms(&self) -> f64 {
        match &self.performance {
            Some(p) => p.now(),
            None => js_sys::Date::now(),
        }
    }
}
