//! Write interception for the primary store
//!
//! [`HookedStorage`] wraps the real store and implements the same
//! [`KeyValueStore`] interface. Every write or removal of a namespaced key
//! runs each hook's `before_write`, the write itself, each hook's
//! `after_write`, then publishes a `StorageMutation` event classified by
//! [`OriginProbe`]. Keys outside the namespace pass straight through.

use std::cell::RefCell;
use std::rc::Rc;

use crate::events::{EventBus, VaultEvent};
use crate::keys::KeyLayout;
use crate::platform::storage::{KeyValueStore, StorageError};

/// Observer of writes to namespaced keys
pub trait WriteHook {
    /// An authorized write to `key` is about to happen
    fn before_write(&self, _key: &str) {}

    /// `key` now holds `value` (`None` after a removal)
    fn after_write(&self, key: &str, value: Option<&str>);
}

/// Captures the call stack of the current write, if the platform has one
pub trait OriginProbe {
    fn capture(&self) -> Option<String>;
}

/// Probe for platforms without an interactive console: every write is trusted
pub struct NoProbe;

impl OriginProbe for NoProbe {
    fn capture(&self) -> Option<String> {
        None
    }
}

/// Frame signatures of code typed into a developer console
const CONSOLE_MARKERS: &[&str] = &["debugger eval code", "_commandLineAPI", "injectedScript"];

/// `<anonymous>:1:8`, the location Chrome gives console input. Built-ins
/// such as `Array.forEach (<anonymous>)` carry no line number.
fn is_anonymous_location(frame: &str) -> bool {
    frame
        .match_indices("<anonymous>:")
        .any(|(i, m)| frame[i + m.len()..].starts_with(|c: char| c.is_ascii_digit()))
}

/// `VM412:1:9`, the script name Chrome gives console evaluations
fn is_vm_script(frame: &str) -> bool {
    frame.match_indices("VM").any(|(i, _)| {
        let standalone = !frame[..i].ends_with(|c: char| c.is_ascii_alphanumeric());
        let rest = &frame[i + 2..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        standalone && digits > 0 && rest[digits..].starts_with(':')
    })
}

fn is_console_frame(frame: &str) -> bool {
    CONSOLE_MARKERS.iter().any(|m| frame.contains(m)) || is_anonymous_location(frame) || is_vm_script(frame)
}

/// Heuristic: did this stack originate from an interactive console?
///
/// The console frame sits below the bindings and wasm frames of whatever
/// exported method it called, so every frame is examined.
pub fn is_interactive_origin(stack: &str) -> bool {
    stack.lines().map(str::trim).any(is_console_frame)
}

/// Decorator that runs [`WriteHook`]s around namespaced writes
pub struct HookedStorage {
    inner: Rc<dyn KeyValueStore>,
    layout: KeyLayout,
    bus: EventBus,
    probe: Rc<dyn OriginProbe>,
    hooks: RefCell<Vec<Rc<dyn WriteHook>>>,
}

impl HookedStorage {
    pub fn new(inner: Rc<dyn KeyValueStore>, layout: KeyLayout, bus: EventBus) -> Self {
        Self {
            inner,
            layout,
            bus,
            probe: Rc::new(NoProbe),
            hooks: RefCell::new(Vec::new()),
        }
    }

    pub fn with_probe(mut self, probe: Rc<dyn OriginProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn add_hook(&self, hook: Rc<dyn WriteHook>) {
        self.hooks.borrow_mut().push(hook);
    }

    /// The undecorated store
    pub fn inner(&self) -> &Rc<dyn KeyValueStore> {
        &self.inner
    }

    fn hooks(&self) -> Vec<Rc<dyn WriteHook>> {
        self.hooks.borrow().clone()
    }

    fn trusted(&self) -> bool {
        self.probe
            .capture()
            .is_none_or(|stack| !is_interactive_origin(&stack))
    }

    fn intercept(
        &self,
        key: &str,
        value: Option<&str>,
        write: impl FnOnce() -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        if !self.layout.owns(key) {
            return write();
        }

        let trusted = self.trusted();
        let hooks = self.hooks();
        for hook in &hooks {
            hook.before_write(key);
        }
        let result = write();
        // Hooks see the write even if it failed so pending state is released;
        // after a failure they are told the value currently stored.
        let stored = match &result {
            Ok(()) => value.map(str::to_owned),
            Err(_) => self.inner.get_item(key).ok().flatten(),
        };
        for hook in &hooks {
            hook.after_write(key, stored.as_deref());
        }
        result?;

        if !trusted {
            log::warn!("Untrusted write to {key}");
        }
        self.bus.publish(&VaultEvent::StorageMutation {
            key: key.to_string(),
            slot: self.layout.slot_of(key),
            trusted,
        });
        Ok(())
    }
}

impl KeyValueStore for HookedStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.intercept(key, Some(value), || self.inner.set_item(key, value))
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.intercept(key, None, || self.inner.remove_item(key))
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.inner.keys()
    }
}
