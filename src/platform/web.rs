//! Browser glue
//!
//! Builds a [`VaultPlatform`] from browser APIs, forwards page lifecycle and
//! cross-tab storage events to the vault, and exposes a small JS surface.

use std::rc::Rc;

use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;

use super::idb::IdbSnapshotStore;
use super::storage::{KeyValueStore, MemoryStorage, WebStorage};
use super::time::BrowserClock;
use super::timers::BrowserTimers;
use crate::amount::Amount;
use crate::config::VaultConfig;
use crate::keys::{Currency, Slot};
use crate::persistence::hooked::OriginProbe;
use crate::vault::{Lifecycle, Vault, VaultPlatform};

const STACK_FRAMES: f64 = 64.0;

/// Reads `new Error().stack` at the point of a write
pub struct ConsoleProbe;

impl OriginProbe for ConsoleProbe {
    fn capture(&self) -> Option<String> {
        // Console frames sit below the bindings and wasm frames; Chrome's
        // default limit of 10 frames can cut them off
        let limit = JsValue::from_str("stackTraceLimit");
        let ctor = js_sys::Error::new("").constructor();
        if js_sys::Reflect::get(&ctor, &limit).ok()?.as_f64() < Some(STACK_FRAMES) {
            let _ = js_sys::Reflect::set(&ctor, &limit, &JsValue::from_f64(STACK_FRAMES));
        }
        let error = js_sys::Error::new("");
        js_sys::Reflect::get(&error, &JsValue::from_str("stack"))
            .ok()?
            .as_string()
    }
}

pub fn init_logging() {
    console_error_panic_hook::set_once();
    if console_log::init_with_level(log::Level::Info).is_err() {
        web_sys::console::warn_1(&"Logger already initialized".into());
    }
}

/// LocalStorage, IndexedDB, browser timers and clocks
pub fn browser_platform(config: &VaultConfig) -> Option<VaultPlatform> {
    let window = web_sys::window()?;
    let storage: Rc<dyn KeyValueStore> = match WebStorage::local() {
        Some(storage) => Rc::new(storage),
        None => {
            log::warn!("LocalStorage unavailable, balances will not persist");
            Rc::new(MemoryStorage::new())
        }
    };
    Some(VaultPlatform {
        storage,
        snapshots: Rc::new(IdbSnapshotStore::new(
            format!("{}_backup", config.namespace),
            "snapshots",
        )),
        timers: Rc::new(BrowserTimers::new(window.clone())),
        clock: Rc::new(BrowserClock::new(&window)),
        probe: Rc::new(ConsoleProbe),
    })
}

fn on_lifecycle(target: &web_sys::EventTarget, event: &str, vault: &Rc<Vault>, signal: Lifecycle) {
    let vault = vault.clone();
    let closure = Closure::<dyn FnMut(_)>::new(move |_event: web_sys::Event| {
        vault.lifecycle(signal);
    });
    let _ = target.add_event_listener_with_callback(event, closure.as_ref().unchecked_ref());
    closure.forget();
}

/// Forward page lifecycle and `storage` events to `vault`
pub fn install_lifecycle(vault: &Rc<Vault>) {
    let Some(window) = web_sys::window() else {
        return;
    };
    let Some(document) = window.document() else {
        return;
    };

    // Visibility change (tab switch, minimize)
    {
        let vault = vault.clone();
        let document_clone = document.clone();
        let closure = Closure::<dyn FnMut(_)>::new(move |_event: web_sys::Event| {
            if document_clone.visibility_state() == web_sys::VisibilityState::Hidden {
                vault.lifecycle(Lifecycle::Hidden);
            } else {
                vault.lifecycle(Lifecycle::Visible);
            }
        });
        let _ = document.add_event_listener_with_callback(
            "visibilitychange",
            closure.as_ref().unchecked_ref(),
        );
        closure.forget();
    }

    on_lifecycle(&window, "pagehide", vault, Lifecycle::PageHide);
    on_lifecycle(&window, "beforeunload", vault, Lifecycle::BeforeUnload);
    on_lifecycle(&document, "freeze", vault, Lifecycle::Freeze);
    on_lifecycle(&document, "resume", vault, Lifecycle::Resume);

    // Window focus
    {
        let vault = vault.clone();
        let closure = Closure::<dyn FnMut(_)>::new(move |_event: web_sys::FocusEvent| {
            vault.lifecycle(Lifecycle::Focus);
        });
        let _ = window.add_event_listener_with_callback("focus", closure.as_ref().unchecked_ref());
        closure.forget();
    }

    // Another tab wrote to LocalStorage
    {
        let vault = vault.clone();
        let closure = Closure::<dyn FnMut(_)>::new(move |event: web_sys::StorageEvent| {
            vault.external_mutation(event.key().as_deref());
        });
        let _ = window.add_event_listener_with_callback("storage", closure.as_ref().unchecked_ref());
        closure.forget();
    }

    log::info!("Lifecycle listeners installed");
}

/// Create, boot and wire a vault from the stored config
pub fn start() -> Option<Rc<Vault>> {
    let config = VaultConfig::load();
    let platform = browser_platform(&config)?;
    let vault = Vault::new(config, platform);
    vault.boot();
    install_lifecycle(&vault);
    Some(vault)
}

fn currency(id: &str) -> Result<Currency, JsValue> {
    Currency::from_id(id).ok_or_else(|| JsValue::from_str(&format!("unknown currency '{id}'")))
}

fn slot(n: u32) -> Result<Slot, JsValue> {
    Slot::new(n).ok_or_else(|| JsValue::from_str("slot numbers start at 1"))
}

/// JS handle to a running vault. Amounts cross the boundary as decimal strings.
#[wasm_bindgen]
pub struct VaultHandle {
    vault: Rc<Vault>,
}

#[wasm_bindgen]
impl VaultHandle {
    #[wasm_bindgen(constructor)]
    pub fn new() -> Result<VaultHandle, JsValue> {
        start()
            .map(|vault| VaultHandle { vault })
            .ok_or_else(|| JsValue::from_str("no browser window"))
    }

    pub fn value(&self, currency_id: &str) -> Result<String, JsValue> {
        Ok(self.vault.currency(currency(currency_id)?).get().to_string())
    }

    pub fn add(&self, currency_id: &str, amount: &str) -> Result<String, JsValue> {
        let amount: Amount = amount.parse().map_err(|e| JsValue::from_str(&format!("{e}")))?;
        Ok(self.vault.currency(currency(currency_id)?).add(amount).to_string())
    }

    pub fn spend(&self, currency_id: &str, cost: &str) -> Result<bool, JsValue> {
        let cost: Amount = cost.parse().map_err(|e| JsValue::from_str(&format!("{e}")))?;
        Ok(self.vault.currency(currency(currency_id)?).spend(&cost))
    }

    pub fn multiplier(&self, currency_id: &str) -> Result<String, JsValue> {
        Ok(self.vault.currency(currency(currency_id)?).multiplier().to_string())
    }

    #[wasm_bindgen(js_name = activeSlot)]
    pub fn active_slot(&self) -> u32 {
        self.vault.active_slot().get()
    }

    #[wasm_bindgen(js_name = switchSlot)]
    pub fn switch_slot(&self, n: u32) -> Result<(), JsValue> {
        self.vault.switch_slot(slot(n)?);
        Ok(())
    }

    #[wasm_bindgen(js_name = isModified)]
    pub fn is_modified(&self, n: u32) -> Result<bool, JsValue> {
        Ok(self.vault.is_modified(slot(n)?))
    }

    /// Write a raw entry through the guarded store
    #[wasm_bindgen(js_name = setRaw)]
    pub fn set_raw(&self, key: &str, value: &str) -> Result<(), JsValue> {
        self.vault
            .storage()
            .set_item(key, value)
            .map_err(|e| JsValue::from_str(&e.to_string()))
    }

    pub fn shutdown(&self) {
        self.vault.shutdown();
    }
}
