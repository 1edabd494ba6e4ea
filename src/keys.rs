//! Persisted key layout
//!
//! Every entry lives under `<namespace>:`. Per-slot entries carry the slot as
//! their last segment, e.g. `vault:coins:1`, `vault:mult_coins:1`,
//! `vault:sig:1`. The active-slot pointer is the only unslotted entry.

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An independent save partition (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Slot(NonZeroU32);

impl Slot {
    pub const FIRST: Slot = Slot(NonZeroU32::MIN);

    pub fn new(n: u32) -> Option<Self> {
        NonZeroU32::new(n).map(Slot)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl Default for Slot {
    fn default() -> Self {
        Slot::FIRST
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u32> for Slot {
    type Error = String;

    fn try_from(n: u32) -> Result<Self, Self::Error> {
        Slot::new(n).ok_or_else(|| "slot must be positive".to_string())
    }
}

impl From<Slot> for u32 {
    fn from(slot: Slot) -> u32 {
        slot.get()
    }
}

impl FromStr for Slot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n: u32 = s.trim().parse().map_err(|_| format!("invalid slot {s:?}"))?;
        Slot::try_from(n)
    }
}

/// The closed set of value classes tracked per slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Currency {
    Coins,
    Gems,
    Stardust,
    Tokens,
}

impl Currency {
    pub const ALL: [Currency; 4] = [Currency::Coins, Currency::Gems, Currency::Stardust, Currency::Tokens];

    /// The primary currency; its absence signals lost save data
    pub const PRIMARY: Currency = Currency::Coins;

    pub fn id(&self) -> &'static str {
        match self {
            Currency::Coins => "coins",
            Currency::Gems => "gems",
            Currency::Stardust => "stardust",
            Currency::Tokens => "tokens",
        }
    }

    pub fn from_id(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "coins" | "coin" => Some(Currency::Coins),
            "gems" | "gem" => Some(Currency::Gems),
            "stardust" => Some(Currency::Stardust),
            "tokens" | "token" => Some(Currency::Tokens),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// What a namespaced key holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Value(Currency),
    Multiplier(Currency),
    Signature,
    Modified,
    Heartbeat,
    ActiveSlot,
    Other(String),
}

const MULTIPLIER_PREFIX: &str = "mult_";
const SIGNATURE: &str = "sig";
const MODIFIED: &str = "modified";
const HEARTBEAT: &str = "heartbeat";
const ACTIVE_SLOT: &str = "active_slot";

/// Builds and parses namespaced keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    namespace: String,
}

impl KeyLayout {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Prefix shared by every key in the namespace
    pub fn prefix(&self) -> String {
        format!("{}:", self.namespace)
    }

    pub fn value_key(&self, currency: Currency, slot: Slot) -> String {
        self.slotted(currency.id(), slot)
    }

    pub fn multiplier_key(&self, currency: Currency, slot: Slot) -> String {
        self.slotted(&format!("{MULTIPLIER_PREFIX}{}", currency.id()), slot)
    }

    pub fn signature_key(&self, slot: Slot) -> String {
        self.slotted(SIGNATURE, slot)
    }

    pub fn modified_key(&self, slot: Slot) -> String {
        self.slotted(MODIFIED, slot)
    }

    pub fn heartbeat_key(&self, slot: Slot) -> String {
        self.slotted(HEARTBEAT, slot)
    }

    pub fn active_slot_key(&self) -> String {
        format!("{}:{ACTIVE_SLOT}", self.namespace)
    }

    fn slotted(&self, name: &str, slot: Slot) -> String {
        format!("{}:{name}:{slot}", self.namespace)
    }

    /// True if `key` lives under this namespace
    pub fn owns(&self, key: &str) -> bool {
        key.strip_prefix(self.namespace.as_str())
            .is_some_and(|rest| rest.starts_with(':'))
    }

    fn split<'k>(&self, key: &'k str) -> Option<(&'k str, Option<Slot>)> {
        let rest = key.strip_prefix(self.namespace.as_str())?.strip_prefix(':')?;
        match rest.rsplit_once(':') {
            Some((name, slot)) => match slot.parse::<Slot>() {
                Ok(slot) => Some((name, Some(slot))),
                Err(_) => Some((rest, None)),
            },
            None => Some((rest, None)),
        }
    }

    /// The slot a key belongs to, if it is a per-slot entry
    pub fn slot_of(&self, key: &str) -> Option<Slot> {
        self.split(key).and_then(|(_, slot)| slot)
    }

    pub fn kind_of(&self, key: &str) -> Option<EntryKind> {
        let (name, slot) = self.split(key)?;
        let kind = match (name, slot) {
            (ACTIVE_SLOT, None) => EntryKind::ActiveSlot,
            (SIGNATURE, Some(_)) => EntryKind::Signature,
            (MODIFIED, Some(_)) => EntryKind::Modified,
            (HEARTBEAT, Some(_)) => EntryKind::Heartbeat,
            (name, Some(_)) => match name.strip_prefix(MULTIPLIER_PREFIX) {
                Some(id) => Currency::from_id(id)
                    .map(EntryKind::Multiplier)
                    .unwrap_or_else(|| EntryKind::Other(name.to_string())),
                None => Currency::from_id(name)
                    .map(EntryKind::Value)
                    .unwrap_or_else(|| EntryKind::Other(name.to_string())),
            },
            (name, None) => EntryKind::Other(name.to_string()),
        };
        Some(kind)
    }

    /// Entries owned by the integrity verifier and excluded from signatures
    pub fn is_integrity_entry(&self, key: &str) -> bool {
        matches!(
            self.kind_of(key),
            Some(EntryKind::Signature | EntryKind::Modified | EntryKind::Heartbeat)
        )
    }
}
