//! Snapshot envelope
//!
//! A snapshot travels to the secondary store as versioned JSON carrying a
//! BLAKE3 digest of the snapshot body. An envelope that fails to open is
//! treated as no snapshot at all.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Full copy of the namespaced entries at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entries: BTreeMap<String, String>,
    /// Wall-clock milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// What triggered the capture ("debounce", "pagehide", ...)
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub version: u32,
    /// Hex BLAKE3 of the serialized snapshot
    pub digest: String,
    pub snapshot: Snapshot,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("snapshot digest mismatch")]
    DigestMismatch,
    #[error("malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),
}

fn digest(snapshot: &Snapshot) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(snapshot)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

impl SnapshotEnvelope {
    pub fn seal(snapshot: Snapshot) -> Result<Self, EnvelopeError> {
        Ok(Self {
            version: SNAPSHOT_VERSION,
            digest: digest(&snapshot)?,
            snapshot,
        })
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and verify an envelope, returning the snapshot inside
    pub fn open(json: &str) -> Result<Snapshot, EnvelopeError> {
        let envelope: SnapshotEnvelope = serde_json::from_str(json)?;
        if envelope.version != SNAPSHOT_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(envelope.version));
        }
        if digest(&envelope.snapshot)? != envelope.digest {
            return Err(EnvelopeError::DigestMismatch);
        }
        Ok(envelope.snapshot)
    }
}
