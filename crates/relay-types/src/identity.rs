use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// The parts of a source-ledger notification that identify one logical event.
///
/// A ledger may emit several events from a single transaction, so the
/// transaction id alone is not enough; the event name and the position of
/// the event within the transaction complete the identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceIdentity {
    /// Source transaction id.
    pub tx_id: String,
    /// Event name as emitted by the source contract.
    pub event_name: String,
    /// Position of the event within its transaction.
    pub sequence: u64,
}

impl SourceIdentity {
    pub fn new(tx_id: impl Into<String>, event_name: impl Into<String>, sequence: u64) -> Self {
        Self {
            tx_id: tx_id.into(),
            event_name: event_name.into(),
            sequence,
        }
    }
}

/// Dedup key for a relay event.
///
/// Derived deterministically from a [`SourceIdentity`] using BLAKE3, so a
/// redelivered or replayed notification always resolves to the same id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    hash: [u8; 32],
}

impl EventId {
    /// Derive an `EventId` from source identity.
    pub fn derive(identity: &SourceIdentity) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"ledger-relay-event-v1:");
        // Length-prefix the variable fields so ("ab", "c") and ("a", "bc")
        // never collide.
        hasher.update(&(identity.tx_id.len() as u64).to_le_bytes());
        hasher.update(identity.tx_id.as_bytes());
        hasher.update(&(identity.event_name.len() as u64).to_le_bytes());
        hasher.update(identity.event_name.as_bytes());
        hasher.update(&identity.sequence.to_le_bytes());
        Self {
            hash: *hasher.finalize().as_bytes(),
        }
    }

    /// Wrap a precomputed digest, e.g. one read back from storage.
    pub fn from_raw(hash: [u8; 32]) -> Self {
        Self { hash }
    }

    /// The raw 32-byte hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.hash
    }

    /// All 64 hex characters of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// `evt:` followed by the first 8 hex characters, for logs.
    pub fn short_id(&self) -> String {
        format!("evt:{}", hex::encode(&self.hash[..4]))
    }

    /// Parse from a hex string (64 hex characters, optional `evt:` prefix).
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let s = s.strip_prefix("evt:").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(TypeError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self { hash: arr })
    }
}

impl FromStr for EventId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.short_id())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_id())
    }
}
