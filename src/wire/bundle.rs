//! Bundles: one transport frame worth of changes and subscriptions

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::convergent::Value;
use crate::error::{Result, SyncError};
use crate::spec::Specifier;

/// How bundles are framed on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Json,
    Cbor,
}

/// Canonical specifier text → value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bundle {
    entries: BTreeMap<String, Value>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; a later entry for the same specifier replaces the earlier one.
    pub fn insert(&mut self, spec: &Specifier, value: Value) {
        self.entries.insert(spec.to_string(), value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, spec: &str) -> Option<&Value> {
        self.entries.get(spec)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Serialize to bytes.
    pub fn encode(&self, codec: Codec) -> Result<Vec<u8>> {
        match codec {
            Codec::Json => {
                serde_json::to_vec(self).map_err(|e| SyncError::Serialization(e.to_string()))
            }
            Codec::Cbor => {
                let mut buf = Vec::new();
                ciborium::into_writer(self, &mut buf)
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                Ok(buf)
            }
        }
    }

    /// Deserialize from bytes.
    pub fn decode(codec: Codec, data: &[u8]) -> Result<Self> {
        match codec {
            Codec::Json => {
                serde_json::from_slice(data).map_err(|e| SyncError::Serialization(e.to_string()))
            }
            Codec::Cbor => {
                ciborium::from_reader(data).map_err(|e| SyncError::Serialization(e.to_string()))
            }
        }
    }

    /// Parse every key and return entries in the order a receiver applies them.
    ///
    /// Entries are sorted by version, newest first, and consumed from the
    /// back: versionless (subscription) entries come out first, then writes
    /// oldest to newest. Versionless entries tie, so their relative order
    /// is reversed key order, not send order. Empty keys are skipped. Any
    /// unparsable key rejects the whole bundle.
    pub fn into_ordered(self) -> Result<Vec<(Specifier, Value)>> {
        let mut parsed = Vec::with_capacity(self.entries.len());
        for (key, value) in self.entries {
            if key.is_empty() {
                continue;
            }
            parsed.push((Specifier::parse(&key)?, value));
        }
        parsed.sort_by(|(a, _), (b, _)| b.version().cmp(&a.version()));

        let mut ordered = Vec::with_capacity(parsed.len());
        while let Some(entry) = parsed.pop() {
            ordered.push(entry);
        }
        Ok(ordered)
    }
}
