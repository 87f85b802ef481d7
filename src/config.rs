//! Peer configuration
//!
//! Loaded from a JSON document such as:
//!
//! ```json
//! { "peer_id": "a_bob", "ring_salts": [0], "pipe": { "flush_delay_ms": 20, "codec": "cbor" } }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::id::{Identifier, Kind};
use crate::topology::DEFAULT_SALTS;
use crate::wire::Codec;

/// How a pipe batches outgoing entries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipePolicy {
    /// Hold entries this long before sending; `None` sends on every change.
    pub flush_delay_ms: Option<u64>,
    pub codec: Codec,
}

impl PipePolicy {
    pub fn immediate() -> Self {
        Self::default()
    }

    /// Batch entries for `millis` before sending.
    ///
    /// Subscribe and unsubscribe entries carry no version, so the receiver
    /// cannot tell which was sent first: when an `on` and an `off` for the same
    /// object share a batch, the `off` is applied first and the
    /// subscription stands.
    pub fn delayed(millis: u64) -> Self {
        Self {
            flush_delay_ms: Some(millis),
            ..Self::default()
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn flush_delay(&self) -> Option<Duration> {
        self.flush_delay_ms.map(Duration::from_millis)
    }
}

fn default_salts() -> Vec<u32> {
    DEFAULT_SALTS.to_vec()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer id, compact (`a_bob`) or fixed form.
    pub peer_id: String,

    #[serde(default = "default_salts")]
    pub ring_salts: Vec<u32>,

    #[serde(default)]
    pub pipe: PipePolicy,
}

impl PeerConfig {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            ring_salts: default_salts(),
            pipe: PipePolicy::default(),
        }
    }

    pub fn peer_identifier(&self) -> Result<Identifier> {
        Ok(Identifier::parse_any(Kind::Peer, &self.peer_id)?.with_kind(Kind::Peer))
    }

    /// Check the config describes a usable peer.
    pub fn validate(&self) -> Result<()> {
        self.peer_identifier()
            .map_err(|e| SyncError::Config(format!("peer_id {:?}: {}", self.peer_id, e)))?;
        if self.ring_salts.is_empty() {
            return Err(SyncError::Config("ring_salts must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        std::fs::write(path, json)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))
    }
}
