//! Consistent-hash placement

use crate::id::Identifier;

/// Salts every peer mixes into its ring.
pub const DEFAULT_SALTS: [u32; 1] = [0];

/// The points a peer occupies on the XOR ring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashRing {
    points: Vec<u32>,
}

impl HashRing {
    pub fn for_peer(peer: &Identifier, salts: &[u32]) -> Self {
        let hash = peer.ring_hash();
        Self {
            points: salts.iter().map(|salt| hash ^ salt).collect(),
        }
    }

    pub fn points(&self) -> &[u32] {
        &self.points
    }

    /// XOR distance from `hash` to the nearest point; `u32::MAX` for an empty ring.
    pub fn distance(&self, hash: u32) -> u32 {
        self.points.iter().map(|p| p ^ hash).min().unwrap_or(u32::MAX)
    }

    pub fn distance_to(&self, object: &Identifier) -> u32 {
        self.distance(object.ring_hash())
    }
}
