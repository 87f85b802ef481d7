//! Peer topology
//!
//! Peers find each other's responsibilities on an XOR hash ring and relay
//! subscriptions and changes along the resulting overlay.

mod peer;
mod ring;

pub use peer::Peer;
pub use ring::{HashRing, DEFAULT_SALTS};
