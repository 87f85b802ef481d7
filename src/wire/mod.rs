//! Wire plumbing: bundles, pipes and an in-memory transport
//!
//! Sockets and reconnect scheduling live outside this crate; anything that
//! can move bytes implements [`Transport`].

mod bundle;
mod loopback;
mod pipe;

pub use bundle::{Bundle, Codec};
pub use loopback::{connect_peers, LoopbackLink, LoopbackTransport};
pub use pipe::{Pipe, Transport, METHOD_OFF, METHOD_ON};
