//! In-memory transport for wiring peers together inside one process

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use super::pipe::{Pipe, Transport};
use crate::config::PipePolicy;
use crate::error::{Result, SyncError};
use crate::router::ListenerRef;
use crate::topology::Peer;

/// One end of an in-memory link. Frames sent here are delivered
/// synchronously to the pipe on the other end.
#[derive(Default)]
pub struct LoopbackTransport {
    target: OnceLock<Weak<Pipe>>,
    closed: AtomicBool,
    frames_sent: AtomicUsize,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver frames to `pipe` from now on. Only the first call takes effect.
    pub fn connect(&self, pipe: &Arc<Pipe>) -> Result<()> {
        self.target
            .set(Arc::downgrade(pipe))
            .map_err(|_| SyncError::Transport("loopback already connected".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn frames_sent(&self) -> usize {
        self.frames_sent.load(Ordering::SeqCst)
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, frame: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(SyncError::Transport("loopback is closed".to_string()));
        }
        let target = self
            .target
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| SyncError::Transport("loopback has no receiver".to_string()))?;
        self.frames_sent.fetch_add(1, Ordering::SeqCst);
        target.receive(frame)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Both ends of a loopback connection between two peers.
pub struct LoopbackLink {
    /// `a`'s pipe to `b`
    pub a_to_b: Arc<Pipe>,
    /// `b`'s pipe to `a`
    pub b_to_a: Arc<Pipe>,
    pub a_transport: Arc<LoopbackTransport>,
    pub b_transport: Arc<LoopbackTransport>,
}

/// Join two peers with a pair of pipes and register each as the other's neighbour.
pub fn connect_peers(a: &Arc<Peer>, b: &Arc<Peer>, policy: PipePolicy) -> Result<LoopbackLink> {
    let a_transport = LoopbackTransport::new();
    let b_transport = LoopbackTransport::new();
    let a_to_b = Pipe::new(b.id(), a_transport.clone(), a, policy.clone());
    let b_to_a = Pipe::new(a.id(), b_transport.clone(), b, policy);
    a_transport.connect(&b_to_a)?;
    b_transport.connect(&a_to_b)?;

    // both sides must know each other before any subscription moves,
    // otherwise the first handshake cannot be answered in kind
    let b_id = a.register_peer(a_to_b.clone() as ListenerRef)?;
    let a_id = b.register_peer(b_to_a.clone() as ListenerRef)?;
    a.reroute_to(&b_id)?;
    b.reroute_to(&a_id)?;
    Ok(LoopbackLink {
        a_to_b,
        b_to_a,
        a_transport,
        b_transport,
    })
}
