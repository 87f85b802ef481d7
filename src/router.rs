//! Specifier-keyed publish/subscribe
//!
//! Records and peers each own an [`EventRouter`]. Listeners are indexed by a
//! single token of the specifier they subscribed with, and a change is
//! delivered to every listener indexed under any token of the change's
//! specifier.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::convergent::Payload;
use crate::error::{Result, SyncError};
use crate::id::Identifier;
use crate::spec::Specifier;

/// Shared handle to anything that accepts changes.
pub type ListenerRef = Arc<dyn Listener>;

/// The three-operation interface shared by records, peers and pipes.
pub trait Listener: Send + Sync {
    /// Deliver a change. `source` is whoever produced it, if known.
    ///
    /// Failures should come back as `Err`. A panic is caught and logged by
    /// [`EventRouter::emit`] only when the build unwinds on panic.
    fn set(&self, spec: &Specifier, payload: &Payload, source: Option<&ListenerRef>) -> Result<()>;

    /// Subscribe `listener` to what `spec` names.
    fn on(&self, _spec: &Specifier, _listener: &ListenerRef) -> Result<()> {
        Ok(())
    }

    /// Undo a previous `on`.
    fn off(&self, _spec: &Specifier, _listener: &ListenerRef) -> Result<()> {
        Ok(())
    }

    /// Set for peers and links to peers.
    fn peer_id(&self) -> Option<Identifier> {
        None
    }
}

/// Identity comparison; two handles are the same listener iff they share an allocation.
pub fn same_listener(a: &ListenerRef, b: &ListenerRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Adapts a closure into a listener.
pub struct FnListener<F> {
    f: F,
}

impl<F> FnListener<F>
where
    F: Fn(&Specifier, &Payload) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }

    pub fn shared(f: F) -> ListenerRef {
        Arc::new(Self::new(f))
    }
}

impl<F> Listener for FnListener<F>
where
    F: Fn(&Specifier, &Payload) + Send + Sync + 'static,
{
    fn set(&self, spec: &Specifier, payload: &Payload, _source: Option<&ListenerRef>) -> Result<()> {
        (self.f)(spec, payload);
        Ok(())
    }
}

/// Accepts and drops everything. Stands in for persistent storage.
#[derive(Debug, Default)]
pub struct Stub;

impl Listener for Stub {
    fn set(&self, _spec: &Specifier, _payload: &Payload, _source: Option<&ListenerRef>) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RouterState {
    wildcard: Vec<ListenerRef>,
    buckets: BTreeMap<Identifier, Vec<ListenerRef>>,
}

#[derive(Default)]
pub struct EventRouter {
    state: Mutex<RouterState>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        // a panicking listener never runs under this lock
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The token a subscription with `spec` is indexed under; `None` for wildcard.
    pub fn index_key(spec: Option<&Specifier>) -> Option<Identifier> {
        let spec = spec?;
        spec.object()
            .or_else(|| spec.field())
            .or_else(|| spec.method())
            .or_else(|| spec.type_id())
    }

    /// Register a listener. Subscribing twice under the same token is a no-op.
    pub fn subscribe(&self, spec: Option<&Specifier>, listener: ListenerRef) {
        match Self::index_key(spec) {
            Some(key) => self.subscribe_key(key, listener),
            None => {
                let mut state = self.lock();
                if !state.wildcard.iter().any(|l| same_listener(l, &listener)) {
                    state.wildcard.push(listener);
                }
            }
        }
    }

    pub fn subscribe_key(&self, key: Identifier, listener: ListenerRef) {
        let mut state = self.lock();
        let bucket = state.buckets.entry(key).or_default();
        if !bucket.iter().any(|l| same_listener(l, &listener)) {
            bucket.push(listener);
        }
    }

    pub fn unsubscribe(&self, spec: Option<&Specifier>, listener: &ListenerRef) -> Result<()> {
        match Self::index_key(spec) {
            Some(key) => self.unsubscribe_key(&key, listener),
            None => {
                let mut state = self.lock();
                let before = state.wildcard.len();
                state.wildcard.retain(|l| !same_listener(l, listener));
                if state.wildcard.len() == before {
                    return Err(SyncError::ListenerNotFound("wildcard".to_string()));
                }
                Ok(())
            }
        }
    }

    pub fn unsubscribe_key(&self, key: &Identifier, listener: &ListenerRef) -> Result<()> {
        let mut state = self.lock();
        let Some(bucket) = state.buckets.get_mut(key) else {
            return Err(SyncError::ListenerNotFound(key.to_string()));
        };
        let before = bucket.len();
        bucket.retain(|l| !same_listener(l, listener));
        if bucket.len() == before {
            return Err(SyncError::ListenerNotFound(key.to_string()));
        }
        if bucket.is_empty() {
            state.buckets.remove(key);
        }
        Ok(())
    }

    /// Drop a listener from every bucket and the wildcard list.
    pub fn purge(&self, listener: &ListenerRef) -> usize {
        let mut state = self.lock();
        let mut removed = 0;
        let before = state.wildcard.len();
        state.wildcard.retain(|l| !same_listener(l, listener));
        removed += before - state.wildcard.len();
        for bucket in state.buckets.values_mut() {
            let before = bucket.len();
            bucket.retain(|l| !same_listener(l, listener));
            removed += before - bucket.len();
        }
        state.buckets.retain(|_, bucket| !bucket.is_empty());
        removed
    }

    /// Remove a whole bucket, returning what it held.
    pub fn remove_key(&self, key: &Identifier) -> Vec<ListenerRef> {
        self.lock().buckets.remove(key).unwrap_or_default()
    }

    pub fn listeners(&self, key: &Identifier) -> Vec<ListenerRef> {
        self.lock().buckets.get(key).cloned().unwrap_or_default()
    }

    pub fn wildcard_listeners(&self) -> Vec<ListenerRef> {
        self.lock().wildcard.clone()
    }

    pub fn keys(&self) -> Vec<Identifier> {
        self.lock().buckets.keys().copied().collect()
    }

    /// Total registrations across all buckets and the wildcard list.
    pub fn listener_count(&self) -> usize {
        let state = self.lock();
        state.wildcard.len() + state.buckets.values().map(Vec::len).sum::<usize>()
    }

    /// Everyone who should hear about `spec`, each once, in delivery order.
    pub fn candidates(&self, spec: &Specifier, source: Option<&ListenerRef>) -> Vec<ListenerRef> {
        let state = self.lock();
        let mut out: Vec<ListenerRef> = Vec::new();
        let keyed = [spec.object(), spec.field(), spec.method(), spec.type_id()]
            .into_iter()
            .flatten()
            .filter_map(|key| state.buckets.get(&key))
            .flatten();
        for listener in state.wildcard.iter().chain(keyed) {
            if source.is_some_and(|s| same_listener(s, listener)) {
                continue;
            }
            if !out.iter().any(|l| same_listener(l, listener)) {
                out.push(Arc::clone(listener));
            }
        }
        out
    }

    /// Deliver a change. A failing or panicking listener is logged and skipped.
    pub fn emit(&self, spec: &Specifier, payload: &Payload, source: Option<&ListenerRef>) {
        for listener in self.candidates(spec, source) {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.set(spec, payload, source)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("Listener failed on {}: {}", spec, e),
                Err(_) => log::error!("Listener panicked on {}", spec),
            }
        }
    }
}
