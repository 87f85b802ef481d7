//! Pipes: the peer-side end of a connection to a remote peer
//!
//! A pipe stands in for the remote peer. Changes and subscriptions the local
//! peer sends it are batched into a [`Bundle`] and handed to a [`Transport`];
//! frames arriving from the transport are unpacked into `on`/`off`/`set`
//! calls on the local peer, with the pipe as listener and source.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::bundle::Bundle;
use crate::config::PipePolicy;
use crate::convergent::{Payload, Value};
use crate::error::{Result, SyncError};
use crate::id::{Identifier, Kind};
use crate::router::{Listener, ListenerRef};
use crate::spec::Specifier;
use crate::topology::Peer;

/// Method token marking a subscribe entry (`on` in compact form).
pub const METHOD_ON: Identifier = Identifier::new(Kind::Method, 0, 461, 0, 0);

/// Method token marking an unsubscribe entry (`off` in compact form).
pub const METHOD_OFF: Identifier = Identifier::new(Kind::Method, 0, 14501, 0, 0);

/// Moves encoded frames to the other side.
pub trait Transport: Send + Sync {
    fn send(&self, frame: &[u8]) -> Result<()>;
    fn close(&self) -> Result<()>;
}

#[derive(Default)]
struct Outbox {
    bundle: Bundle,
    timer_armed: bool,
}

pub struct Pipe {
    remote: Identifier,
    transport: Arc<dyn Transport>,
    host: Weak<Peer>,
    policy: PipePolicy,
    outbox: Mutex<Outbox>,
    self_ref: Weak<Pipe>,
}

impl Pipe {
    pub fn new(
        remote: Identifier,
        transport: Arc<dyn Transport>,
        host: &Arc<Peer>,
        policy: PipePolicy,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            remote: remote.with_kind(Kind::Peer),
            transport,
            host: Arc::downgrade(host),
            policy,
            outbox: Mutex::new(Outbox::default()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn remote(&self) -> Identifier {
        self.remote
    }

    pub fn policy(&self) -> &PipePolicy {
        &self.policy
    }

    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn as_listener(&self) -> Result<ListenerRef> {
        self.self_ref
            .upgrade()
            .map(|p| p as ListenerRef)
            .ok_or_else(|| SyncError::Transport(format!("pipe to {} is gone", self.remote)))
    }

    /// Number of entries waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.outbox().bundle.len()
    }

    fn queue(&self, spec: &Specifier, payload: &Payload) -> Result<()> {
        let timer = self
            .policy
            .flush_delay()
            .and_then(|delay| tokio::runtime::Handle::try_current().ok().map(|h| (delay, h)));
        {
            let mut outbox = self.outbox();
            match payload {
                Payload::Diff(diff) => {
                    for (entry, value) in diff.iter() {
                        outbox.bundle.insert(entry, value.clone());
                    }
                }
                Payload::Value(value) => outbox.bundle.insert(spec, value.clone()),
                Payload::Fields(fields) => outbox.bundle.insert(spec, Value::Map(fields.clone())),
            }
            if outbox.timer_armed {
                return Ok(());
            }
            outbox.timer_armed = timer.is_some();
        }

        // without a runtime there is nothing to run the timer, so send now
        let Some((delay, handle)) = timer else {
            return self.flush();
        };
        let pipe = self.self_ref.clone();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(pipe) = pipe.upgrade() {
                pipe.outbox().timer_armed = false;
                if let Err(e) = pipe.flush() {
                    log::error!("Delayed flush to {} failed: {}", pipe.remote, e);
                }
            }
        });
        Ok(())
    }

    /// Send whatever is queued as one frame.
    pub fn flush(&self) -> Result<()> {
        let bundle = std::mem::take(&mut self.outbox().bundle);
        if bundle.is_empty() {
            return Ok(());
        }
        let frame = bundle.encode(self.policy.codec)?;
        log::trace!("Sending {} entries to {}", bundle.len(), self.remote);
        self.transport.send(&frame)
    }

    /// Unpack one inbound frame into calls on the host peer.
    ///
    /// An undecodable frame or key is rejected as a whole. Failures of
    /// individual entries are logged and the rest of the bundle still applies.
    pub fn receive(&self, frame: &[u8]) -> Result<()> {
        let host = self
            .host
            .upgrade()
            .ok_or_else(|| SyncError::Transport("host peer is gone".to_string()))?;
        let me = self.as_listener()?;
        let entries = Bundle::decode(self.policy.codec, frame)?.into_ordered()?;

        for (spec, value) in entries {
            let outcome = match spec.method() {
                Some(method) if method == METHOD_ON => {
                    host.on(&spec.clone().without_method(), Some(Arc::clone(&me))).map(|_| ())
                }
                Some(method) if method == METHOD_OFF => {
                    host.off(&spec.clone().without_method(), &me)
                }
                Some(method) => {
                    log::warn!("Ignoring unknown method {} from {}", method.to_compact_string(), self.remote);
                    Ok(())
                }
                None => host.set(&spec, &Payload::Value(value), Some(&me)),
            };
            if let Err(e) = outcome {
                log::warn!("Entry {} from {} failed: {}", spec, self.remote, e);
            }
        }
        Ok(())
    }

    /// Flush what is pending and close the transport.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.transport.close()
    }
}

impl Listener for Pipe {
    fn set(&self, spec: &Specifier, payload: &Payload, _source: Option<&ListenerRef>) -> Result<()> {
        self.queue(spec, payload)
    }

    fn on(&self, spec: &Specifier, _listener: &ListenerRef) -> Result<()> {
        let spec = spec.clone().with_method(METHOD_ON);
        self.queue(&spec, &Payload::Value(Value::string("")))
    }

    fn off(&self, spec: &Specifier, _listener: &ListenerRef) -> Result<()> {
        let spec = spec.clone().with_method(METHOD_OFF);
        self.queue(&spec, &Payload::Value(Value::string("")))
    }

    fn peer_id(&self) -> Option<Identifier> {
        Some(self.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::convergent::TypeRegistry;
    use crate::wire::{Codec, LoopbackTransport};

    #[test]
    fn test_failed_entries_are_skipped() {
        let peer = Peer::new(Identifier::new(Kind::Peer, 0, 0, 5, 0), Arc::new(TypeRegistry::new()));
        let transport = LoopbackTransport::new();
        let pipe = Pipe::new(
            Identifier::new(Kind::Peer, 0, 0, 9, 0),
            transport,
            &peer,
            PipePolicy::immediate(),
        );

        // neither entry can succeed: the pipe's peer is not connected and
        // the subscription names no type
        let mut bundle = Bundle::new();
        let obj = Identifier::new(Kind::Object, 1, 0, 1, 0);
        bundle.insert(&Specifier::new().with_object(obj).with_method(METHOD_OFF), Value::string(""));
        let other = Identifier::new(Kind::Object, 2, 0, 1, 0);
        bundle.insert(&Specifier::new().with_object(other).with_method(METHOD_ON), Value::string(""));
        let frame = bundle.encode(Codec::Json).unwrap();

        assert!(pipe.receive(&frame).is_ok());
        assert!(peer.tracked_objects().is_empty());
        assert!(matches!(
            pipe.receive(b"not a bundle"),
            Err(SyncError::Serialization(_))
        ));
    }

    #[test]
    fn test_method_tokens_match_compact_names() {
        assert_eq!(METHOD_ON, Identifier::parse_compact(Kind::Method, "on").unwrap());
        assert_eq!(METHOD_OFF, Identifier::parse_compact(Kind::Method, "off").unwrap());
        assert_eq!(METHOD_ON.to_compact_string(), "on");
    }
}
