//! The peer: subscription bookkeeping, uplink choice and relaying
//!
//! A peer keeps one bucket of listeners per tracked object: the local record,
//! application listeners, and links to neighbouring peers. Every object has an
//! uplink, the neighbour closest to it on the hash ring (or the storage stub
//! when this peer is itself the closest). Subscriptions flow toward the
//! uplink, changes flow to everyone in the bucket.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use super::ring::{HashRing, DEFAULT_SALTS};
use crate::config::PeerConfig;
use crate::convergent::{Payload, ReplicatedRecord, TypeRegistry, VersionVector};
use crate::error::{Result, SyncError};
use crate::id::{Clock, IdMinter, Identifier, Kind, SystemClock};
use crate::router::{same_listener, EventRouter, Listener, ListenerRef, Stub};
use crate::spec::Specifier;

struct PeerEntry {
    link: ListenerRef,
    ring: HashRing,
}

/// Marks a specifier as being relayed; cleared on drop.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl<'a> InFlight<'a> {
    fn enter(set: &'a Mutex<HashSet<String>>, key: String) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.clone());
        inserted.then_some(Self { set, key })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.key);
    }
}

pub struct Peer {
    id: Identifier,
    salts: Vec<u32>,
    ring: HashRing,
    minter: Arc<Mutex<IdMinter>>,
    router: EventRouter,
    records: RwLock<HashMap<Identifier, Arc<ReplicatedRecord>>>,
    peers: RwLock<BTreeMap<Identifier, PeerEntry>>,
    storage: ListenerRef,
    registry: Arc<TypeRegistry>,
    in_flight: Mutex<HashSet<String>>,
    self_ref: Weak<Peer>,
}

impl Peer {
    pub fn new(id: Identifier, registry: Arc<TypeRegistry>) -> Arc<Self> {
        Self::with_clock(id, registry, Arc::new(SystemClock), DEFAULT_SALTS.to_vec())
    }

    pub fn with_clock(
        id: Identifier,
        registry: Arc<TypeRegistry>,
        clock: Arc<dyn Clock>,
        salts: Vec<u32>,
    ) -> Arc<Self> {
        let id = id.with_kind(Kind::Peer);
        Arc::new_cyclic(|self_ref| Self {
            id,
            ring: HashRing::for_peer(&id, &salts),
            salts,
            minter: Arc::new(Mutex::new(IdMinter::new(clock, id.origin()))),
            router: EventRouter::new(),
            records: RwLock::new(HashMap::new()),
            peers: RwLock::new(BTreeMap::new()),
            storage: Arc::new(Stub),
            registry,
            in_flight: Mutex::new(HashSet::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Build a peer from its configuration.
    pub fn from_config(
        config: &PeerConfig,
        registry: Arc<TypeRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let id = config.peer_identifier()?;
        Ok(Self::with_clock(id, registry, clock, config.ring_salts.clone()))
    }

    pub fn id(&self) -> Identifier {
        self.id
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn as_listener(&self) -> Option<ListenerRef> {
        self.self_ref.upgrade().map(|p| p as ListenerRef)
    }

    fn me(&self) -> Result<ListenerRef> {
        self.as_listener()
            .ok_or_else(|| SyncError::UnknownPeer(format!("{} is shutting down", self.id)))
    }

    fn peers_read(&self) -> RwLockReadGuard<'_, BTreeMap<Identifier, PeerEntry>> {
        self.peers.read().unwrap_or_else(|p| p.into_inner())
    }

    fn peers_write(&self) -> RwLockWriteGuard<'_, BTreeMap<Identifier, PeerEntry>> {
        self.peers.write().unwrap_or_else(|p| p.into_inner())
    }

    fn records_read(&self) -> RwLockReadGuard<'_, HashMap<Identifier, Arc<ReplicatedRecord>>> {
        self.records.read().unwrap_or_else(|p| p.into_inner())
    }

    fn records_write(&self) -> RwLockWriteGuard<'_, HashMap<Identifier, Arc<ReplicatedRecord>>> {
        self.records.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Mint an identifier stamped with this peer's origin.
    pub fn mint(&self, kind: Kind) -> Identifier {
        self.minter
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .mint(kind)
    }

    /// This peer's ring distance to an object.
    pub fn distance(&self, object: &Identifier) -> u32 {
        self.ring.distance_to(object)
    }

    pub fn find_record(&self, object: &Identifier) -> Option<Arc<ReplicatedRecord>> {
        self.records_read()
            .get(&object.with_kind(Kind::Object))
            .cloned()
    }

    /// Objects with at least one listener registered here.
    pub fn tracked_objects(&self) -> Vec<Identifier> {
        self.router
            .keys()
            .into_iter()
            .filter(|k| k.kind() == Kind::Object)
            .collect()
    }

    /// Listeners registered for an object, in registration order.
    pub fn listeners(&self, object: &Identifier) -> Vec<ListenerRef> {
        self.router.listeners(&object.with_kind(Kind::Object))
    }

    pub fn peer_ids(&self) -> Vec<Identifier> {
        self.peers_read().keys().copied().collect()
    }

    pub fn storage(&self) -> ListenerRef {
        Arc::clone(&self.storage)
    }

    /// The peer id behind `listener`, if it is a link to a connected peer.
    fn connected_peer(&self, listener: &ListenerRef) -> Option<Identifier> {
        let peer_id = listener.peer_id()?;
        self.peers_read().contains_key(&peer_id).then_some(peer_id)
    }

    /// Whether a connected peer sits farther from `object` than this peer.
    fn ranks_after(&self, object: &Identifier, peer_id: &Identifier) -> bool {
        let hash = object.ring_hash();
        let own = (self.ring.distance(hash), self.id);
        self.peers_read()
            .get(peer_id)
            .is_some_and(|entry| (entry.ring.distance(hash), *peer_id) > own)
    }

    /// Neighbour responsible for `object`, skipping `except`.
    ///
    /// Candidates rank by `(distance, peer id)`. A neighbour is only chosen
    /// if it beats this peer's own rank; otherwise the storage stub is
    /// returned.
    pub fn find_uplink(&self, object: &Identifier, except: Option<&Identifier>) -> ListenerRef {
        let hash = object.ring_hash();
        let mut best = (self.ring.distance(hash), self.id);
        let mut uplink = Arc::clone(&self.storage);
        for (peer_id, entry) in self.peers_read().iter() {
            if except == Some(peer_id) {
                continue;
            }
            let rank = (entry.ring.distance(hash), *peer_id);
            if rank < best {
                best = rank;
                uplink = Arc::clone(&entry.link);
            }
        }
        uplink
    }

    /// What to send an uplink when subscribing for `object`.
    fn subscription_spec(&self, object: &Identifier) -> Specifier {
        match self.find_record(object) {
            Some(record) => record.spec(),
            None => Specifier::new().with_object(*object),
        }
    }

    /// Subscribe `listener` to the object `spec` names and return its record.
    ///
    /// A spec carrying a base gets the listener an immediate catch-up diff.
    /// A spec without an object id gets a fresh one. An unknown object with
    /// a type is created and subscribed upstream.
    pub fn on(&self, spec: &Specifier, listener: Option<ListenerRef>) -> Result<Arc<ReplicatedRecord>> {
        let me = self.me()?;
        let mut spec = spec.clone();
        let mut record = spec.object().and_then(|oid| self.find_record(&oid));

        if let (Some(record), Some(base), Some(listener)) = (&record, spec.base(), &listener) {
            if let (Some(object), Some(diff)) = (record.id(), record.diff_since(base)) {
                let scope = Specifier::new()
                    .with_type(record.type_id())
                    .with_object(object);
                listener.set(&scope, &Payload::Diff(diff), Some(&me))?;
            }
        }

        if record.is_none() && spec.object().is_none() {
            spec.set_object(Some(self.mint(Kind::Object)));
        }
        let Some(object) = spec.object() else {
            return Err(SyncError::IncompleteSpecifier(spec.to_string()));
        };
        if record.is_none() {
            if let Some(type_id) = spec.type_id() {
                record = Some(self.create_record(type_id, object, &me)?);
            }
        }
        let record = record.ok_or_else(|| SyncError::IncompleteSpecifier(spec.to_string()))?;

        if let Some(listener) = listener {
            let record_ref: ListenerRef = record.clone();
            if !same_listener(&listener, &record_ref) {
                self.router.subscribe_key(object, Arc::clone(&listener));
            }
            if let Some(peer_id) = self.connected_peer(&listener) {
                if self.ranks_after(&object, &peer_id) {
                    listener.on(&record.spec(), &me)?;
                }
            }
        }
        Ok(record)
    }

    fn create_record(
        &self,
        type_id: Identifier,
        object: Identifier,
        me: &ListenerRef,
    ) -> Result<Arc<ReplicatedRecord>> {
        let record = self.registry.instantiate(&type_id, object)?;
        {
            let mut records = self.records_write();
            if let Some(existing) = records.get(&object) {
                return Ok(Arc::clone(existing));
            }
            records.insert(object, Arc::clone(&record));
        }
        record.attach(Arc::clone(&self.minter));
        record.subscribe(None, Arc::clone(me));

        let newly_tracked = self.router.listeners(&object).is_empty();
        self.router.subscribe_key(object, record.clone());
        if newly_tracked {
            let uplink = self.find_uplink(&object, None);
            let upstream = Specifier::new()
                .with_type(record.type_id())
                .with_object(object)
                .with_base(VersionVector::zero());
            uplink.on(&upstream, me)?;
        }
        log::debug!("{} created record {}", self.id, object);
        Ok(record)
    }

    /// Unsubscribe `listener` from the object `spec` names.
    pub fn off(&self, spec: &Specifier, listener: &ListenerRef) -> Result<()> {
        let me = self.me()?;
        let object = spec
            .object()
            .ok_or_else(|| SyncError::IncompleteSpecifier(spec.to_string()))?;
        let object_spec = Specifier::new().with_object(object);
        let connected = self.connected_peer(listener);
        if connected.is_none() {
            if let Some(peer_id) = listener.peer_id() {
                return Err(SyncError::UnknownPeer(peer_id.to_string()));
            }
        }

        match self.router.unsubscribe_key(&object, listener) {
            Ok(()) => {}
            Err(e) if connected.is_some() => {
                log::debug!("{} had no subscription from peer for {}: {}", self.id, object, e);
            }
            Err(e) => return Err(e),
        }

        if let Some(record) = self.find_record(&object) {
            let record_ref: ListenerRef = record.clone();
            if same_listener(&record_ref, listener) {
                record.unsubscribe(None, &me)?;
            }
        }

        let remaining = self.router.listeners(&object);
        let uplink = self.find_uplink(&object, None);
        if remaining.len() == 1 && same_listener(&remaining[0], &uplink) {
            self.router.unsubscribe_key(&object, &uplink)?;
            uplink.off(&object_spec, &me)?;
        }

        if let Some(peer_id) = connected {
            if self.ranks_after(&object, &peer_id) {
                listener.off(&object_spec, &me)?;
            }
        }
        Ok(())
    }

    /// Relay a change to everyone listening, except its source.
    ///
    /// A specifier already being relayed is not relayed again; this is what
    /// stops a record's re-emission of a change from echoing back.
    pub fn set(&self, spec: &Specifier, payload: &Payload, source: Option<&ListenerRef>) -> Result<()> {
        let mut spec = spec.clone();
        if spec.type_id().is_none() {
            if let Some(record) = spec.object().and_then(|oid| self.find_record(&oid)) {
                spec.set_type(Some(record.type_id()));
            }
        }
        let Some(_guard) = InFlight::enter(&self.in_flight, spec.to_string()) else {
            log::trace!("{} already relaying {}", self.id, spec);
            return Ok(());
        };
        self.router.emit(&spec, payload, source);
        Ok(())
    }

    /// Connect a neighbour and move every object it is now closest to onto it.
    pub fn add_peer(&self, link: ListenerRef) -> Result<()> {
        let peer_id = self.register_peer(Arc::clone(&link))?;
        self.reroute_to(&peer_id)
    }

    /// First half of `add_peer`: make the neighbour known without moving
    /// any subscriptions yet.
    pub(crate) fn register_peer(&self, link: ListenerRef) -> Result<Identifier> {
        let peer_id = link
            .peer_id()
            .ok_or_else(|| SyncError::UnknownPeer("link does not name a peer".to_string()))?;
        let mut peers = self.peers_write();
        if peers.contains_key(&peer_id) {
            return Err(SyncError::DuplicatePeer(peer_id.to_string()));
        }
        peers.insert(
            peer_id,
            PeerEntry {
                ring: HashRing::for_peer(&peer_id, &self.salts),
                link,
            },
        );
        log::debug!("{} added peer {}", self.id, peer_id);
        Ok(peer_id)
    }

    /// Second half of `add_peer`: resubscribe every tracked object whose
    /// uplink is now `peer_id`.
    pub(crate) fn reroute_to(&self, peer_id: &Identifier) -> Result<()> {
        let me = self.me()?;
        let link = self
            .peers_read()
            .get(peer_id)
            .map(|entry| Arc::clone(&entry.link))
            .ok_or_else(|| SyncError::UnknownPeer(peer_id.to_string()))?;

        for object in self.tracked_objects() {
            let uplink = self.find_uplink(&object, None);
            if !same_listener(&uplink, &link) {
                continue;
            }
            let old = self.find_uplink(&object, Some(peer_id));
            if let Err(e) = old.off(&Specifier::new().with_object(object), &me) {
                log::warn!("Failed to leave old uplink for {}: {}", object, e);
            }
            if let Err(e) = uplink.on(&self.subscription_spec(&object), &me) {
                log::warn!("Failed to subscribe {} at {}: {}", object, peer_id, e);
            }
            log::debug!("{} switched uplink for {} to {}", self.id, object, peer_id);
        }
        Ok(())
    }

    /// Disconnect a neighbour, moving its objects to their next-best uplink.
    pub fn remove_peer(&self, peer_id: &Identifier) -> Result<()> {
        let me = self.me()?;
        let link = self
            .peers_read()
            .get(peer_id)
            .map(|entry| Arc::clone(&entry.link))
            .ok_or_else(|| SyncError::UnknownPeer(peer_id.to_string()))?;

        for object in self.tracked_objects() {
            let uplink = self.find_uplink(&object, None);
            if !same_listener(&uplink, &link) {
                continue;
            }
            let replacement = self.find_uplink(&object, Some(peer_id));
            if let Err(e) = replacement.on(&self.subscription_spec(&object), &me) {
                log::warn!("Failed to subscribe {} at new uplink: {}", object, e);
            }
            if let Err(e) = uplink.off(&Specifier::new().with_object(object), &me) {
                log::warn!("Failed to leave {} for {}: {}", peer_id, object, e);
            }
        }

        self.peers_write().remove(peer_id);
        let purged = self.router.purge(&link);
        log::debug!("{} removed peer {} ({} subscriptions dropped)", self.id, peer_id, purged);
        Ok(())
    }

    /// Reclaim records nobody but this peer (and the uplink) listens to.
    ///
    /// Buckets with other listeners are left alone. Returns the collected
    /// object ids.
    pub fn collect_garbage(&self) -> Vec<Identifier> {
        let Ok(me) = self.me() else {
            return Vec::new();
        };
        let mut reclaimed = Vec::new();

        for object in self.tracked_objects() {
            let Some(record) = self.find_record(&object) else {
                continue;
            };
            let record_ref: ListenerRef = record.clone();
            let uplink = self.find_uplink(&object, None);
            let bucket = self.router.listeners(&object);
            let holds_record = bucket.iter().any(|l| same_listener(l, &record_ref));
            let only_record_and_uplink = bucket
                .iter()
                .all(|l| same_listener(l, &record_ref) || same_listener(l, &uplink));
            if !holds_record || !only_record_and_uplink {
                continue;
            }
            let watchers = record.router().wildcard_listeners();
            let only_us = record.router().listener_count() == 1
                && watchers.iter().any(|l| same_listener(l, &me));
            if !only_us {
                continue;
            }

            if let Err(e) = record.unsubscribe(None, &me) {
                log::warn!("Record {} lost its peer subscription early: {}", object, e);
            }
            self.router.remove_key(&object);
            self.records_write().remove(&object);
            record.clear_identity();
            if let Err(e) = uplink.off(&Specifier::new().with_object(object), &me) {
                log::warn!("Failed to unsubscribe {} upstream: {}", object, e);
            }
            log::debug!("{} collected record {}", self.id, object);
            reclaimed.push(object);
        }
        reclaimed
    }
}

impl Listener for Peer {
    fn set(&self, spec: &Specifier, payload: &Payload, source: Option<&ListenerRef>) -> Result<()> {
        Peer::set(self, spec, payload, source)
    }

    fn on(&self, spec: &Specifier, listener: &ListenerRef) -> Result<()> {
        Peer::on(self, spec, Some(Arc::clone(listener))).map(|_| ())
    }

    fn off(&self, spec: &Specifier, listener: &ListenerRef) -> Result<()> {
        Peer::off(self, spec, listener)
    }

    fn peer_id(&self) -> Option<Identifier> {
        Some(self.id)
    }
}
