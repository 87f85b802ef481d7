//! Multi-hop topologies
//!
//! Topology for most tests: A (origin 5) - B (origin 50) - C (origin 100).
//! The object hashes to 5, so A is responsible for it, B relays for C, and
//! C never talks to A directly.

use std::sync::Arc;

use swarm_sync::{
    connect_peers, Identifier, Kind, ListenerRef, ManualClock, Peer, PeerConfig, PipePolicy,
    ReplicatedRecord, Specifier, TypeRegistry, Value,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn registry() -> Arc<TypeRegistry> {
    let mut registry = TypeRegistry::new();
    registry.define("Mice", &["x"]).unwrap();
    Arc::new(registry)
}

fn mice() -> Identifier {
    Identifier::parse_compact(Kind::Type, "Mice").unwrap()
}

fn obj() -> Identifier {
    Identifier::new(Kind::Object, 10, 0, 5, 0)
}

fn make_peer(origin: u32, clock: &Arc<ManualClock>) -> Arc<Peer> {
    Peer::with_clock(
        Identifier::new(Kind::Peer, 0, 0, origin, 0),
        registry(),
        clock.clone(),
        vec![0],
    )
}

fn open(peer: &Peer) -> Arc<ReplicatedRecord> {
    peer.on(&Specifier::new().with_type(mice()).with_object(obj()), None)
        .unwrap()
}

fn write(record: &ReplicatedRecord, value: i64) {
    let x = Identifier::parse_compact(Kind::Field, "x").unwrap();
    record
        .write(&Specifier::new().with_field(x), &Value::int(value).into(), None)
        .unwrap();
}

fn is_uplink(peer: &Peer, expected: &Identifier) -> bool {
    peer.find_uplink(&obj(), None).peer_id() == Some(*expected)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn test_chain_relays_through_middle_peer() {
    init_logging();
    let clock = Arc::new(ManualClock::at_epoch_offset(1000));
    let a = make_peer(5, &clock);
    let b = make_peer(50, &clock);
    let c = make_peer(100, &clock);
    let _ab = connect_peers(&a, &b, PipePolicy::immediate()).unwrap();
    let _bc = connect_peers(&b, &c, PipePolicy::immediate()).unwrap();

    let c_record = open(&c);
    // c's subscription pulled the object into b and a
    let a_record = a.find_record(&obj()).unwrap();
    let b_record = b.find_record(&obj()).unwrap();
    assert!(is_uplink(&c, &b.id()));
    assert!(is_uplink(&b, &a.id()));
    assert!(a.find_uplink(&obj(), None).peer_id().is_none());

    write(&a_record, 1);
    assert_eq!(b_record.get("x"), Some(Value::int(1)));
    assert_eq!(c_record.get("x"), Some(Value::int(1)));

    clock.advance(1);
    write(&c_record, 2);
    assert_eq!(a_record.get("x"), Some(Value::int(2)));
    assert_eq!(b_record.get("x"), Some(Value::int(2)));
}

#[test]
fn test_closer_peer_joining_takes_over() {
    init_logging();
    let clock = Arc::new(ManualClock::at_epoch_offset(1000));
    let a = make_peer(5, &clock);
    let b = make_peer(50, &clock);
    let c = make_peer(100, &clock);
    let _bc = connect_peers(&b, &c, PipePolicy::immediate()).unwrap();

    let c_record = open(&c);
    write(&c_record, 7);
    let b_record = b.find_record(&obj()).unwrap();
    assert_eq!(b_record.get("x"), Some(Value::int(7)));
    assert!(b.find_uplink(&obj(), None).peer_id().is_none());

    let _ab = connect_peers(&a, &b, PipePolicy::immediate()).unwrap();
    assert!(is_uplink(&b, &a.id()));
    let a_record = a.find_record(&obj()).unwrap();
    assert_eq!(a_record.get("x"), Some(Value::int(7)));

    clock.advance(1);
    write(&a_record, 8);
    assert_eq!(c_record.get("x"), Some(Value::int(8)));
}

#[test]
fn test_removing_a_peer_falls_back() {
    init_logging();
    let clock = Arc::new(ManualClock::at_epoch_offset(1000));
    let a = make_peer(5, &clock);
    let b = make_peer(50, &clock);
    let ab = connect_peers(&a, &b, PipePolicy::immediate()).unwrap();

    open(&b);
    assert!(is_uplink(&b, &a.id()));

    b.remove_peer(&a.id()).unwrap();
    ab.a_to_b.close().unwrap();
    assert!(b.peer_ids().is_empty());
    assert!(b.find_uplink(&obj(), None).peer_id().is_none());

    // only the record is left in b's bucket
    let listeners: Vec<ListenerRef> = b.listeners(&obj());
    assert_eq!(listeners.len(), 1);
}

#[test]
fn test_peers_from_config_file() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peer.json");
    PeerConfig::new("a_bob").save(&path).unwrap();

    let config = PeerConfig::load(&path).unwrap();
    let clock = Arc::new(ManualClock::at_epoch_offset(0));
    let peer = Peer::from_config(&config, registry(), clock).unwrap();
    assert_eq!(peer.id(), Identifier::parse_compact(Kind::Peer, "a_bob").unwrap());
}
