//! Replicated records
//!
//! A record is a flat map of fields, each stamped with the version of the
//! write that produced its value. Writes carrying a version that does not
//! beat the recorded one are dropped, so replicas that see the same writes in
//! any order end up identical (last writer wins on the full version token).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use super::value::{Diff, Payload, Value};
use super::version_vector::VersionVector;
use crate::error::{Result, SyncError};
use crate::id::{IdMinter, Identifier, Kind, Origin};
use crate::router::{EventRouter, Listener, ListenerRef};
use crate::spec::Specifier;

#[derive(Default)]
struct RecordState {
    values: BTreeMap<Identifier, Value>,
    versions: BTreeMap<Identifier, Identifier>,
}

pub struct ReplicatedRecord {
    type_id: Identifier,
    id: RwLock<Option<Identifier>>,
    state: Mutex<RecordState>,
    router: EventRouter,
    minter: RwLock<Arc<Mutex<IdMinter>>>,
    self_ref: Weak<ReplicatedRecord>,
}

impl ReplicatedRecord {
    /// A detached record. Versions it mints carry the zero origin until it
    /// is attached to a peer.
    pub fn new(type_id: Identifier, object: Identifier) -> Arc<Self> {
        Self::with_fields(type_id, object, &[])
    }

    /// A record whose declared fields start out as `Null` with no version.
    pub fn with_fields(type_id: Identifier, object: Identifier, fields: &[Identifier]) -> Arc<Self> {
        let state = RecordState {
            values: fields.iter().map(|f| (f.with_kind(Kind::Field), Value::Null)).collect(),
            versions: BTreeMap::new(),
        };
        Arc::new_cyclic(|self_ref| Self {
            type_id: type_id.with_kind(Kind::Type),
            id: RwLock::new(Some(object.with_kind(Kind::Object))),
            state: Mutex::new(state),
            router: EventRouter::new(),
            minter: RwLock::new(Arc::new(Mutex::new(IdMinter::system(Origin::default())))),
            self_ref: self_ref.clone(),
        })
    }

    /// Mint versions through `minter` from now on.
    pub fn attach(&self, minter: Arc<Mutex<IdMinter>>) {
        *self.minter.write().unwrap_or_else(|p| p.into_inner()) = minter;
    }

    fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn type_id(&self) -> Identifier {
        self.type_id
    }

    /// Object id, or `None` once the record has been garbage collected.
    pub fn id(&self) -> Option<Identifier> {
        *self.id.read().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_alive(&self) -> bool {
        self.id().is_some()
    }

    pub(crate) fn clear_identity(&self) {
        *self.id.write().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn as_listener(&self) -> Option<ListenerRef> {
        self.self_ref.upgrade().map(|r| r as ListenerRef)
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn subscribe(&self, spec: Option<&Specifier>, listener: ListenerRef) {
        self.router.subscribe(spec, listener);
    }

    pub fn unsubscribe(&self, spec: Option<&Specifier>, listener: &ListenerRef) -> Result<()> {
        self.router.unsubscribe(spec, listener)
    }

    fn mint_version(&self) -> Identifier {
        let minter = self.minter.read().unwrap_or_else(|p| p.into_inner()).clone();
        let mut minter = minter.lock().unwrap_or_else(|p| p.into_inner());
        minter.mint(Kind::Version)
    }

    /// Apply a write. Returns how many field values were accepted.
    ///
    /// Missing type and object slots are taken from the record. A write
    /// without a version is a local change: it gets a fresh version and the
    /// record itself becomes its source.
    pub fn write(&self, spec: &Specifier, payload: &Payload, source: Option<&ListenerRef>) -> Result<usize> {
        if let Payload::Diff(diff) = payload {
            let mut applied = 0;
            for (entry, value) in diff.iter() {
                applied += self.write(entry, &Payload::Value(value.clone()), source)?;
            }
            return Ok(applied);
        }

        let Some(object) = self.id() else {
            log::warn!("Write {} to a collected record dropped", spec);
            return Ok(0);
        };
        let scope = Specifier::new().with_type(self.type_id).with_object(object);
        let mut spec = spec.scoped(&scope).without_base().without_method();
        if spec.object() != Some(object) {
            log::warn!("Write {} addressed to another object dropped", spec);
            return Ok(0);
        }

        let mut source = source.cloned();
        if spec.version().is_none() {
            spec.set_version(Some(self.mint_version()));
            source = self.as_listener();
        }

        if spec.field().is_some() {
            let value = match payload {
                Payload::Fields(fields) => Value::Map(fields.clone()),
                Payload::Value(value) => value.clone(),
                Payload::Diff(_) => return Ok(0),
            };
            return Ok(self.apply(spec, value, source.as_ref()) as usize);
        }

        match payload {
            Payload::Fields(fields) => {
                let mut applied = 0;
                for (name, value) in fields {
                    let field = Identifier::parse_any(Kind::Field, name)?;
                    let field_spec = spec.clone().with_field(field);
                    applied += self.apply(field_spec, value.clone(), source.as_ref()) as usize;
                }
                Ok(applied)
            }
            _ => Err(SyncError::IncompleteSpecifier(format!("{spec} names no field"))),
        }
    }

    fn apply(&self, spec: Specifier, value: Value, source: Option<&ListenerRef>) -> bool {
        let (Some(field), Some(version)) = (spec.field(), spec.version()) else {
            return false;
        };
        let outcome = {
            let mut state = self.lock();
            match state.versions.get(&field) {
                Some(current) if *current >= version => Err(*current),
                _ => {
                    state.values.insert(field, value.clone());
                    state.versions.insert(field, version);
                    Ok(())
                }
            }
        };
        match outcome {
            Ok(()) => {
                self.router.emit(&spec, &Payload::Value(value), source);
                true
            }
            Err(current) if current == version => {
                log::debug!("Duplicate write {} ignored", spec);
                false
            }
            Err(current) => {
                log::warn!("Stale write {} dropped, field is at {}", spec, current);
                false
            }
        }
    }

    /// Version vector over every recorded field version; `$000000` when empty.
    pub fn current_base(&self) -> VersionVector {
        let state = self.lock();
        if state.versions.is_empty() {
            return VersionVector::zero();
        }
        state.versions.values().copied().collect()
    }

    /// Every field write `base` has not seen, as fully specified entries.
    pub fn diff_since(&self, base: &VersionVector) -> Option<Diff> {
        let object = self.id()?;
        let state = self.lock();
        let diff: Diff = state
            .versions
            .iter()
            .filter(|(_, version)| version.stamp() > base.get(&version.origin()))
            .map(|(field, version)| {
                let spec = Specifier::new()
                    .with_type(self.type_id)
                    .with_object(object)
                    .with_field(*field)
                    .with_version(*version);
                let value = state.values.get(field).cloned().unwrap_or_default();
                (spec, value)
            })
            .collect();
        (!diff.is_empty()).then_some(diff)
    }

    /// `type + object + base`: what a replica sends to subscribe with catch-up.
    pub fn spec(&self) -> Specifier {
        let mut spec = Specifier::new().with_type(self.type_id);
        spec.set_object(self.id());
        spec.with_base(self.current_base())
    }

    /// Field value by compact (or fixed) field name.
    pub fn get(&self, name: &str) -> Option<Value> {
        let field = Identifier::parse_any(Kind::Field, name).ok()?;
        self.get_field(&field)
    }

    pub fn get_field(&self, field: &Identifier) -> Option<Value> {
        self.lock().values.get(&field.with_kind(Kind::Field)).cloned()
    }

    pub fn version_of(&self, field: &Identifier) -> Option<Identifier> {
        self.lock().versions.get(&field.with_kind(Kind::Field)).copied()
    }

    /// Snapshot of all fields, keyed by compact name.
    pub fn fields(&self) -> BTreeMap<String, Value> {
        self.lock()
            .values
            .iter()
            .map(|(f, v)| (f.to_compact_string(), v.clone()))
            .collect()
    }
}

impl Listener for ReplicatedRecord {
    fn set(&self, spec: &Specifier, payload: &Payload, source: Option<&ListenerRef>) -> Result<()> {
        self.write(spec, payload, source).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ManualClock;
    use crate::router::FnListener;

    fn mice() -> Identifier {
        Identifier::parse_compact(Kind::Type, "Mice").unwrap()
    }

    fn obj() -> Identifier {
        Identifier::new(Kind::Object, 1000, 0, 1, 0)
    }

    fn x() -> Identifier {
        Identifier::parse_compact(Kind::Field, "x").unwrap()
    }

    fn v(ts: u32, origin: u32) -> Identifier {
        Identifier::new(Kind::Version, ts, 0, origin, 0)
    }

    fn field_write(version: Identifier) -> Specifier {
        Specifier::new().with_field(x()).with_version(version)
    }

    #[test]
    fn test_newer_version_wins() {
        let record = ReplicatedRecord::new(mice(), obj());
        assert_eq!(record.write(&field_write(v(10, 1)), &Value::int(1).into(), None).unwrap(), 1);
        assert_eq!(record.write(&field_write(v(12, 1)), &Value::int(2).into(), None).unwrap(), 1);
        assert_eq!(record.get("x"), Some(Value::int(2)));
        assert_eq!(record.version_of(&x()), Some(v(12, 1)));
    }

    #[test]
    fn test_stale_and_duplicate_writes_are_dropped() {
        let record = ReplicatedRecord::new(mice(), obj());
        record.write(&field_write(v(12, 1)), &Value::int(2).into(), None).unwrap();

        assert_eq!(record.write(&field_write(v(10, 1)), &Value::int(1).into(), None).unwrap(), 0);
        assert_eq!(record.write(&field_write(v(12, 1)), &Value::int(3).into(), None).unwrap(), 0);
        assert_eq!(record.get("x"), Some(Value::int(2)));
    }

    #[test]
    fn test_same_timestamp_origin_breaks_tie() {
        let a = ReplicatedRecord::new(mice(), obj());
        let b = ReplicatedRecord::new(mice(), obj());

        a.write(&field_write(v(10, 1)), &Value::string("one").into(), None).unwrap();
        a.write(&field_write(v(10, 2)), &Value::string("two").into(), None).unwrap();
        b.write(&field_write(v(10, 2)), &Value::string("two").into(), None).unwrap();
        b.write(&field_write(v(10, 1)), &Value::string("one").into(), None).unwrap();

        assert_eq!(a.get("x"), Some(Value::string("two")));
        assert_eq!(b.get("x"), Some(Value::string("two")));
    }

    #[test]
    fn test_local_write_mints_version_and_emits() {
        let record = ReplicatedRecord::new(mice(), obj());
        let clock = Arc::new(ManualClock::at_epoch_offset(500));
        record.attach(Arc::new(Mutex::new(IdMinter::new(clock, Origin::new(7, 0)))));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        record.subscribe(None, FnListener::shared(move |spec, _| s.lock().unwrap().push(spec.clone())));

        record.write(&Specifier::new().with_field(x()), &Value::int(5).into(), None).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let version = seen[0].version().unwrap();
        assert_eq!(version.origin(), Origin::new(7, 0));
        assert_eq!(version.timestamp(), 500);
        assert_eq!(seen[0].type_id(), Some(mice()));
        assert_eq!(seen[0].object(), Some(obj()));
    }

    #[test]
    fn test_fields_payload_writes_each_field() {
        let record = ReplicatedRecord::with_fields(mice(), obj(), &[x()]);
        assert_eq!(record.get("x"), Some(Value::Null));

        let fields = [("x".to_string(), Value::int(1)), ("y".to_string(), Value::int(2))]
            .into_iter()
            .collect::<crate::convergent::FieldMap>();
        let applied = record
            .write(&Specifier::new().with_version(v(20, 3)), &fields.into(), None)
            .unwrap();
        assert_eq!(applied, 2);
        assert_eq!(record.get("y"), Some(Value::int(2)));
    }

    #[test]
    fn test_value_without_field_is_incomplete() {
        let record = ReplicatedRecord::new(mice(), obj());
        let err = record.write(&Specifier::new().with_version(v(1, 1)), &Value::int(1).into(), None);
        assert!(matches!(err, Err(SyncError::IncompleteSpecifier(_))));
    }

    #[test]
    fn test_base_and_diff() {
        let record = ReplicatedRecord::new(mice(), obj());
        assert_eq!(record.current_base().to_string(), "$000000");
        assert!(record.diff_since(&VersionVector::zero()).is_none());

        record.write(&field_write(v(10, 1)), &Value::int(42).into(), None).unwrap();
        let y = Identifier::parse_compact(Kind::Field, "y").unwrap();
        record
            .write(&Specifier::new().with_field(y).with_version(v(11, 2)), &Value::int(7).into(), None)
            .unwrap();

        let base = record.current_base();
        assert!(base.covers(&v(10, 1)));
        assert!(base.covers(&v(11, 2)));

        let full = record.diff_since(&VersionVector::zero()).unwrap();
        assert_eq!(full.len(), 2);
        let key = Specifier::new().with_type(mice()).with_object(obj()).with_field(x()).with_version(v(10, 1));
        assert_eq!(full.get(&key), Some(&Value::int(42)));

        let partial = record.diff_since(&[v(10, 1)].into_iter().collect::<VersionVector>()).unwrap();
        assert_eq!(partial.len(), 1);
        assert!(record.diff_since(&base).is_none());
    }

    #[test]
    fn test_diff_payload_applies_each_entry() {
        let source = ReplicatedRecord::new(mice(), obj());
        source.write(&field_write(v(10, 1)), &Value::int(42).into(), None).unwrap();
        let diff = source.diff_since(&VersionVector::zero()).unwrap();

        let replica = ReplicatedRecord::new(mice(), obj());
        let applied = replica.write(&Specifier::new(), &diff.into(), None).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(replica.get("x"), Some(Value::int(42)));
        assert_eq!(replica.current_base(), source.current_base());
    }

    #[test]
    fn test_spec_carries_type_object_base() {
        let record = ReplicatedRecord::new(mice(), obj());
        let spec = record.spec();
        assert_eq!(spec.as_str(), format!("{}{}$000000", mice(), obj()));
    }

    #[test]
    fn test_collected_record_ignores_writes() {
        let record = ReplicatedRecord::new(mice(), obj());
        record.clear_identity();
        assert!(!record.is_alive());
        assert_eq!(record.write(&field_write(v(10, 1)), &Value::int(1).into(), None).unwrap(), 0);
    }
}
