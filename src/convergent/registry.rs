//! Record types
//!
//! Peers create records for objects they hear about by looking the type up
//! here by its compact name.

use std::collections::HashMap;
use std::sync::Arc;

use super::record::ReplicatedRecord;
use crate::error::{Result, SyncError};
use crate::id::{Identifier, Kind};

/// A named record type and the fields every instance starts with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordType {
    pub name: String,
    pub type_id: Identifier,
    pub fields: Vec<Identifier>,
}

impl RecordType {
    /// Names must already be in canonical compact form (`Mice`, `x`, `xBob`).
    ///
    /// The letter `a` is the zero digit, so a name whose time or origin part
    /// starts with `a` (`Amber`, `xAuthor`) is not canonical and is rejected.
    pub fn new(name: &str, fields: &[&str]) -> Result<Self> {
        let type_id = canonical(Kind::Type, name)?;
        let fields = fields
            .iter()
            .map(|f| canonical(Kind::Field, f))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: name.to_string(),
            type_id,
            fields,
        })
    }
}

fn canonical(kind: Kind, name: &str) -> Result<Identifier> {
    let id = Identifier::parse_compact(kind, name)?;
    if id.to_compact_string() != name {
        return Err(SyncError::MalformedId(format!(
            "{name:?} is not a canonical name (expected {:?})",
            id.to_compact_string()
        )));
    }
    Ok(id)
}

/// Registry mapping type names to record types.
#[derive(Clone, Debug, Default)]
pub struct TypeRegistry {
    types: HashMap<String, RecordType>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record type.
    pub fn register(&mut self, record_type: RecordType) {
        self.types.insert(record_type.name.clone(), record_type);
    }

    /// Shorthand for `register(RecordType::new(..)?)`.
    pub fn define(&mut self, name: &str, fields: &[&str]) -> Result<Identifier> {
        let record_type = RecordType::new(name, fields)?;
        let type_id = record_type.type_id;
        self.register(record_type);
        Ok(type_id)
    }

    pub fn get(&self, name: &str) -> Option<&RecordType> {
        self.types.get(name)
    }

    pub fn resolve(&self, type_id: &Identifier) -> Option<&RecordType> {
        self.types.get(&type_id.with_kind(Kind::Type).to_compact_string())
    }

    /// Build an empty record of `type_id` for `object`.
    pub fn instantiate(&self, type_id: &Identifier, object: Identifier) -> Result<Arc<ReplicatedRecord>> {
        let record_type = self
            .resolve(type_id)
            .ok_or_else(|| SyncError::UnknownType(type_id.to_compact_string()))?;
        Ok(ReplicatedRecord::with_fields(
            record_type.type_id,
            object,
            &record_type.fields,
        ))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}
