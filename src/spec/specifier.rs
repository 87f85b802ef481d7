//! Specifiers: composite keys of typed identifier tokens
//!
//! A specifier names anything the system talks about: a type, an object, a
//! field of an object, a particular version of that field. Its canonical text
//! is the concatenation of the present tokens in slot order
//! `/ # . , ' ! $`, whatever order they were parsed or set in.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::convergent::VersionVector;
use crate::error::{Result, SyncError};
use crate::id::{decode_digits, Identifier, Kind, FIXED_LEN};

#[derive(Clone, Default)]
pub struct Specifier {
    ty: Option<Identifier>,
    object: Option<Identifier>,
    field: Option<Identifier>,
    key: Option<Identifier>,
    method: Option<Identifier>,
    version: Option<Identifier>,
    base: Option<VersionVector>,
    canonical: OnceLock<String>,
}

impl Specifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse canonical or non-canonical token text.
    ///
    /// A slot given twice keeps its first token; base tokens accumulate.
    pub fn parse(text: &str) -> Result<Self> {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() % FIXED_LEN != 0 {
            return Err(SyncError::MalformedSpecifier(format!(
                "{text:?} has {} trailing characters",
                chars.len() % FIXED_LEN
            )));
        }

        let mut spec = Self::new();
        for token in chars.chunks(FIXED_LEN) {
            let digits = decode_digits(&token[1..]).ok_or_else(|| {
                SyncError::MalformedSpecifier(format!(
                    "bad token {:?} in {text:?}",
                    token.iter().collect::<String>()
                ))
            })?;
            let kind = Kind::from_symbol(token[0])
                .filter(|k| *k != Kind::Peer)
                .ok_or(SyncError::UnknownQuant(token[0]))?;
            let id = Identifier::from_digits(kind, digits);
            match kind {
                Kind::Base => spec.base.get_or_insert_with(VersionVector::new).observe(&id),
                _ => {
                    let slot = spec.slot_mut(kind);
                    if slot.is_none() {
                        *slot = Some(id);
                    }
                }
            }
        }
        Ok(spec)
    }

    /// Parse `text` and fill its empty slots from `scope`.
    pub fn parse_scoped(text: &str, scope: &Specifier) -> Result<Self> {
        Ok(Self::parse(text)?.scoped(scope))
    }

    /// A copy with empty slots filled from `scope`. `scope` is left as is.
    pub fn scoped(&self, scope: &Specifier) -> Specifier {
        Specifier {
            ty: self.ty.or(scope.ty),
            object: self.object.or(scope.object),
            field: self.field.or(scope.field),
            key: self.key.or(scope.key),
            method: self.method.or(scope.method),
            version: self.version.or(scope.version),
            base: self.base.clone().or_else(|| scope.base.clone()),
            canonical: OnceLock::new(),
        }
    }

    /// The canonical text, rendered once and then cached.
    pub fn as_str(&self) -> &str {
        self.canonical.get_or_init(|| self.render())
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for id in [self.ty, self.object, self.field, self.key, self.method, self.version]
            .into_iter()
            .flatten()
        {
            id.push_fixed(&mut out);
        }
        if let Some(base) = &self.base {
            out.push_str(&base.to_string());
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.ty.is_none()
            && self.object.is_none()
            && self.field.is_none()
            && self.key.is_none()
            && self.method.is_none()
            && self.version.is_none()
            && self.base.is_none()
    }

    pub fn type_id(&self) -> Option<Identifier> {
        self.ty
    }

    pub fn object(&self) -> Option<Identifier> {
        self.object
    }

    pub fn field(&self) -> Option<Identifier> {
        self.field
    }

    pub fn key(&self) -> Option<Identifier> {
        self.key
    }

    pub fn method(&self) -> Option<Identifier> {
        self.method
    }

    pub fn version(&self) -> Option<Identifier> {
        self.version
    }

    pub fn base(&self) -> Option<&VersionVector> {
        self.base.as_ref()
    }

    fn slot_mut(&mut self, kind: Kind) -> &mut Option<Identifier> {
        match kind {
            Kind::Type => &mut self.ty,
            Kind::Object => &mut self.object,
            Kind::Field => &mut self.field,
            Kind::Key => &mut self.key,
            Kind::Method => &mut self.method,
            // base and peer tokens never reach here
            Kind::Version | Kind::Base | Kind::Peer => &mut self.version,
        }
    }

    fn set_slot(&mut self, kind: Kind, id: Option<Identifier>) {
        *self.slot_mut(kind) = id.map(|id| id.with_kind(kind));
        self.canonical = OnceLock::new();
    }

    pub fn set_type(&mut self, id: Option<Identifier>) {
        self.set_slot(Kind::Type, id);
    }

    pub fn set_object(&mut self, id: Option<Identifier>) {
        self.set_slot(Kind::Object, id);
    }

    pub fn set_field(&mut self, id: Option<Identifier>) {
        self.set_slot(Kind::Field, id);
    }

    pub fn set_key(&mut self, id: Option<Identifier>) {
        self.set_slot(Kind::Key, id);
    }

    pub fn set_method(&mut self, id: Option<Identifier>) {
        self.set_slot(Kind::Method, id);
    }

    pub fn set_version(&mut self, id: Option<Identifier>) {
        self.set_slot(Kind::Version, id);
    }

    pub fn set_base(&mut self, base: Option<VersionVector>) {
        self.base = base;
        self.canonical = OnceLock::new();
    }

    pub fn with_type(mut self, id: Identifier) -> Self {
        self.set_type(Some(id));
        self
    }

    pub fn with_object(mut self, id: Identifier) -> Self {
        self.set_object(Some(id));
        self
    }

    pub fn with_field(mut self, id: Identifier) -> Self {
        self.set_field(Some(id));
        self
    }

    pub fn with_key(mut self, id: Identifier) -> Self {
        self.set_key(Some(id));
        self
    }

    pub fn with_method(mut self, id: Identifier) -> Self {
        self.set_method(Some(id));
        self
    }

    pub fn with_version(mut self, id: Identifier) -> Self {
        self.set_version(Some(id));
        self
    }

    pub fn with_base(mut self, base: VersionVector) -> Self {
        self.set_base(Some(base));
        self
    }

    pub fn without_base(mut self) -> Self {
        self.set_base(None);
        self
    }

    pub fn without_method(mut self) -> Self {
        self.set_method(None);
        self
    }
}

impl PartialEq for Specifier {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Specifier {}

impl PartialOrd for Specifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Specifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl Hash for Specifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl fmt::Debug for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Specifier").field(&self.as_str()).finish()
    }
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Specifier {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Specifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Specifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty() -> Identifier {
        Identifier::parse_compact(Kind::Type, "Mice").unwrap()
    }

    fn obj() -> Identifier {
        Identifier::new(Kind::Object, 500, 0, 9, 0)
    }

    fn field() -> Identifier {
        Identifier::parse_compact(Kind::Field, "x").unwrap()
    }

    fn ver() -> Identifier {
        Identifier::new(Kind::Version, 600, 2, 9, 1)
    }

    #[test]
    fn test_canonical_order_ignores_input_order() {
        let ordered = format!("{}{}{}{}", ty(), obj(), field(), ver());
        let shuffled = format!("{}{}{}{}", ver(), field(), ty(), obj());
        let a = Specifier::parse(&ordered).unwrap();
        let b = Specifier::parse(&shuffled).unwrap();
        assert_eq!(a.as_str(), ordered);
        assert_eq!(b.as_str(), ordered);
        assert_eq!(a, b);
    }

    #[test]
    fn test_slots_are_typed() {
        let spec = Specifier::parse(&format!("{}{}", obj(), ver())).unwrap();
        assert_eq!(spec.object(), Some(obj()));
        assert_eq!(spec.version(), Some(ver()));
        assert!(spec.type_id().is_none());
        assert!(spec.field().is_none());
    }

    #[test]
    fn test_first_occurrence_wins_and_bases_accumulate() {
        let other = Identifier::new(Kind::Object, 1, 0, 1, 0);
        let b1 = Identifier::new(Kind::Base, 5, 0, 1, 0);
        let b2 = Identifier::new(Kind::Base, 7, 0, 2, 0);
        let spec = Specifier::parse(&format!("{}{}{}{}", obj(), b2, other, b1)).unwrap();
        assert_eq!(spec.object(), Some(obj()));
        let base = spec.base().unwrap();
        assert_eq!(base.len(), 2);
        assert!(spec.as_str().ends_with(&format!("{b1}{b2}")));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Specifier::parse("#00000"), Err(SyncError::MalformedSpecifier(_))));
        assert!(matches!(
            Specifier::parse(&format!("{}x", obj())),
            Err(SyncError::MalformedSpecifier(_))
        ));
        assert_eq!(Specifier::parse("?000000"), Err(SyncError::UnknownQuant('?')));
        assert_eq!(Specifier::parse("*000000"), Err(SyncError::UnknownQuant('*')));
        assert!(matches!(Specifier::parse("#00 000"), Err(SyncError::MalformedSpecifier(_))));
    }

    #[test]
    fn test_scope_fills_empty_slots_only() {
        let scope = Specifier::new().with_type(ty()).with_object(obj());
        let scope_text = scope.as_str().to_string();

        let child = Specifier::parse_scoped(&format!("{}{}", field(), ver()), &scope).unwrap();
        assert_eq!(child.type_id(), Some(ty()));
        assert_eq!(child.object(), Some(obj()));
        assert_eq!(child.field(), Some(field()));

        let other = Identifier::new(Kind::Object, 2, 0, 2, 0);
        let own = Specifier::new().with_object(other).scoped(&scope);
        assert_eq!(own.object(), Some(other));
        assert_eq!(scope.as_str(), scope_text);
    }

    #[test]
    fn test_setters_invalidate_cached_text() {
        let mut spec = Specifier::new().with_object(obj());
        let before = spec.as_str().to_string();
        spec.set_field(Some(field()));
        assert_ne!(spec.as_str(), before);
        assert_eq!(spec.as_str(), format!("{}{}", obj(), field()));

        spec.set_field(None);
        assert_eq!(spec.as_str(), before);
    }

    #[test]
    fn test_setters_retag_kind() {
        let raw = Identifier::new(Kind::Version, 500, 0, 9, 0);
        let spec = Specifier::new().with_object(raw);
        assert_eq!(spec.object().map(|id| id.kind()), Some(Kind::Object));
        assert!(spec.as_str().starts_with('#'));
    }

    #[test]
    fn test_empty_spec() {
        let spec = Specifier::parse("").unwrap();
        assert!(spec.is_empty());
        assert_eq!(spec.as_str(), "");
    }
}
