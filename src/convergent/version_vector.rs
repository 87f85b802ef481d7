//! Version vectors ("bases")
//!
//! A version vector records, per origin, the newest version stamp a replica
//! has seen. Peers exchange them to ask "what changed since this?".

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, SyncError};
use crate::id::{push_origin_chars, push_time_chars, Identifier, Kind, Origin, Stamp, FIXED_LEN};

/// Origin → newest stamp seen from that origin.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VersionVector {
    seen: BTreeMap<Origin, Stamp>,
}

impl VersionVector {
    /// Create an empty vector (knows nothing)
    pub fn new() -> Self {
        Self::default()
    }

    /// The zero marker `$000000`: "I have nothing, send everything".
    pub fn zero() -> Self {
        Self::at(Origin::default(), Stamp::default())
    }

    pub fn at(origin: Origin, stamp: Stamp) -> Self {
        let mut vv = Self::new();
        vv.seen.insert(origin, stamp);
        vv
    }

    /// Stamp seen from an origin (zero if never seen)
    pub fn get(&self, origin: &Origin) -> Stamp {
        self.seen.get(origin).copied().unwrap_or_default()
    }

    /// Record having seen a version
    pub fn observe(&mut self, version: &Identifier) {
        self.observe_stamp(version.origin(), version.stamp());
    }

    pub fn observe_stamp(&mut self, origin: Origin, stamp: Stamp) {
        let current = self.seen.entry(origin).or_default();
        if stamp > *current {
            *current = stamp;
        }
    }

    /// Take the per-origin maximum of both vectors
    pub fn merge(&mut self, other: &VersionVector) {
        for (origin, stamp) in &other.seen {
            self.observe_stamp(*origin, *stamp);
        }
    }

    /// Whether `version` is already reflected in this vector
    pub fn covers(&self, version: &Identifier) -> bool {
        self.get(&version.origin()) >= version.stamp()
    }

    /// Whether this vector has seen everything `other` has seen
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other.seen.iter().all(|(o, s)| self.get(o) >= *s)
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Origin, &Stamp)> {
        self.seen.iter()
    }

    /// The entries as `$` identifiers, ordered by origin.
    pub fn tokens(&self) -> impl Iterator<Item = Identifier> + '_ {
        self.seen
            .iter()
            .map(|(origin, stamp)| Identifier::from_parts(Kind::Base, *stamp, *origin))
    }

    /// Parse a run of `$` tokens. Any other kind is rejected.
    pub fn parse(text: &str) -> Result<Self> {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() % FIXED_LEN != 0 {
            return Err(SyncError::MalformedSpecifier(format!(
                "version vector {text:?} is not a whole number of tokens"
            )));
        }
        let mut vv = Self::new();
        for chunk in chars.chunks(FIXED_LEN) {
            let token: String = chunk.iter().collect();
            let id = Identifier::parse_fixed(&token)?;
            if id.kind() != Kind::Base {
                return Err(SyncError::UnknownQuant(id.kind().symbol()));
            }
            vv.observe(&id);
        }
        Ok(vv)
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::with_capacity(self.seen.len() * FIXED_LEN * 3);
        for (origin, stamp) in &self.seen {
            out.push(Kind::Base.symbol());
            push_time_chars(*stamp, &mut out);
            push_origin_chars(*origin, &mut out);
        }
        f.write_str(&out)
    }
}

impl FromStr for VersionVector {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl FromIterator<Identifier> for VersionVector {
    fn from_iter<I: IntoIterator<Item = Identifier>>(iter: I) -> Self {
        let mut vv = Self::new();
        for id in iter {
            vv.observe(&id);
        }
        vv
    }
}

impl Serialize for VersionVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(ts: u32, seq: u16, origin: u32) -> Identifier {
        Identifier::new(Kind::Version, ts, seq, origin, 0)
    }

    #[test]
    fn test_observe_keeps_maximum() {
        let mut vv = VersionVector::new();
        vv.observe(&v(10, 1, 1));
        vv.observe(&v(9, 5, 1));
        vv.observe(&v(10, 0, 1));
        assert_eq!(vv.get(&Origin::new(1, 0)), Stamp::new(10, 1));

        // Doesn't go backwards on merge either
        vv.merge(&VersionVector::at(Origin::new(1, 0), Stamp::new(3, 0)));
        assert_eq!(vv.get(&Origin::new(1, 0)), Stamp::new(10, 1));
    }

    #[test]
    fn test_covers_and_dominates() {
        let a: VersionVector = [v(10, 0, 1), v(5, 0, 2)].into_iter().collect();
        let b: VersionVector = [v(8, 0, 1)].into_iter().collect();

        assert!(a.covers(&v(10, 0, 1)));
        assert!(!a.covers(&v(10, 1, 1)));
        assert!(!a.covers(&v(1, 0, 3)));
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
    }

    #[test]
    fn test_zero_marker_text() {
        assert_eq!(VersionVector::zero().to_string(), "$000000");
        assert_eq!(VersionVector::new().to_string(), "");
        assert_eq!(VersionVector::parse("$000000").unwrap(), VersionVector::zero());
    }

    #[test]
    fn test_text_is_ordered_by_origin() {
        let vv: VersionVector = [v(99, 0, 7), v(1, 0, 2)].into_iter().collect();
        let text = vv.to_string();
        let tokens: Vec<Identifier> = vv.tokens().collect();
        assert!(tokens[0].origin() < tokens[1].origin());
        assert_eq!(VersionVector::parse(&text).unwrap(), vv);
    }

    #[test]
    fn test_parse_rejects_other_kinds() {
        let text = v(1, 0, 1).to_fixed_string();
        assert_eq!(VersionVector::parse(&text), Err(SyncError::UnknownQuant('!')));
        assert!(matches!(VersionVector::parse("$0000"), Err(SyncError::MalformedSpecifier(_))));
    }
}
