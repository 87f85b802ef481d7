//! Sortable identifiers and their two textual encodings
//!
//! An identifier packs `(timestamp, sequence, origin, sub_origin)` plus a
//! one-character kind tag. The fixed form spends one character per 15-bit
//! digit (`0x30 + digit`), so seven characters always sort the same way the
//! numeric fields do. The compact form is a base-32 rendering meant for
//! humans and for naming types and fields in code.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, SyncError};

/// 1 Jan 2010 00:00:00 UTC, in unix seconds.
pub const EPOCH: i64 = 1_262_275_200;

/// Length of the fixed form, in characters.
pub const FIXED_LEN: usize = 7;

pub const MAX_TIMESTAMP: u32 = 0x3fff_ffff;
pub const MAX_ORIGIN: u32 = 0x3fff_ffff;
pub const MAX_SEQUENCE: u16 = 0x7fff;

const DIGIT_BASE: u32 = 0x30;
const DIGIT_MASK: u32 = 0x7fff;
const BASE32: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
const MAX_COMPACT_DIGITS: usize = 9;

/// What an identifier names. The tag is the first character of the fixed form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Type,
    Object,
    Field,
    Key,
    Method,
    Version,
    Base,
    Peer,
}

impl Kind {
    pub const ALL: [Kind; 8] = [
        Kind::Type,
        Kind::Object,
        Kind::Field,
        Kind::Key,
        Kind::Method,
        Kind::Version,
        Kind::Base,
        Kind::Peer,
    ];

    pub fn symbol(self) -> char {
        match self {
            Kind::Type => '/',
            Kind::Object => '#',
            Kind::Field => '.',
            Kind::Key => ',',
            Kind::Method => '\'',
            Kind::Version => '!',
            Kind::Base => '$',
            Kind::Peer => '*',
        }
    }

    pub fn from_symbol(symbol: char) -> Option<Kind> {
        Kind::ALL.into_iter().find(|k| k.symbol() == symbol)
    }
}

impl PartialOrd for Kind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Kind {
    fn cmp(&self, other: &Self) -> Ordering {
        self.symbol().cmp(&other.symbol())
    }
}

/// The author half of an identifier: a 30-bit primary tag and a 15-bit sub tag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Origin {
    pub primary: u32,
    pub sub: u16,
}

impl Origin {
    pub const fn new(primary: u32, sub: u16) -> Self {
        Self {
            primary: primary & MAX_ORIGIN,
            sub: sub & MAX_SEQUENCE,
        }
    }
}

/// The time half of an identifier. Orders exactly like the fixed form does.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Stamp {
    pub timestamp: u32,
    pub sequence: u16,
}

impl Stamp {
    pub const fn new(timestamp: u32, sequence: u16) -> Self {
        Self {
            timestamp: timestamp & MAX_TIMESTAMP,
            sequence: sequence & MAX_SEQUENCE,
        }
    }
}

/// A typed, totally ordered identifier.
///
/// Ordering follows the fixed textual form: kind, timestamp, sequence,
/// origin, sub-origin. Comparing two versions with `>` is therefore the same
/// as comparing their fixed strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Identifier {
    kind: Kind,
    stamp: Stamp,
    origin: Origin,
}

impl Identifier {
    /// Build an identifier, truncating each field to its bit width.
    pub const fn new(kind: Kind, timestamp: u32, sequence: u16, origin: u32, sub_origin: u16) -> Self {
        Self {
            kind,
            stamp: Stamp::new(timestamp, sequence),
            origin: Origin::new(origin, sub_origin),
        }
    }

    pub const fn from_parts(kind: Kind, stamp: Stamp, origin: Origin) -> Self {
        Self {
            kind,
            stamp,
            origin,
        }
    }

    /// The all-zero identifier of a kind (`$000000` for bases).
    pub fn zero(kind: Kind) -> Self {
        Self::from_parts(kind, Stamp::default(), Origin::default())
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn timestamp(&self) -> u32 {
        self.stamp.timestamp
    }

    pub fn sequence(&self) -> u16 {
        self.stamp.sequence
    }

    /// Same numeric triple, different tag.
    pub fn with_kind(self, kind: Kind) -> Self {
        Self { kind, ..self }
    }

    /// Placement hash for the peer ring. Not used for replication correctness.
    pub fn ring_hash(&self) -> u32 {
        self.origin.primary ^ u32::from(self.origin.sub)
    }

    /// Parse the 7-character fixed form.
    pub fn parse_fixed(text: &str) -> Result<Self> {
        let mut chars = [char::default(); FIXED_LEN];
        let mut count = 0;
        for c in text.chars() {
            if count == FIXED_LEN {
                return Err(malformed(text, "too long"));
            }
            chars[count] = c;
            count += 1;
        }
        if count != FIXED_LEN {
            return Err(malformed(text, "too short"));
        }
        let kind = Kind::from_symbol(chars[0]).ok_or_else(|| malformed(text, "unknown kind"))?;
        let digits = decode_digits(&chars[1..]).ok_or_else(|| malformed(text, "digit out of range"))?;
        Ok(Self::from_digits(kind, digits))
    }

    pub(crate) fn from_digits(kind: Kind, d: [u32; 6]) -> Self {
        Self {
            kind,
            stamp: Stamp {
                timestamp: (d[0] << 15) | d[1],
                sequence: d[2] as u16,
            },
            origin: Origin {
                primary: (d[3] << 15) | d[4],
                sub: d[5] as u16,
            },
        }
    }

    pub fn to_fixed_string(&self) -> String {
        let mut out = String::with_capacity(FIXED_LEN * 3);
        self.push_fixed(&mut out);
        out
    }

    pub(crate) fn push_fixed(&self, out: &mut String) {
        out.push(self.kind.symbol());
        push_time_chars(self.stamp, out);
        push_origin_chars(self.origin, out);
    }

    /// Base-32 rendering with the per-kind case convention.
    ///
    /// Types read as `Mice`, fields as `x` or `xAuthor`, everything else as
    /// `time_origin`. A zero origin is left out.
    pub fn to_compact_string(&self) -> String {
        let time = base32_encode(pack(self.stamp.timestamp, self.stamp.sequence));
        let origin_value = pack(self.origin.primary, self.origin.sub);
        let origin = if origin_value == 0 {
            String::new()
        } else {
            base32_encode(origin_value)
        };
        // a digit cannot carry the case switch, so it gets an explicit separator
        let joined = |time: String| match origin.chars().next() {
            None => time,
            Some(first) if first.is_ascii_digit() => format!("{time}_{origin}"),
            Some(_) => time + &capitalize(&origin),
        };
        match self.kind {
            Kind::Type => joined(capitalize(&time)),
            Kind::Field | Kind::Key => joined(time),
            _ if origin.is_empty() => time,
            _ => format!("{time}_{origin}"),
        }
    }

    /// Parse the compact form under a given kind.
    ///
    /// The time and origin parts may be separated by `-`, `_`, or a switch
    /// from lower to upper case. A missing origin part means zero.
    pub fn parse_compact(kind: Kind, text: &str) -> Result<Self> {
        let mut normalized = String::with_capacity(text.len() + 2);
        let mut prev: Option<char> = None;
        for c in text.chars() {
            let after_digit = prev.is_some_and(|p| p.is_ascii_alphabetic() || ('2'..='7').contains(&p));
            if c.is_ascii_uppercase() && after_digit {
                normalized.push('-');
            }
            normalized.push(if c == '_' { '-' } else { c.to_ascii_lowercase() });
            prev = Some(c);
        }
        let (time, origin) = match normalized.split_once('-') {
            Some((time, origin)) => (time, origin),
            None => (normalized.as_str(), "a"),
        };
        let time = base32_decode(time).ok_or_else(|| malformed(text, "bad time part"))?;
        let origin = base32_decode(origin).ok_or_else(|| malformed(text, "bad origin part"))?;
        Ok(Self::from_parts(
            kind,
            Stamp::new((time >> 15) as u32, (time & 0x7fff) as u16),
            Origin::new((origin >> 15) as u32, (origin & 0x7fff) as u16),
        ))
    }

    /// Accept either encoding; anything that is not a valid fixed token is
    /// read as compact text of `default_kind`.
    pub fn parse_any(default_kind: Kind, text: &str) -> Result<Self> {
        if text.chars().count() == FIXED_LEN {
            if let Ok(id) = Self::parse_fixed(text) {
                return Ok(id);
            }
        }
        Self::parse_compact(default_kind, text)
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.kind, self.stamp, self.origin).cmp(&(other.kind, other.stamp, other.origin))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_fixed_string())
    }
}

impl FromStr for Identifier {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_fixed(s)
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_fixed_string())
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse_fixed(&text).map_err(serde::de::Error::custom)
    }
}

fn malformed(text: &str, reason: &str) -> SyncError {
    SyncError::MalformedId(format!("{text:?}: {reason}"))
}

/// Decode six fixed-form digit characters. `None` if any is out of range.
pub(crate) fn decode_digits(body: &[char]) -> Option<[u32; 6]> {
    if body.len() != 6 {
        return None;
    }
    let mut digits = [0u32; 6];
    for (slot, c) in digits.iter_mut().zip(body) {
        *slot = decode_digit(*c)?;
    }
    Some(digits)
}

/// Value of one fixed-form digit character.
pub(crate) fn decode_digit(c: char) -> Option<u32> {
    let code = c as u32;
    if (DIGIT_BASE..=DIGIT_BASE + DIGIT_MASK).contains(&code) {
        Some(code - DIGIT_BASE)
    } else {
        None
    }
}

pub(crate) fn digit_char(value: u32) -> char {
    char::from_u32(DIGIT_BASE + (value & DIGIT_MASK)).unwrap_or('0')
}

pub(crate) fn push_time_chars(stamp: Stamp, out: &mut String) {
    out.push(digit_char(stamp.timestamp >> 15));
    out.push(digit_char(stamp.timestamp));
    out.push(digit_char(u32::from(stamp.sequence)));
}

pub(crate) fn push_origin_chars(origin: Origin, out: &mut String) {
    out.push(digit_char(origin.primary >> 15));
    out.push(digit_char(origin.primary));
    out.push(digit_char(u32::from(origin.sub)));
}

fn pack(high: u32, low: u16) -> u64 {
    (u64::from(high) << 15) | u64::from(low)
}

fn base32_encode(mut value: u64) -> String {
    if value == 0 {
        return "a".to_string();
    }
    let mut digits = Vec::with_capacity(MAX_COMPACT_DIGITS);
    while value > 0 {
        digits.push(BASE32[(value & 31) as usize]);
        value >>= 5;
    }
    digits.iter().rev().map(|&b| b as char).collect()
}

fn base32_decode(text: &str) -> Option<u64> {
    if text.is_empty() || text.len() > MAX_COMPACT_DIGITS {
        return None;
    }
    text.bytes().try_fold(0u64, |acc, b| {
        let digit = BASE32.iter().position(|&d| d == b)?;
        Some((acc << 5) | digit as u64)
    })
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Identifier {
        Identifier::new(Kind::Version, 0x1234_5678 & MAX_TIMESTAMP, 42, 0x0abc_def0, 7)
    }

    #[test]
    fn test_fixed_round_trip() {
        let id = sample();
        let text = id.to_fixed_string();
        assert_eq!(text.chars().count(), FIXED_LEN);
        assert!(text.starts_with('!'));
        let parsed = Identifier::parse_fixed(&text).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.to_fixed_string(), text);
    }

    #[test]
    fn test_zero_base_marker() {
        assert_eq!(Identifier::zero(Kind::Base).to_fixed_string(), "$000000");
        assert_eq!(Identifier::parse_fixed("$000000").unwrap(), Identifier::zero(Kind::Base));
    }

    #[test]
    fn test_parse_fixed_rejects_bad_input() {
        assert!(matches!(Identifier::parse_fixed("!00000"), Err(SyncError::MalformedId(_))));
        assert!(matches!(Identifier::parse_fixed("!0000000"), Err(SyncError::MalformedId(_))));
        assert!(matches!(Identifier::parse_fixed("x000000"), Err(SyncError::MalformedId(_))));
        // '/' is below the digit range
        assert!(matches!(Identifier::parse_fixed("!00/000"), Err(SyncError::MalformedId(_))));
    }

    #[test]
    fn test_order_matches_fixed_string_order() {
        let ids = [
            Identifier::new(Kind::Version, 100, 0, 5, 0),
            Identifier::new(Kind::Version, 100, 1, 1, 0),
            Identifier::new(Kind::Version, 100, 1, 2, 0),
            Identifier::new(Kind::Version, 1 << 16, 0, 0, 0),
            Identifier::new(Kind::Field, 0, 0, 0, 0),
        ];
        for a in &ids {
            for b in &ids {
                assert_eq!(a.cmp(b), a.to_fixed_string().cmp(&b.to_fixed_string()), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn test_compact_type_and_field_names() {
        let mice = Identifier::parse_compact(Kind::Type, "Mice").unwrap();
        assert_eq!(mice.origin(), Origin::default());
        assert_eq!(mice.to_compact_string(), "Mice");

        let x = Identifier::parse_compact(Kind::Field, "x").unwrap();
        assert_eq!(x.to_compact_string(), "x");

        let typed = Identifier::parse_compact(Kind::Type, "MiceBob").unwrap();
        assert_eq!(typed.origin(), Identifier::parse_compact(Kind::Type, "a-bob").unwrap().origin());
        assert_eq!(typed.to_compact_string(), "MiceBob");

        // single-letter time part followed by an origin
        let short = Identifier::new(Kind::Type, 0, 0, 0, 9);
        let text = short.to_compact_string();
        assert_eq!(Identifier::parse_compact(Kind::Type, &text).unwrap(), short);

        // an origin starting with a digit has no upper case form
        let digit_origin = Identifier::new(Kind::Field, 0, 23, 0, 26);
        assert_eq!(digit_origin.to_compact_string(), "x_2");
        assert_eq!(Identifier::parse_compact(Kind::Field, "x_2").unwrap(), digit_origin);
    }

    #[test]
    fn test_compact_round_trip_keeps_numeric_triple() {
        let id = sample();
        let compact = id.to_compact_string();
        assert!(compact.contains('_'));
        let back = Identifier::parse_compact(Kind::Version, &compact).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_compact_separators_are_equivalent() {
        let dash = Identifier::parse_compact(Kind::Version, "abc-xyz").unwrap();
        let underscore = Identifier::parse_compact(Kind::Version, "abc_xyz").unwrap();
        let camel = Identifier::parse_compact(Kind::Version, "abcXyz").unwrap();
        assert_eq!(dash, underscore);
        assert_eq!(dash, camel);
    }

    #[test]
    fn test_compact_rejects_garbage() {
        assert!(Identifier::parse_compact(Kind::Field, "").is_err());
        assert!(Identifier::parse_compact(Kind::Field, "no1").is_err());
        assert!(Identifier::parse_compact(Kind::Field, "abcdefghij").is_err());
        assert!(Identifier::parse_compact(Kind::Field, "ab-").is_err());
    }

    #[test]
    fn test_parse_any_prefers_fixed() {
        let id = sample();
        assert_eq!(Identifier::parse_any(Kind::Field, &id.to_fixed_string()).unwrap(), id);
        assert_eq!(
            Identifier::parse_any(Kind::Field, "x").unwrap(),
            Identifier::parse_compact(Kind::Field, "x").unwrap()
        );
    }

    #[test]
    fn test_ring_hash() {
        let id = Identifier::new(Kind::Peer, 0, 0, 0b1010, 0b0110);
        assert_eq!(id.ring_hash(), 0b1100);
    }
}
