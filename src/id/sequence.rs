//! Run-length compressed sequences of identifiers
//!
//! The text form is a list of segments. Each segment opens with a literal
//! anchor, `@` followed by the anchor's fixed form, and may carry one run:
//!
//! - `;` + count: the anchor repeated `count` more times
//! - `'` + count + two characters per member: ids sharing the anchor's kind,
//!   origin and high timestamp digit, written as (low timestamp, sequence)
//!
//! Segments are built greedily left to right, so every list has exactly one
//! encoding.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::identifier::{decode_digit, digit_char, Identifier, Stamp, FIXED_LEN};
use crate::error::{Result, SyncError};

const ANCHOR: char = '@';
const UNIFORM: char = ';';
const PREFIX: char = '\'';

/// Longest run a single count character can express.
const MAX_RUN: usize = 0x7fff;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Run {
    Single,
    Uniform(usize),
    Prefix(Vec<(u16, u16)>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Segment {
    anchor: Identifier,
    run: Run,
}

impl Segment {
    fn new(anchor: Identifier) -> Self {
        Self {
            anchor,
            run: Run::Single,
        }
    }

    fn len(&self) -> usize {
        1 + match &self.run {
            Run::Single => 0,
            Run::Uniform(count) => *count,
            Run::Prefix(members) => members.len(),
        }
    }

    fn get(&self, index: usize) -> Identifier {
        match (&self.run, index) {
            (_, 0) | (Run::Single, _) | (Run::Uniform(_), _) => self.anchor,
            (Run::Prefix(members), i) => {
                let (low, sequence) = members[i - 1];
                let high = self.anchor.timestamp() >> 15;
                Identifier::from_parts(
                    self.anchor.kind(),
                    Stamp::new((high << 15) | u32::from(low), sequence),
                    self.anchor.origin(),
                )
            }
        }
    }

    fn shares_prefix(&self, id: &Identifier) -> bool {
        id.kind() == self.anchor.kind()
            && id.origin() == self.anchor.origin()
            && id.timestamp() >> 15 == self.anchor.timestamp() >> 15
    }

    /// Absorb `id` into this segment's run if the greedy rules allow it.
    fn try_extend(&mut self, id: Identifier) -> bool {
        let shares = self.shares_prefix(&id);
        match &mut self.run {
            Run::Single if id == self.anchor => {
                self.run = Run::Uniform(1);
                true
            }
            Run::Single if shares => {
                self.run = Run::Prefix(vec![low_digits(&id)]);
                true
            }
            Run::Uniform(count) if id == self.anchor && *count < MAX_RUN => {
                *count += 1;
                true
            }
            Run::Prefix(members) if shares && members.len() < MAX_RUN => {
                members.push(low_digits(&id));
                true
            }
            _ => false,
        }
    }

    fn write_to(&self, out: &mut String) {
        out.push(ANCHOR);
        self.anchor.push_fixed(out);
        match &self.run {
            Run::Single => {}
            Run::Uniform(count) => {
                out.push(UNIFORM);
                out.push(digit_char(*count as u32));
            }
            Run::Prefix(members) => {
                out.push(PREFIX);
                out.push(digit_char(members.len() as u32));
                for (low, sequence) in members {
                    out.push(digit_char(u32::from(*low)));
                    out.push(digit_char(u32::from(*sequence)));
                }
            }
        }
    }
}

fn low_digits(id: &Identifier) -> (u16, u16) {
    ((id.timestamp() & 0x7fff) as u16, id.sequence())
}

/// An ordered list of identifiers kept in run-length compressed form.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdSequence {
    segments: Vec<Segment>,
    len: usize,
}

impl IdSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids<I: IntoIterator<Item = Identifier>>(ids: I) -> Self {
        let mut seq = Self::new();
        for id in ids {
            seq.append(id);
        }
        seq
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one id, extending the open run when possible.
    pub fn append(&mut self, id: Identifier) {
        let extended = self
            .segments
            .last_mut()
            .is_some_and(|last| last.try_extend(id));
        if !extended {
            self.segments.push(Segment::new(id));
        }
        self.len += 1;
    }

    pub fn insert(&mut self, position: usize, id: Identifier) {
        self.splice(position, 0, [id]);
    }

    pub fn at(&self, position: usize) -> Option<Identifier> {
        let (index, within) = self.locate(position)?;
        Some(self.segments[index].get(within))
    }

    /// Position of the first occurrence of `id`.
    pub fn find(&self, id: &Identifier) -> Option<usize> {
        self.iter().position(|candidate| candidate == *id)
    }

    pub fn iter(&self) -> impl Iterator<Item = Identifier> + '_ {
        self.segments
            .iter()
            .flat_map(|segment| (0..segment.len()).map(move |i| segment.get(i)))
    }

    /// Remove `delete_count` ids at `offset` and put `inserts` in their place.
    ///
    /// Segments wholly before the edit are kept as they are. The last of them
    /// is reopened so the edited ids can still join its run, and everything
    /// from the edited segment on is recompressed.
    pub fn splice<I>(&mut self, offset: usize, delete_count: usize, inserts: I)
    where
        I: IntoIterator<Item = Identifier>,
    {
        let offset = offset.min(self.len);
        let (split, within) = match self.locate(offset) {
            Some(found) => found,
            None => (self.segments.len(), 0),
        };

        let tail: Vec<Segment> = self.segments.split_off(split);
        self.len = self.segments.iter().map(Segment::len).sum();

        let mut remaining = tail
            .iter()
            .flat_map(|segment| (0..segment.len()).map(move |i| segment.get(i)));
        for id in remaining.by_ref().take(within) {
            self.append(id);
        }
        for id in inserts {
            self.append(id);
        }
        for id in remaining.skip(delete_count) {
            self.append(id);
        }
    }

    /// Parse the text form. The result is re-canonicalised.
    pub fn from_string(text: &str) -> Result<Self> {
        let chars: Vec<char> = text.chars().collect();
        let mut pos = 0;
        let mut seq = Self::new();

        while pos < chars.len() {
            if chars[pos] != ANCHOR {
                return Err(malformed(text, pos, "expected anchor"));
            }
            pos += 1;
            let end = pos + FIXED_LEN;
            if end > chars.len() {
                return Err(malformed(text, pos, "truncated anchor"));
            }
            let anchor_text: String = chars[pos..end].iter().collect();
            let anchor = Identifier::parse_fixed(&anchor_text)?;
            pos = end;
            seq.append(anchor);

            match chars.get(pos) {
                Some(&UNIFORM) => {
                    let count = read_count(text, &chars, pos + 1)?;
                    pos += 2;
                    for _ in 0..count {
                        seq.append(anchor);
                    }
                }
                Some(&PREFIX) => {
                    let count = read_count(text, &chars, pos + 1)?;
                    pos += 2;
                    let end = pos + 2 * count;
                    if end > chars.len() {
                        return Err(malformed(text, pos, "truncated run"));
                    }
                    let high = anchor.timestamp() >> 15;
                    for pair in chars[pos..end].chunks(2) {
                        let low = decode_digit(pair[0]);
                        let sequence = decode_digit(pair[1]);
                        let (Some(low), Some(sequence)) = (low, sequence) else {
                            return Err(malformed(text, pos, "bad run member"));
                        };
                        seq.append(Identifier::from_parts(
                            anchor.kind(),
                            Stamp::new((high << 15) | low, sequence as u16),
                            anchor.origin(),
                        ));
                    }
                    pos = end;
                }
                _ => {}
            }
        }
        Ok(seq)
    }

    /// Segment index and offset inside it for a position; `None` past the end.
    fn locate(&self, position: usize) -> Option<(usize, usize)> {
        let mut start = 0;
        for (index, segment) in self.segments.iter().enumerate() {
            let len = segment.len();
            if position < start + len {
                return Some((index, position - start));
            }
            start += len;
        }
        None
    }
}

fn read_count(text: &str, chars: &[char], pos: usize) -> Result<usize> {
    chars
        .get(pos)
        .and_then(|c| decode_digit(*c))
        .filter(|count| *count > 0)
        .map(|count| count as usize)
        .ok_or_else(|| malformed(text, pos, "bad run count"))
}

fn malformed(text: &str, pos: usize, reason: &str) -> SyncError {
    SyncError::MalformedId(format!("id sequence {text:?} at {pos}: {reason}"))
}

impl fmt::Display for IdSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        for segment in &self.segments {
            segment.write_to(&mut out);
        }
        f.write_str(&out)
    }
}

impl FromStr for IdSequence {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_string(s)
    }
}

impl FromIterator<Identifier> for IdSequence {
    fn from_iter<I: IntoIterator<Item = Identifier>>(iter: I) -> Self {
        Self::from_ids(iter)
    }
}

impl Serialize for IdSequence {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for IdSequence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_string(&text).map_err(serde::de::Error::custom)
    }
}
