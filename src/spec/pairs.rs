//! Token-level helpers that work on specifier text without building a
//! [`Specifier`](super::Specifier).

use crate::convergent::VersionVector;
use crate::id::{decode_digits, Identifier, Kind, FIXED_LEN};

/// Split text into 7-character tokens. A short tail comes out as a short token.
fn tokens(text: &str) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let end = rest
            .char_indices()
            .nth(FIXED_LEN)
            .map_or(rest.len(), |(i, _)| i);
        let (token, tail) = rest.split_at(end);
        rest = tail;
        Some(token)
    })
}

/// Value token stored for `key` in a key→value token-pair mapping.
///
/// Pairs sit at even token positions; a key token appearing in a value
/// position does not match.
pub fn extract_pair<'a>(text: &'a str, key: &Identifier) -> Option<&'a str> {
    let key = key.to_fixed_string();
    let all: Vec<&str> = tokens(text).collect();
    all.chunks(2)
        .find(|pair| pair.len() == 2 && pair[0] == key)
        .map(|pair| pair[1])
}

/// Set the value token for `key`, appending the pair when the key is absent.
pub fn replace_pair(text: &str, key: &Identifier, value: &Identifier) -> String {
    let key = key.to_fixed_string();
    let value = value.to_fixed_string();
    let all: Vec<&str> = tokens(text).collect();

    let mut out = String::with_capacity(text.len() + key.len() + value.len());
    let mut replaced = false;
    for pair in all.chunks(2) {
        out.push_str(pair[0]);
        match pair.get(1) {
            Some(_) if pair[0] == key && !replaced => {
                out.push_str(&value);
                replaced = true;
            }
            Some(old) => out.push_str(old),
            None => {}
        }
    }
    if !replaced {
        out.push_str(&key);
        out.push_str(&value);
    }
    out
}

/// Newest time part per origin across every fixed token in `text`,
/// rendered as a base (`$` tokens ordered by origin, empty when none).
///
/// Tokens that do not decode are skipped; with `kind` set, so are tokens of
/// other kinds.
pub fn max_versions_per_origin(text: &str, kind: Option<Kind>) -> String {
    let mut vv = VersionVector::new();
    for token in tokens(text) {
        let chars: Vec<char> = token.chars().collect();
        if chars.len() != FIXED_LEN {
            continue;
        }
        let Some(token_kind) = Kind::from_symbol(chars[0]) else {
            continue;
        };
        if kind.is_some_and(|k| k != token_kind) {
            continue;
        }
        if let Some(digits) = decode_digits(&chars[1..]) {
            vv.observe(&Identifier::from_digits(token_kind, digits));
        }
    }
    vv.to_string()
}
