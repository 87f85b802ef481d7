//! Identifiers: encoding, minting and compressed sequences

mod clock;
mod identifier;
mod sequence;

pub use clock::{Clock, IdMinter, ManualClock, SystemClock};
pub use identifier::{
    Identifier, Kind, Origin, Stamp, EPOCH, FIXED_LEN, MAX_ORIGIN, MAX_SEQUENCE, MAX_TIMESTAMP,
};
pub use sequence::IdSequence;

pub(crate) use identifier::{decode_digits, push_origin_chars, push_time_chars};
