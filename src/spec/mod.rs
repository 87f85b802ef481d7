//! Specifier assembly and parsing

mod pairs;
mod specifier;

pub use pairs::{extract_pair, max_versions_per_origin, replace_pair};
pub use specifier::Specifier;
