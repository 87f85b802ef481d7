//! Convergent records
//!
//! Versioned key/value records, the version vectors that summarise what a
//! replica has seen, and the registry peers use to create records on demand.

mod record;
mod registry;
mod value;
mod version_vector;

pub use record::ReplicatedRecord;
pub use registry::{RecordType, TypeRegistry};
pub use value::{Diff, FieldMap, Payload, Value};
pub use version_vector::VersionVector;
