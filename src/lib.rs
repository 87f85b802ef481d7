// Swarm Sync - peer-to-peer object synchronization

pub mod config;
pub mod convergent;
pub mod error;
pub mod id;
pub mod router;
pub mod spec;
pub mod topology;
pub mod wire;

pub use config::{PeerConfig, PipePolicy};
pub use convergent::{
    Diff, FieldMap, Payload, RecordType, ReplicatedRecord, TypeRegistry, Value, VersionVector,
};
pub use error::{Result, SyncError};
pub use id::{Clock, IdMinter, IdSequence, Identifier, Kind, ManualClock, Origin, Stamp, SystemClock};
pub use router::{EventRouter, FnListener, Listener, ListenerRef};
pub use spec::Specifier;
pub use topology::{HashRing, Peer};
pub use wire::{connect_peers, Bundle, Codec, LoopbackTransport, Pipe, Transport};
