use thiserror::Error;

/// Errors raised by the synchronization core.
///
/// Stale writes are deliberately absent: a write that loses the
/// last-writer-wins comparison is logged and dropped, never reported.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Malformed id: {0}")]
    MalformedId(String),

    #[error("Malformed specifier: {0}")]
    MalformedSpecifier(String),

    #[error("Unknown quant: {0:?}")]
    UnknownQuant(char),

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Incomplete specifier: {0}")]
    IncompleteSpecifier(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Peer was already added: {0}")]
    DuplicatePeer(String),

    #[error("Listener not found: {0}")]
    ListenerNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
