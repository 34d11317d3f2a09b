use std::path::PathBuf;

use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("transport error: {0}")]
    Transport(#[from] crate::TransportError),

    #[error("crypto error: {0}")]
    Crypto(#[from] gatelink_crypto::CryptoError),

    #[error("frame error: {0}")]
    Frame(#[from] gatelink_proto::FrameError),

    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("bad config {path}: {source}")]
    Config {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("no home directory, set GATELINK_HOME")]
    NoHome,
}

/// Failure reported by (or detected at) the BLE link for a single command
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("operation on {0} rejected by the stack: {1}")]
    Rejected(Uuid, String),

    #[error("link is not connected")]
    Disconnected,

    #[error("operation on {0} timed out")]
    Timeout(Uuid),
}
