//! Gatelink wire protocol - framing, chunking and GATT constants
//!
//! Nothing in here touches a radio. The gateway crate drives these types
//! from link events.

pub mod chunk;
pub mod frame;
pub mod gatt;

pub use chunk::{ReassemblyBuffer, ReassemblyState, HANDSHAKE_CHUNK_SIZE, MIN_MTU, max_payload, split};
pub use frame::{Decoded, Frame, decode, decode_body, encode};

/// Malformed or corrupted frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("frame declares {declared} bytes but {actual} arrived")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("payload of {0} bytes does not fit a frame")]
    TooLong(usize),
    #[error("frame CRC mismatch")]
    CrcMismatch,
}

/// Chunk that does not belong to any read sequence
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("chunk arrived with no active read")]
    NoActiveRead,
    #[error("frame length prefix {0} is smaller than the frame overhead")]
    BadLength(usize),
}
