//! Chunked transfer over a low-MTU link
//!
//! Outbound buffers are cut into fixed-size chunks, one per characteristic
//! write. Inbound reads are accumulated in a [`ReassemblyBuffer`] until the
//! logical payload is complete.

use crate::ProtocolError;

/// Chunk size used for handshake parameter transfer
pub const HANDSHAKE_CHUNK_SIZE: usize = 20;

/// ATT header bytes subtracted from the MTU for application payloads
pub const ATT_OVERHEAD: usize = 3;

/// Smallest ATT MTU a BLE link can have
pub const MIN_MTU: usize = 23;

/// Usable payload per write for a negotiated MTU
pub fn max_payload(mtu: usize) -> usize {
    mtu.saturating_sub(ATT_OVERHEAD)
}

/// Split `data` into ordered chunks of at most `chunk_size` bytes.
///
/// Each call returns a fresh iterator. A zero chunk size is treated as 1.
pub fn split(data: &[u8], chunk_size: usize) -> std::slice::Chunks<'_, u8> {
    data.chunks(chunk_size.max(1))
}

/// Outcome of feeding one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyState {
    NeedMore,
    Complete(Vec<u8>),
}

/// How a buffer decides that the logical payload is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// First chunk starts with the BE u16 frame length (which counts itself).
    /// The completed payload excludes the length field but keeps the CRC.
    LengthPrefixed,
    /// Any chunk shorter than `max_chunk` ends the transfer, and so does an
    /// empty one.
    ShortChunk { max_chunk: usize },
}

/// Per-channel accumulator for one logical read sequence
#[derive(Debug, Clone)]
pub struct ReassemblyBuffer {
    completion: Completion,
    active: bool,
    expected_total_len: Option<usize>,
    accumulated: Vec<u8>,
}

impl ReassemblyBuffer {
    pub fn length_prefixed() -> Self {
        Self::new(Completion::LengthPrefixed)
    }

    pub fn short_chunk(max_chunk: usize) -> Self {
        Self::new(Completion::ShortChunk { max_chunk })
    }

    fn new(completion: Completion) -> Self {
        Self {
            completion,
            active: false,
            expected_total_len: None,
            accumulated: Vec::new(),
        }
    }

    /// Start a new read sequence, discarding anything left over.
    pub fn begin(&mut self) {
        self.reset();
        self.active = true;
    }

    /// Return to the idle, unknown-length state.
    pub fn reset(&mut self) {
        self.active = false;
        self.expected_total_len = None;
        self.accumulated.clear();
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Adjust the short-chunk threshold, e.g. after an MTU change.
    pub fn set_max_chunk(&mut self, max_chunk: usize) {
        if let Completion::ShortChunk { .. } = self.completion {
            self.completion = Completion::ShortChunk { max_chunk };
        }
    }

    pub fn expected_total_len(&self) -> Option<usize> {
        self.expected_total_len
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<ReassemblyState, ProtocolError> {
        if !self.active {
            return Err(ProtocolError::NoActiveRead);
        }

        match self.completion {
            Completion::LengthPrefixed => self.feed_length_prefixed(chunk),
            Completion::ShortChunk { max_chunk } => {
                self.accumulated.extend_from_slice(chunk);
                if chunk.is_empty() || chunk.len() < max_chunk {
                    Ok(self.finish(None))
                } else {
                    Ok(ReassemblyState::NeedMore)
                }
            }
        }
    }

    fn feed_length_prefixed(&mut self, chunk: &[u8]) -> Result<ReassemblyState, ProtocolError> {
        self.accumulated.extend_from_slice(chunk);

        let total = match self.expected_total_len {
            Some(total) => total,
            None => {
                // the prefix may straddle chunks when chunks are tiny
                if self.accumulated.len() < 2 {
                    return Ok(ReassemblyState::NeedMore);
                }
                let total = u16::from_be_bytes([self.accumulated[0], self.accumulated[1]]) as usize;
                if total < 4 {
                    self.reset();
                    return Err(ProtocolError::BadLength(total));
                }
                self.accumulated.drain(..2);
                self.expected_total_len = Some(total);
                total
            }
        };

        let remaining = total - 2;
        if self.accumulated.len() >= remaining {
            Ok(self.finish(Some(remaining)))
        } else {
            Ok(ReassemblyState::NeedMore)
        }
    }

    fn finish(&mut self, keep: Option<usize>) -> ReassemblyState {
        let mut payload = std::mem::take(&mut self.accumulated);
        if let Some(keep) = keep {
            payload.truncate(keep);
        }
        self.reset();
        ReassemblyState::Complete(payload)
    }
}
