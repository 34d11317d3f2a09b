//! Length-prefixed, CRC16-checked frames
//!
//! Every handshake parameter travels as:
//!
//! ```text
//! [2-byte BE length][N-byte payload][2-byte BE CRC16]
//! ```
//!
//! `length = N + 4` (it counts itself and the CRC). The CRC is CRC16/X-25
//! computed over the payload only, with its two bytes swapped before they are
//! written big-endian, so `"123456789"` (X-25 value `0x906E`) carries the
//! trailer bytes `6E 90`.

use crate::FrameError;

/// Length prefix + CRC trailer
pub const FRAME_OVERHEAD: usize = 4;

/// Largest payload whose frame length still fits the u16 prefix
pub const MAX_PAYLOAD: usize = u16::MAX as usize - FRAME_OVERHEAD;

/// CRC16/X-25: reflected poly 0x8408, seed 0xFFFF, final complement
pub fn crc16_x25(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        let mut b = byte;
        for _ in 0..8 {
            if (crc ^ b as u16) & 1 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
            b >>= 1;
        }
    }
    !crc
}

/// The CRC value as it appears in the frame trailer (byte-swapped X-25)
pub fn wire_crc(payload: &[u8]) -> u16 {
    crc16_x25(payload).swap_bytes()
}

/// A single handshake frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub length: u16,
    pub payload: Vec<u8>,
    pub crc: u16,
}

impl Frame {
    pub fn new(payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::TooLong(payload.len()));
        }
        Ok(Self {
            length: (payload.len() + FRAME_OVERHEAD) as u16,
            crc: wire_crc(&payload),
            payload,
        })
    }

    /// Whether the carried CRC matches one recomputed over the payload
    pub fn crc_ok(&self) -> bool {
        wire_crc(&self.payload) == self.crc
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload.len() + FRAME_OVERHEAD);
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.crc.to_be_bytes());
        buf
    }

    /// Parse a complete frame. A CRC mismatch is not an error here, check `crc_ok()`.
    ///
    /// Bytes beyond the declared length are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < FRAME_OVERHEAD {
            return Err(FrameError::TooShort(data.len()));
        }
        let length = u16::from_be_bytes([data[0], data[1]]);
        let declared = length as usize;
        if declared < FRAME_OVERHEAD || declared > data.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: data.len(),
            });
        }
        let (payload, crc) = split_trailer(&data[2..declared])?;
        Ok(Self {
            length,
            payload: payload.to_vec(),
            crc,
        })
    }
}

/// Payload + CRC as produced by reassembly (length prefix already consumed)
pub fn decode_body(body: &[u8]) -> Result<Decoded, FrameError> {
    let (payload, crc) = split_trailer(body)?;
    Ok(Decoded {
        crc_ok: wire_crc(payload) == crc,
        payload: payload.to_vec(),
    })
}

/// Result of decoding a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub payload: Vec<u8>,
    pub crc_ok: bool,
}

impl Decoded {
    /// The payload, or `CrcMismatch` if the trailer did not match
    pub fn verified(self) -> Result<Vec<u8>, FrameError> {
        if self.crc_ok {
            Ok(self.payload)
        } else {
            Err(FrameError::CrcMismatch)
        }
    }
}

/// Frame a payload for transmission
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    Ok(Frame::new(payload.to_vec())?.to_bytes())
}

/// Parse a complete frame into its payload and CRC verdict
pub fn decode(data: &[u8]) -> Result<Decoded, FrameError> {
    let frame = Frame::from_bytes(data)?;
    Ok(Decoded {
        crc_ok: frame.crc_ok(),
        payload: frame.payload,
    })
}

fn split_trailer(body: &[u8]) -> Result<(&[u8], u16), FrameError> {
    if body.len() < 2 {
        return Err(FrameError::TooShort(body.len()));
    }
    let (payload, trailer) = body.split_at(body.len() - 2);
    Ok((payload, u16::from_be_bytes([trailer[0], trailer[1]])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_value() {
        assert_eq!(crc16_x25(b"123456789"), 0x906E);
        assert_eq!(wire_crc(b"123456789"), 0x6E90);
        assert_eq!(crc16_x25(&[]), 0x0000);
    }

    #[test]
    fn three_byte_frame() {
        let bytes = encode(&[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(bytes, vec![0x00, 0x07, 0x01, 0x02, 0x03, 0x3B, 0x9D]);

        let decoded = decode(&bytes).unwrap();
        assert!(decoded.crc_ok);
        assert_eq!(decoded.payload, vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn empty_payload() {
        let bytes = encode(&[]).unwrap();
        assert_eq!(bytes, vec![0x00, 0x04, 0x00, 0x00]);
        let decoded = decode(&bytes).unwrap();
        assert!(decoded.crc_ok);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn any_single_bit_flip_is_detected() {
        let payload: Vec<u8> = (0u8..37).map(|i| i.wrapping_mul(29)).collect();
        let bytes = encode(&payload).unwrap();

        // payload and CRC region; the length prefix is structural
        for byte in 2..bytes.len() {
            for bit in 0..8 {
                let mut corrupted = bytes.clone();
                corrupted[byte] ^= 1 << bit;
                let decoded = decode(&corrupted).unwrap();
                assert!(!decoded.crc_ok, "flip at byte {byte} bit {bit} went unnoticed");
            }
        }
    }

    #[test]
    fn body_decode_matches_full_decode() {
        let bytes = encode(b"certificate").unwrap();
        let body = decode_body(&bytes[2..]).unwrap();
        assert_eq!(body, decode(&bytes).unwrap());
        assert_eq!(body.verified().unwrap(), b"certificate".to_vec());
    }

    #[test]
    fn mismatch_surfaces_as_error() {
        let mut bytes = encode(b"nonce").unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            decode(&bytes).unwrap().verified(),
            Err(FrameError::CrcMismatch)
        ));
    }

    #[test]
    fn malformed_input() {
        assert!(matches!(decode(&[0x00]), Err(FrameError::TooShort(1))));
        assert!(matches!(
            decode(&[0x00, 0x09, 0x01, 0x02, 0x03]),
            Err(FrameError::LengthMismatch { declared: 9, actual: 5 })
        ));
        assert!(matches!(
            Frame::new(vec![0; MAX_PAYLOAD + 1]),
            Err(FrameError::TooLong(_))
        ));
    }
}
