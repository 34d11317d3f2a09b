//! Key and signature encodings as they travel over the link
//!
//! The edge firmware exchanges P-256 public keys as the bare uncompressed
//! point (the SPKI DER with its fixed 26-byte prefix removed) and ECDSA
//! signatures as DER with the outer `SEQUENCE` tag and length removed.

use crate::{CryptoError, Result};

/// DER prefix of a P-256 `SubjectPublicKeyInfo` up to the point bytes
pub const P256_SPKI_HEADER: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08,
    0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];

pub const POINT_LEN: usize = 65;

/// Accept `04 || X || Y`, a raw 64-byte `X || Y`, or a full SPKI DER.
pub fn normalize_point(bytes: &[u8]) -> Result<[u8; POINT_LEN]> {
    let point = match bytes.len() {
        91 if bytes.starts_with(&P256_SPKI_HEADER) => &bytes[P256_SPKI_HEADER.len()..],
        _ => bytes,
    };

    let mut out = [0u8; POINT_LEN];
    match point.len() {
        POINT_LEN if point[0] == 0x04 => out.copy_from_slice(point),
        64 => {
            out[0] = 0x04;
            out[1..].copy_from_slice(point);
        }
        n => {
            return Err(CryptoError::InvalidPublicKey(format!(
                "expected a 64 or 65 byte P-256 point, got {n} bytes"
            )));
        }
    }
    Ok(out)
}

/// SPKI DER for an uncompressed point
pub fn attach_spki_header(point: &[u8; POINT_LEN]) -> Vec<u8> {
    let mut der = Vec::with_capacity(P256_SPKI_HEADER.len() + POINT_LEN);
    der.extend_from_slice(&P256_SPKI_HEADER);
    der.extend_from_slice(point);
    der
}

/// Drop the leading `30 <len>` of a DER signature
pub fn strip_signature_header(der: &[u8]) -> Result<&[u8]> {
    match der {
        [0x30, len, body @ ..] if *len < 0x80 && *len as usize == body.len() => Ok(body),
        _ => Err(CryptoError::InvalidSignature(
            "not a short-form DER SEQUENCE".into(),
        )),
    }
}

/// Rebuild `30 <len> || body` from a stripped signature
pub fn attach_signature_header(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() >= 0x80 {
        return Err(CryptoError::InvalidSignature(format!(
            "signature body of {} bytes needs long-form length",
            body.len()
        )));
    }
    let mut der = Vec::with_capacity(body.len() + 2);
    der.push(0x30);
    der.push(body.len() as u8);
    der.extend_from_slice(body);
    Ok(der)
}
