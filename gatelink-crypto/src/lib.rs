//! Gatelink cryptographic operations
//!
//! Thin wrappers over RustCrypto primitives in the shapes the mutual
//! authentication protocol needs:
//!
//! - [`IdentityKeys`]: long-lived P-256 signing identity (ECDSA/SHA-256, DER signatures)
//! - [`EcdhKeyPair`]: per-attempt ephemeral key agreement
//! - [`cipher`]: AES-CFB8 with the protocol's fixed IV
//! - [`cert`]: single pinned-root X.509 verification
//! - [`wire`]: the stripped key/signature encodings used on the link

pub mod cert;
pub mod cipher;
mod ecdh;
mod identity;
pub mod wire;

pub use cert::{Certificate, verify_certificate_chain};
pub use cipher::{SESSION_IV, aes_cfb8_decrypt, aes_cfb8_encrypt};
pub use ecdh::{EcdhKeyPair, SharedSecret};
pub use identity::{IdentityKeys, PeerKey, verify};

use sha2::{Digest, Sha256};

/// Result type alias for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Cryptographic operation errors.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("malformed signature: {0}")]
    InvalidSignature(String),

    #[error("invalid cipher key length: {0}")]
    InvalidKeyLength(usize),

    #[error("certificate error: {0}")]
    Certificate(#[from] CertVerificationError),
}

/// Why a peer certificate was not accepted
#[derive(Debug, thiserror::Error)]
pub enum CertVerificationError {
    #[error("certificate does not parse: {0}")]
    Parse(String),

    #[error("certificate was not issued by the pinned root")]
    IssuerMismatch,

    #[error("unsupported signature algorithm {0}")]
    UnsupportedAlgorithm(String),

    #[error("certificate signature does not verify")]
    BadSignature,

    #[error("certificate key is not a P-256 point")]
    UnsupportedKey,
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}
