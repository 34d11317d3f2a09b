//! X.509 checks against a single pinned root
//!
//! Only what the handshake needs: the leaf must name the root as issuer and
//! carry an ecdsa-with-SHA256 signature that verifies under the root's key.
//! Validity dates and extensions are not evaluated.

use std::str::FromStr;
use std::time::Duration;

use p256::pkcs8::EncodePublicKey;
use x509_cert::certificate::{TbsCertificate, Version};
use x509_cert::der::asn1::BitString;
use x509_cert::der::oid::ObjectIdentifier;
use x509_cert::der::{Decode, DecodePem, Encode};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::time::Validity;

pub use x509_cert::Certificate;

use crate::identity::{IdentityKeys, PeerKey};
use crate::{CertVerificationError, CryptoError, Result};

pub const ECDSA_WITH_SHA256: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");

/// Parse DER, or PEM when the bytes look like it
pub fn parse(bytes: &[u8]) -> std::result::Result<Certificate, CertVerificationError> {
    let parsed = if bytes.starts_with(b"-----BEGIN") {
        Certificate::from_pem(bytes)
    } else {
        Certificate::from_der(bytes)
    };
    parsed.map_err(|e| CertVerificationError::Parse(e.to_string()))
}

pub fn to_der(cert: &Certificate) -> Result<Vec<u8>> {
    cert.to_der()
        .map_err(|e| CertVerificationError::Parse(e.to_string()).into())
}

/// The subject's P-256 key
pub fn public_key(cert: &Certificate) -> std::result::Result<PeerKey, CertVerificationError> {
    let spki = &cert.tbs_certificate.subject_public_key_info;
    PeerKey::from_bytes(spki.subject_public_key.raw_bytes())
        .map_err(|_| CertVerificationError::UnsupportedKey)
}

/// Check that `leaf` was signed by `root`
pub fn verify_issued_by(
    leaf: &Certificate,
    root: &Certificate,
) -> std::result::Result<(), CertVerificationError> {
    if leaf.tbs_certificate.issuer != root.tbs_certificate.subject {
        return Err(CertVerificationError::IssuerMismatch);
    }
    if leaf.signature_algorithm.oid != ECDSA_WITH_SHA256 {
        return Err(CertVerificationError::UnsupportedAlgorithm(
            leaf.signature_algorithm.oid.to_string(),
        ));
    }

    let root_key = public_key(root)?;
    let tbs = leaf
        .tbs_certificate
        .to_der()
        .map_err(|e| CertVerificationError::Parse(e.to_string()))?;
    let signature = leaf
        .signature
        .as_bytes()
        .ok_or(CertVerificationError::BadSignature)?;

    if root_key.verify(&tbs, signature) {
        Ok(())
    } else {
        Err(CertVerificationError::BadSignature)
    }
}

/// Verify a peer certificate against the pinned root and return its key
pub fn verify_peer(leaf: &[u8], root: &[u8]) -> std::result::Result<PeerKey, CertVerificationError> {
    let leaf = parse(leaf)?;
    let root = parse(root)?;
    verify_issued_by(&leaf, &root)?;
    public_key(&leaf)
}

pub fn verify_certificate_chain(leaf_der: &[u8], root_der: &[u8]) -> bool {
    match verify_peer(leaf_der, root_der) {
        Ok(_) => true,
        Err(e) => {
            log::warn!("certificate rejected: {e}");
            false
        }
    }
}

/// Issue a DER certificate for `subject_point`, signed by `issuer_keys`.
///
/// Self-signed when the subject point is the issuer's own key and names match.
/// Meant for bench provisioning of gateways and test edges.
pub fn issue(
    subject: &str,
    subject_point: &[u8],
    issuer: &str,
    issuer_keys: &IdentityKeys,
    serial: u8,
    valid_for: Duration,
) -> Result<Vec<u8>> {
    let encode_err = |e: x509_cert::der::Error| CertVerificationError::Parse(e.to_string());

    let subject_key = p256::PublicKey::from_sec1_bytes(&crate::wire::normalize_point(subject_point)?)
        .map_err(|_| CryptoError::InvalidPublicKey("subject point is not on P-256".into()))?;
    let spki_der = subject_key
        .to_public_key_der()
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    let subject_public_key_info =
        SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes()).map_err(encode_err)?;

    let algorithm = AlgorithmIdentifierOwned {
        oid: ECDSA_WITH_SHA256,
        parameters: None,
    };
    let name = |cn: &str| {
        Name::from_str(&format!("CN={cn}"))
            .map_err(|e| CertVerificationError::Parse(e.to_string()))
    };

    let tbs_certificate = TbsCertificate {
        version: Version::V3,
        // keep the INTEGER positive and minimally encoded
        serial_number: SerialNumber::new(&[serial & 0x7f]).map_err(encode_err)?,
        signature: algorithm.clone(),
        issuer: name(issuer)?,
        validity: Validity::from_now(valid_for).map_err(encode_err)?,
        subject: name(subject)?,
        subject_public_key_info,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: None,
    };

    let tbs = tbs_certificate.to_der().map_err(encode_err)?;
    let signature = BitString::from_bytes(&issuer_keys.sign(&tbs)?).map_err(encode_err)?;

    let certificate = Certificate {
        tbs_certificate,
        signature_algorithm: algorithm,
        signature,
    };
    Ok(certificate.to_der().map_err(encode_err)?)
}
