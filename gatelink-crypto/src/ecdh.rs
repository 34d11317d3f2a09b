//! Ephemeral P-256 key agreement, one key pair per handshake attempt

use p256::ecdh::diffie_hellman;
use p256::{PublicKey, SecretKey};
use zeroize::Zeroizing;

use crate::identity::uncompressed;
use crate::wire::{self, POINT_LEN};
use crate::{CryptoError, Result};

/// Raw ECDH output (x-coordinate), zeroed when dropped
pub type SharedSecret = Zeroizing<[u8; 32]>;

pub struct EcdhKeyPair {
    secret_key: SecretKey,
    public_key: [u8; POINT_LEN],
}

impl EcdhKeyPair {
    pub fn generate() -> Self {
        let secret_key = SecretKey::random(&mut rand::rngs::OsRng);
        let public_key = uncompressed(&secret_key.public_key());
        Self {
            secret_key,
            public_key,
        }
    }

    /// Uncompressed public point, `04 || X || Y`
    pub fn public_key(&self) -> &[u8; POINT_LEN] {
        &self.public_key
    }

    /// Agree on a secret with the peer's point (64 or 65 bytes).
    pub fn agree(&self, peer_public: &[u8]) -> Result<SharedSecret> {
        let point = wire::normalize_point(peer_public)?;
        let peer = PublicKey::from_sec1_bytes(&point)
            .map_err(|_| CryptoError::InvalidPublicKey("ECDH point is not on P-256".into()))?;

        let shared = diffie_hellman(self.secret_key.to_nonzero_scalar(), peer.as_affine());
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }
}

impl std::fmt::Debug for EcdhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdhKeyPair").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree() {
        let gateway = EcdhKeyPair::generate();
        let edge = EcdhKeyPair::generate();

        let a = gateway.agree(edge.public_key()).unwrap();
        let b = edge.agree(&gateway.public_key()[1..]).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn fresh_pairs_differ() {
        assert_ne!(
            EcdhKeyPair::generate().public_key(),
            EcdhKeyPair::generate().public_key()
        );
    }

    #[test]
    fn off_curve_point_rejected() {
        let keys = EcdhKeyPair::generate();
        let mut bogus = [0x01u8; POINT_LEN];
        bogus[0] = 0x04;
        assert!(matches!(keys.agree(&bogus), Err(CryptoError::InvalidPublicKey(_))));
    }
}
