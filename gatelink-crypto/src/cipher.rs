//! AES-CFB8 stream encryption for the post-handshake session
//!
//! No padding; ciphertext length equals plaintext length. The key length
//! picks AES-128, AES-192 or AES-256.

use aes::{Aes128, Aes192, Aes256};
use cfb8::cipher::{AsyncStreamCipher, KeyIvInit};

use crate::{CryptoError, Result};

/// Fixed IV used by the edge firmware (ASCII `einfochips_arrow`)
pub const SESSION_IV: [u8; 16] = *b"einfochips_arrow";

pub fn aes_cfb8_encrypt(data: &[u8], key: &[u8], iv: &[u8; 16]) -> Result<Vec<u8>> {
    let mut buf = data.to_vec();
    let bad_len = |_| CryptoError::InvalidKeyLength(key.len());
    match key.len() {
        16 => cfb8::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(bad_len)?
            .encrypt(&mut buf),
        24 => cfb8::Encryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(bad_len)?
            .encrypt(&mut buf),
        32 => cfb8::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(bad_len)?
            .encrypt(&mut buf),
        n => return Err(CryptoError::InvalidKeyLength(n)),
    }
    Ok(buf)
}

pub fn aes_cfb8_decrypt(data: &[u8], key: &[u8], iv: &[u8; 16]) -> Result<Vec<u8>> {
    let mut buf = data.to_vec();
    let bad_len = |_| CryptoError::InvalidKeyLength(key.len());
    match key.len() {
        16 => cfb8::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(bad_len)?
            .decrypt(&mut buf),
        24 => cfb8::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(bad_len)?
            .decrypt(&mut buf),
        32 => cfb8::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(bad_len)?
            .decrypt(&mut buf),
        n => return Err(CryptoError::InvalidKeyLength(n)),
    }
    Ok(buf)
}
