//! AEAD sealing of serialized envelopes.
//!
//! The transport client seals every frame with a key derived from the
//! current session secret (the PSK-derived interim secret before
//! authentication, the PAKE-derived secret after). The handshake component
//! never touches this layer; it only produces the secret.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

const NONCE_LEN: usize = 12;
const KEY_INFO: &[u8] = b"waypost envelope seal v1";

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (wrong secret or tampered frame)")]
    Decrypt,
    #[error("malformed field: {0}")]
    Malformed(&'static str),
}

/// A sealed frame body. Both fields are base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedBox {
    pub nonce: String,
    pub ciphertext: String,
}

fn derive_key(secret: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, secret);
    let mut key = [0u8; 32];
    // Expanding 32 bytes from SHA-256 output cannot fail.
    hk.expand(KEY_INFO, &mut key)
        .unwrap_or_else(|_| unreachable!("32-byte HKDF expand"));
    key
}

/// Seal `plain` under a key derived from `secret`, with a fresh random nonce.
pub fn seal(
    plain: &[u8],
    secret: &[u8],
    rng: &mut impl rand::RngCore,
) -> Result<SealedBox, SealError> {
    let key = derive_key(secret);
    let cipher = Aes256Gcm::new((&key).into());

    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plain)
        .map_err(|_| SealError::Encrypt)?;

    Ok(SealedBox {
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    })
}

/// Open a sealed frame body with the same secret used to seal it.
pub fn open(sealed: &SealedBox, secret: &[u8]) -> Result<Vec<u8>, SealError> {
    let nonce = BASE64
        .decode(&sealed.nonce)
        .map_err(|_| SealError::Malformed("nonce"))?;
    if nonce.len() != NONCE_LEN {
        return Err(SealError::Malformed("nonce"));
    }
    let ciphertext = BASE64
        .decode(&sealed.ciphertext)
        .map_err(|_| SealError::Malformed("ciphertext"))?;

    let key = derive_key(secret);
    let cipher = Aes256Gcm::new((&key).into());
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| SealError::Decrypt)
}
