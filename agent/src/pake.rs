//! PAKE primitives: an EKE-style password-authenticated key exchange over
//! X25519.
//!
//! Each side's ephemeral public key is XOR-blinded with a pad derived from
//! the pre-shared key, so an observer without the PSK learns nothing usable
//! and neither the PSK nor anything trivially reducible to it ever crosses
//! the wire. Registration derives a long-term `auth_key` from the first
//! exchange; authentication mixes a fresh exchange with that key to produce
//! the per-session secret, confirmed in both directions with HMAC tags over
//! the message transcript.
//!
//! Everything here is pure math over caller-supplied randomness; the message
//! sequencing lives in `handshake`.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

type HmacSha256 = Hmac<Sha256>;

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;

/// Blinding pad labels. Registration and authentication use distinct pads so
/// a transcript from one phase cannot be replayed into the other.
pub const REGISTER_LABEL: &[u8] = b"waypost pake register blind v1";
pub const AUTH_LABEL: &[u8] = b"waypost pake auth blind v1";

/// An ephemeral X25519 key pair. The secret half is consumed by
/// `shared_secret` and never leaves this struct.
pub struct KeyPair {
    secret: StaticSecret,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate(rng: &mut (impl RngCore + CryptoRng)) -> Self {
        let secret = StaticSecret::random_from_rng(&mut *rng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn shared_secret(&self, peer: &PublicKey) -> SharedSecret {
        self.secret.diffie_hellman(peer)
    }
}

/// Long-lived state retained by the agent after a successful registration.
/// `auth_key` is derived, never transmitted; the server holds the same value.
#[derive(Clone)]
pub struct RegistrationRecord {
    pub salt: Vec<u8>,
    pub auth_key: [u8; KEY_LEN],
}

/// Interim secret used before any PAKE exchange completes: a digest of the
/// PSK, good enough to bootstrap token signing and first-contact sealing.
pub fn interim_secret(psk: &str) -> Vec<u8> {
    Sha256::digest(psk.as_bytes()).to_vec()
}

/// Derive the XOR pad that blinds public keys in a given phase.
pub fn blinding_pad(psk: &str, aid: &Uuid, label: &[u8]) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(Some(aid.as_bytes()), psk.as_bytes());
    let mut pad = [0u8; KEY_LEN];
    hk.expand(label, &mut pad)
        .unwrap_or_else(|_| unreachable!("32-byte HKDF expand"));
    pad
}

pub fn blind(public: &PublicKey, pad: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let mut out = public.to_bytes();
    for (byte, p) in out.iter_mut().zip(pad) {
        *byte ^= p;
    }
    out
}

pub fn unblind(blinded: &[u8; KEY_LEN], pad: &[u8; KEY_LEN]) -> PublicKey {
    let mut out = *blinded;
    for (byte, p) in out.iter_mut().zip(pad) {
        *byte ^= p;
    }
    PublicKey::from(out)
}

/// Derive the long-term authentication key from the registration exchange.
pub fn derive_auth_key(dh: &SharedSecret, salt: &[u8]) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(Some(salt), dh.as_bytes());
    let mut key = [0u8; KEY_LEN];
    hk.expand(b"waypost registration v1", &mut key)
        .unwrap_or_else(|_| unreachable!("32-byte HKDF expand"));
    key
}

/// Derive the session secret from a fresh exchange plus the retained
/// registration key.
pub fn derive_session_secret(dh: &SharedSecret, auth_key: &[u8; KEY_LEN], salt: &[u8]) -> Vec<u8> {
    let mut ikm = Vec::with_capacity(KEY_LEN * 2);
    ikm.extend_from_slice(dh.as_bytes());
    ikm.extend_from_slice(auth_key);

    let hk = Hkdf::<Sha256>::new(Some(salt), &ikm);
    let mut secret = vec![0u8; KEY_LEN];
    hk.expand(b"waypost session v1", &mut secret)
        .unwrap_or_else(|_| unreachable!("32-byte HKDF expand"));
    secret
}

/// Key-confirmation tag over a transcript, domain-separated per role.
pub fn confirm_tag(key: &[u8], role: &[u8], transcript: &[u8]) -> [u8; KEY_LEN] {
    let mut m = HmacSha256::new_from_slice(key).unwrap_or_else(|_| unreachable!("hmac key length"));
    m.update(role);
    m.update(transcript);
    m.finalize().into_bytes().into()
}

/// Constant-time comparison of a received confirmation tag.
pub fn verify_confirm(key: &[u8], role: &[u8], transcript: &[u8], tag: &[u8]) -> bool {
    let mut m = HmacSha256::new_from_slice(key).unwrap_or_else(|_| unreachable!("hmac key length"));
    m.update(role);
    m.update(transcript);
    m.verify_slice(tag).is_ok()
}

/// Proof that the agent holds the registration state, bound to this
/// authentication attempt's blinded key.
pub fn auth_proof(auth_key: &[u8; KEY_LEN], blinded: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    confirm_tag(auth_key, b"auth init", blinded)
}

pub fn random_salt(rng: &mut (impl RngCore + CryptoRng)) -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rng.fill_bytes(&mut salt);
    salt
}
