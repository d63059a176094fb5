//! Self-issued bearer tokens.
//!
//! The agent mints its own time-bounded token and presents it to the
//! transport layer on every request, starting with the very first
//! registration message. The signing key is derived from the pre-shared key,
//! so the server can validate the token before any session exists.
//!
//! Format: `base64url(claims JSON) . base64url(HMAC-SHA256 tag)`.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone)]
pub struct BearerToken {
    pub value: String,
    pub expires_at: i64,
}

fn mac(key: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length.
    HmacSha256::new_from_slice(key).unwrap_or_else(|_| unreachable!("hmac key length"))
}

/// Mint a token for this agent identity, valid for `lifetime_secs` from now.
pub fn issue(aid: &Uuid, key: &[u8], lifetime_secs: u64) -> Result<BearerToken> {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: *aid,
        iat: now,
        exp: now + lifetime_secs as i64,
    };
    let body = serde_json::to_vec(&claims).context("serializing token claims")?;

    let mut m = mac(key);
    m.update(&body);
    let tag = m.finalize().into_bytes();

    Ok(BearerToken {
        value: format!("{}.{}", URL_SAFE_NO_PAD.encode(&body), URL_SAFE_NO_PAD.encode(tag)),
        expires_at: claims.exp,
    })
}

/// Validate a token's signature and expiry, returning its claims.
/// Used by tests and by the server side of the protocol.
pub fn verify(value: &str, key: &[u8]) -> Result<Claims> {
    let (body_b64, tag_b64) = value
        .split_once('.')
        .context("token missing signature separator")?;
    let body = URL_SAFE_NO_PAD
        .decode(body_b64)
        .context("decoding token claims")?;
    let tag = URL_SAFE_NO_PAD
        .decode(tag_b64)
        .context("decoding token signature")?;

    let mut m = mac(key);
    m.update(&body);
    if m.verify_slice(&tag).is_err() {
        bail!("token signature mismatch");
    }

    let claims: Claims = serde_json::from_slice(&body).context("parsing token claims")?;
    if chrono::Utc::now().timestamp() >= claims.exp {
        bail!("token expired");
    }
    Ok(claims)
}
