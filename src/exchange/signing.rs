//! HMAC-SHA256 request signing shared by the Bybit and Binance adapters and
//! their private websocket handshakes.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::AdapterError;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `payload` keyed with `secret`.
pub(crate) fn sign_hex(secret: &str, payload: &str) -> Result<String, AdapterError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| AdapterError::Authentication(format!("failed to create signing key: {err}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
