//! Webhook signature checks

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &str, payload: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(mac)
}

/// Verify a Meta `X-Hub-Signature-256` header of the form `sha256=<hex>`
pub fn verify_hex_signature(secret: &str, payload: &[u8], header: &str) -> bool {
    let Some(hex_digest) = header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    mac(secret, payload).is_some_and(|mac| mac.verify_slice(&expected).is_ok())
}

/// Verify an X `x-twitter-webhooks-signature` header (`sha256=<base64>`)
pub fn verify_base64_signature(secret: &str, payload: &[u8], header: &str) -> bool {
    let header = header.trim();
    let encoded = header.strip_prefix("sha256=").unwrap_or(header);
    let Ok(expected) = BASE64.decode(encoded) else {
        return false;
    };
    mac(secret, payload).is_some_and(|mac| mac.verify_slice(&expected).is_ok())
}

/// `sha256=<hex>` signature for `payload`
pub fn sign_hex(secret: &str, payload: &[u8]) -> String {
    let digest = mac(secret, payload)
        .map(|mac| hex::encode(mac.finalize().into_bytes()))
        .unwrap_or_default();
    format!("sha256={}", digest)
}

/// `sha256=<base64>` signature for `payload`
pub fn sign_base64(secret: &str, payload: &[u8]) -> String {
    let digest = mac(secret, payload)
        .map(|mac| BASE64.encode(mac.finalize().into_bytes()))
        .unwrap_or_default();
    format!("sha256={}", digest)
}
