use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signature scheme version accepted in `X-MLflow-Signature`.
const SIGNATURE_PREFIX: &str = "v1,";

pub const DEFAULT_MAX_TIMESTAMP_AGE: u64 = 300;

/// Check that a delivery timestamp (decimal Unix seconds) is no older than
/// `max_age` seconds. Unparsable and future timestamps are rejected.
pub fn is_fresh(timestamp: &str, max_age: u64) -> bool {
    is_fresh_at(timestamp, max_age, Utc::now().timestamp())
}

pub fn is_fresh_at(timestamp: &str, max_age: u64, now: i64) -> bool {
    let Ok(sent_at) = timestamp.parse::<i64>() else {
        return false;
    };
    let Some(age) = now.checked_sub(sent_at) else {
        return false;
    };
    u64::try_from(age).is_ok_and(|age| age <= max_age)
}

/// Verify an MLflow webhook signature.
/// Header format: "v1,<base64>"
/// Signed payload: "<delivery-id>.<timestamp>.<body>"
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    delivery_id: &str,
    timestamp: &str,
    signature_header: &str,
) -> bool {
    let Some(encoded) = signature_header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(provided) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };

    let Some(mac) = signing_mac(secret, body, delivery_id, timestamp) else {
        return false;
    };
    // verify_slice compares in constant time.
    mac.verify_slice(&provided).is_ok()
}

/// Produce the `v1,<base64>` header value for a delivery.
#[cfg(test)]
pub fn sign(secret: &str, body: &[u8], delivery_id: &str, timestamp: &str) -> Option<String> {
    let mac = signing_mac(secret, body, delivery_id, timestamp)?;
    let digest = mac.finalize().into_bytes();
    Some(format!(
        "{SIGNATURE_PREFIX}{}",
        base64::engine::general_purpose::STANDARD.encode(digest)
    ))
}

fn signing_mac(
    secret: &str,
    body: &[u8],
    delivery_id: &str,
    timestamp: &str,
) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(delivery_id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Some(mac)
}
