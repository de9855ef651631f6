//! HMAC helpers shared by the beacon and the transfer handshake.
//!
//! HMAC verification is constant-time via `hmac::Mac::verify_slice`; raw
//! fingerprint byte-array comparisons elsewhere use `subtle::ConstantTimeEq`
//! explicitly since those are plain equality checks, not `Mac` verifications.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Computes `hex(HMAC-SHA256(key, message))`.
pub fn hmac_hex(key: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts a key of any length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// The `/prepare-upload` authentication proof: `HMAC-SHA256(phrase, "ts:fingerprint")`.
pub fn compute_proof(canonical_phrase: &str, timestamp: &str, fingerprint: &str) -> String {
    hmac_hex(canonical_phrase, &format!("{timestamp}:{fingerprint}"))
}

/// Verifies a hex-encoded HMAC over `message`, keyed by `key`, in constant time.
pub fn verify_hmac(key: &str, message: &str, hex_mac: &str) -> bool {
    let Ok(expected) = hex::decode(hex_mac) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
        return false;
    };
    mac.update(message.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Constant-time string equality for hex-encoded proofs/fingerprints.
pub fn constant_time_eq_str(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
