//! Request signing
//!
//! Venue REST APIs authenticate with an HMAC-SHA256 over a canonical string
//! (timestamp + method + path + body, details per venue), hex- or
//! base64-encoded. Venue clocks drift; the offset tracker keeps a correction
//! that is re-synced whenever a venue rejects our timestamp.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &str, payload: &str) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| anyhow!("invalid HMAC key length"))?;
    mac.update(payload.as_bytes());
    Ok(mac)
}

/// Hex-encoded HMAC-SHA256 (binance, bybit).
pub fn sign_hex(secret: &str, payload: &str) -> Result<String> {
    Ok(hex::encode(mac_for(secret, payload)?.finalize().into_bytes()))
}

/// Base64-encoded HMAC-SHA256 (upbit).
pub fn sign_base64(secret: &str, payload: &str) -> Result<String> {
    Ok(BASE64.encode(mac_for(secret, payload)?.finalize().into_bytes()))
}

/// Correction between the venue's clock and ours, in milliseconds.
/// Mutated only by the owning adapter's request path.
#[derive(Debug, Default)]
pub struct ServerTimeOffset {
    offset_ms: AtomicI64,
}

impl ServerTimeOffset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local wall-clock milliseconds adjusted by the known offset.
    pub fn now_ms(&self) -> i64 {
        let local = (crate::models::epoch_now() * 1000.0) as i64;
        local + self.offset_ms.load(Ordering::Relaxed)
    }

    /// Record the venue-reported time against our clock.
    pub fn sync(&self, server_ms: i64) {
        let local = (crate::models::epoch_now() * 1000.0) as i64;
        let offset = server_ms - local;
        self.offset_ms.store(offset, Ordering::Relaxed);
        debug!("server time offset updated to {}ms", offset);
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_signature_matches_known_vector() {
        // RFC 4231 test case 2: key "Jefe", data "what do ya want for nothing?".
        let sig = sign_hex("Jefe", "what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn base64_signature_is_consistent_with_hex() {
        let hex_sig = sign_hex("secret", "payload").unwrap();
        let b64_sig = sign_base64("secret", "payload").unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(b64_sig)
            .unwrap();
        assert_eq!(hex::encode(decoded), hex_sig);
    }

    #[test]
    fn offset_shifts_reported_time() {
        let offset = ServerTimeOffset::new();
        let before = offset.now_ms();
        offset.sync(before + 5_000);
        assert!(offset.offset_ms() >= 4_000);
        assert!(offset.now_ms() >= before + 4_000);
    }
}
