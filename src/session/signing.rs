use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::time::Duration;

use crate::error::{CodeboxError, Result};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signer for time-limited artifact URLs.
#[derive(Clone)]
pub struct UrlSigner {
    mac: HmacSha256,
    ttl: Duration,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(key: &[u8], ttl: Duration) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|e| CodeboxError::config(format!("invalid signing key: {}", e)))?;
        Ok(Self { mac, ttl })
    }

    /// Use the configured key, or 32 random bytes for this process.
    pub fn from_key_or_random(key: Option<&str>, ttl: Duration) -> Result<Self> {
        match key.map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => Self::new(key.as_bytes(), ttl),
            None => {
                let mut key = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut key);
                Self::new(&key, ttl)
            }
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn mac(&self, path: &str, exp: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(path.as_bytes());
        mac.update(b"|");
        mac.update(exp.as_bytes());
        mac
    }

    pub fn signature(&self, path: &str, exp: i64) -> String {
        hex::encode(self.mac(path, &exp.to_string()).finalize().into_bytes())
    }

    /// `path?exp=<unix>&sig=<hex>` valid for the signer's TTL from `now`.
    pub fn sign_at(&self, path: &str, now: DateTime<Utc>) -> String {
        let exp = now.timestamp() + self.ttl.as_secs() as i64;
        format!("{}?exp={}&sig={}", path, exp, self.signature(path, exp))
    }

    pub fn sign(&self, path: &str) -> String {
        self.sign_at(path, Utc::now())
    }

    /// Accept only when `now <= exp` and the signature matches in constant time.
    pub fn verify_at(&self, path: &str, exp: &str, sig: &str, now: DateTime<Utc>) -> bool {
        if path.is_empty() || exp.is_empty() || sig.is_empty() {
            return false;
        }
        let exp_unix = match exp.parse::<i64>() {
            Ok(v) if v > 0 => v,
            _ => return false,
        };
        if now.timestamp() > exp_unix {
            return false;
        }
        // Lowercase hex only, so each signature has exactly one accepted spelling.
        if sig.len() != 64 || !sig.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return false;
        }
        let Ok(sig) = hex::decode(sig) else {
            return false;
        };
        self.mac(path, exp).verify_slice(&sig).is_ok()
    }

    pub fn verify(&self, path: &str, exp: &str, sig: &str) -> bool {
        self.verify_at(path, exp, sig, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &str = "/api/sessions/sess_abc/transcript.ndjson";

    fn parts(url: &str) -> (String, String) {
        let query = url.split_once('?').unwrap().1;
        let mut exp = String::new();
        let mut sig = String::new();
        for pair in query.split('&') {
            match pair.split_once('=').unwrap() {
                ("exp", v) => exp = v.to_string(),
                ("sig", v) => sig = v.to_string(),
                _ => {}
            }
        }
        (exp, sig)
    }

    #[test]
    fn test_signed_url_roundtrip() {
        let signer = UrlSigner::new(b"secret", Duration::from_secs(900)).unwrap();
        let now = Utc::now();
        let url = signer.sign_at(PATH, now);
        assert!(url.starts_with(PATH));
        let (exp, sig) = parts(&url);
        assert_eq!(exp.parse::<i64>().unwrap(), now.timestamp() + 900);
        assert!(signer.verify_at(PATH, &exp, &sig, now));
        assert!(!signer.verify_at("/api/sessions/other/transcript.ndjson", &exp, &sig, now));
    }

    #[test]
    fn test_any_bit_flip_rejected() {
        let signer = UrlSigner::new(b"secret", Duration::from_secs(900)).unwrap();
        let now = Utc::now();
        let (exp, sig) = parts(&signer.sign_at(PATH, now));
        let raw = hex::decode(&sig).unwrap();
        for byte in 0..raw.len() {
            for bit in 0..8 {
                let mut flipped = raw.clone();
                flipped[byte] ^= 1 << bit;
                assert!(!signer.verify_at(PATH, &exp, &hex::encode(&flipped), now));
            }
        }
    }

    #[test]
    fn test_any_bit_flip_in_signature_text_rejected() {
        let signer = UrlSigner::new(b"secret", Duration::from_secs(900)).unwrap();
        let now = Utc::now();
        let (exp, sig) = parts(&signer.sign_at(PATH, now));
        for index in 0..sig.len() {
            for bit in 0..8 {
                let mut bytes = sig.clone().into_bytes();
                bytes[index] ^= 1 << bit;
                let Ok(flipped) = String::from_utf8(bytes) else {
                    continue;
                };
                assert!(
                    !signer.verify_at(PATH, &exp, &flipped, now),
                    "accepted {} for {}",
                    flipped,
                    sig
                );
            }
        }
        let upper = sig.to_uppercase();
        if upper != sig {
            assert!(!signer.verify_at(PATH, &exp, &upper, now));
        }
        assert!(!signer.verify_at(PATH, &exp, &format!("{}0", sig), now));
    }

    #[test]
    fn test_expired_or_malformed_rejected() {
        let signer = UrlSigner::new(b"secret", Duration::from_secs(900)).unwrap();
        let now = Utc::now();
        let (exp, sig) = parts(&signer.sign_at(PATH, now));
        let later = now + chrono::Duration::seconds(901);
        assert!(!signer.verify_at(PATH, &exp, &sig, later));
        assert!(signer.verify_at(PATH, &exp, &sig, now + chrono::Duration::seconds(900)));
        assert!(!signer.verify_at(PATH, "", &sig, now));
        assert!(!signer.verify_at(PATH, "abc", &sig, now));
        assert!(!signer.verify_at(PATH, &exp, "zz", now));
    }

    #[test]
    fn test_keys_differ() {
        let a = UrlSigner::from_key_or_random(None, Duration::from_secs(60)).unwrap();
        let b = UrlSigner::from_key_or_random(None, Duration::from_secs(60)).unwrap();
        assert_ne!(a.signature(PATH, 100), b.signature(PATH, 100));
        let c = UrlSigner::from_key_or_random(Some("k"), Duration::from_secs(60)).unwrap();
        let d = UrlSigner::new(b"k", Duration::ZERO).unwrap();
        assert_eq!(c.signature(PATH, 100), d.signature(PATH, 100));
    }
}
