//! Key derivation — spec.md §4.1.
//!
//! `derive` is HMAC-SHA512 with the usage string domain-separating the
//! derived key and the salt making it per-session. The three named
//! wrappers exist so call sites never have to remember the right
//! `(usage, length)` pair.

use hmac::{Hmac, Mac};
use sha2::Sha512;
use thiserror::Error;

type HmacSha512 = Hmac<Sha512>;

#[derive(Debug, Error)]
pub enum KdfError {
    #[error("salt must be at least 16 bytes")]
    SaltTooShort,
    #[error("usage must be non-empty")]
    EmptyUsage,
    #[error("length must be between 32 and 64 bytes")]
    LengthOutOfRange,
    #[error("secret must be at least as long as the requested output")]
    SecretTooShort,
    #[error("hmac key of any length is accepted, but construction failed")]
    MacInit,
}

const MIN_SALT_LEN: usize = 16;
const MIN_LEN: usize = 32;
const MAX_LEN: usize = 64;

/// `derive(secret, salt, usage, length) -> bytes`.
///
/// The output is the first `length` bytes of `HMAC-SHA512(secret, salt ||
/// 0x00 || usage)`; `0x00` is the usage separator so `usage="AB"` and a
/// salt that happens to contain `usage="A" + "B"...` never collide.
pub fn derive(secret: &[u8], salt: &[u8], usage: &str, length: usize) -> Result<Vec<u8>, KdfError> {
    if salt.len() < MIN_SALT_LEN {
        return Err(KdfError::SaltTooShort);
    }
    if usage.is_empty() {
        return Err(KdfError::EmptyUsage);
    }
    if !(MIN_LEN..=MAX_LEN).contains(&length) {
        return Err(KdfError::LengthOutOfRange);
    }
    if secret.len() < length {
        return Err(KdfError::SecretTooShort);
    }

    let mut mac = HmacSha512::new_from_slice(secret).map_err(|_| KdfError::MacInit)?;
    mac.update(salt);
    mac.update(&[0u8]);
    mac.update(usage.as_bytes());
    let full = mac.finalize().into_bytes();
    Ok(full[..length].to_vec())
}

/// `CookieHashKey` — length 64, usage `"INTEGRITY"`.
pub fn cookie_hash_key(secret: &[u8], salt: &[u8]) -> Result<Vec<u8>, KdfError> {
    derive(secret, salt, "INTEGRITY", 64)
}

/// `CookieBlockKey` — length 32, usage `"ENCRYPTION"`.
pub fn cookie_block_key(secret: &[u8], salt: &[u8]) -> Result<Vec<u8>, KdfError> {
    derive(secret, salt, "ENCRYPTION", 32)
}

/// `TokenSigningKey` — length 64, usage `"SIGNATURE"`.
pub fn token_signing_key(secret: &[u8], salt: &[u8]) -> Result<Vec<u8>, KdfError> {
    derive(secret, salt, "SIGNATURE", 64)
}

/// Stable pseudo-random MAC address for a router port (spec.md §4.8 step
/// 3), seeded by `"<server_cert_fingerprint>.0.<network_id>"`-style input
/// so every cluster member computes the same value without coordination.
/// Keyed with a fixed domain string rather than a per-cluster secret,
/// since the whole point is that members with no shared secret beyond the
/// certificate fingerprint still agree on the MAC.
pub fn router_mac(seed: &str) -> String {
    let mut mac = HmacSha512::new_from_slice(b"lxd-router-mac").expect("static key");
    mac.update(seed.as_bytes());
    let digest = mac.finalize().into_bytes();
    let mut octets = [digest[0], digest[1], digest[2], digest[3], digest[4], digest[5]];
    octets[0] = (octets[0] & 0xFE) | 0x02; // locally administered, unicast
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        octets[0], octets[1], octets[2], octets[3], octets[4], octets[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(len: usize) -> Vec<u8> {
        (0..len as u8).cycle().take(len).collect()
    }

    #[test]
    fn derive_is_deterministic() {
        let s = secret(64);
        let salt = [7u8; 16];
        let a = derive(&s, &salt, "SIGNATURE", 64).unwrap();
        let b = derive(&s, &salt, "SIGNATURE", 64).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn usage_domain_separates() {
        let s = secret(64);
        let salt = [7u8; 16];
        let sig = derive(&s, &salt, "SIGNATURE", 64).unwrap();
        let integ = derive(&s, &salt, "INTEGRITY", 64).unwrap();
        assert_ne!(sig, integ);
    }

    #[test]
    fn salt_changes_output() {
        let s = secret(64);
        let a = derive(&s, &[1u8; 16], "SIGNATURE", 64).unwrap();
        let b = derive(&s, &[2u8; 16], "SIGNATURE", 64).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_short_salt() {
        assert!(matches!(
            derive(&secret(64), &[0u8; 8], "SIGNATURE", 64),
            Err(KdfError::SaltTooShort)
        ));
    }

    #[test]
    fn rejects_length_out_of_range() {
        assert!(matches!(
            derive(&secret(64), &[0u8; 16], "SIGNATURE", 16),
            Err(KdfError::LengthOutOfRange)
        ));
        assert!(matches!(
            derive(&secret(64), &[0u8; 16], "SIGNATURE", 128),
            Err(KdfError::LengthOutOfRange)
        ));
    }

    #[test]
    fn rejects_secret_shorter_than_output() {
        assert!(matches!(
            derive(&secret(16), &[0u8; 16], "SIGNATURE", 64),
            Err(KdfError::SecretTooShort)
        ));
    }

    #[test]
    fn named_wrappers_fix_usage_and_length() {
        let s = secret(64);
        let salt = [9u8; 16];
        assert_eq!(cookie_hash_key(&s, &salt).unwrap().len(), 64);
        assert_eq!(cookie_block_key(&s, &salt).unwrap().len(), 32);
        assert_eq!(token_signing_key(&s, &salt).unwrap().len(), 64);
    }

    #[test]
    fn router_mac_is_deterministic_and_unicast_local() {
        let a = router_mac("fp:abcdef.0.7");
        let b = router_mac("fp:abcdef.0.7");
        assert_eq!(a, b);
        let first_octet = u8::from_str_radix(&a[0..2], 16).unwrap();
        assert_eq!(first_octet & 0x01, 0, "must be unicast");
        assert_eq!(first_octet & 0x02, 0x02, "must be locally administered");
    }

    #[test]
    fn router_mac_differs_by_network_id() {
        assert_ne!(router_mac("fp:abcdef.0.7"), router_mac("fp:abcdef.0.8"));
    }
}
