//! Fingerprint hashing and partial-data masking.
//!
//! Machine fingerprints and machine IDs are stored only as keyed one-way
//! hashes; license keys are stored as salted hashes plus a display-safe
//! fragment. The masking helpers here are the only way identifying data is
//! ever echoed in responses or audit logs.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Placeholder returned for inputs that cannot be masked meaningfully.
const UNKNOWN: &str = "unknown";

/// Keyed hasher for machine fingerprints and machine IDs.
///
/// The HMAC key is derived from the master secret via HKDF, so the same
/// fingerprint always hashes to the same digest (required for activation
/// lookups) while the raw value is unrecoverable from storage.
///
/// Thread-safe and cheaply cloneable.
#[derive(Clone)]
pub struct MachineHasher {
    hmac_key: [u8; 32],
}

impl MachineHasher {
    pub fn from_master_secret(master_secret: &[u8]) -> Self {
        Self {
            hmac_key: derive_key(master_secret, b"machine-data"),
        }
    }

    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { hmac_key: key }
    }

    /// Hash a machine fingerprint or machine id for storage/lookup.
    ///
    /// Input is NFC-normalized and trimmed so clients sending the same
    /// identifier in different encodings resolve to the same activation.
    pub fn hash(&self, raw: &str) -> String {
        let normalized: String = raw.nfc().collect();
        let normalized = normalized.trim();

        let mut mac: Hmac<Sha256> =
            Mac::new_from_slice(&self.hmac_key).expect("HMAC can take key of any size");
        mac.update(normalized.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Keyed hasher for customer emails (license resolution from webhook events).
///
/// Emails are normalized (NFC, lowercase, trimmed) before hashing so lookups
/// are consistent regardless of input encoding.
#[derive(Clone)]
pub struct EmailHasher {
    hmac_key: [u8; 32],
}

impl EmailHasher {
    pub fn from_master_secret(master_secret: &[u8]) -> Self {
        Self {
            hmac_key: derive_key(master_secret, b"email"),
        }
    }

    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { hmac_key: key }
    }

    pub fn hash(&self, email: &str) -> String {
        let normalized: String = email.nfc().collect();
        let normalized = normalized.to_lowercase();
        let normalized = normalized.trim();

        let mut mac: Hmac<Sha256> =
            Mac::new_from_slice(&self.hmac_key).expect("HMAC can take key of any size");
        mac.update(normalized.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

fn derive_key(master_secret: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(b"keywarden-v1"), master_secret);
    let mut key = [0u8; 32];
    hk.expand(info, &mut key)
        .expect("HKDF expand should not fail with valid length");
    key
}

/// Hash a license key for database lookups.
/// Salted SHA-256, lowercase hex. The raw key is never stored.
pub fn hash_license_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"keywarden-v1:");
    hasher.update(key.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// Display-safe fragment of a license key: first 4 + last 4 characters,
/// middle masked. Never returns the full key; too-short or empty input
/// yields a safe placeholder.
pub fn partial_license_key(key: &str) -> String {
    mask_middle(key.trim(), 4, 9)
}

/// Display-safe fragment of a machine fingerprint/id for activation history.
pub fn partial_machine_data(raw: &str) -> String {
    mask_middle(raw.trim(), 4, 9)
}

/// Masked form of an email address for log payloads: first character of the
/// local part kept, rest masked, domain kept.
pub fn mask_email(email: &str) -> String {
    let email = email.trim();
    if email.is_empty() {
        return UNKNOWN.to_string();
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
            let first = local.chars().next().unwrap();
            format!("{}***@{}", first, domain)
        }
        _ => "***".to_string(),
    }
}

/// Keep `edge` characters from each end, mask the middle with a fixed-width
/// filler (the true length does not leak). Inputs shorter than `min_len`
/// are fully masked; empty input yields the placeholder.
fn mask_middle(value: &str, edge: usize, min_len: usize) -> String {
    if value.is_empty() {
        return UNKNOWN.to_string();
    }
    let chars: Vec<char> = value.chars().collect();
    if chars.len() < min_len {
        return "****".to_string();
    }
    let head: String = chars[..edge].iter().collect();
    let tail: String = chars[chars.len() - edge..].iter().collect();
    format!("{}****{}", head, tail)
}
