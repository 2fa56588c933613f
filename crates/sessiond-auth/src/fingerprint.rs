//! Request fingerprints for deduplication
//!
//! A fingerprint is `operation:arg:...:digest`. Plain arguments appear
//! verbatim; secrets are folded into a SHA-256 digest so identical requests
//! collide while no secret ever reaches a log line.

use sha2::{Digest, Sha256};
use std::fmt;

/// Hex characters of the secret digest kept in a fingerprint
const DIGEST_HEX_LEN: usize = 16;

/// Identity of a logical request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Start building a fingerprint for `operation`
    pub fn builder(operation: &str) -> FingerprintBuilder {
        FingerprintBuilder {
            parts: vec![operation.to_string()],
            secrets: None,
        }
    }

    /// The fingerprint text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builder returned by [`Fingerprint::builder`]
#[derive(Clone)]
pub struct FingerprintBuilder {
    parts: Vec<String>,
    secrets: Option<Sha256>,
}

impl fmt::Debug for FingerprintBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintBuilder")
            .field("parts", &self.parts)
            .field("has_secrets", &self.secrets.is_some())
            .finish()
    }
}

impl FingerprintBuilder {
    /// Append a non-secret argument
    pub fn arg(mut self, value: impl AsRef<str>) -> Self {
        self.parts.push(value.as_ref().to_string());
        self
    }

    /// Fold a secret into the digest
    pub fn secret(mut self, value: impl AsRef<[u8]>) -> Self {
        let hasher = self.secrets.get_or_insert_with(Sha256::new);
        let value = value.as_ref();
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
        self
    }

    /// Finish the fingerprint
    pub fn build(mut self) -> Fingerprint {
        if let Some(hasher) = self.secrets.take() {
            let digest = hex::encode(hasher.finalize());
            self.parts.push(digest[..DIGEST_HEX_LEN].to_string());
        }
        Fingerprint(self.parts.join(":"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_requests_collide() {
        let a = Fingerprint::builder("sign_in").arg("a@b.co").secret("pw").build();
        let b = Fingerprint::builder("sign_in").arg("a@b.co").secret("pw").build();
        assert_eq!(a, b);
    }

    #[test]
    fn test_secret_never_appears() {
        let fp = Fingerprint::builder("sign_in").arg("a@b.co").secret("hunter2").build();
        assert!(!fp.as_str().contains("hunter2"));
        assert!(fp.as_str().starts_with("sign_in:a@b.co:"));
        assert_eq!(fp.as_str().len(), "sign_in:a@b.co:".len() + DIGEST_HEX_LEN);
    }

    #[test]
    fn test_different_inputs_differ() {
        let base = Fingerprint::builder("sign_in").arg("a@b.co").secret("pw").build();
        assert_ne!(base, Fingerprint::builder("sign_in").arg("a@b.co").secret("pw2").build());
        assert_ne!(base, Fingerprint::builder("sign_up").arg("a@b.co").secret("pw").build());
        assert_ne!(base, Fingerprint::builder("sign_in").arg("c@d.co").secret("pw").build());
    }

    #[test]
    fn test_secret_boundaries_are_unambiguous() {
        let a = Fingerprint::builder("op").secret("ab").secret("c").build();
        let b = Fingerprint::builder("op").secret("a").secret("bc").build();
        assert_ne!(a, b);
    }

    #[test]
    fn test_without_secrets() {
        let fp = Fingerprint::builder("sign_out").arg("u1").build();
        assert_eq!(fp.to_string(), "sign_out:u1");
    }
}
