//! Bearer authentication for the HTTP API.
//!
//! The core only checks opaque bearer tokens against a verifier
//! capability; who hands tokens out is someone else's problem. The
//! default verifier compares the SHA-256 of the presented token with a
//! digest from the environment, so the secret itself never lives in the
//! server's configuration.

use sha2::{Digest, Sha256};

/// Environment variable holding the hex SHA-256 of the accepted API token.
pub const API_TOKEN_DIGEST_ENV: &str = "API_TOKEN_SHA256";

/// Verifies opaque API bearer tokens.
pub trait ApiTokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> bool;
}

/// Accepts tokens whose SHA-256 matches a configured digest.
pub struct Sha256TokenVerifier {
    digest_hex: String,
}

impl Sha256TokenVerifier {
    pub fn new(digest_hex: &str) -> Self {
        Sha256TokenVerifier {
            digest_hex: digest_hex.to_ascii_lowercase(),
        }
    }

    /// Build from [`API_TOKEN_DIGEST_ENV`], if set.
    pub fn from_env() -> Option<Self> {
        std::env::var(API_TOKEN_DIGEST_ENV)
            .ok()
            .map(|digest| Sha256TokenVerifier::new(&digest))
    }
}

impl ApiTokenVerifier for Sha256TokenVerifier {
    fn verify(&self, token: &str) -> bool {
        let digest = Sha256::digest(token.as_bytes());
        hex::encode(digest) == self.digest_hex
    }
}

/// Rejects everything; used when no API token digest is configured.
pub struct DenyAllVerifier;

impl ApiTokenVerifier for DenyAllVerifier {
    fn verify(&self, _token: &str) -> bool {
        false
    }
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_matching_token_is_accepted() {
        let digest = hex::encode(Sha256::digest(b"edge-api-token"));
        let verifier = Sha256TokenVerifier::new(&digest);
        assert!(verifier.verify("edge-api-token"));
        assert!(!verifier.verify("other-token"));
    }

    #[test]
    fn digest_comparison_is_case_insensitive() {
        let digest = hex::encode(Sha256::digest(b"edge-api-token")).to_ascii_uppercase();
        let verifier = Sha256TokenVerifier::new(&digest);
        assert!(verifier.verify("edge-api-token"));
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(extract_bearer("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("Basic abc"), None);
    }

    #[test]
    fn deny_all_denies() {
        assert!(!DenyAllVerifier.verify("anything"));
    }
}
