//! Short-lived connection tokens for the websocket handshake.
//!
//! A token binds a device id (subject) to the client host that requested
//! it (audience) and expires after one minute. HS256 over a process-scoped
//! random secret: tokens are only ever verified by the process that issued
//! them, one hop later in the handshake.

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use meridian_edge::DeviceId;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Tokens expire this long after issuing.
pub const TOKEN_LIFETIME: Duration = Duration::minutes(1);

const ISSUER: &str = "meridian-server";

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    iat: i64,
    exp: i64,
    sub: String,
    aud: String,
}

/// Issues and verifies websocket connection tokens.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenService {
    /// A service with a fresh random secret. Tokens do not survive a
    /// process restart; clients simply request a new one.
    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        TokenService {
            encoding_key: EncodingKey::from_secret(&secret),
            decoding_key: DecodingKey::from_secret(&secret),
        }
    }

    /// Issue a token for one device and the host that asked for it.
    pub fn issue(&self, device_id: DeviceId, client_hostname: &str) -> Result<String, TokenError> {
        self.issue_with_lifetime(device_id, client_hostname, TOKEN_LIFETIME)
    }

    fn issue_with_lifetime(
        &self,
        device_id: DeviceId,
        client_hostname: &str,
        lifetime: Duration,
    ) -> Result<String, TokenError> {
        let now = Utc::now();
        let claims = Claims {
            iss: ISSUER.to_owned(),
            iat: now.timestamp(),
            exp: (now + lifetime).timestamp(),
            sub: device_id.to_string(),
            aud: client_hostname.to_owned(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Invalid(e.to_string()))
    }

    /// Verify a token against the connecting device and host.
    ///
    /// Requires every claim to be present, the expiry to lie in the
    /// future, and the audience/subject to match.
    pub fn verify(
        &self,
        token: &str,
        device_id: DeviceId,
        client_hostname: &str,
    ) -> Result<(), TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[client_hostname]);
        validation.set_issuer(&[ISSUER]);
        // `iat` presence is enforced by the Claims shape itself.
        validation.set_required_spec_claims(&["exp", "iss", "sub", "aud"]);
        validation.leeway = 0;

        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| TokenError::Invalid(e.to_string()))?;

        if data.claims.sub != device_id.to_string() {
            return Err(TokenError::Invalid(
                "the device id does not match the token".to_owned(),
            ));
        }
        Ok(())
    }
}

impl Default for TokenService {
    fn default() -> Self {
        TokenService::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_id() -> DeviceId {
        "0191d9b4-6f5a-7cde-8f00-000000000001".parse().unwrap()
    }

    fn other_device_id() -> DeviceId {
        "0191d9b4-6f5a-7cde-8f00-000000000002".parse().unwrap()
    }

    #[test]
    fn a_token_verifies_for_its_device_and_host() {
        let service = TokenService::new();
        let token = service.issue(device_id(), "198.51.100.7").unwrap();
        assert!(service.verify(&token, device_id(), "198.51.100.7").is_ok());
    }

    #[test]
    fn a_token_is_bound_to_its_device() {
        let service = TokenService::new();
        let token = service.issue(device_id(), "198.51.100.7").unwrap();
        assert!(service
            .verify(&token, other_device_id(), "198.51.100.7")
            .is_err());
    }

    #[test]
    fn a_token_is_bound_to_its_host() {
        let service = TokenService::new();
        let token = service.issue(device_id(), "198.51.100.7").unwrap();
        assert!(service.verify(&token, device_id(), "203.0.113.9").is_err());
    }

    #[test]
    fn an_expired_token_is_rejected() {
        let service = TokenService::new();
        let token = service
            .issue_with_lifetime(device_id(), "198.51.100.7", Duration::seconds(-5))
            .unwrap();
        assert!(service.verify(&token, device_id(), "198.51.100.7").is_err());
    }

    #[test]
    fn tokens_from_another_process_are_rejected() {
        let issuer = TokenService::new();
        let verifier = TokenService::new();
        let token = issuer.issue(device_id(), "198.51.100.7").unwrap();
        assert!(verifier.verify(&token, device_id(), "198.51.100.7").is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let service = TokenService::new();
        assert!(service.verify("not-a-token", device_id(), "h").is_err());
    }
}
