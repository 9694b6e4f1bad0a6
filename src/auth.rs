//! JWT validation and brute-force protection for authenticated routes.
//!
//! Routes flagged `require_auth` accept either a configured API key in
//! `X-API-Key` (looked up by the security validator) or an `Authorization:
//! Bearer` JWT validated here. HS256 is the default; RS256 is available when
//! key files are configured.
//!
//! A per-IP failure limiter sits in front of credential validation so that
//! an attacker hammering bad tokens gets cut off before we spend signature
//! verifications on them.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::{SystemTime, UNIX_EPOCH};

use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::JwtConfig;
use crate::error::{GatewayError, GatewayResult};

/// Auth failures allowed per IP per minute before requests are blocked.
const AUTH_FAILURE_LIMIT: NonZeroU32 = NonZeroU32::new(10).unwrap();

/// Burst allowance on top of the per-minute failure quota.
const AUTH_FAILURE_BURST: NonZeroU32 = NonZeroU32::new(5).unwrap();

/// Registered claims plus whatever custom claims the token carries.
#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub iat: u64,
    pub exp: u64,
    #[serde(flatten)]
    pub custom: HashMap<String, serde_json::Value>,
}

/// Outcome of a successful validation.
#[derive(Debug)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub claims: HashMap<String, serde_json::Value>,
}

/// Signs and validates bearer tokens for the gateway.
pub struct JwtManager {
    encoding_key: Option<EncodingKey>,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    issuer: String,
    audience: String,
    token_expiry_secs: u64,
}

impl JwtManager {
    /// HS256 manager from a shared secret.
    pub fn new_hs256(
        secret: &str,
        issuer: &str,
        audience: &str,
        token_expiry_secs: u64,
    ) -> GatewayResult<Self> {
        if secret.is_empty() {
            return Err(GatewayError::Config("JWT secret cannot be empty".into()));
        }
        Ok(Self {
            encoding_key: Some(EncodingKey::from_secret(secret.as_bytes())),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            algorithm: Algorithm::HS256,
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            token_expiry_secs,
        })
    }

    /// Build from configuration; reads PEM key files for RS256.
    pub fn from_config(config: &JwtConfig) -> GatewayResult<Self> {
        match config.algorithm.as_str() {
            "HS256" => Self::new_hs256(
                &config.secret,
                &config.issuer,
                &config.audience,
                config.access_token_expiry,
            ),
            "RS256" => {
                let public_pem = std::fs::read(&config.public_key_file).map_err(|e| {
                    GatewayError::Config(format!(
                        "Could not read {}: {e}",
                        config.public_key_file
                    ))
                })?;
                let decoding_key = DecodingKey::from_rsa_pem(&public_pem)
                    .map_err(|e| GatewayError::Config(format!("Invalid RSA public key: {e}")))?;

                let encoding_key = if config.private_key_file.is_empty() {
                    None
                } else {
                    let private_pem = std::fs::read(&config.private_key_file).map_err(|e| {
                        GatewayError::Config(format!(
                            "Could not read {}: {e}",
                            config.private_key_file
                        ))
                    })?;
                    Some(EncodingKey::from_rsa_pem(&private_pem).map_err(|e| {
                        GatewayError::Config(format!("Invalid RSA private key: {e}"))
                    })?)
                };

                Ok(Self {
                    encoding_key,
                    decoding_key,
                    algorithm: Algorithm::RS256,
                    issuer: config.issuer.clone(),
                    audience: config.audience.clone(),
                    token_expiry_secs: config.access_token_expiry,
                })
            }
            other => Err(GatewayError::Config(format!(
                "Unsupported JWT algorithm: {other}"
            ))),
        }
    }

    /// Sign a token for `user_id` with the configured lifetime.
    pub fn generate_token(
        &self,
        user_id: &str,
        custom_claims: HashMap<String, serde_json::Value>,
    ) -> GatewayResult<String> {
        let Some(encoding_key) = &self.encoding_key else {
            return Err(GatewayError::Config(
                "Token generation requires a signing key".into(),
            ));
        };

        let now = unix_now();
        let claims = JwtClaims {
            sub: user_id.to_string(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now,
            exp: now + self.token_expiry_secs,
            custom: custom_claims,
        };

        encode(&Header::new(self.algorithm), &claims, encoding_key)
            .map_err(|e| GatewayError::Internal(format!("Token signing failed: {e}")))
    }

    /// Verify signature, expiry, issuer, and audience; surface the subject
    /// and custom claims on success.
    pub fn validate_token(&self, token: &str) -> GatewayResult<AuthenticatedUser> {
        if token.is_empty() {
            return Err(GatewayError::Unauthorized);
        }

        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);

        let data = decode::<JwtClaims>(token, &self.decoding_key, &validation).map_err(|e| {
            debug!(error = %e, "JWT validation failed");
            GatewayError::Unauthorized
        })?;

        Ok(AuthenticatedUser {
            user_id: data.claims.sub,
            claims: data.claims.custom,
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// =============================================================================
// Brute-force protection
// =============================================================================

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Per-IP limiter on authentication failures.
///
/// Quota is consumed only by failures, so legitimate clients presenting
/// valid credentials are never throttled here. Once an IP exhausts its
/// failure quota it lands in the block map, and `check` rejects it with a
/// retry hint until the block expires.
pub struct AuthFailureLimiter {
    limiter: KeyedLimiter,
    blocked: parking_lot::Mutex<HashMap<String, std::time::Instant>>,
}

impl AuthFailureLimiter {
    pub fn new() -> Self {
        let quota = Quota::per_minute(AUTH_FAILURE_LIMIT).allow_burst(AUTH_FAILURE_BURST);
        Self {
            limiter: RateLimiter::keyed(quota),
            blocked: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// `Err(retry_after_secs)` when the IP is currently blocked.
    ///
    /// Non-consuming: checking does not count against anyone's quota.
    pub fn check(&self, ip: &str) -> Result<(), u64> {
        let mut blocked = self.blocked.lock();
        match blocked.get(ip) {
            Some(until) => {
                let now = std::time::Instant::now();
                if now < *until {
                    Err((*until - now).as_secs().max(1))
                } else {
                    blocked.remove(ip);
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }

    /// Burn one failure token for this IP; exhausting the quota blocks it.
    pub fn record_failure(&self, ip: &str) {
        if let Err(not_until) = self.limiter.check_key(&ip.to_string()) {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            self.blocked
                .lock()
                .insert(ip.to_string(), std::time::Instant::now() + wait);
        }
    }
}

impl Default for AuthFailureLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn manager() -> JwtManager {
        JwtManager::new_hs256(SECRET, "portico", "portico-clients", 3600).unwrap()
    }

    #[test]
    fn test_round_trip_surfaces_subject_and_custom_claims() {
        let jwt = manager();
        let token = jwt
            .generate_token("user123", HashMap::from([("role".to_string(), json!("admin"))]))
            .unwrap();

        let user = jwt.validate_token(&token).unwrap();
        assert_eq!(user.user_id, "user123");
        assert_eq!(user.claims.get("role"), Some(&json!("admin")));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let jwt = manager();
        let token = jwt.generate_token("user123", HashMap::new()).unwrap();

        // Flip one byte in the payload segment.
        let mut bytes = token.into_bytes();
        let mid = bytes.len() / 2;
        bytes[mid] = if bytes[mid] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();

        assert!(jwt.validate_token(&tampered).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let jwt = manager();
        let other = JwtManager::new_hs256(
            "ffffffffffffffffffffffffffffffff",
            "portico",
            "portico-clients",
            3600,
        )
        .unwrap();

        let token = other.generate_token("user123", HashMap::new()).unwrap();
        assert!(jwt.validate_token(&token).is_err());
    }

    #[test]
    fn test_wrong_issuer_rejected() {
        let jwt = manager();
        let other = JwtManager::new_hs256(SECRET, "someone-else", "portico-clients", 3600).unwrap();

        let token = other.generate_token("user123", HashMap::new()).unwrap();
        assert!(jwt.validate_token(&token).is_err());
    }

    #[test]
    fn test_wrong_audience_rejected() {
        let jwt = manager();
        let other = JwtManager::new_hs256(SECRET, "portico", "other-audience", 3600).unwrap();

        let token = other.generate_token("user123", HashMap::new()).unwrap();
        assert!(jwt.validate_token(&token).is_err());
    }

    #[test]
    fn test_empty_token_rejected() {
        assert!(manager().validate_token("").is_err());
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(manager().validate_token("not.a.jwt").is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(JwtManager::new_hs256("", "i", "a", 3600).is_err());
    }

    #[test]
    fn test_failure_limiter_check_is_non_consuming() {
        let limiter = AuthFailureLimiter::new();
        for _ in 0..100 {
            assert!(limiter.check("1.1.1.1").is_ok());
        }
    }

    #[test]
    fn test_failure_limiter_blocks_after_quota() {
        let limiter = AuthFailureLimiter::new();

        // Burn through burst + sustained quota for one IP.
        for _ in 0..40 {
            limiter.record_failure("6.6.6.6");
        }
        let blocked = limiter.check("6.6.6.6");
        assert!(blocked.is_err());
        assert!(blocked.unwrap_err() >= 1);

        // Other IPs are unaffected.
        assert!(limiter.check("1.1.1.1").is_ok());
    }
}
