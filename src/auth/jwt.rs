//! Identity tokens issued by the identity provider (HS256, shared secret).

use crate::error::{AppError, AppResult};
use crate::models::{Identity, Role};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user_id
    pub role: Role,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Clone)]
pub struct JwtSecret {
    secret: String,
}

impl JwtSecret {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Mint a token the way the identity provider does. Used by local tooling and tests.
    pub fn issue(&self, user_id: &str, role: Role, ttl: Duration) -> AppResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            role,
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AppError::Jwt(e.to_string()))
    }

    pub fn validate(&self, token: &str) -> AppResult<Identity> {
        let mut validation = Validation::default();
        validation.validate_exp = true;
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| AppError::Jwt(e.to_string()))?;
        Ok(Identity {
            user_id: data.claims.sub,
            role: data.claims.role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_validates() {
        let secret = JwtSecret::new("test-identity-secret-32-chars-long!".to_string());
        let token = secret.issue("user-9", Role::Driver, Duration::hours(1)).unwrap();
        let identity = secret.validate(&token).unwrap();
        assert_eq!(identity.user_id, "user-9");
        assert_eq!(identity.role, Role::Driver);
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let issuer = JwtSecret::new("issuer-secret-issuer-secret-issuer".to_string());
        let verifier = JwtSecret::new("another-secret-another-secret-abc".to_string());
        let token = issuer.issue("user-9", Role::Owner, Duration::hours(1)).unwrap();
        assert!(matches!(verifier.validate(&token), Err(AppError::Jwt(_))));
    }

    #[test]
    fn expired_token_is_rejected() {
        let secret = JwtSecret::new("test-identity-secret-32-chars-long!".to_string());
        let token = secret
            .issue("user-9", Role::Passenger, Duration::hours(-2))
            .unwrap();
        assert!(secret.validate(&token).is_err());
    }
}
