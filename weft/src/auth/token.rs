//! Signed short-lived bearer tokens (HS256).
//!
//! Each issued token carries a random `jti` that is also written to the
//! `access_tokens` table; validation therefore checks both the signature and
//! the server-side record, which gives immediate revocation on logout.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AuthError, UserLevel};

/// Signed token payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    /// User id.
    pub sub: String,
    /// Group id; absent for the synthetic system user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grp: Option<String>,
    /// User level string (`NORMAL` / `ADMIN` / `ADMIN_GERAL`).
    pub lvl: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// A freshly issued token plus the record fields the caller must persist.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues a token for `user_id`, valid for `ttl_minutes`.
pub fn issue(
    secret: &str,
    issuer: &str,
    user_id: &str,
    group_id: Option<&str>,
    level: UserLevel,
    ttl_minutes: i64,
) -> Result<IssuedToken, AuthError> {
    let now = Utc::now();
    let expires_at = now + Duration::minutes(ttl_minutes);
    let jti = Uuid::new_v4().to_string();
    let claims = Claims {
        iss: issuer.to_string(),
        sub: user_id.to_string(),
        grp: group_id.map(String::from),
        lvl: level.as_str().to_string(),
        jti: jti.clone(),
        iat: now.timestamp(),
        exp: expires_at.timestamp(),
    };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Token(e.to_string()))?;
    Ok(IssuedToken {
        token,
        jti,
        expires_at,
    })
}

/// Decodes and validates signature, issuer, and expiry.
pub fn decode_token(secret: &str, issuer: &str, token: &str) -> Result<Claims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[issuer]);
    validation.set_required_spec_claims(&["exp", "iat", "iss", "sub"]);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| AuthError::Token(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "unit-secret";
    const ISSUER: &str = "agent-api";

    #[test]
    fn issue_then_decode_round_trips_claims() {
        let issued = issue(SECRET, ISSUER, "u1", Some("g1"), UserLevel::Admin, 60).unwrap();
        let claims = decode_token(SECRET, ISSUER, &issued.token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.grp.as_deref(), Some("g1"));
        assert_eq!(claims.lvl, "ADMIN");
        assert_eq!(claims.jti, issued.jti);
        assert_eq!(claims.exp, issued.expires_at.timestamp());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let issued = issue(SECRET, ISSUER, "u1", None, UserLevel::Normal, 60).unwrap();
        assert!(decode_token("other", ISSUER, &issued.token).is_err());
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let issued = issue(SECRET, ISSUER, "u1", None, UserLevel::Normal, 60).unwrap();
        assert!(decode_token(SECRET, "someone-else", &issued.token).is_err());
    }

    /// **Scenario**: a token whose `exp` is in the past fails validation even
    /// with the right secret and issuer.
    #[test]
    fn expired_token_is_rejected() {
        let issued = issue(SECRET, ISSUER, "u1", None, UserLevel::Normal, -5).unwrap();
        assert!(decode_token(SECRET, ISSUER, &issued.token).is_err());
    }
}
