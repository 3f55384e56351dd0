//! Bearer-token authentication for streaming clients.
//!
//! Tokens are HS256 JWTs carrying `{sub, role, iat, exp}`. A role maps to a fixed
//! permission set; a token whose role is not in the table is rejected.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthError {
    #[error("Missing token")]
    MissingToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Token encoding failed: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Trader,
    Viewer,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "trader" => Some(Role::Trader),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }

    pub fn permissions(&self) -> HashSet<Permission> {
        let granted: &[Permission] = match self {
            Role::Admin => &[Permission::Read, Permission::Write, Permission::Delete],
            Role::Trader => &[Permission::Read, Permission::Write],
            Role::Viewer => &[Permission::Read],
        };
        granted.iter().copied().collect()
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Trader => "trader",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JWT payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

/// Verified identity extracted from a token.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub role: Role,
}

pub fn issue_token(user_id: &str, role: Role, secret: &str, ttl: Duration) -> Result<String, AuthError> {
    issue_token_at(user_id, role, secret, Utc::now(), ttl)
}

pub fn issue_token_at(
    user_id: &str,
    role: Role,
    secret: &str,
    issued_at: DateTime<Utc>,
    ttl: Duration,
) -> Result<String, AuthError> {
    let ttl = chrono::Duration::from_std(ttl).map_err(|e| AuthError::Encoding(e.to_string()))?;
    let claims = Claims {
        sub: user_id.to_string(),
        role: role.as_str().to_string(),
        iat: issued_at.timestamp(),
        exp: (issued_at + ttl).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Encoding(e.to_string()))
}

/// Checks signature and expiry, then resolves the role.
pub fn verify_token(token: &str, secret: &str) -> Result<AuthenticatedUser, AuthError> {
    if token.trim().is_empty() {
        return Err(AuthError::MissingToken);
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.leeway = 0;

    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::InvalidToken(e.to_string()),
        })?;

    let role = Role::parse(&data.claims.role)
        .ok_or_else(|| AuthError::UnknownRole(data.claims.role.clone()))?;

    Ok(AuthenticatedUser {
        user_id: data.claims.sub,
        role,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-with-enough-length-0123456789";

    #[test]
    fn test_role_permissions() {
        assert!(Role::Admin.has_permission(Permission::Delete));
        assert!(Role::Trader.has_permission(Permission::Write));
        assert!(!Role::Trader.has_permission(Permission::Delete));
        assert!(Role::Viewer.has_permission(Permission::Read));
        assert!(!Role::Viewer.has_permission(Permission::Write));
    }

    #[test]
    fn test_token_round_trip() {
        let token = issue_token("alice", Role::Trader, SECRET, Duration::from_secs(3600)).unwrap();
        let user = verify_token(&token, SECRET).unwrap();
        assert_eq!(user.user_id, "alice");
        assert_eq!(user.role, Role::Trader);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issue_token("alice", Role::Admin, SECRET, Duration::from_secs(3600)).unwrap();
        assert!(matches!(
            verify_token(&token, "another-secret"),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let issued = Utc::now() - chrono::Duration::hours(2);
        let token = issue_token_at("bob", Role::Viewer, SECRET, issued, Duration::from_secs(3600)).unwrap();
        assert_eq!(verify_token(&token, SECRET), Err(AuthError::TokenExpired));
    }

    #[test]
    fn test_unknown_role_rejected() {
        let claims = Claims {
            sub: "mallory".to_string(),
            role: "root".to_string(),
            iat: Utc::now().timestamp(),
            exp: Utc::now().timestamp() + 600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert_eq!(
            verify_token(&token, SECRET),
            Err(AuthError::UnknownRole("root".to_string()))
        );
    }

    #[test]
    fn test_empty_token_is_missing() {
        assert_eq!(verify_token("", SECRET), Err(AuthError::MissingToken));
    }
}
