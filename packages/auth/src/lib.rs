//! Token verification for the collaboration gateway.
//!
//! The core never stores passwords. Clients present a bearer token (issued
//! elsewhere) on every socket; [`TokenVerifier::verify`] maps it to a
//! [`Principal`] or rejects it. Verification is purely functional with
//! respect to the signing secret and the clock.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token invalid")]
    TokenInvalid,

    #[error("token expired")]
    TokenExpired,

    #[error("token creation failed: {0}")]
    IssueFailed(String),
}

/// Role carried by a principal's token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Editor,
    Viewer,
    User,
}

impl Role {
    /// Whether the role is capable of write access at all. Viewers are
    /// capped at read regardless of any ACL entry.
    pub fn can_write(self) -> bool {
        !matches!(self, Role::Viewer)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
            Role::User => "user",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "editor" => Ok(Role::Editor),
            "viewer" => Ok(Role::Viewer),
            "user" => Ok(Role::User),
            _ => Err(AuthError::TokenInvalid),
        }
    }
}

/// Authenticated identity, immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: String,
    pub display_name: String,
    pub role: Role,
    pub permissions: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// Principal id.
    sub: String,
    /// Display name.
    name: String,
    role: Role,
    #[serde(default)]
    perms: Vec<String>,
    exp: i64,
    iat: i64,
}

/// Verifies bearer tokens against a shared HS256 secret.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::TokenInvalid,
            }
        })?;
        let claims = data.claims;
        Ok(Principal {
            principal_id: claims.sub,
            display_name: claims.name,
            role: claims.role,
            permissions: claims.perms,
        })
    }
}

/// Issues tokens for tests and the dev `mint-token` command.
pub struct TokenIssuer {
    key: EncodingKey,
}

impl TokenIssuer {
    pub fn new(secret: &str) -> Self {
        Self {
            key: EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue(&self, principal: &Principal, ttl_secs: i64) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: principal.principal_id.clone(),
            name: principal.display_name.clone(),
            role: principal.role,
            perms: principal.permissions.clone(),
            exp: now + ttl_secs,
            iat: now,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|e| AuthError::IssueFailed(e.to_string()))
    }
}
