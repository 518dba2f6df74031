//! Bearer-token authentication and the ownership capability predicate.
//!
//! Tokens are HS256 JWTs signed with `BERTH_AUTH_SECRET`. Authorization
//! decisions go through `Identity::can_manage` so role logic lives in one
//! place instead of being re-derived per endpoint.

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::api::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: usize,
}

/// Signing material derived once from the auth secret.
#[derive(Clone)]
pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl AuthKeys {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    pub fn issue(&self, user_id: &str, role: Role, ttl_secs: u64) -> anyhow::Result<String> {
        let exp = chrono::Utc::now().timestamp() as usize + ttl_secs as usize;
        let claims = Claims {
            sub: user_id.to_string(),
            role,
            exp,
        };
        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| anyhow::anyhow!("failed to sign token: {}", e))
    }

    pub fn verify(&self, token: &str) -> Result<Identity, jsonwebtoken::errors::Error> {
        let data = jsonwebtoken::decode::<Claims>(
            token,
            &self.decoding,
            &Validation::new(Algorithm::HS256),
        )?;
        Ok(Identity {
            user_id: data.claims.sub,
            role: data.claims.role,
        })
    }
}

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// The single capability predicate: admins manage everything, users
    /// manage only what they own.
    pub fn can_manage(&self, owner_id: &str) -> bool {
        self.is_admin() || self.user_id == owner_id
    }
}

impl<S> FromRequestParts<S> for Identity
where
    AuthKeys: axum::extract::FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = AuthKeys::from_ref(state);
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::Unauthorized("malformed authorization header".into()))?;
        keys.verify(token)
            .map_err(|_| ApiError::Unauthorized("invalid or expired token".into()))
    }
}
