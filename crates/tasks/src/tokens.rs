//! Signed, time-boxed and optionally use-limited credentials.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TaskError;
use crate::stack::Cache;
use crate::util::random_string;

/// Signing secret used when none is configured. Never use in production.
pub const DEV_SECRET: &str = "execustack-development-secret";

/// Default credential lifetime (90 days).
pub const DEFAULT_EXPIRY: Duration = Duration::from_millis(90 * 24 * 60 * 60 * 1000);

/// Cache value of an unlimited credential.
const ACTIVE: &str = "active";

const TOKEN_ID_LENGTH: usize = 24;

/// Credential claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Tenant the credential was issued to.
    pub sub: String,
    /// Unique token id.
    pub jti: String,
    #[serde(default)]
    pub payload: Value,
    pub iat: i64,
    pub exp: i64,
}

/// Cache key tracking a credential's status.
pub fn token_key(tenant_id: &str, token_id: &str) -> String {
    format!("{}:tokens:{}", tenant_id, token_id)
}

/// Issues and verifies HS256 credentials backed by a cache-side status.
#[derive(Clone)]
pub struct TokenIssuer {
    cache: Arc<dyn Cache>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    default_expiry: Duration,
}

impl TokenIssuer {
    pub fn new(cache: Arc<dyn Cache>, secret: &str) -> Self {
        Self {
            cache,
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            default_expiry: DEFAULT_EXPIRY,
        }
    }

    pub fn with_default_expiry(mut self, expiry: Duration) -> Self {
        self.default_expiry = expiry;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = cache;
        self
    }

    /// Issue a credential for `tenant_id` carrying `payload`.
    ///
    /// `allowed_uses` limits how many times it verifies successfully.
    pub async fn issue(
        &self,
        tenant_id: &str,
        payload: Value,
        expiry: Option<Duration>,
        allowed_uses: Option<i64>,
    ) -> Result<String, TaskError> {
        let expiry = expiry.filter(|d| !d.is_zero()).unwrap_or(self.default_expiry);
        let expiry_secs = expiry.as_secs().max(1);
        let now = Utc::now().timestamp();

        let claims = Claims {
            sub: tenant_id.to_string(),
            jti: random_string(TOKEN_ID_LENGTH),
            payload,
            iat: now,
            exp: now + expiry_secs as i64,
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;

        let status = allowed_uses
            .map(|n| n.to_string())
            .unwrap_or_else(|| ACTIVE.to_string());
        self.cache
            .set(
                &token_key(tenant_id, &claims.jti),
                &status,
                Some(Duration::from_secs(expiry_secs)),
            )
            .await?;

        Ok(token)
    }

    fn decode(&self, token: &str) -> Result<Claims, TaskError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)?;
        if data.claims.sub.is_empty() {
            return Err(TaskError::Token("invalid token subject".to_string()));
        }
        Ok(data.claims)
    }

    /// Verify a credential, consuming one use of a limited credential.
    pub async fn verify(&self, token: &str) -> Result<Claims, TaskError> {
        let claims = self.decode(token)?;
        let key = token_key(&claims.sub, &claims.jti);

        match self.cache.get(&key).await? {
            Some(status) if status == ACTIVE => Ok(claims),
            Some(status) if status.parse::<i64>().is_ok() => {
                let remaining = self.cache.decr(&key).await?;
                if remaining <= 0 {
                    self.cache.del(&key).await?;
                }
                if remaining < 0 {
                    return Err(TaskError::Token("token has no remaining uses".to_string()));
                }
                Ok(claims)
            }
            _ => Err(TaskError::Token("token is not active".to_string())),
        }
    }

    /// Revoke a credential. Returns whether it was active.
    pub async fn revoke(&self, token: &str) -> Result<bool, TaskError> {
        let claims = self.decode(token)?;
        Ok(self.cache.del(&token_key(&claims.sub, &claims.jti)).await?)
    }
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("default_expiry", &self.default_expiry)
            .finish_non_exhaustive()
    }
}
