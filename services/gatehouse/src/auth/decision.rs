use crate::auth::error::{AuthError, AuthResult};
use crate::auth::expression::{ConditionEvaluator, RequestParams};
use crate::auth::policy::PolicyProjection;
use crate::auth::token::unix_now;
use crate::auth::verifier::TokenVerifier;
use axum::http::Uri;
use gatehouse_cache::{CacheEntry, ExpiryCache};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Per-request orchestration: JWT cache probe, verification on miss,
/// policy lookup, conditional-binding evaluation.
///
/// The cached subject is a short-lived capability: it is trusted only while
/// `entry.exp > now` holds, where `exp` is the verified token's own expiry.
/// Anything at or past expiry goes through full verification again.
pub struct Authenticator {
    verifier: TokenVerifier,
    policy: Arc<PolicyProjection>,
    conditions: ConditionEvaluator,
    jwt_cache: Arc<ExpiryCache<String>>,
}

impl Authenticator {
    pub fn new(
        verifier: TokenVerifier,
        policy: Arc<PolicyProjection>,
        jwt_cache: Arc<ExpiryCache<String>>,
    ) -> Self {
        Self {
            verifier,
            policy,
            conditions: ConditionEvaluator::new(),
            jwt_cache,
        }
    }

    /// Decide a request. `Ok` carries the authorized principal; every error
    /// kind maps to a deny at the HTTP surface.
    pub async fn authorize(&self, token: &str, original_url: &Uri) -> AuthResult<String> {
        let scheme = original_url
            .scheme_str()
            .ok_or_else(|| AuthError::BadRequestUrl("missing scheme".to_string()))?;
        let authority = original_url
            .authority()
            .ok_or_else(|| AuthError::BadRequestUrl("missing host".to_string()))?
            .to_string();
        let audience = format!("{scheme}://{authority}");
        let now = unix_now();

        let key = cache_key(token, &audience);
        let email = match self.jwt_cache.get(&key) {
            Some(entry) if entry.exp > now => {
                metrics::counter!("gatehouse_jwt_cache_total", "outcome" => "hit").increment(1);
                entry.value
            }
            cached => {
                let outcome = if cached.is_some() { "stale" } else { "miss" };
                metrics::counter!("gatehouse_jwt_cache_total", "outcome" => outcome).increment(1);
                let verified = self.verifier.verify(token, &audience).await?;
                let cache = self.jwt_cache.clone();
                let email = verified.email.clone();
                let entry = CacheEntry {
                    value: verified.email,
                    exp: verified.expires_at,
                };
                // Insert off the response path; a pre-write reader simply
                // verifies in full.
                tokio::spawn(async move {
                    cache.set(&key, entry);
                });
                email
            }
        };

        let bindings = self.policy.bindings_for(&email).await?;
        if bindings.len() == 1 && bindings[0].expression.is_none() {
            return Ok(email);
        }

        tracing::debug!(principal = %email, bindings = bindings.len(), "evaluating conditional bindings");
        let params = RequestParams {
            path: original_url.path().to_string(),
            host: authority,
            time: now,
        };
        // Every conditional binding must hold; unconditional bindings in the
        // mix are vacuously true and never short-circuit an allow.
        for binding in &bindings {
            let Some(expression) = binding.expression.as_deref() else {
                continue;
            };
            match self.conditions.evaluate(expression, &params) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(AuthError::ConditionFailed {
                        title: binding.title.clone(),
                    });
                }
                Err(AuthError::BadExpression(message)) => {
                    return Err(AuthError::BadExpression(format!(
                        "binding {}: {message}",
                        binding.title
                    )));
                }
                Err(AuthError::ExpressionError(message)) => {
                    return Err(AuthError::ExpressionError(format!(
                        "binding {}: {message}",
                        binding.title
                    )));
                }
                Err(other) => return Err(other),
            }
        }

        Ok(email)
    }
}

/// Caches are object-identity-free: the key is the hex SHA-256 of
/// `token ":" audience`.
pub(crate) fn cache_key(token: &str, audience: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(b":");
    hasher.update(audience.as_bytes());
    hex::encode(hasher.finalize())
}
