use thiserror::Error;

/// Internal failure taxonomy for the auth pipeline. Every kind collapses to
/// a body-less 407 at the HTTP surface; the kind only controls logging.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed token: {0}")]
    MalformedToken(String),
    #[error("token cannot be verified: {0}")]
    UnverifiableToken(String),
    #[error("bad signature: {0}")]
    BadSignature(String),
    #[error("token expired")]
    ExpiredToken,
    #[error("audience mismatch: expected {expected}, got {actual}")]
    BadAudience { expected: String, actual: String },
    #[error("bad claims: {0}")]
    BadClaims(String),
    #[error("original url rejected: {0}")]
    BadRequestUrl(String),
    #[error("policy snapshot not available")]
    PolicyUnavailable,
    #[error("no role bindings for principal {0}")]
    NotAuthorized(String),
    #[error("conditional binding {title} evaluated to false")]
    ConditionFailed { title: String },
    #[error("expression failed to compile: {0}")]
    BadExpression(String),
    #[error("expression evaluation failed: {0}")]
    ExpressionError(String),
    #[error("key source unavailable: {0}")]
    KeySourceUnavailable(String),
}

impl AuthError {
    /// Token-shaped failures log at debug; policy and expression failures
    /// log at warn.
    pub fn logs_at_warn(&self) -> bool {
        matches!(
            self,
            AuthError::PolicyUnavailable
                | AuthError::NotAuthorized(_)
                | AuthError::ConditionFailed { .. }
                | AuthError::BadExpression(_)
                | AuthError::ExpressionError(_)
        )
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
