use crate::auth::error::{AuthError, AuthResult};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Issuers of Google-signed ID tokens, served from the shared certs
/// endpoint. Both spellings occur in the wild.
pub const ID_TOKEN_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];

/// Self-signed service-account JWTs carry the account email as issuer.
pub const SERVICE_ACCOUNT_ISSUER_SUFFIX: &str = ".gserviceaccount.com";

/// Where a token's signing key lives, decided from its claims alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Google-issued ID token, verified against the shared public certs.
    IdToken,
    /// Self-signed service-account JWT, verified against the account's own
    /// JWKS endpoint.
    ServiceAccountJwt,
}

/// Claims we read before and after signature verification. Everything is
/// optional except `iss` so that malformed payloads fail as claim errors
/// rather than deserialization errors.
#[derive(Debug, Clone, Deserialize)]
pub struct RawClaims {
    pub iss: String,
    #[serde(default)]
    pub aud: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub exp: Option<i64>,
}

/// The semantic projection of a token that passed full verification.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub email: String,
    pub issuer: String,
    pub audience: String,
    pub kid: String,
    pub kind: TokenKind,
    pub issued_at: i64,
    pub expires_at: i64,
}

/// Decode the payload segment without trusting the signature. Classification
/// and key-source selection need the issuer before any key is available.
pub fn peek_claims(token: &str) -> AuthResult<RawClaims> {
    let mut segments = token.split('.');
    let _header = segments
        .next()
        .ok_or_else(|| AuthError::MalformedToken("empty token".to_string()))?;
    let payload = segments
        .next()
        .ok_or_else(|| AuthError::MalformedToken("missing payload segment".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| AuthError::MalformedToken("payload is not base64url".to_string()))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| AuthError::MalformedToken(format!("payload is not a claim set: {err}")))
}

/// Classify a token from its issuer claim. Unknown issuers are unverifiable:
/// there is no key source to consult for them.
pub fn classify(claims: &RawClaims) -> AuthResult<TokenKind> {
    if ID_TOKEN_ISSUERS.contains(&claims.iss.as_str()) {
        return Ok(TokenKind::IdToken);
    }
    if claims.iss.ends_with(SERVICE_ACCOUNT_ISSUER_SUFFIX) {
        return Ok(TokenKind::ServiceAccountJwt);
    }
    Err(AuthError::UnverifiableToken(format!(
        "unsupported issuer {}",
        claims.iss
    )))
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64
}
