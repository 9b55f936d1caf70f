use crate::auth::error::{AuthError, AuthResult};
use crate::auth::keys::{KeySelector, TokenKeySource};
use crate::auth::token::{RawClaims, VerifiedToken, classify, peek_claims, unix_now};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use std::collections::HashSet;
use std::sync::Arc;

pub const DEFAULT_LEEWAY_SECONDS: u64 = 60;

/// Stateless JWT verification: parse, classify, resolve the key, check the
/// signature under the algorithm allowlist, then the standard claims.
///
/// Claim checks are done by hand rather than through `Validation` flags so
/// each failure maps to its own error kind; `Validation` still enforces the
/// signature and the declared algorithm.
pub struct TokenVerifier {
    keys: Arc<TokenKeySource>,
    leeway: i64,
    allowed_algorithms: Vec<Algorithm>,
}

impl TokenVerifier {
    pub fn new(keys: Arc<TokenKeySource>, leeway_seconds: u64) -> Self {
        Self {
            keys,
            leeway: leeway_seconds as i64,
            allowed_algorithms: vec![Algorithm::RS256],
        }
    }

    pub async fn verify(&self, token: &str, audience: &str) -> AuthResult<VerifiedToken> {
        let header =
            decode_header(token).map_err(|err| AuthError::MalformedToken(err.to_string()))?;
        let unverified = peek_claims(token)?;
        let kind = classify(&unverified)?;
        let selector = KeySelector::for_token(kind, &unverified.iss);

        let kid = header
            .kid
            .ok_or_else(|| AuthError::MalformedToken("missing kid header".to_string()))?;
        let key = self.keys.key(&selector, &kid).await.map_err(|err| match err {
            // A source we cannot reach is indistinguishable, for the caller,
            // from a token we cannot verify.
            AuthError::KeySourceUnavailable(message) => AuthError::UnverifiableToken(message),
            other => other,
        })?;

        if !self.allowed_algorithms.contains(&header.alg) {
            return Err(AuthError::BadSignature(format!(
                "algorithm {:?} is not permitted",
                header.alg
            )));
        }

        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();
        let claims = decode::<RawClaims>(token, &key.key, &validation)
            .map_err(|err| match err.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    AuthError::BadSignature(err.to_string())
                }
                _ => AuthError::MalformedToken(err.to_string()),
            })?
            .claims;

        self.check_claims(&claims, audience)?;
        let email = claims
            .email
            .filter(|email| !email.is_empty())
            .ok_or_else(|| AuthError::BadClaims("missing email claim".to_string()))?;

        Ok(VerifiedToken {
            email,
            issuer: claims.iss,
            audience: audience.to_string(),
            kid,
            kind,
            issued_at: claims.iat.unwrap_or_default(),
            expires_at: claims.exp.unwrap_or_default(),
        })
    }

    fn check_claims(&self, claims: &RawClaims, audience: &str) -> AuthResult<()> {
        let now = unix_now();
        let iat = claims
            .iat
            .ok_or_else(|| AuthError::BadClaims("missing iat claim".to_string()))?;
        if iat > now + self.leeway {
            return Err(AuthError::BadClaims("token issued in the future".to_string()));
        }
        let exp = claims
            .exp
            .ok_or_else(|| AuthError::BadClaims("missing exp claim".to_string()))?;
        if exp + self.leeway <= now {
            return Err(AuthError::ExpiredToken);
        }
        // Exact, case-sensitive audience match.
        match claims.aud.as_deref() {
            Some(aud) if aud == audience => Ok(()),
            Some(aud) => Err(AuthError::BadAudience {
                expected: audience.to_string(),
                actual: aud.to_string(),
            }),
            None => Err(AuthError::BadClaims("missing aud claim".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::keys::{FetchedKeys, KeyFetcher, KeySourceConfig, PublicKey, TokenKeySource};
    use crate::auth::token::TokenKind;
    use async_trait::async_trait;
    use gatehouse_cache::ExpiryCache;
    use jsonwebtoken::{DecodingKey, EncodingKey, Header};
    use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey};
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::OnceLock;
    use std::time::Duration;

    const AUDIENCE: &str = "https://api.example";
    const SA_ISSUER: &str = "svc@p.iam.gserviceaccount.com";
    const KID: &str = "kid-1";

    struct TestKeys {
        private_pem: String,
        public_pem: String,
    }

    fn test_keys() -> &'static TestKeys {
        static KEYS: OnceLock<TestKeys> = OnceLock::new();
        KEYS.get_or_init(|| {
            let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("key");
            let public = RsaPublicKey::from(&key);
            TestKeys {
                private_pem: key.to_pkcs1_pem(Default::default()).expect("pem").to_string(),
                public_pem: public.to_pkcs1_pem(Default::default()).expect("pem"),
            }
        })
    }

    struct PemFetcher;

    #[async_trait]
    impl KeyFetcher for PemFetcher {
        async fn fetch(&self, _url: &str) -> anyhow::Result<FetchedKeys> {
            let mut keys = HashMap::new();
            keys.insert(
                KID.to_string(),
                Arc::new(PublicKey {
                    kid: KID.to_string(),
                    alg: Algorithm::RS256,
                    key: DecodingKey::from_rsa_pem(test_keys().public_pem.as_bytes())?,
                }),
            );
            Ok(FetchedKeys {
                keys: Arc::new(keys),
                max_age: None,
            })
        }
    }

    async fn test_verifier() -> (TokenVerifier, Arc<TokenKeySource>) {
        let source = Arc::new(
            TokenKeySource::new(
                Arc::new(PemFetcher),
                KeySourceConfig {
                    static_certs_url: "http://127.0.0.1:1/certs".to_string(),
                    issuer_jwks_base_url: "http://127.0.0.1:1/jwk".to_string(),
                    refresh_interval: Duration::from_secs(3600),
                    default_jwks_ttl: Duration::from_secs(3600),
                },
                ExpiryCache::new(Duration::from_secs(3600)),
            )
            .await,
        );
        (
            TokenVerifier::new(source.clone(), DEFAULT_LEEWAY_SECONDS),
            source,
        )
    }

    fn mint(claims: serde_json::Value) -> String {
        mint_with_kid(claims, KID)
    }

    fn mint_with_kid(claims: serde_json::Value, kid: &str) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());
        jsonwebtoken::encode(
            &header,
            &claims,
            &EncodingKey::from_rsa_pem(test_keys().private_pem.as_bytes()).expect("key"),
        )
        .expect("token")
    }

    fn base_claims() -> serde_json::Value {
        let now = unix_now();
        json!({
            "iss": SA_ISSUER,
            "aud": AUDIENCE,
            "email": SA_ISSUER,
            "sub": "1234567890",
            "iat": now,
            "exp": now + 300
        })
    }

    #[tokio::test]
    async fn verifies_service_account_token() {
        let (verifier, source) = test_verifier().await;
        let token = verifier
            .verify(&mint(base_claims()), AUDIENCE)
            .await
            .expect("verified");
        assert_eq!(token.email, SA_ISSUER);
        assert_eq!(token.kind, TokenKind::ServiceAccountJwt);
        assert_eq!(token.kid, KID);
        assert_eq!(token.audience, AUDIENCE);
        source.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_expired_token() {
        let (verifier, source) = test_verifier().await;
        let mut claims = base_claims();
        claims["iat"] = json!(unix_now() - 600);
        claims["exp"] = json!(unix_now() - 120);
        let err = verifier
            .verify(&mint(claims), AUDIENCE)
            .await
            .expect_err("expired");
        assert!(matches!(err, AuthError::ExpiredToken));
        source.shutdown().await;
    }

    #[tokio::test]
    async fn expiry_within_leeway_is_accepted() {
        let (verifier, source) = test_verifier().await;
        let mut claims = base_claims();
        claims["exp"] = json!(unix_now() - 30);
        verifier
            .verify(&mint(claims), AUDIENCE)
            .await
            .expect("within leeway");
        source.shutdown().await;
    }

    #[tokio::test]
    async fn iat_at_leeway_boundary_is_accepted() {
        let (verifier, source) = test_verifier().await;
        let mut claims = base_claims();
        claims["iat"] = json!(unix_now() + DEFAULT_LEEWAY_SECONDS as i64);
        verifier
            .verify(&mint(claims), AUDIENCE)
            .await
            .expect("boundary iat");
        source.shutdown().await;
    }

    #[tokio::test]
    async fn iat_beyond_leeway_is_rejected() {
        let (verifier, source) = test_verifier().await;
        let mut claims = base_claims();
        claims["iat"] = json!(unix_now() + DEFAULT_LEEWAY_SECONDS as i64 + 5);
        let err = verifier
            .verify(&mint(claims), AUDIENCE)
            .await
            .expect_err("future token");
        assert!(matches!(err, AuthError::BadClaims(_)));
        source.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_audience_mismatch() {
        let (verifier, source) = test_verifier().await;
        let err = verifier
            .verify(&mint(base_claims()), "https://other.example")
            .await
            .expect_err("audience mismatch");
        assert!(matches!(err, AuthError::BadAudience { .. }));
        source.shutdown().await;
    }

    #[tokio::test]
    async fn audience_comparison_is_case_sensitive() {
        let (verifier, source) = test_verifier().await;
        let mut claims = base_claims();
        claims["aud"] = json!("https://API.example");
        let err = verifier
            .verify(&mint(claims), AUDIENCE)
            .await
            .expect_err("case mismatch");
        assert!(matches!(err, AuthError::BadAudience { .. }));
        source.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_missing_email() {
        let (verifier, source) = test_verifier().await;
        let mut claims = base_claims();
        claims.as_object_mut().expect("object").remove("email");
        let err = verifier
            .verify(&mint(claims), AUDIENCE)
            .await
            .expect_err("no email");
        assert!(matches!(err, AuthError::BadClaims(_)));
        source.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_unknown_kid() {
        let (verifier, source) = test_verifier().await;
        let err = verifier
            .verify(&mint_with_kid(base_claims(), "kid-rotated-away"), AUDIENCE)
            .await
            .expect_err("unknown kid");
        assert!(matches!(err, AuthError::UnverifiableToken(_)));
        source.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_tampered_signature() {
        let (verifier, source) = test_verifier().await;
        let token = mint(base_claims());
        let (rest, _signature) = token.rsplit_once('.').expect("segments");
        let forged = format!("{rest}.AAAA");
        let err = verifier
            .verify(&forged, AUDIENCE)
            .await
            .expect_err("bad signature");
        assert!(matches!(err, AuthError::BadSignature(_)));
        source.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_disallowed_algorithm() {
        let (verifier, source) = test_verifier().await;
        // HS256 with the public key bytes as the shared secret: a classic
        // downgrade attempt, cut off by the allowlist before key use.
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(KID.to_string());
        let token = jsonwebtoken::encode(
            &header,
            &base_claims(),
            &EncodingKey::from_secret(test_keys().public_pem.as_bytes()),
        )
        .expect("token");
        let err = verifier
            .verify(&token, AUDIENCE)
            .await
            .expect_err("downgrade");
        assert!(matches!(err, AuthError::BadSignature(_)));
        source.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_malformed_token() {
        let (verifier, source) = test_verifier().await;
        let err = verifier
            .verify("definitely-not-a-jwt", AUDIENCE)
            .await
            .expect_err("malformed");
        assert!(matches!(err, AuthError::MalformedToken(_)));
        source.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_unknown_issuer() {
        let (verifier, source) = test_verifier().await;
        let mut claims = base_claims();
        claims["iss"] = json!("https://unrelated-idp.example");
        let err = verifier
            .verify(&mint(claims), AUDIENCE)
            .await
            .expect_err("unknown issuer");
        assert!(matches!(err, AuthError::UnverifiableToken(_)));
        source.shutdown().await;
    }
}
