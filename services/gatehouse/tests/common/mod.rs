//! Shared fixtures for gatehouse integration tests: a local JWKS server
//! standing in for Google's key endpoints, token minting, and in-memory
//! policy/workspace readers.
use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use gatehouse::app::{AppState, build_router};
use gatehouse::auth::decision::Authenticator;
use gatehouse::auth::keys::{HttpKeyFetcher, KeySourceConfig, TokenKeySource};
use gatehouse::auth::policy::{MemberBinding, PolicyProjection, PolicyReader, WorkspaceReader};
use gatehouse::auth::verifier::TokenVerifier;
use gatehouse::config::DEFAULT_ORIGINAL_URL_HEADER;
use gatehouse_cache::ExpiryCache;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const KID: &str = "it-key-1";
pub const REQUIRED_ROLE: &str = "roles/iap.httpsResourceAccessor";
pub const PROJECT: &str = "it-project";

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64
}

/// A local stand-in for Google's key endpoints: the same JWKS document is
/// served as the shared certs set and as every issuer's own key set.
pub struct TestIdp {
    addr: SocketAddr,
    private_pem: String,
}

impl TestIdp {
    pub async fn spawn() -> Self {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("key");
        let public = RsaPublicKey::from(&key);
        let private_pem = key
            .to_pkcs1_pem(Default::default())
            .expect("pem")
            .to_string();

        let jwks = serde_json::json!({
            "keys": [{
                "kty": "RSA",
                "kid": KID,
                "alg": "RS256",
                "use": "sig",
                "n": URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
                "e": URL_SAFE_NO_PAD.encode(public.e().to_bytes_be())
            }]
        });

        async fn serve_jwks(State(jwks): State<Arc<serde_json::Value>>) -> axum::Json<serde_json::Value> {
            axum::Json(jwks.as_ref().clone())
        }

        let app = Router::new()
            .route("/certs", get(serve_jwks))
            .route("/jwk/:issuer", get(serve_jwks))
            .with_state(Arc::new(jwks));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });

        Self { addr, private_pem }
    }

    pub fn key_source_config(&self) -> KeySourceConfig {
        KeySourceConfig {
            static_certs_url: format!("http://{}/certs", self.addr),
            issuer_jwks_base_url: format!("http://{}/jwk", self.addr),
            refresh_interval: Duration::from_secs(3600),
            default_jwks_ttl: Duration::from_secs(3600),
        }
    }

    pub fn mint(&self, issuer: &str, audience: &str, email: &str) -> String {
        self.mint_with_validity(issuer, audience, email, 0, 300)
    }

    pub fn mint_with_validity(
        &self,
        issuer: &str,
        audience: &str,
        email: &str,
        iat_offset: i64,
        exp_offset: i64,
    ) -> String {
        let now = unix_now();
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(KID.to_string());
        let claims = serde_json::json!({
            "iss": issuer,
            "aud": audience,
            "email": email,
            "sub": "1234567890",
            "iat": now + iat_offset,
            "exp": now + exp_offset
        });
        jsonwebtoken::encode(
            &header,
            &claims,
            &EncodingKey::from_rsa_pem(self.private_pem.as_bytes()).expect("key"),
        )
        .expect("token")
    }
}

pub struct FakePolicyReader {
    records: Vec<MemberBinding>,
}

#[async_trait]
impl PolicyReader for FakePolicyReader {
    async fn bindings_for_role(
        &self,
        _role: &str,
        _project: &str,
    ) -> anyhow::Result<Vec<MemberBinding>> {
        Ok(self.records.clone())
    }
}

pub struct FakeWorkspaceReader {
    groups: HashMap<String, Vec<String>>,
}

#[async_trait]
impl WorkspaceReader for FakeWorkspaceReader {
    async fn members_of_group(&self, group: &str) -> anyhow::Result<Vec<String>> {
        self.groups
            .get(group)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown group {group}"))
    }
}

pub fn binding(member: &str, title: &str, expression: Option<&str>) -> MemberBinding {
    MemberBinding {
        member: member.to_string(),
        title: title.to_string(),
        expression: expression.map(str::to_string),
    }
}

/// A router wired exactly like the binary, but against the test IdP and
/// in-memory policy data.
pub async fn build_app(
    idp: &TestIdp,
    bindings: Vec<MemberBinding>,
    groups: HashMap<String, Vec<String>>,
) -> Router {
    let policy = Arc::new(
        PolicyProjection::new(
            Arc::new(FakePolicyReader { records: bindings }),
            Arc::new(FakeWorkspaceReader { groups }),
            REQUIRED_ROLE.to_string(),
            PROJECT.to_string(),
            Duration::from_secs(3600),
        )
        .await,
    );
    let key_source = Arc::new(
        TokenKeySource::new(
            Arc::new(HttpKeyFetcher::new()),
            idp.key_source_config(),
            ExpiryCache::new(Duration::from_secs(3600)),
        )
        .await,
    );
    let verifier = TokenVerifier::new(key_source, 60);
    let jwt_cache = Arc::new(ExpiryCache::new(Duration::from_secs(3600)));
    let state = AppState {
        authenticator: Arc::new(Authenticator::new(verifier, policy, jwt_cache)),
        original_url_header: DEFAULT_ORIGINAL_URL_HEADER.to_string(),
    };
    build_router(state)
}

pub fn auth_request(token: &str, original_url: &str) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .uri("/auth")
        .header("X-Forwarded-Authorization", format!("Bearer:{token}"))
        .header(DEFAULT_ORIGINAL_URL_HEADER, original_url)
        .body(axum::body::Body::empty())
        .expect("request")
}
