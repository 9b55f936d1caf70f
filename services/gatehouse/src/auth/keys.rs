use crate::auth::error::{AuthError, AuthResult};
use crate::auth::token::{TokenKind, unix_now};
use async_trait::async_trait;
use gatehouse_cache::{CacheEntry, ExpiryCache, SingleFlight};
use jsonwebtoken::jwk::{Jwk, JwkSet, KeyAlgorithm};
use jsonwebtoken::{Algorithm, DecodingKey};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

const DEFAULT_STATIC_CERTS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const DEFAULT_ISSUER_JWKS_BASE_URL: &str = "https://www.googleapis.com/service_accounts/v1/jwk";
const STATIC_FLIGHT_KEY: &str = "static-certs";

/// Which key source a token verifies against, with the per-issuer identity
/// when applicable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
    StaticCerts,
    IssuerJwks(String),
}

impl KeySelector {
    pub fn for_token(kind: TokenKind, issuer: &str) -> Self {
        match kind {
            TokenKind::IdToken => KeySelector::StaticCerts,
            TokenKind::ServiceAccountJwt => KeySelector::IssuerJwks(issuer.to_string()),
        }
    }
}

/// A single verification key. Immutable once built; rotation replaces the
/// whole map for a source.
#[derive(Clone)]
pub struct PublicKey {
    pub kid: String,
    pub alg: Algorithm,
    pub key: DecodingKey,
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("kid", &self.kid)
            .field("alg", &self.alg)
            .finish()
    }
}

pub type KeyMap = Arc<HashMap<String, Arc<PublicKey>>>;

/// One fetch of a key set, with the transport-provided freshness when the
/// endpoint sent one.
pub struct FetchedKeys {
    pub keys: KeyMap,
    pub max_age: Option<Duration>,
}

#[async_trait]
pub trait KeyFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchedKeys>;
}

/// Fetches JWKS documents over HTTPS and reads `Cache-Control: max-age`.
pub struct HttpKeyFetcher {
    client: reqwest::Client,
}

impl HttpKeyFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "failed to build key-fetch client, using defaults");
                reqwest::Client::new()
            });
        Self { client }
    }
}

impl Default for HttpKeyFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyFetcher for HttpKeyFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchedKeys> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("key endpoint {url} returned {}", response.status());
        }
        let max_age = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_max_age);
        let jwks: JwkSet = response.json().await?;
        Ok(FetchedKeys {
            keys: key_map_from_jwks(&jwks)?,
            max_age,
        })
    }
}

fn parse_max_age(cache_control: &str) -> Option<Duration> {
    cache_control
        .split(',')
        .filter_map(|directive| directive.trim().strip_prefix("max-age="))
        .find_map(|seconds| seconds.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn key_map_from_jwks(jwks: &JwkSet) -> anyhow::Result<KeyMap> {
    let mut keys = HashMap::new();
    for jwk in &jwks.keys {
        let Some(kid) = jwk.common.key_id.clone() else {
            // A key we cannot address by id is a key we can never select.
            continue;
        };
        let key = DecodingKey::from_jwk(jwk)
            .map_err(|err| anyhow::anyhow!("jwk {kid} rejected: {err}"))?;
        keys.insert(
            kid.clone(),
            Arc::new(PublicKey {
                kid,
                alg: jwk_algorithm(jwk),
                key,
            }),
        );
    }
    Ok(Arc::new(keys))
}

fn jwk_algorithm(jwk: &Jwk) -> Algorithm {
    match jwk.common.key_algorithm {
        Some(KeyAlgorithm::RS256) | None => Algorithm::RS256,
        Some(KeyAlgorithm::RS384) => Algorithm::RS384,
        Some(KeyAlgorithm::RS512) => Algorithm::RS512,
        Some(KeyAlgorithm::ES256) => Algorithm::ES256,
        Some(KeyAlgorithm::ES384) => Algorithm::ES384,
        Some(_) => Algorithm::RS256,
    }
}

pub struct KeySourceConfig {
    pub static_certs_url: String,
    pub issuer_jwks_base_url: String,
    pub refresh_interval: Duration,
    pub default_jwks_ttl: Duration,
}

impl Default for KeySourceConfig {
    fn default() -> Self {
        Self {
            static_certs_url: DEFAULT_STATIC_CERTS_URL.to_string(),
            issuer_jwks_base_url: DEFAULT_ISSUER_JWKS_BASE_URL.to_string(),
            refresh_interval: Duration::from_secs(180),
            default_jwks_ttl: Duration::from_secs(3600),
        }
    }
}

/// Supplies verification keys from the two source kinds.
///
/// The static certs set is refreshed on an interval and swapped wholesale;
/// a failed refresh keeps the previous set. Per-issuer JWKS sets are
/// fetched on demand, cached with their transport freshness (or a default
/// TTL), and cold fetches for the same issuer collapse to one request.
pub struct TokenKeySource {
    fetcher: Arc<dyn KeyFetcher>,
    config: KeySourceConfig,
    static_keys: Arc<RwLock<KeyMap>>,
    issuer_keys: ExpiryCache<KeyMap>,
    inflight: SingleFlight<KeyMap>,
    stop: watch::Sender<bool>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl TokenKeySource {
    /// Build the source, attempt an initial static fetch, and start the
    /// refresher. A failed initial fetch leaves the set empty; the first
    /// request will retry through the single-flight path.
    pub async fn new(
        fetcher: Arc<dyn KeyFetcher>,
        config: KeySourceConfig,
        issuer_keys: ExpiryCache<KeyMap>,
    ) -> Self {
        let static_keys: Arc<RwLock<KeyMap>> = Arc::new(RwLock::new(Arc::new(HashMap::new())));

        match fetcher.fetch(&config.static_certs_url).await {
            Ok(fetched) => {
                *static_keys.write().await = fetched.keys;
            }
            Err(err) => {
                tracing::warn!(error = %err, url = %config.static_certs_url, "initial public certs fetch failed");
            }
        }

        let (stop, mut stopped) = watch::channel(false);
        let refresher = {
            let fetcher = fetcher.clone();
            let url = config.static_certs_url.clone();
            let slot = static_keys.clone();
            let period = config.refresh_interval;
            tokio::spawn(async move {
                let start = tokio::time::Instant::now() + period;
                let mut ticker = tokio::time::interval_at(start, period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => match fetcher.fetch(&url).await {
                            Ok(fetched) => {
                                let count = fetched.keys.len();
                                *slot.write().await = fetched.keys;
                                metrics::counter!("gatehouse_key_refresh_total", "source" => "static", "outcome" => "ok").increment(1);
                                tracing::debug!(count, "public certs refreshed");
                            }
                            Err(err) => {
                                // Keep serving the previous set.
                                metrics::counter!("gatehouse_key_refresh_total", "source" => "static", "outcome" => "error").increment(1);
                                tracing::warn!(error = %err, "public certs refresh failed, retaining previous keys");
                            }
                        },
                        _ = stopped.changed() => break,
                    }
                }
            })
        };

        Self {
            fetcher,
            config,
            static_keys,
            issuer_keys,
            inflight: SingleFlight::new(),
            stop,
            refresher: Mutex::new(Some(refresher)),
        }
    }

    /// Current key set for a source, fetching if nothing usable is cached.
    pub async fn keys(&self, selector: &KeySelector) -> AuthResult<KeyMap> {
        match selector {
            KeySelector::StaticCerts => {
                let current = self.static_keys.read().await.clone();
                if !current.is_empty() {
                    return Ok(current);
                }
                // Cold start with a failed initial fetch: retry once here
                // instead of waiting out a refresh interval.
                self.inflight
                    .run(STATIC_FLIGHT_KEY, || async {
                        let fetched =
                            self.fetcher
                                .fetch(&self.config.static_certs_url)
                                .await
                                .map_err(|err| {
                                    AuthError::KeySourceUnavailable(format!(
                                        "public certs fetch failed: {err}"
                                    ))
                                })?;
                        *self.static_keys.write().await = fetched.keys.clone();
                        Ok(fetched.keys)
                    })
                    .await
            }
            KeySelector::IssuerJwks(issuer) => {
                if let Some(entry) = self.issuer_keys.get(issuer)
                    && entry.exp > unix_now()
                {
                    return Ok(entry.value);
                }
                let url = format!("{}/{issuer}", self.config.issuer_jwks_base_url);
                self.inflight
                    .run(issuer, || async {
                        let fetched = self.fetcher.fetch(&url).await.map_err(|err| {
                            AuthError::KeySourceUnavailable(format!(
                                "jwks fetch for {issuer} failed: {err}"
                            ))
                        })?;
                        let ttl = fetched.max_age.unwrap_or(self.config.default_jwks_ttl);
                        self.issuer_keys.set(
                            issuer,
                            CacheEntry {
                                value: fetched.keys.clone(),
                                exp: unix_now() + ttl.as_secs() as i64,
                            },
                        );
                        Ok(fetched.keys)
                    })
                    .await
            }
        }
    }

    /// Convenience lookup of one key by id.
    pub async fn key(&self, selector: &KeySelector, kid: &str) -> AuthResult<Arc<PublicKey>> {
        let keys = self.keys(selector).await?;
        keys.get(kid)
            .cloned()
            .ok_or_else(|| AuthError::UnverifiableToken(format!("no key with id {kid}")))
    }

    /// Stop the refresher and the per-issuer cache sweeper.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.refresher.lock().await.take() {
            let _ = handle.await;
        }
        self.issuer_keys.shutdown().await;
    }
}
