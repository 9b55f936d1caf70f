use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_ORIGINAL_URL_HEADER: &str = "X-Original-URL";
pub const DEFAULT_REQUIRED_ROLE: &str = "roles/iap.httpsResourceAccessor";

// Gatehouse configuration sourced from environment variables, with an
// optional YAML override file for ops-friendly deployments.
#[derive(Debug, Clone)]
pub struct GatehouseConfig {
    // Bind address for the auth endpoint.
    pub bind_addr: SocketAddr,
    // Metrics HTTP bind address.
    pub metrics_bind: SocketAddr,
    // Header carrying the original request URL.
    pub original_url_header: String,
    // Cadence for re-fetching the shared public certs.
    pub public_certs_refresh_interval: Duration,
    // Sweep cadence for the per-issuer JWKS cache.
    pub jwks_cache_clean_interval: Duration,
    // Sweep cadence for the verified-JWT cache.
    pub jwt_cache_clean_interval: Duration,
    // Cadence for rebuilding the policy projection.
    pub policy_refresh_interval: Duration,
    // Clock-skew tolerance for token claims.
    pub jwt_leeway_seconds: u64,
    // The role whose bindings authorize access.
    pub required_role: String,
    // Cloud project holding the policy.
    pub project: String,
}

#[derive(Debug, Deserialize)]
struct GatehouseConfigOverride {
    bind_addr: Option<String>,
    metrics_bind: Option<String>,
    original_url_header: Option<String>,
    public_certs_refresh_interval_seconds: Option<u64>,
    jwks_cache_clean_interval_seconds: Option<u64>,
    jwt_cache_clean_interval_seconds: Option<u64>,
    policy_refresh_interval_seconds: Option<u64>,
    jwt_leeway_seconds: Option<u64>,
    required_role: Option<String>,
    project: Option<String>,
}

impl GatehouseConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = std::env::var("GATEHOUSE_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse GATEHOUSE_BIND")?;
        let metrics_bind = std::env::var("GATEHOUSE_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:9090".to_string())
            .parse()
            .with_context(|| "parse GATEHOUSE_METRICS_BIND")?;
        let original_url_header = std::env::var("GATEHOUSE_ORIGINAL_URL_HEADER")
            .unwrap_or_else(|_| DEFAULT_ORIGINAL_URL_HEADER.to_string());
        let required_role = std::env::var("GATEHOUSE_REQUIRED_ROLE")
            .unwrap_or_else(|_| DEFAULT_REQUIRED_ROLE.to_string());
        // The project has no sensible default; policy lookups are scoped to it.
        let project =
            std::env::var("GATEHOUSE_PROJECT").with_context(|| "GATEHOUSE_PROJECT must be set")?;
        Ok(Self {
            bind_addr,
            metrics_bind,
            original_url_header,
            public_certs_refresh_interval: env_seconds("GATEHOUSE_PUBLIC_CERTS_REFRESH_INTERVAL", 180)?,
            jwks_cache_clean_interval: env_seconds("GATEHOUSE_JWKS_CACHE_CLEAN_INTERVAL", 300)?,
            jwt_cache_clean_interval: env_seconds("GATEHOUSE_JWT_CACHE_CLEAN_INTERVAL", 300)?,
            policy_refresh_interval: env_seconds("GATEHOUSE_POLICY_REFRESH_INTERVAL", 300)?,
            jwt_leeway_seconds: env_u64("GATEHOUSE_JWT_LEEWAY_SECONDS", 60)?,
            required_role,
            project,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("GATEHOUSE_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read GATEHOUSE_CONFIG: {path}"))?;
            let override_cfg: GatehouseConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse gatehouse config yaml")?;
            if let Some(value) = override_cfg.bind_addr {
                config.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.original_url_header {
                config.original_url_header = value;
            }
            if let Some(value) = override_cfg.public_certs_refresh_interval_seconds {
                config.public_certs_refresh_interval = Duration::from_secs(value);
            }
            if let Some(value) = override_cfg.jwks_cache_clean_interval_seconds {
                config.jwks_cache_clean_interval = Duration::from_secs(value);
            }
            if let Some(value) = override_cfg.jwt_cache_clean_interval_seconds {
                config.jwt_cache_clean_interval = Duration::from_secs(value);
            }
            if let Some(value) = override_cfg.policy_refresh_interval_seconds {
                config.policy_refresh_interval = Duration::from_secs(value);
            }
            if let Some(value) = override_cfg.jwt_leeway_seconds {
                config.jwt_leeway_seconds = value;
            }
            if let Some(value) = override_cfg.required_role {
                config.required_role = value;
            }
            if let Some(value) = override_cfg.project {
                config.project = value;
            }
        }
        Ok(config)
    }
}

fn env_seconds(key: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_u64(key, default)?))
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(value) => value.parse().with_context(|| format!("parse {key}")),
        Err(_) => Ok(default),
    }
}
