// Gatehouse (HTTP)
// ----------------
// External authentication endpoint for a reverse proxy's auth_request
// directive. The proxy forwards the original request's authorization header
// and URL; this service answers 200 (forward it) or 407 (reject it) by:
// - verifying the bearer JWT against Google's rotating signing keys
//   (shared public certs for ID tokens, per-service-account JWKS for
//   self-signed JWTs),
// - projecting IAM policy bindings for one role in one project, with
//   transitive group expansion, refreshed in the background,
// - evaluating conditional bindings as CEL expressions over the request
//   path, host, and time.
//
// Caching model:
// - Verified (token, audience) pairs are cached until the token's own
//   expiry and swept periodically; a cached subject is re-checked against
//   expiry on every hit.
// - Per-issuer JWKS sets live in an expiry cache keyed by issuer; the
//   shared certs set is swapped wholesale on a refresh interval.
// - Policy snapshots are rebuilt off-path and swapped atomically; requests
//   never wait on a refresh.
//
// All caches are in-memory only; a restart starts cold.
use anyhow::Context;
use gatehouse::app::{AppState, build_router};
use gatehouse::auth::decision::Authenticator;
use gatehouse::auth::keys::{HttpKeyFetcher, KeySourceConfig, TokenKeySource};
use gatehouse::auth::policy::PolicyProjection;
use gatehouse::auth::verifier::TokenVerifier;
use gatehouse::config::GatehouseConfig;
use gatehouse::google::{
    CloudIdentityWorkspaceReader, MetadataTokenProvider, ResourceManagerPolicyReader,
};
use gatehouse::observability;
use gatehouse_cache::ExpiryCache;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let metrics_handle = observability::init_observability();
    let config = GatehouseConfig::from_env_or_yaml().context("gatehouse config")?;

    tracing::info!("starting workspace membership client");
    let tokens = Arc::new(MetadataTokenProvider::new());
    let workspace = Arc::new(CloudIdentityWorkspaceReader::new(tokens.clone()));

    tracing::info!(project = %config.project, role = %config.required_role, "starting project policy projection");
    let policy_reader = Arc::new(ResourceManagerPolicyReader::new(tokens.clone()));
    let policy = Arc::new(
        PolicyProjection::new(
            policy_reader,
            workspace,
            config.required_role.clone(),
            config.project.clone(),
            config.policy_refresh_interval,
        )
        .await,
    );

    tracing::info!("starting token verification service");
    let key_source = Arc::new(
        TokenKeySource::new(
            Arc::new(HttpKeyFetcher::new()),
            KeySourceConfig {
                refresh_interval: config.public_certs_refresh_interval,
                ..KeySourceConfig::default()
            },
            ExpiryCache::new(config.jwks_cache_clean_interval),
        )
        .await,
    );
    let verifier = TokenVerifier::new(key_source.clone(), config.jwt_leeway_seconds);
    let jwt_cache = Arc::new(ExpiryCache::new(config.jwt_cache_clean_interval));
    let authenticator = Arc::new(Authenticator::new(verifier, policy.clone(), jwt_cache.clone()));

    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let state = AppState {
        authenticator,
        original_url_header: config.original_url_header.clone(),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "gatehouse listening");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight decisions have drained; stop the background workers.
    tracing::info!("shutting down background refreshers");
    policy.shutdown().await;
    key_source.shutdown().await;
    jwt_cache.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
