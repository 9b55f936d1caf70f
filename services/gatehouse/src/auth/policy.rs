use crate::auth::error::{AuthError, AuthResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

/// One binding as the policy backend reports it: a raw member reference
/// (`user:`, `serviceAccount:`, `group:` ...) plus the condition attached to
/// it, if any.
#[derive(Debug, Clone)]
pub struct MemberBinding {
    pub member: String,
    pub title: String,
    pub expression: Option<String>,
}

/// One binding as the decision path consumes it: flattened to a concrete
/// principal. Absence of `expression` means the binding is unconditional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleBinding {
    pub principal: String,
    pub role: String,
    pub title: String,
    pub expression: Option<String>,
}

/// Lists the bindings carrying a role in a project.
#[async_trait]
pub trait PolicyReader: Send + Sync {
    async fn bindings_for_role(&self, role: &str, project: &str)
    -> anyhow::Result<Vec<MemberBinding>>;
}

/// Resolves a group to its transitive member set.
#[async_trait]
pub trait WorkspaceReader: Send + Sync {
    async fn members_of_group(&self, group: &str) -> anyhow::Result<Vec<String>>;
}

type Snapshot = Arc<HashMap<String, Vec<RoleBinding>>>;

/// Background-refreshed projection of principal → role bindings for one
/// role in one project.
///
/// Snapshots are built off the request path and published with a single
/// reference write, so readers always observe a complete projection. A
/// failed rebuild keeps the previous snapshot serving; only a cold start
/// with no snapshot at all surfaces `PolicyUnavailable`.
pub struct PolicyProjection {
    snapshot: Arc<RwLock<Option<Snapshot>>>,
    stop: watch::Sender<bool>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl PolicyProjection {
    /// Build the initial snapshot and start the refresher. Eventual
    /// consistency is explicit: membership and binding changes become
    /// visible at the next completed refresh, not before.
    pub async fn new(
        reader: Arc<dyn PolicyReader>,
        workspace: Arc<dyn WorkspaceReader>,
        role: String,
        project: String,
        refresh_interval: Duration,
    ) -> Self {
        let snapshot: Arc<RwLock<Option<Snapshot>>> = Arc::new(RwLock::new(None));

        match build_snapshot(reader.as_ref(), workspace.as_ref(), &role, &project).await {
            Ok(built) => {
                tracing::info!(principals = built.len(), role = %role, "policy projection built");
                *snapshot.write().await = Some(Arc::new(built));
            }
            Err(err) => {
                tracing::warn!(error = %err, role = %role, "initial policy build failed, serving nothing until a refresh succeeds");
            }
        }

        let (stop, mut stopped) = watch::channel(false);
        let refresher = {
            let snapshot = snapshot.clone();
            let role = role.clone();
            let project = project.clone();
            tokio::spawn(async move {
                let start = tokio::time::Instant::now() + refresh_interval;
                let mut ticker = tokio::time::interval_at(start, refresh_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match build_snapshot(reader.as_ref(), workspace.as_ref(), &role, &project).await {
                                Ok(built) => {
                                    metrics::counter!("gatehouse_policy_refresh_total", "outcome" => "ok").increment(1);
                                    tracing::debug!(principals = built.len(), "policy projection refreshed");
                                    *snapshot.write().await = Some(Arc::new(built));
                                }
                                Err(err) => {
                                    metrics::counter!("gatehouse_policy_refresh_total", "outcome" => "error").increment(1);
                                    tracing::warn!(error = %err, "policy refresh failed, retaining previous snapshot");
                                }
                            }
                        }
                        _ = stopped.changed() => break,
                    }
                }
            })
        };

        Self {
            snapshot,
            stop,
            refresher: Mutex::new(Some(refresher)),
        }
    }

    /// Bindings for a principal from the current snapshot.
    pub async fn bindings_for(&self, principal: &str) -> AuthResult<Vec<RoleBinding>> {
        let guard = self.snapshot.read().await;
        let snapshot = guard.as_ref().ok_or(AuthError::PolicyUnavailable)?;
        snapshot
            .get(principal)
            .cloned()
            .ok_or_else(|| AuthError::NotAuthorized(principal.to_string()))
    }

    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        if let Some(handle) = self.refresher.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn build_snapshot(
    reader: &dyn PolicyReader,
    workspace: &dyn WorkspaceReader,
    role: &str,
    project: &str,
) -> anyhow::Result<HashMap<String, Vec<RoleBinding>>> {
    let records = reader.bindings_for_role(role, project).await?;
    let mut projection: HashMap<String, Vec<RoleBinding>> = HashMap::new();

    for record in records {
        if let Some(principal) = record
            .member
            .strip_prefix("user:")
            .or_else(|| record.member.strip_prefix("serviceAccount:"))
        {
            push_binding(&mut projection, principal, role, &record);
        } else if let Some(group) = record.member.strip_prefix("group:") {
            // Any failure here fails the whole build; a half-expanded group
            // must not replace a complete snapshot.
            for principal in workspace.members_of_group(group).await? {
                push_binding(&mut projection, &principal, role, &record);
            }
        } else {
            tracing::debug!(member = %record.member, "skipping unsupported member kind");
        }
    }

    Ok(projection)
}

fn push_binding(
    projection: &mut HashMap<String, Vec<RoleBinding>>,
    principal: &str,
    role: &str,
    record: &MemberBinding,
) {
    projection
        .entry(principal.to_string())
        .or_default()
        .push(RoleBinding {
            principal: principal.to_string(),
            role: role.to_string(),
            title: record.title.clone(),
            expression: record.expression.clone(),
        });
}
