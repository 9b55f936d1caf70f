//! Outbound Google API clients.
//!
//! # Purpose
//! Thin REST adapters behind the policy and workspace reader traits, plus
//! access-token acquisition from the GCE metadata server. These are the
//! only components that talk to Google control-plane APIs; everything on
//! the request path works from state they feed.
use crate::auth::policy::{MemberBinding, PolicyReader, WorkspaceReader};
use crate::auth::token::unix_now;
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const RESOURCE_MANAGER_BASE_URL: &str = "https://cloudresourcemanager.googleapis.com/v1";
const CLOUD_IDENTITY_BASE_URL: &str = "https://cloudidentity.googleapis.com/v1";

// Refresh ahead of expiry so an in-flight call never carries a token that
// dies mid-request.
const TOKEN_REFRESH_MARGIN_SECONDS: i64 = 60;

fn api_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to build api client, using defaults");
            reqwest::Client::new()
        })
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: i64,
}

/// Access tokens for outbound API calls, from the instance metadata server,
/// cached until shortly before they expire.
pub struct MetadataTokenProvider {
    client: reqwest::Client,
    token_url: String,
    cached: RwLock<Option<(String, i64)>>,
}

impl MetadataTokenProvider {
    pub fn new() -> Self {
        Self::with_token_url(METADATA_TOKEN_URL.to_string())
    }

    pub fn with_token_url(token_url: String) -> Self {
        Self {
            client: api_client(),
            token_url,
            cached: RwLock::new(None),
        }
    }

    pub async fn access_token(&self) -> anyhow::Result<String> {
        let now = unix_now();
        if let Some((token, exp)) = self.cached.read().await.as_ref()
            && *exp > now + TOKEN_REFRESH_MARGIN_SECONDS
        {
            return Ok(token.clone());
        }

        let response = self
            .client
            .get(&self.token_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .with_context(|| "metadata token request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("metadata server returned {}", response.status());
        }
        let token: MetadataToken = response
            .json()
            .await
            .with_context(|| "decode metadata token response")?;

        let mut cached = self.cached.write().await;
        *cached = Some((token.access_token.clone(), now + token.expires_in));
        Ok(token.access_token)
    }
}

impl Default for MetadataTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct IamPolicy {
    #[serde(default)]
    bindings: Vec<IamBinding>,
}

#[derive(Debug, Deserialize)]
struct IamBinding {
    role: String,
    #[serde(default)]
    members: Vec<String>,
    condition: Option<IamCondition>,
}

#[derive(Debug, Deserialize)]
struct IamCondition {
    #[serde(default)]
    title: String,
    #[serde(default)]
    expression: String,
}

/// Policy bindings from Cloud Resource Manager `getIamPolicy`.
pub struct ResourceManagerPolicyReader {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<MetadataTokenProvider>,
}

impl ResourceManagerPolicyReader {
    pub fn new(tokens: Arc<MetadataTokenProvider>) -> Self {
        Self::with_base_url(RESOURCE_MANAGER_BASE_URL.to_string(), tokens)
    }

    pub fn with_base_url(base_url: String, tokens: Arc<MetadataTokenProvider>) -> Self {
        Self {
            client: api_client(),
            base_url,
            tokens,
        }
    }
}

#[async_trait]
impl PolicyReader for ResourceManagerPolicyReader {
    async fn bindings_for_role(
        &self,
        role: &str,
        project: &str,
    ) -> anyhow::Result<Vec<MemberBinding>> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}/projects/{project}:getIamPolicy", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            // Version 3 is required for bindings to carry their conditions.
            .json(&serde_json::json!({
                "options": {"requestedPolicyVersion": 3}
            }))
            .send()
            .await
            .with_context(|| format!("getIamPolicy for {project} failed"))?;
        if !response.status().is_success() {
            anyhow::bail!("getIamPolicy for {project} returned {}", response.status());
        }
        let policy: IamPolicy = response
            .json()
            .await
            .with_context(|| "decode iam policy response")?;
        Ok(flatten_policy(policy, role))
    }
}

fn flatten_policy(policy: IamPolicy, role: &str) -> Vec<MemberBinding> {
    policy
        .bindings
        .into_iter()
        .filter(|binding| binding.role == role)
        .flat_map(|binding| {
            let (title, expression) = match binding.condition {
                Some(condition) if !condition.expression.is_empty() => {
                    (condition.title, Some(condition.expression))
                }
                _ => (String::new(), None),
            };
            binding
                .members
                .into_iter()
                .map(move |member| MemberBinding {
                    member,
                    title: title.clone(),
                    expression: expression.clone(),
                })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct GroupLookup {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransitiveMemberships {
    #[serde(default)]
    memberships: Vec<TransitiveMembership>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransitiveMembership {
    #[serde(default)]
    preferred_member_key: Vec<MemberKey>,
}

#[derive(Debug, Deserialize)]
struct MemberKey {
    id: String,
}

/// Transitive group membership from the Cloud Identity API.
pub struct CloudIdentityWorkspaceReader {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<MetadataTokenProvider>,
}

impl CloudIdentityWorkspaceReader {
    pub fn new(tokens: Arc<MetadataTokenProvider>) -> Self {
        Self::with_base_url(CLOUD_IDENTITY_BASE_URL.to_string(), tokens)
    }

    pub fn with_base_url(base_url: String, tokens: Arc<MetadataTokenProvider>) -> Self {
        Self {
            client: api_client(),
            base_url,
            tokens,
        }
    }

    async fn lookup_group(&self, group: &str) -> anyhow::Result<String> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}/groups:lookup", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("groupKey.id", group)])
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("group lookup for {group} failed"))?;
        if !response.status().is_success() {
            anyhow::bail!("group lookup for {group} returned {}", response.status());
        }
        let lookup: GroupLookup = response
            .json()
            .await
            .with_context(|| "decode group lookup response")?;
        Ok(lookup.name)
    }
}

#[async_trait]
impl WorkspaceReader for CloudIdentityWorkspaceReader {
    async fn members_of_group(&self, group: &str) -> anyhow::Result<Vec<String>> {
        let name = self.lookup_group(group).await?;
        let url = format!("{}/{name}/memberships:searchTransitiveMemberships", self.base_url);

        let mut members = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let token = self.tokens.access_token().await?;
            let mut request = self
                .client
                .get(&url)
                .query(&[("pageSize", "1000")])
                .bearer_auth(token);
            if let Some(page) = &page_token {
                request = request.query(&[("pageToken", page.as_str())]);
            }
            let response = request
                .send()
                .await
                .with_context(|| format!("transitive membership search for {group} failed"))?;
            if !response.status().is_success() {
                anyhow::bail!(
                    "transitive membership search for {group} returned {}",
                    response.status()
                );
            }
            let page: TransitiveMemberships = response
                .json()
                .await
                .with_context(|| "decode membership response")?;
            for membership in page.memberships {
                members.extend(membership.preferred_member_key.into_iter().map(|key| key.id));
            }
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iam_policy_flattens_members_per_binding() {
        let payload = serde_json::json!({
            "version": 3,
            "bindings": [
                {
                    "role": "roles/iap.httpsResourceAccessor",
                    "members": [
                        "serviceAccount:svc@p.iam.gserviceaccount.com",
                        "group:devs@example.com"
                    ],
                    "condition": {
                        "title": "v1-only",
                        "description": "API v1 paths",
                        "expression": "request.path.startsWith(\"/v1/\")"
                    }
                },
                {
                    "role": "roles/viewer",
                    "members": ["user:alice@example.com"]
                },
                {
                    "role": "roles/iap.httpsResourceAccessor",
                    "members": ["user:bob@example.com"]
                }
            ],
            "etag": "BwXhqDhbC6w="
        });
        let policy: IamPolicy = serde_json::from_value(payload).expect("decode");
        let bindings = flatten_policy(policy, "roles/iap.httpsResourceAccessor");

        assert_eq!(bindings.len(), 3);
        assert_eq!(bindings[0].member, "serviceAccount:svc@p.iam.gserviceaccount.com");
        assert_eq!(bindings[0].title, "v1-only");
        assert_eq!(
            bindings[0].expression.as_deref(),
            Some("request.path.startsWith(\"/v1/\")")
        );
        assert_eq!(bindings[1].member, "group:devs@example.com");
        // The unconditional binding for the role is kept, other roles dropped.
        assert_eq!(bindings[2].member, "user:bob@example.com");
        assert!(bindings[2].expression.is_none());
    }

    #[test]
    fn empty_condition_expression_counts_as_unconditional() {
        let policy = IamPolicy {
            bindings: vec![IamBinding {
                role: "r".to_string(),
                members: vec!["user:alice@example.com".to_string()],
                condition: Some(IamCondition {
                    title: "t".to_string(),
                    expression: String::new(),
                }),
            }],
        };
        let bindings = flatten_policy(policy, "r");
        assert!(bindings[0].expression.is_none());
    }

    #[test]
    fn membership_pages_decode() {
        let payload = serde_json::json!({
            "memberships": [
                {
                    "member": "groups/child/memberships/1",
                    "preferredMemberKey": [{"id": "bob@example.com"}],
                    "roles": [{"role": "MEMBER"}]
                },
                {
                    "preferredMemberKey": [{"id": "carol@example.com"}]
                }
            ],
            "nextPageToken": "page-2"
        });
        let page: TransitiveMemberships = serde_json::from_value(payload).expect("decode");
        assert_eq!(page.memberships.len(), 2);
        assert_eq!(page.memberships[0].preferred_member_key[0].id, "bob@example.com");
        assert_eq!(page.next_page_token.as_deref(), Some("page-2"));
    }

    #[test]
    fn metadata_token_decodes() {
        let payload = serde_json::json!({
            "access_token": "ya29.secret",
            "expires_in": 3599,
            "token_type": "Bearer"
        });
        let token: MetadataToken = serde_json::from_value(payload).expect("decode");
        assert_eq!(token.access_token, "ya29.secret");
        assert_eq!(token.expires_in, 3599);
    }
}
