//! GCP IAM Client
//!
//! REST client for service accounts, workload identity pools/providers and
//! IAM policies. Implements every capability trait the engine needs.
//!
//! ## Security Model
//! - Uses ADC (Application Default Credentials) - no hardcoded secrets
//! - Impersonation bindings live on the service account's own IAM policy;
//!   project roles live on the project policy
//!
//! Policies are read-modify-written with their etag, so a concurrent edit
//! makes the write fail rather than be silently overwritten.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info};

use crate::agents::bindings::{BindingTransport, FederatedPrincipal, IamBinding};
use crate::agents::conflicts::{
    LifecycleState, PoolConfig, ProviderConfig, ResourceConfig, ResourceDescriptor, ServiceAccountConfig,
    StateFetcher,
};
use crate::agents::setup::ResourceProvisioner;
use crate::agents::trust::CompiledCondition;

const IAM_API: &str = "https://iam.googleapis.com/v1";
const RESOURCE_MANAGER_API: &str = "https://cloudresourcemanager.googleapis.com/v1";

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// IAM and Resource Manager both accept the broad cloud-platform scope
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Policy version required for conditional bindings
const CONDITIONAL_POLICY_VERSION: i32 = 3;

/// Condition description prefix recording which provider a binding is for
const PROVIDER_MARKER: &str = "provider:";

/// IAM policy document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default)]
    pub version: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<PolicyBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyBinding {
    pub role: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<PolicyCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCondition {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub expression: String,
}

impl PolicyCondition {
    fn from_binding(binding: &IamBinding) -> Option<Self> {
        binding.condition.as_ref().map(|c| Self {
            title: c.title.clone(),
            description: format!("{}{}", PROVIDER_MARKER, binding.provider_id),
            expression: c.expression.clone(),
        })
    }

    fn provider_id(&self) -> Option<&str> {
        self.description
            .strip_prefix(PROVIDER_MARKER)
            .filter(|id| !id.is_empty())
    }
}

impl Policy {
    /// Bindings that name `principal`, one per (entry, member) pair.
    ///
    /// The provider id is read from the condition description; bindings
    /// without that marker are attributed to `default_provider`.
    pub fn bindings_for(&self, principal: &str, default_provider: &str) -> Vec<IamBinding> {
        let Some((pool_id, repository)) = parse_principal(principal) else {
            return vec![];
        };

        self.bindings
            .iter()
            .filter(|entry| entry.members.iter().any(|m| m == principal))
            .map(|entry| IamBinding {
                role: entry.role.clone(),
                member: principal.to_string(),
                repository: repository.clone(),
                pool_id: pool_id.clone(),
                provider_id: entry
                    .condition
                    .as_ref()
                    .and_then(|c| c.provider_id())
                    .unwrap_or(default_provider)
                    .to_string(),
                condition: entry
                    .condition
                    .as_ref()
                    .map(|c| CompiledCondition::new(c.title.clone(), c.expression.clone())),
            })
            .collect()
    }

    pub fn add(&mut self, binding: &IamBinding) {
        self.version = CONDITIONAL_POLICY_VERSION;
        self.bindings.push(PolicyBinding {
            role: binding.role.clone(),
            members: vec![binding.member.clone()],
            condition: PolicyCondition::from_binding(binding),
        });
    }

    /// Remove `binding`'s member from the entry holding it; empty entries are dropped
    pub fn detach(&mut self, binding: &IamBinding) -> bool {
        let expression = binding.condition.as_ref().map(|c| c.expression.as_str());
        let Some(index) = self.bindings.iter().position(|entry| {
            entry.role == binding.role
                && entry.condition.as_ref().map(|c| c.expression.as_str()) == expression
                && entry.members.contains(&binding.member)
        }) else {
            return false;
        };

        let entry = &mut self.bindings[index];
        entry.members.retain(|m| m != &binding.member);
        if entry.members.is_empty() {
            self.bindings.remove(index);
        }
        self.version = CONDITIONAL_POLICY_VERSION;
        true
    }

    /// Unconditional roles held by `member`
    pub fn roles_of(&self, member: &str) -> BTreeSet<String> {
        self.bindings
            .iter()
            .filter(|entry| entry.condition.is_none() && entry.members.iter().any(|m| m == member))
            .map(|entry| entry.role.clone())
            .collect()
    }

    pub fn grant(&mut self, role: &str, member: &str) {
        match self
            .bindings
            .iter_mut()
            .find(|entry| entry.role == role && entry.condition.is_none())
        {
            Some(entry) if entry.members.iter().any(|m| m == member) => {}
            Some(entry) => entry.members.push(member.to_string()),
            None => self.bindings.push(PolicyBinding {
                role: role.to_string(),
                members: vec![member.to_string()],
                condition: None,
            }),
        }
    }

    pub fn revoke(&mut self, role: &str, member: &str) {
        for entry in self
            .bindings
            .iter_mut()
            .filter(|entry| entry.role == role && entry.condition.is_none())
        {
            entry.members.retain(|m| m != member);
        }
        self.bindings.retain(|entry| !entry.members.is_empty());
    }
}

/// `(pool, repository)` from a repository principal set
fn parse_principal(principal: &str) -> Option<(String, String)> {
    let (_, rest) = principal.split_once("/workloadIdentityPools/")?;
    let (pool, repository) = rest.split_once("/attribute.repository/")?;
    Some((pool.to_string(), repository.to_string()))
}

/// GCP IAM REST client
pub struct GcpIamClient {
    /// GCP project ID
    project_id: String,
    /// Service account whose IAM policy holds impersonation bindings
    service_account: String,
    /// Provider assumed for listed bindings that do not record one
    provider_id: String,
    /// HTTP client for GCP API calls
    http_client: Client,
}

impl GcpIamClient {
    /// Create a client for `project_id`, managing bindings on `service_account`
    pub fn new(project_id: &str, service_account: &str) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        info!(project = %project_id, service_account = %service_account, "GcpIamClient initialized");
        Ok(Self {
            project_id: project_id.to_string(),
            service_account: service_account.to_string(),
            provider_id: String::new(),
            http_client,
        })
    }

    /// Attribute unmarked bindings to `provider_id` when listing
    pub fn with_provider(mut self, provider_id: &str) -> Self {
        self.provider_id = provider_id.to_string();
        self
    }

    /// Access token for the IAM APIs.
    ///
    /// On GCE/GKE the metadata server mints it for the attached service
    /// account; elsewhere the local application default credentials are used.
    async fn access_token(&self) -> Result<String> {
        match self.metadata_token().await {
            Ok(token) => Ok(token),
            Err(e) => {
                debug!(error = %format!("{:#}", e), "No metadata server token, using local ADC");
                self.local_adc_token().await
            }
        }
    }

    async fn metadata_token(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct MetadataToken {
            access_token: String,
        }

        let response = self
            .http_client
            .get(METADATA_TOKEN_URL)
            .query(&[("scopes", CLOUD_PLATFORM_SCOPE)])
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .context("Metadata server unreachable")?
            .error_for_status()
            .context("Metadata server refused the token request")?;

        let token: MetadataToken = response
            .json()
            .await
            .context("Metadata server token response has no access_token")?;
        Ok(token.access_token)
    }

    async fn local_adc_token(&self) -> Result<String> {
        let output = tokio::process::Command::new("gcloud")
            .args(["auth", "application-default", "print-access-token"])
            .output()
            .await
            .context("No IAM credentials: metadata server unavailable and gcloud not installed")?;

        if !output.status.success() {
            bail!(
                "No IAM credentials for project {}: {} (run 'gcloud auth application-default login')",
                self.project_id,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let token = String::from_utf8(output.stdout).context("gcloud printed a non-UTF-8 token")?;
        let token = token.trim();
        if token.is_empty() {
            bail!("gcloud printed an empty access token for project {}", self.project_id);
        }
        Ok(token.to_string())
    }

    /// Send one request. `Ok(None)` means the API answered 404.
    async fn call(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Option<Value>> {
        let token = self.access_token().await?;
        debug!(method = %method, url = %url, "IAM API request");

        let mut request = self.http_client.request(method.clone(), url).bearer_auth(&token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to call {} {}", method, url))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("IAM API returned {}: {}", status, body);
        }

        let value = response.json().await.context("Invalid IAM API response")?;
        Ok(Some(value))
    }

    async fn required(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Value> {
        self.call(method, url, body)
            .await?
            .with_context(|| format!("{} not found", url))
    }

    fn service_account_url(&self, email: &str) -> String {
        format!(
            "{}/projects/{}/serviceAccounts/{}",
            IAM_API,
            self.project_id,
            urlencoding::encode(email)
        )
    }

    fn pool_url(&self, pool_id: &str) -> String {
        format!(
            "{}/projects/{}/locations/global/workloadIdentityPools/{}",
            IAM_API,
            self.project_id,
            urlencoding::encode(pool_id)
        )
    }

    fn provider_url(&self, pool_id: &str, provider_id: &str) -> String {
        format!("{}/providers/{}", self.pool_url(pool_id), urlencoding::encode(provider_id))
    }

    fn resource_url(&self, descriptor: &ResourceDescriptor) -> String {
        match &descriptor.desired {
            ResourceConfig::ServiceAccount(_) => self.service_account_url(&email_of(descriptor)),
            ResourceConfig::WorkloadIdentityPool(_) => self.pool_url(&descriptor.name),
            ResourceConfig::WorkloadIdentityProvider(provider) => {
                self.provider_url(&provider.pool_id, &descriptor.name)
            }
        }
    }

    // =========================================================================
    // IAM POLICIES
    // =========================================================================

    async fn project_policy(&self) -> Result<Policy> {
        let url = format!("{}/projects/{}:getIamPolicy", RESOURCE_MANAGER_API, self.project_id);
        let body = json!({ "options": { "requestedPolicyVersion": CONDITIONAL_POLICY_VERSION } });
        let value = self.required(Method::POST, &url, Some(&body)).await?;
        serde_json::from_value(value).context("Failed to parse project IAM policy")
    }

    async fn set_project_policy(&self, policy: &Policy) -> Result<()> {
        let url = format!("{}/projects/{}:setIamPolicy", RESOURCE_MANAGER_API, self.project_id);
        self.required(Method::POST, &url, Some(&json!({ "policy": policy })))
            .await
            .context("Failed to set project IAM policy")?;
        Ok(())
    }

    async fn service_account_policy(&self) -> Result<Policy> {
        let url = format!(
            "{}:getIamPolicy?options.requestedPolicyVersion={}",
            self.service_account_url(&self.service_account),
            CONDITIONAL_POLICY_VERSION
        );
        let value = self.required(Method::POST, &url, None).await?;
        serde_json::from_value(value).context("Failed to parse service account IAM policy")
    }

    async fn set_service_account_policy(&self, policy: &Policy) -> Result<()> {
        let url = format!("{}:setIamPolicy", self.service_account_url(&self.service_account));
        self.required(Method::POST, &url, Some(&json!({ "policy": policy })))
            .await
            .context("Failed to set service account IAM policy")?;
        Ok(())
    }

    /// Grant `wanted` project roles to `member`, revoking others when `exact`
    async fn sync_project_roles(&self, member: &str, wanted: &BTreeSet<String>, exact: bool) -> Result<()> {
        let mut policy = self.project_policy().await?;
        let current = policy.roles_of(member);

        let grant: Vec<&String> = wanted.difference(&current).collect();
        let revoke: Vec<&String> = if exact {
            current.difference(wanted).collect()
        } else {
            vec![]
        };
        if grant.is_empty() && revoke.is_empty() {
            return Ok(());
        }

        for role in &grant {
            policy.grant(role, member);
        }
        for role in &revoke {
            policy.revoke(role, member);
        }
        self.set_project_policy(&policy).await?;

        info!(member = %member, granted = grant.len(), revoked = revoke.len(), "Project roles synced");
        Ok(())
    }
}

fn member_of(descriptor: &ResourceDescriptor) -> String {
    FederatedPrincipal::service_account(&descriptor.project_id, &descriptor.name)
}

fn email_of(descriptor: &ResourceDescriptor) -> String {
    member_of(descriptor).trim_start_matches("serviceAccount:").to_string()
}

fn parse_state(value: &Value) -> LifecycleState {
    serde_json::from_value(value["state"].clone()).unwrap_or_default()
}

fn text(value: &Value, field: &str) -> String {
    value[field].as_str().unwrap_or_default().to_string()
}

fn parse_pool(value: &Value) -> PoolConfig {
    PoolConfig {
        display_name: text(value, "displayName"),
        description: text(value, "description"),
        disabled: value["disabled"].as_bool().unwrap_or(false),
        state: parse_state(value),
    }
}

fn parse_provider(pool_id: &str, value: &Value) -> ProviderConfig {
    let attribute_mapping: BTreeMap<String, String> =
        serde_json::from_value(value["attributeMapping"].clone()).unwrap_or_default();
    let allowed_audiences: BTreeSet<String> =
        serde_json::from_value(value["oidc"]["allowedAudiences"].clone()).unwrap_or_default();
    let condition = value["attributeCondition"]
        .as_str()
        .filter(|c| !c.is_empty())
        .map(|c| CompiledCondition::new("attributeCondition", c));

    ProviderConfig {
        pool_id: pool_id.to_string(),
        display_name: text(value, "displayName"),
        description: text(value, "description"),
        disabled: value["disabled"].as_bool().unwrap_or(false),
        state: parse_state(value),
        issuer_uri: value["oidc"]["issuerUri"].as_str().unwrap_or_default().to_string(),
        allowed_audiences,
        attribute_mapping,
        condition,
        // Not stored by the API
        repository: None,
        allowed_branches: None,
        allowed_tags: None,
    }
}

fn pool_body(pool: &PoolConfig) -> Value {
    json!({
        "displayName": pool.display_name,
        "description": pool.description,
        "disabled": pool.disabled,
    })
}

fn provider_body(provider: &ProviderConfig) -> Value {
    let mut body = json!({
        "displayName": provider.display_name,
        "description": provider.description,
        "disabled": provider.disabled,
        "attributeMapping": provider.attribute_mapping,
        "oidc": {
            "issuerUri": provider.issuer_uri,
            "allowedAudiences": provider.allowed_audiences,
        },
    });
    if let Some(condition) = &provider.condition {
        body["attributeCondition"] = json!(condition.expression);
    }
    body
}

#[async_trait]
impl StateFetcher for GcpIamClient {
    async fn fetch_state(&self, descriptor: &ResourceDescriptor) -> Result<Option<ResourceConfig>> {
        let url = self.resource_url(descriptor);
        let Some(value) = self
            .call(Method::GET, &url, None)
            .await
            .with_context(|| format!("Failed to get {} '{}'", descriptor.kind(), descriptor.name))?
        else {
            return Ok(None);
        };

        let config = match &descriptor.desired {
            ResourceConfig::ServiceAccount(_) => {
                let member = member_of(descriptor);
                ResourceConfig::ServiceAccount(ServiceAccountConfig {
                    display_name: text(&value, "displayName"),
                    description: text(&value, "description"),
                    roles: self.project_policy().await?.roles_of(&member),
                    disabled: value["disabled"].as_bool().unwrap_or(false),
                })
            }
            ResourceConfig::WorkloadIdentityPool(_) => ResourceConfig::WorkloadIdentityPool(parse_pool(&value)),
            ResourceConfig::WorkloadIdentityProvider(desired) => {
                ResourceConfig::WorkloadIdentityProvider(parse_provider(&desired.pool_id, &value))
            }
        };
        Ok(Some(config))
    }
}

#[async_trait]
impl ResourceProvisioner for GcpIamClient {
    async fn create_resource(&self, descriptor: &ResourceDescriptor) -> Result<()> {
        match &descriptor.desired {
            ResourceConfig::ServiceAccount(sa) => {
                let email = email_of(descriptor);
                let account_id = email.split('@').next().unwrap_or_default();
                let url = format!("{}/projects/{}/serviceAccounts", IAM_API, self.project_id);
                let body = json!({
                    "accountId": account_id,
                    "serviceAccount": {
                        "displayName": sa.display_name,
                        "description": sa.description,
                    },
                });
                self.required(Method::POST, &url, Some(&body))
                    .await
                    .with_context(|| format!("Failed to create service account {}", email))?;
                self.sync_project_roles(&member_of(descriptor), &sa.roles, false)
                    .await?;
            }
            ResourceConfig::WorkloadIdentityPool(pool) => {
                let url = format!(
                    "{}/projects/{}/locations/global/workloadIdentityPools?workloadIdentityPoolId={}",
                    IAM_API,
                    self.project_id,
                    urlencoding::encode(&descriptor.name)
                );
                self.required(Method::POST, &url, Some(&pool_body(pool)))
                    .await
                    .with_context(|| format!("Failed to create workload identity pool {}", descriptor.name))?;
            }
            ResourceConfig::WorkloadIdentityProvider(provider) => {
                let url = format!(
                    "{}/providers?workloadIdentityPoolProviderId={}",
                    self.pool_url(&provider.pool_id),
                    urlencoding::encode(&descriptor.name)
                );
                self.required(Method::POST, &url, Some(&provider_body(provider)))
                    .await
                    .with_context(|| format!("Failed to create workload identity provider {}", descriptor.name))?;
            }
        }

        info!(kind = %descriptor.kind(), resource = %descriptor.name, "Created resource");
        Ok(())
    }

    async fn update_resource(&self, descriptor: &ResourceDescriptor) -> Result<()> {
        let url = self.resource_url(descriptor);
        match &descriptor.desired {
            ResourceConfig::ServiceAccount(sa) => {
                let body = json!({
                    "serviceAccount": {
                        "displayName": sa.display_name,
                        "description": sa.description,
                    },
                    "updateMask": "displayName,description",
                });
                self.required(Method::PATCH, &url, Some(&body)).await?;

                let toggle = if sa.disabled { "disable" } else { "enable" };
                self.required(Method::POST, &format!("{}:{}", url, toggle), Some(&json!({})))
                    .await?;
                self.sync_project_roles(&member_of(descriptor), &sa.roles, true)
                    .await?;
            }
            ResourceConfig::WorkloadIdentityPool(pool) => {
                let url = format!("{}?updateMask=displayName,description,disabled", url);
                self.required(Method::PATCH, &url, Some(&pool_body(pool))).await?;
            }
            ResourceConfig::WorkloadIdentityProvider(provider) => {
                let mask = "displayName,description,disabled,attributeMapping,attributeCondition,oidc";
                let url = format!("{}?updateMask={}", url, urlencoding::encode(mask));
                self.required(Method::PATCH, &url, Some(&provider_body(provider))).await?;
            }
        }

        info!(kind = %descriptor.kind(), resource = %descriptor.name, "Updated resource");
        Ok(())
    }

    async fn delete_resource(&self, descriptor: &ResourceDescriptor) -> Result<bool> {
        if let ResourceConfig::ServiceAccount(_) = &descriptor.desired {
            let member = member_of(descriptor);
            self.sync_project_roles(&member, &BTreeSet::new(), true)
                .await
                .with_context(|| format!("Failed to revoke project roles of {} before delete", member))?;
        }

        let deleted = self
            .call(Method::DELETE, &self.resource_url(descriptor), None)
            .await
            .with_context(|| format!("Failed to delete {} '{}'", descriptor.kind(), descriptor.name))?
            .is_some();

        info!(kind = %descriptor.kind(), resource = %descriptor.name, deleted, "Deleted resource");
        Ok(deleted)
    }
}

#[async_trait]
impl BindingTransport for GcpIamClient {
    async fn list_bindings(&self, principal: &str) -> Result<Vec<IamBinding>> {
        Ok(self
            .service_account_policy()
            .await?
            .bindings_for(principal, &self.provider_id))
    }

    async fn create_binding(&self, binding: &IamBinding) -> Result<()> {
        let mut policy = self.service_account_policy().await?;
        policy.add(binding);
        self.set_service_account_policy(&policy).await
    }

    async fn replace_condition(&self, existing: &IamBinding, replacement: &IamBinding) -> Result<()> {
        let mut policy = self.service_account_policy().await?;
        if !policy.detach(existing) {
            bail!("binding for role {} changed concurrently", existing.role);
        }
        policy.add(replacement);
        self.set_service_account_policy(&policy).await
    }

    async fn remove_binding(&self, binding: &IamBinding) -> Result<()> {
        let mut policy = self.service_account_policy().await?;
        if policy.detach(binding) {
            self.set_service_account_policy(&policy).await?;
        }
        Ok(())
    }
}
