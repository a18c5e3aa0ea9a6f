//! Federation configuration
//!
//! Names of the GCP resources that make up one GitHub Actions federation,
//! read from the environment the same way the CLI flags are.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;

use crate::agents::bindings::FederatedPrincipal;

/// Default workload identity pool id
pub const DEFAULT_POOL_ID: &str = "github-pool";

/// Default workload identity provider id
pub const DEFAULT_PROVIDER_ID: &str = "github-provider";

/// GitHub Actions OIDC issuer
pub const GITHUB_ISSUER_URI: &str = "https://token.actions.githubusercontent.com";

/// Role that lets a federated principal impersonate the service account
pub const WORKLOAD_IDENTITY_USER_ROLE: &str = "roles/iam.workloadIdentityUser";

/// Resource names for one federation setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationConfig {
    pub project_id: String,
    /// Numeric project number, used in principal identifiers
    pub project_number: String,
    pub pool_id: String,
    pub provider_id: String,
    /// Service account id (the part before `@`) or full email
    pub service_account_id: String,
    /// GitHub repository in `owner/name` form
    pub repository: String,
    /// Project-level roles granted to the service account
    pub roles: Vec<String>,
    pub issuer_uri: String,
}

impl FederationConfig {
    pub fn new(
        project_id: impl Into<String>,
        project_number: impl Into<String>,
        service_account_id: impl Into<String>,
        repository: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            project_number: project_number.into(),
            pool_id: DEFAULT_POOL_ID.to_string(),
            provider_id: DEFAULT_PROVIDER_ID.to_string(),
            service_account_id: service_account_id.into(),
            repository: repository.into(),
            roles: vec![],
            issuer_uri: GITHUB_ISSUER_URI.to_string(),
        }
    }

    /// Load from `GCP_*`, `WIF_*` and `GITHUB_REPOSITORY` environment variables
    pub fn from_env() -> Result<Self> {
        let required = |name: &str| env::var(name).with_context(|| format!("{} not set", name));

        Ok(Self {
            project_id: required("GCP_PROJECT_ID")?,
            project_number: required("GCP_PROJECT_NUMBER")?,
            pool_id: env::var("GCP_WORKLOAD_IDENTITY_POOL_ID")
                .unwrap_or_else(|_| DEFAULT_POOL_ID.to_string()),
            provider_id: env::var("GCP_WORKLOAD_IDENTITY_PROVIDER_ID")
                .unwrap_or_else(|_| DEFAULT_PROVIDER_ID.to_string()),
            service_account_id: required("WIF_SERVICE_ACCOUNT_ID")?,
            repository: required("GITHUB_REPOSITORY")?,
            roles: env::var("WIF_ROLES")
                .map(|roles| parse_roles(&roles))
                .unwrap_or_default(),
            issuer_uri: GITHUB_ISSUER_URI.to_string(),
        })
    }

    pub fn with_pool(mut self, pool_id: impl Into<String>) -> Self {
        self.pool_id = pool_id.into();
        self
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = provider_id.into();
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Full service account email
    pub fn service_account_email(&self) -> String {
        if self.service_account_id.contains('@') {
            self.service_account_id.clone()
        } else {
            format!(
                "{}@{}.iam.gserviceaccount.com",
                self.service_account_id, self.project_id
            )
        }
    }

    /// Federated principal for every workflow run of `repository`
    pub fn principal(&self, repository: &str) -> String {
        FederatedPrincipal::repository(&self.project_number, &self.pool_id, repository)
    }

    /// Provider resource name, as used by `google-github-actions/auth`
    pub fn provider_resource(&self) -> String {
        format!(
            "projects/{}/locations/global/workloadIdentityPools/{}/providers/{}",
            self.project_number, self.pool_id, self.provider_id
        )
    }
}

/// Split a comma separated role list, dropping blanks
pub fn parse_roles(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FederationConfig::new("acme-prod", "123456", "deployer", "acme/app");
        assert_eq!(config.pool_id, "github-pool");
        assert_eq!(config.provider_id, "github-provider");
        assert_eq!(config.issuer_uri, "https://token.actions.githubusercontent.com");
        assert_eq!(config.service_account_email(), "deployer@acme-prod.iam.gserviceaccount.com");
    }

    #[test]
    fn test_full_email_is_kept() {
        let config = FederationConfig::new("p", "1", "ci@other.iam.gserviceaccount.com", "a/b");
        assert_eq!(config.service_account_email(), "ci@other.iam.gserviceaccount.com");
    }

    #[test]
    fn test_parse_roles() {
        assert_eq!(
            parse_roles("roles/run.admin, roles/storage.admin,,"),
            vec!["roles/run.admin", "roles/storage.admin"]
        );
        assert!(parse_roles("").is_empty());
    }

    #[test]
    fn test_from_env() {
        env::set_var("GCP_PROJECT_ID", "acme-prod");
        env::set_var("GCP_PROJECT_NUMBER", "123456");
        env::set_var("WIF_SERVICE_ACCOUNT_ID", "deployer");
        env::set_var("GITHUB_REPOSITORY", "acme/app");
        env::set_var("WIF_ROLES", "roles/run.admin,roles/artifactregistry.writer");

        let config = FederationConfig::from_env().unwrap();

        assert_eq!(config.project_number, "123456");
        assert_eq!(config.pool_id, DEFAULT_POOL_ID);
        assert_eq!(config.roles.len(), 2);

        env::remove_var("GITHUB_REPOSITORY");
        let err = FederationConfig::from_env().unwrap_err();
        assert_eq!(err.to_string(), "GITHUB_REPOSITORY not set");
    }

    #[test]
    fn test_provider_resource() {
        let config = FederationConfig::new("p", "42", "sa", "a/b").with_pool("ci").with_provider("gh");
        assert_eq!(
            config.provider_resource(),
            "projects/42/locations/global/workloadIdentityPools/ci/providers/gh"
        );
        assert_eq!(
            config.principal("a/b"),
            "principalSet://iam.googleapis.com/projects/42/locations/global/workloadIdentityPools/ci/attribute.repository/a/b"
        );
    }
}
