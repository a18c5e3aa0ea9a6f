//! Types for conditional IAM bindings
//!
//! A binding grants a role to a federated principal, gated by a compiled
//! trust condition. Bindings are identified by `(role, pool, provider,
//! repository)`; the condition is content that may be replaced in place.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agents::trust::{CompiledCondition, ConditionError};

/// Identity of a binding, independent of its condition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingKey {
    pub role: String,
    pub pool_id: String,
    pub provider_id: String,
    pub repository: String,
}

/// A conditional IAM binding for a federated principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IamBinding {
    pub role: String,
    /// Federated principal, see [`FederatedPrincipal`]
    pub member: String,
    pub repository: String,
    #[serde(rename = "poolID")]
    pub pool_id: String,
    #[serde(rename = "providerID")]
    pub provider_id: String,
    pub condition: Option<CompiledCondition>,
}

impl IamBinding {
    pub fn key(&self) -> BindingKey {
        BindingKey {
            role: self.role.clone(),
            pool_id: self.pool_id.clone(),
            provider_id: self.provider_id.clone(),
            repository: self.repository.clone(),
        }
    }

    /// Conditions match when both are absent or their expressions are identical
    pub fn same_condition(&self, other: &IamBinding) -> bool {
        match (&self.condition, &other.condition) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same_expression(b),
            _ => false,
        }
    }
}

/// Federated principal identifiers for workload identity pools
pub struct FederatedPrincipal;

impl FederatedPrincipal {
    /// Every token from `repository` accepted by the pool
    pub fn repository(project_number: &str, pool_id: &str, repository: &str) -> String {
        format!(
            "principalSet://iam.googleapis.com/projects/{}/locations/global/workloadIdentityPools/{}/attribute.repository/{}",
            project_number, pool_id, repository
        )
    }

    /// `serviceAccount:<email>`, expanding a bare account id to its project email
    pub fn service_account(project_id: &str, account: &str) -> String {
        if account.contains('@') {
            format!("serviceAccount:{}", account)
        } else {
            format!("serviceAccount:{}@{}.iam.gserviceaccount.com", account, project_id)
        }
    }
}

/// Result of [`BindingLifecycleManager::create`](super::BindingLifecycleManager::create)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CreateOutcome {
    Created,
    /// Already present with an identical condition
    Unchanged,
    /// Present with a different condition, which was replaced
    ConditionReplaced { previous: Option<CompiledCondition> },
}

/// Result of [`BindingLifecycleManager::remove`](super::BindingLifecycleManager::remove)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoveOutcome {
    Removed,
    AlreadyAbsent,
}

/// Best-effort listing: bindings that could be read plus any transport error
#[derive(Debug, Default)]
pub struct ListOutcome {
    pub bindings: Vec<IamBinding>,
    pub error: Option<BindingError>,
}

impl ListOutcome {
    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

/// Errors that can occur during binding operations
#[derive(Debug, Error)]
pub enum BindingError {
    /// Transport failure, passed through unchanged
    #[error(transparent)]
    OperationFailed(#[from] anyhow::Error),

    /// The binding's condition failed validation
    #[error("Binding condition rejected: {0}")]
    ExpressionInvalid(#[from] ConditionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(role: &str, expression: Option<&str>) -> IamBinding {
        IamBinding {
            role: role.to_string(),
            member: FederatedPrincipal::repository("123", "github-pool", "acme/app"),
            repository: "acme/app".to_string(),
            pool_id: "github-pool".to_string(),
            provider_id: "github".to_string(),
            condition: expression.map(|e| CompiledCondition::new("repo", e)),
        }
    }

    #[test]
    fn test_principal_format() {
        assert_eq!(
            FederatedPrincipal::repository("123", "github-pool", "acme/app"),
            "principalSet://iam.googleapis.com/projects/123/locations/global/workloadIdentityPools/github-pool/attribute.repository/acme/app"
        );
    }

    #[test]
    fn test_service_account_member() {
        assert_eq!(
            FederatedPrincipal::service_account("acme-prod", "deployer"),
            "serviceAccount:deployer@acme-prod.iam.gserviceaccount.com"
        );
        assert_eq!(
            FederatedPrincipal::service_account("acme-prod", "ci@other.iam.gserviceaccount.com"),
            "serviceAccount:ci@other.iam.gserviceaccount.com"
        );
    }

    #[test]
    fn test_key_ignores_condition() {
        let a = binding("roles/iam.workloadIdentityUser", Some("repository == 'acme/app'"));
        let b = binding("roles/iam.workloadIdentityUser", None);
        assert_eq!(a.key(), b.key());
        assert!(!a.same_condition(&b));
    }

    #[test]
    fn test_same_condition_ignores_title() {
        let a = binding("r", Some("repository == 'acme/app'"));
        let mut b = a.clone();
        b.condition = Some(CompiledCondition::new("other title", "repository == 'acme/app'"));
        assert!(a.same_condition(&b));
    }

    #[test]
    fn test_keys_order_by_role_then_pool_then_provider() {
        let mut keys = vec![
            BindingKey { role: "b".into(), pool_id: "p1".into(), provider_id: "x".into(), repository: "r".into() },
            BindingKey { role: "a".into(), pool_id: "p2".into(), provider_id: "x".into(), repository: "r".into() },
            BindingKey { role: "a".into(), pool_id: "p1".into(), provider_id: "y".into(), repository: "r".into() },
            BindingKey { role: "a".into(), pool_id: "p1".into(), provider_id: "x".into(), repository: "r".into() },
        ];
        keys.sort();
        let order: Vec<(&str, &str, &str)> = keys
            .iter()
            .map(|k| (k.role.as_str(), k.pool_id.as_str(), k.provider_id.as_str()))
            .collect();
        assert_eq!(order, vec![("a", "p1", "x"), ("a", "p1", "y"), ("a", "p2", "x"), ("b", "p1", "x")]);
    }

    #[test]
    fn test_transport_error_is_transparent() {
        let err: BindingError = anyhow::anyhow!("IAM API returned 403 Forbidden").into();
        assert_eq!(err.to_string(), "IAM API returned 403 Forbidden");
    }
}
