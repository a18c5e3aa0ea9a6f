//! Binding Lifecycle Manager
//!
//! Idempotent create/list/remove of conditional IAM bindings.
//!
//! Per binding key the lifecycle is
//! `Absent -> Present(C1) -> Present(C2) -> Absent`:
//! creating with an identical condition is a no-op, creating with a
//! different condition replaces it in place, and removing an absent
//! binding succeeds.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use super::types::*;
use crate::agents::trust::validate;

/// Network capability for reading and writing IAM bindings
#[async_trait]
pub trait BindingTransport: Send + Sync {
    /// All bindings whose member is `principal`, in any order
    async fn list_bindings(&self, principal: &str) -> Result<Vec<IamBinding>>;

    /// Add a new binding
    async fn create_binding(&self, binding: &IamBinding) -> Result<()>;

    /// Swap the condition of `existing` for the one on `replacement`
    async fn replace_condition(&self, existing: &IamBinding, replacement: &IamBinding) -> Result<()>;

    /// Delete exactly `binding` (as returned by `list_bindings`)
    async fn remove_binding(&self, binding: &IamBinding) -> Result<()>;
}

/// Binding lifecycle manager over a transport
pub struct BindingLifecycleManager {
    transport: Arc<dyn BindingTransport>,
}

impl BindingLifecycleManager {
    pub fn new(transport: Arc<dyn BindingTransport>) -> Self {
        Self { transport }
    }

    /// Ensure `binding` exists with its condition, never duplicating its key
    pub async fn create(&self, binding: &IamBinding) -> Result<CreateOutcome, BindingError> {
        if let Some(condition) = &binding.condition {
            validate(&condition.expression)?;
        }

        let key = binding.key();
        let live = self.transport.list_bindings(&binding.member).await?;
        let mut matching = live.iter().filter(|b| b.key() == key);

        let outcome = match matching.next() {
            None => {
                self.transport.create_binding(binding).await?;
                CreateOutcome::Created
            }
            Some(current) if current.same_condition(binding) => CreateOutcome::Unchanged,
            Some(current) => {
                self.transport.replace_condition(current, binding).await?;
                CreateOutcome::ConditionReplaced {
                    previous: current.condition.clone(),
                }
            }
        };

        // Duplicates can only come from out-of-band edits; collapse them.
        for duplicate in matching {
            warn!(
                role = %duplicate.role,
                repository = %duplicate.repository,
                "Removing duplicate binding for key"
            );
            self.transport.remove_binding(duplicate).await?;
        }

        info!(
            role = %binding.role,
            pool = %binding.pool_id,
            provider = %binding.provider_id,
            repository = %binding.repository,
            outcome = ?outcome,
            "Binding ensured"
        );
        Ok(outcome)
    }

    /// Bindings for `principal`, ordered by role, pool, then provider.
    ///
    /// Transport failures yield an empty list with the error reported
    /// alongside, for best-effort display.
    pub async fn list(&self, principal: &str) -> ListOutcome {
        match self.transport.list_bindings(principal).await {
            Ok(mut bindings) => {
                bindings.retain(|b| b.member == principal);
                bindings.sort_by_key(|b| b.key());
                ListOutcome {
                    bindings,
                    error: None,
                }
            }
            Err(e) => {
                warn!(principal = %principal, error = %e, "Failed to list bindings");
                ListOutcome {
                    bindings: vec![],
                    error: Some(BindingError::OperationFailed(e)),
                }
            }
        }
    }

    /// Remove the binding with `binding`'s key, whatever its condition
    pub async fn remove(&self, binding: &IamBinding) -> Result<RemoveOutcome, BindingError> {
        let key = binding.key();
        let live = self.transport.list_bindings(&binding.member).await?;

        let mut removed = false;
        for current in live.iter().filter(|b| b.key() == key) {
            self.transport.remove_binding(current).await?;
            removed = true;
        }

        let outcome = if removed {
            RemoveOutcome::Removed
        } else {
            RemoveOutcome::AlreadyAbsent
        };
        info!(
            role = %binding.role,
            repository = %binding.repository,
            outcome = ?outcome,
            "Binding removed"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::trust::{compile, CompiledCondition, TrustConditionSpec};
    use crate::tools::memory::InMemoryCloud;

    const ROLE: &str = "roles/iam.workloadIdentityUser";

    fn binding(spec: &TrustConditionSpec) -> IamBinding {
        IamBinding {
            role: ROLE.to_string(),
            member: FederatedPrincipal::repository("123", "github-pool", &spec.repository),
            repository: spec.repository.clone(),
            pool_id: "github-pool".to_string(),
            provider_id: "github".to_string(),
            condition: Some(compile(spec).unwrap()),
        }
    }

    fn setup() -> (Arc<InMemoryCloud>, BindingLifecycleManager) {
        let cloud = Arc::new(InMemoryCloud::new());
        let manager = BindingLifecycleManager::new(cloud.clone());
        (cloud, manager)
    }

    #[tokio::test]
    async fn test_create_twice_leaves_one_binding() {
        let (_cloud, manager) = setup();
        let b = binding(&TrustConditionSpec::new("acme/app").branch("main"));

        assert_eq!(manager.create(&b).await.unwrap(), CreateOutcome::Created);
        assert_eq!(manager.create(&b).await.unwrap(), CreateOutcome::Unchanged);

        let listed = manager.list(&b.member).await;
        assert!(!listed.is_degraded());
        assert_eq!(listed.bindings, vec![b]);
    }

    #[tokio::test]
    async fn test_create_with_new_condition_replaces_in_place() {
        let (_cloud, manager) = setup();
        let first = binding(&TrustConditionSpec::new("acme/app").branch("main"));
        let second = binding(&TrustConditionSpec::new("acme/app").branch("main").require_actor(true));

        manager.create(&first).await.unwrap();
        let outcome = manager.create(&second).await.unwrap();

        assert_eq!(
            outcome,
            CreateOutcome::ConditionReplaced {
                previous: first.condition.clone()
            }
        );
        let listed = manager.list(&first.member).await;
        assert_eq!(listed.bindings.len(), 1);
        assert_eq!(listed.bindings[0].condition, second.condition);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_condition_before_calling_transport() {
        let (cloud, manager) = setup();
        let mut b = binding(&TrustConditionSpec::new("acme/app"));
        b.condition = Some(CompiledCondition::new("bad", "repository = 'acme/app'"));

        let err = manager.create(&b).await.unwrap_err();

        assert!(matches!(err, BindingError::ExpressionInvalid(_)));
        assert!(cloud.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_never_created_succeeds() {
        let (_cloud, manager) = setup();
        let b = binding(&TrustConditionSpec::new("acme/app"));

        assert_eq!(manager.remove(&b).await.unwrap(), RemoveOutcome::AlreadyAbsent);
    }

    #[tokio::test]
    async fn test_remove_matches_key_not_condition() {
        let (_cloud, manager) = setup();
        let created = binding(&TrustConditionSpec::new("acme/app").tag("v*"));
        manager.create(&created).await.unwrap();

        let mut other_condition = created.clone();
        other_condition.condition = None;

        assert_eq!(manager.remove(&other_condition).await.unwrap(), RemoveOutcome::Removed);
        assert!(manager.list(&created.member).await.bindings.is_empty());
        assert_eq!(manager.remove(&created).await.unwrap(), RemoveOutcome::AlreadyAbsent);
    }

    #[tokio::test]
    async fn test_list_orders_by_role_pool_provider() {
        let (_cloud, manager) = setup();
        let base = binding(&TrustConditionSpec::new("acme/app"));

        for (role, provider) in [("roles/z", "github"), ("roles/a", "gitlab"), ("roles/a", "github")] {
            let mut b = base.clone();
            b.role = role.to_string();
            b.provider_id = provider.to_string();
            manager.create(&b).await.unwrap();
        }

        let listed = manager.list(&base.member).await;
        let order: Vec<(&str, &str)> = listed
            .bindings
            .iter()
            .map(|b| (b.role.as_str(), b.provider_id.as_str()))
            .collect();
        assert_eq!(order, vec![("roles/a", "github"), ("roles/a", "gitlab"), ("roles/z", "github")]);
    }

    #[tokio::test]
    async fn test_list_failure_degrades_to_empty() {
        let (cloud, manager) = setup();
        let b = binding(&TrustConditionSpec::new("acme/app"));
        manager.create(&b).await.unwrap();
        cloud.fail_bindings("IAM API returned 503").await;

        let listed = manager.list(&b.member).await;

        assert!(listed.bindings.is_empty());
        assert!(listed.is_degraded());
        assert!(listed.error.unwrap().to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_transport_failures_surface_unchanged_on_create_and_remove() {
        let (cloud, manager) = setup();
        let b = binding(&TrustConditionSpec::new("acme/app"));
        cloud.fail_bindings("IAM API returned 403 Forbidden").await;

        let create_err = manager.create(&b).await.unwrap_err();
        assert!(matches!(create_err, BindingError::OperationFailed(_)));
        assert_eq!(create_err.to_string(), "IAM API returned 403 Forbidden");

        let remove_err = manager.remove(&b).await.unwrap_err();
        assert_eq!(remove_err.to_string(), "IAM API returned 403 Forbidden");
    }

    #[tokio::test]
    async fn test_out_of_band_duplicates_are_collapsed() {
        let (cloud, manager) = setup();
        let b = binding(&TrustConditionSpec::new("acme/app"));
        let mut stale = b.clone();
        stale.condition = None;
        cloud.seed_binding(stale.clone()).await;
        cloud.seed_binding(stale).await;

        manager.create(&b).await.unwrap();

        let listed = manager.list(&b.member).await;
        assert_eq!(listed.bindings, vec![b]);
    }
}
