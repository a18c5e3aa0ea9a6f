//! Workload Identity Setup Orchestrator
//!
//! Sequences condition compilation, conflict detection, resource
//! provisioning and binding creation for one GitHub repository.
//!
//! ## Ordering
//!
//! Setup: service account and pool (concurrently when `parallel`), then the
//! provider, then the conditional binding. Cleanup runs the reverse, and
//! rollback only undoes what a given report created.

use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::config::WORKLOAD_IDENTITY_USER_ROLE;
use super::types::*;
use crate::agents::bindings::{
    BindingLifecycleManager, BindingTransport, CreateOutcome, IamBinding, RemoveOutcome,
};
use crate::agents::conflicts::classification::diff;
use crate::agents::conflicts::{
    assess, ConflictDetector, Observation, PoolConfig, ProviderConfig, ResourceDescriptor, ResourceKind,
    ServiceAccountConfig, StateFetcher,
};
use crate::agents::trust::{compile, validate, CompiledCondition};

/// Standard GitHub Actions OIDC claim mapping
pub fn github_attribute_mapping() -> BTreeMap<String, String> {
    [
        ("google.subject", "assertion.sub"),
        ("attribute.repository", "assertion.repository"),
        ("attribute.repository_owner", "assertion.repository_owner"),
        ("attribute.actor", "assertion.actor"),
        ("attribute.ref", "assertion.ref"),
        ("attribute.job_workflow_ref", "assertion.job_workflow_ref"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Desired service account, pool and provider for `request`, in setup order
pub fn descriptors(request: &SetupRequest, condition: Option<&CompiledCondition>) -> Vec<ResourceDescriptor> {
    let config = &request.config;
    let trust = &request.trust;

    let service_account = ServiceAccountConfig {
        display_name: format!("GitHub Actions ({})", trust.repository),
        description: format!("Impersonated by GitHub Actions workflows of {}", trust.repository),
        roles: config.roles.iter().cloned().collect(),
        disabled: false,
    };

    let pool = PoolConfig {
        display_name: "GitHub Actions".to_string(),
        description: "Identity pool for GitHub Actions OIDC tokens".to_string(),
        ..Default::default()
    };

    let provider = ProviderConfig {
        pool_id: config.pool_id.clone(),
        display_name: "GitHub".to_string(),
        description: format!("GitHub Actions OIDC provider for {}", trust.repository),
        issuer_uri: config.issuer_uri.clone(),
        attribute_mapping: github_attribute_mapping(),
        condition: condition.cloned(),
        repository: Some(trust.repository.clone()),
        allowed_branches: Some(trust.allowed_branches.iter().cloned().collect::<BTreeSet<_>>()),
        allowed_tags: Some(trust.allowed_tags.iter().cloned().collect::<BTreeSet<_>>()),
        ..Default::default()
    };

    vec![
        ResourceDescriptor::service_account(&config.project_id, &config.service_account_email(), service_account),
        ResourceDescriptor::pool(&config.project_id, &config.pool_id, pool),
        ResourceDescriptor::provider(&config.project_id, &config.provider_id, provider),
    ]
}

/// The impersonation binding for `request`
pub fn binding_for(request: &SetupRequest, condition: Option<CompiledCondition>) -> IamBinding {
    let config = &request.config;
    IamBinding {
        role: WORKLOAD_IDENTITY_USER_ROLE.to_string(),
        member: config.principal(&request.trust.repository),
        repository: request.trust.repository.clone(),
        pool_id: config.pool_id.clone(),
        provider_id: config.provider_id.clone(),
        condition,
    }
}

/// Orchestration facade over the detector, a provisioner and the binding manager
pub struct WorkloadIdentitySetup {
    provisioner: Arc<dyn ResourceProvisioner>,
    detector: ConflictDetector,
    bindings: BindingLifecycleManager,
}

impl WorkloadIdentitySetup {
    pub fn new(
        fetcher: Arc<dyn StateFetcher>,
        provisioner: Arc<dyn ResourceProvisioner>,
        transport: Arc<dyn BindingTransport>,
    ) -> Self {
        Self {
            detector: ConflictDetector::new(fetcher),
            bindings: BindingLifecycleManager::new(transport),
            provisioner,
        }
    }

    /// Use one client for every capability
    pub fn with_cloud<C>(cloud: Arc<C>) -> Self
    where
        C: StateFetcher + ResourceProvisioner + BindingTransport + 'static,
    {
        Self::new(cloud.clone(), cloud.clone(), cloud)
    }

    pub fn bindings(&self) -> &BindingLifecycleManager {
        &self.bindings
    }

    /// Compile the trust condition, observe live state and detect conflicts
    pub async fn plan(&self, request: &SetupRequest, options: &SetupOptions) -> Result<SetupPlan, ProvisionError> {
        let condition = compile(&request.trust)?;
        validate(&condition.expression)?;

        let (observed, failures) = self
            .detector
            .observe(descriptors(request, Some(&condition)))
            .await;
        let detection = assess(&observed, failures, options.policy());
        let binding = binding_for(request, Some(condition.clone()));

        info!(
            repository = %request.trust.repository,
            condition = %condition.title,
            conflicts = detection.total_conflicts,
            can_proceed = detection.can_proceed,
            "Setup planned"
        );

        Ok(SetupPlan {
            condition,
            descriptors: observed,
            binding,
            detection,
        })
    }

    /// Provision everything `request` needs
    pub async fn setup(&self, request: &SetupRequest, options: &SetupOptions) -> Result<SetupReport, ProvisionError> {
        let plan = self.plan(request, options).await?;

        let blocked = !plan.detection.can_proceed || !plan.detection.is_complete();
        if blocked && !options.force {
            warn!(
                action = %plan.detection.recommended_action,
                summary = %plan.detection.summary,
                "Setup blocked by conflicts"
            );
            return Err(ProvisionError::Blocked {
                action: plan.detection.recommended_action,
                summary: plan.detection.summary.clone(),
            });
        }
        if blocked {
            warn!(summary = %plan.detection.summary, "Proceeding despite conflicts (forced)");
        }

        let mut report = SetupReport::start(options.dry_run);
        report.condition = Some(plan.condition.clone());

        // Providers depend on their pool; everything else is independent.
        let (providers, independent): (Vec<&ResourceDescriptor>, Vec<&ResourceDescriptor>) = plan
            .descriptors
            .iter()
            .partition(|d| d.kind() == ResourceKind::WorkloadIdentityProvider);

        let first = if options.parallel {
            join_all(independent.iter().map(|d| self.provision(d, options))).await
        } else {
            let mut records = Vec::new();
            for descriptor in &independent {
                records.push(self.provision(descriptor, options).await);
            }
            records
        };

        let mut halted = self.record_all(&mut report, first, options);

        for provider in providers {
            if halted {
                break;
            }
            let record = self.provision(provider, options).await;
            halted = self.record_all(&mut report, vec![record], options);
        }

        if !halted {
            let record = self.ensure_binding(&plan.binding, options).await;
            self.record_all(&mut report, vec![record], options);
        }

        report.detection = Some(plan.detection);
        let report = report.finish();

        info!(
            run_id = %report.run_id,
            actions = report.actions.len(),
            created = report.created().count(),
            failed = report.failures().count(),
            dry_run = report.dry_run,
            "Setup complete"
        );
        Ok(report)
    }

    /// Append records, returning true when the run must stop
    fn record_all(&self, report: &mut SetupReport, records: Vec<ActionRecord>, options: &SetupOptions) -> bool {
        let failed = records.iter().any(|r| r.outcome == ActionOutcome::Failed);
        report.actions.extend(records);
        failed && !options.ignore_errors
    }

    async fn provision(&self, descriptor: &ResourceDescriptor, options: &SetupOptions) -> ActionRecord {
        let target = Target::from(descriptor.kind());
        if descriptor.existing == Observation::Unknown {
            return failed(
                target,
                &descriptor.name,
                Operation::Keep,
                anyhow::anyhow!("live state unavailable"),
            );
        }
        let (operation, reason) = decide(descriptor, options);

        if operation == Operation::Keep {
            return ActionRecord::new(target, &descriptor.name, operation, ActionOutcome::Skipped).with_detail(reason);
        }
        if options.dry_run {
            info!(kind = %target, resource = %descriptor.name, operation = %operation, "DRY RUN - would apply");
            return ActionRecord::new(target, &descriptor.name, operation, ActionOutcome::Planned).with_detail(reason);
        }

        let result = match operation {
            Operation::Create => self.provisioner.create_resource(descriptor).await,
            Operation::Update => self.provisioner.update_resource(descriptor).await,
            Operation::Delete | Operation::Keep => Ok(()),
        };

        match result {
            Ok(()) => {
                info!(kind = %target, resource = %descriptor.name, operation = %operation, "Resource provisioned");
                ActionRecord::new(target, &descriptor.name, operation, ActionOutcome::Applied)
            }
            Err(e) => failed(target, &descriptor.name, operation, e),
        }
    }

    async fn ensure_binding(&self, binding: &IamBinding, options: &SetupOptions) -> ActionRecord {
        if options.dry_run {
            info!(role = %binding.role, member = %binding.member, "DRY RUN - would bind");
            return ActionRecord::new(Target::Binding, &binding.role, Operation::Create, ActionOutcome::Planned)
                .with_detail(binding.member.clone());
        }

        match self.bindings.create(binding).await {
            Ok(CreateOutcome::Created) => {
                ActionRecord::new(Target::Binding, &binding.role, Operation::Create, ActionOutcome::Applied)
            }
            Ok(CreateOutcome::Unchanged) => {
                ActionRecord::new(Target::Binding, &binding.role, Operation::Keep, ActionOutcome::Skipped)
                    .with_detail("condition unchanged")
            }
            Ok(CreateOutcome::ConditionReplaced { .. }) => {
                ActionRecord::new(Target::Binding, &binding.role, Operation::Update, ActionOutcome::Applied)
                    .with_detail("condition replaced")
            }
            Err(e) => failed(Target::Binding, &binding.role, Operation::Create, e.into()),
        }
    }

    /// Remove the binding, provider, pool and service account within `options.scope`
    pub async fn cleanup(&self, request: &SetupRequest, options: &SetupOptions) -> SetupReport {
        let mut report = SetupReport::start(options.dry_run);

        if options.scope.includes(Target::Binding) {
            let binding = binding_for(request, None);
            let record = self.unbind(&binding, options).await;
            if self.record_all(&mut report, vec![record], options) {
                return self.finish_cleanup(report);
            }
        }

        for descriptor in descriptors(request, None).iter().rev() {
            if !options.scope.includes(Target::from(descriptor.kind())) {
                continue;
            }
            let record = self.delete(descriptor, options).await;
            if self.record_all(&mut report, vec![record], options) {
                break;
            }
        }

        self.finish_cleanup(report)
    }

    fn finish_cleanup(&self, report: SetupReport) -> SetupReport {
        let report = report.finish();
        info!(
            run_id = %report.run_id,
            actions = report.actions.len(),
            failed = report.failures().count(),
            "Cleanup complete"
        );
        report
    }

    /// Undo the creations recorded in `report`, newest first
    pub async fn rollback(&self, request: &SetupRequest, report: &SetupReport) -> SetupReport {
        let mut rollback = SetupReport::start(false);
        let resources = descriptors(request, None);
        let options = SetupOptions {
            ignore_errors: true,
            ..Default::default()
        };

        let created: Vec<&ActionRecord> = report.created().collect();
        for action in created.into_iter().rev() {
            let record = match action.target {
                Target::Binding => self.unbind(&binding_for(request, None), &options).await,
                target => match resources.iter().find(|d| Target::from(d.kind()) == target) {
                    Some(descriptor) => self.delete(descriptor, &options).await,
                    None => continue,
                },
            };
            rollback.actions.push(record);
        }

        let rollback = rollback.finish();
        info!(
            run_id = %report.run_id,
            undone = rollback.actions.len(),
            failed = rollback.failures().count(),
            "Rollback complete"
        );
        rollback
    }

    async fn unbind(&self, binding: &IamBinding, options: &SetupOptions) -> ActionRecord {
        if options.dry_run {
            return ActionRecord::new(Target::Binding, &binding.role, Operation::Delete, ActionOutcome::Planned)
                .with_detail(binding.member.clone());
        }

        match self.bindings.remove(binding).await {
            Ok(RemoveOutcome::Removed) => {
                ActionRecord::new(Target::Binding, &binding.role, Operation::Delete, ActionOutcome::Applied)
            }
            Ok(RemoveOutcome::AlreadyAbsent) => {
                ActionRecord::new(Target::Binding, &binding.role, Operation::Delete, ActionOutcome::Skipped)
                    .with_detail("already absent")
            }
            Err(e) => failed(Target::Binding, &binding.role, Operation::Delete, e.into()),
        }
    }

    async fn delete(&self, descriptor: &ResourceDescriptor, options: &SetupOptions) -> ActionRecord {
        let target = Target::from(descriptor.kind());
        if options.dry_run {
            return ActionRecord::new(target, &descriptor.name, Operation::Delete, ActionOutcome::Planned);
        }

        match self.provisioner.delete_resource(descriptor).await {
            Ok(true) => {
                info!(kind = %target, resource = %descriptor.name, "Resource deleted");
                ActionRecord::new(target, &descriptor.name, Operation::Delete, ActionOutcome::Applied)
            }
            Ok(false) => ActionRecord::new(target, &descriptor.name, Operation::Delete, ActionOutcome::Skipped)
                .with_detail("already absent"),
            Err(e) => failed(target, &descriptor.name, Operation::Delete, e),
        }
    }
}

/// Operation for one resource given its observed state
fn decide(descriptor: &ResourceDescriptor, options: &SetupOptions) -> (Operation, String) {
    match &descriptor.existing {
        Observation::Unknown => (Operation::Keep, "live state unavailable".to_string()),
        Observation::Absent if options.create_new || options.force => {
            (Operation::Create, "not found".to_string())
        }
        Observation::Absent => (Operation::Keep, "not found; creation disabled".to_string()),
        Observation::Present(live) if live.state().is_some_and(|s| s.is_terminal()) => {
            (Operation::Keep, format!("live resource is {}", live.state().unwrap_or_default()))
        }
        Observation::Present(live) => {
            let changed = diff(&descriptor.desired, live).map_or(0, |d| d.len());
            if changed == 0 {
                (Operation::Keep, "up to date".to_string())
            } else if options.allow_update || options.force {
                (Operation::Update, format!("{} field(s) differ", changed))
            } else {
                (Operation::Keep, format!("{} field(s) differ; updates disabled", changed))
            }
        }
    }
}

fn failed(target: Target, name: &str, operation: Operation, e: anyhow::Error) -> ActionRecord {
    let err = ProvisionError::OperationFailed {
        target,
        name: name.to_string(),
        operation,
        reason: format!("{:#}", e),
    };
    error!(error = %err, "Provisioning step failed");
    ActionRecord::new(target, name, operation, ActionOutcome::Failed).with_detail(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::conflicts::{LifecycleState, RecommendedAction, ResourceConfig};
    use crate::agents::setup::FederationConfig;
    use crate::agents::trust::TrustConditionSpec;
    use crate::tools::memory::InMemoryCloud;

    fn request() -> SetupRequest {
        let config = FederationConfig::new("acme-prod", "123456", "deployer", "acme/app")
            .with_roles(["roles/run.admin"]);
        let trust = TrustConditionSpec::new("acme/app").branch("main");
        SetupRequest::new(config, trust)
    }

    fn setup() -> (Arc<InMemoryCloud>, WorkloadIdentitySetup) {
        let cloud = Arc::new(InMemoryCloud::new());
        let facade = WorkloadIdentitySetup::with_cloud(cloud.clone());
        (cloud, facade)
    }

    fn outcomes(report: &SetupReport) -> Vec<(Target, Operation, ActionOutcome)> {
        report.actions.iter().map(|a| (a.target, a.operation, a.outcome)).collect()
    }

    #[tokio::test]
    async fn test_setup_creates_everything_in_order() {
        let (cloud, facade) = setup();

        let report = facade.setup(&request(), &SetupOptions::default()).await.unwrap();

        assert!(report.is_success());
        assert_eq!(
            outcomes(&report),
            vec![
                (Target::ServiceAccount, Operation::Create, ActionOutcome::Applied),
                (Target::WorkloadIdentityPool, Operation::Create, ActionOutcome::Applied),
                (Target::WorkloadIdentityProvider, Operation::Create, ActionOutcome::Applied),
                (Target::Binding, Operation::Create, ActionOutcome::Applied),
            ]
        );
        assert_eq!(report.condition.as_ref().unwrap().title, "repo+branch");
        assert_eq!(cloud.bindings().await.len(), 1);
        assert!(cloud
            .resource(ResourceKind::WorkloadIdentityProvider, "github-provider")
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_second_setup_is_a_no_op_when_updates_allowed() {
        let (cloud, facade) = setup();
        let options = SetupOptions {
            allow_update: true,
            ..Default::default()
        };
        facade.setup(&request(), &options).await.unwrap();

        let report = facade.setup(&request(), &options).await.unwrap();

        assert!(report.actions.iter().all(|a| a.outcome == ActionOutcome::Skipped));
        assert_eq!(report.detection.as_ref().unwrap().total_conflicts, 0);
        assert_eq!(cloud.bindings().await.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_resources_block_setup_unless_forced() {
        let (_cloud, facade) = setup();
        facade.setup(&request(), &SetupOptions::default()).await.unwrap();

        let err = facade.setup(&request(), &SetupOptions::default()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Blocked { .. }));

        let forced = SetupOptions {
            force: true,
            ..Default::default()
        };
        let report = facade.setup(&request(), &forced).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.created().count(), 0);
    }

    #[tokio::test]
    async fn test_changed_trust_replaces_binding_condition() {
        let (cloud, facade) = setup();
        let options = SetupOptions {
            allow_update: true,
            ..Default::default()
        };
        facade.setup(&request(), &options).await.unwrap();

        let mut changed = request();
        changed.trust = changed.trust.tag("v*");
        let report = facade.setup(&changed, &options).await.unwrap();

        assert_eq!(
            report.action_for(Target::Binding).map(|a| (a.operation, a.outcome)),
            Some((Operation::Update, ActionOutcome::Applied))
        );
        assert_eq!(
            report.action_for(Target::WorkloadIdentityProvider).map(|a| a.operation),
            Some(Operation::Update)
        );
        let bindings = cloud.bindings().await;
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].condition.as_ref().unwrap().title, "repo+branch+tag");
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let (cloud, facade) = setup();
        let options = SetupOptions {
            dry_run: true,
            ..Default::default()
        };

        let report = facade.setup(&request(), &options).await.unwrap();

        assert!(report.dry_run);
        assert!(report.actions.iter().all(|a| a.outcome == ActionOutcome::Planned));
        assert_eq!(report.actions.len(), 4);
        assert!(cloud.resource(ResourceKind::ServiceAccount, "deployer@acme-prod.iam.gserviceaccount.com").await.is_none());
        assert!(cloud.bindings().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_trust_spec_fails_before_any_call() {
        let (cloud, facade) = setup();
        let mut bad = request();
        bad.trust = TrustConditionSpec::new("not-a-repo");

        let err = facade.setup(&bad, &SetupOptions::default()).await.unwrap_err();

        assert!(matches!(err, ProvisionError::Condition(_)));
        assert!(cloud.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_stops_run_unless_ignored() {
        let (cloud, facade) = setup();
        cloud.fail_provisioning("github-pool", "IAM API returned 403 Forbidden").await;

        let report = facade.setup(&request(), &SetupOptions::default()).await.unwrap();
        assert!(!report.is_success());
        assert!(report.action_for(Target::WorkloadIdentityProvider).is_none());
        assert!(report.action_for(Target::Binding).is_none());
        let failure = report.failures().next().unwrap();
        assert!(failure.detail.as_ref().unwrap().contains("403 Forbidden"));

        let (cloud, facade) = setup();
        cloud.fail_provisioning("github-pool", "IAM API returned 403 Forbidden").await;
        let options = SetupOptions {
            ignore_errors: true,
            ..Default::default()
        };
        let report = facade.setup(&request(), &options).await.unwrap();
        assert_eq!(report.failures().count(), 1);
        assert!(report.action_for(Target::Binding).is_some());
    }

    #[tokio::test]
    async fn test_sequential_setup_matches_parallel() {
        let (_cloud, facade) = setup();
        let options = SetupOptions {
            parallel: false,
            ..Default::default()
        };

        let report = facade.setup(&request(), &options).await.unwrap();

        assert_eq!(report.created().count(), 4);
    }

    #[tokio::test]
    async fn test_deleted_pool_blocks_setup() {
        let (cloud, facade) = setup();
        cloud
            .seed_resource(
                "github-pool",
                ResourceConfig::WorkloadIdentityPool(PoolConfig {
                    state: LifecycleState::Deleted,
                    ..Default::default()
                }),
            )
            .await;

        let err = facade.setup(&request(), &SetupOptions::default()).await.unwrap_err();

        match err {
            ProvisionError::Blocked { action, .. } => {
                assert_eq!(action, RecommendedAction::ManualInterventionRequired)
            }
            other => panic!("expected Blocked, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_plan_fetches_each_resource_once() {
        let (cloud, facade) = setup();
        cloud.fail_fetch("github-pool", "IAM API returned 503").await;

        let plan = facade.plan(&request(), &SetupOptions::default()).await.unwrap();

        let pool_fetches = cloud
            .calls()
            .await
            .into_iter()
            .filter(|c| c == "fetch github-pool")
            .count();
        assert_eq!(pool_fetches, 1);
        assert_eq!(plan.detection.fetch_failures.len(), 1);
        assert_eq!(plan.detection.fetch_failures[0].resource_name, "github-pool");
    }

    #[tokio::test]
    async fn test_transient_fetch_failure_blocks_setup() {
        let (cloud, facade) = setup();
        cloud.fail_fetch_once("github-pool", "IAM API returned 503").await;

        let err = facade.setup(&request(), &SetupOptions::default()).await.unwrap_err();

        match err {
            ProvisionError::Blocked { action, .. } => assert_eq!(action, RecommendedAction::ResolveThenRetry),
            other => panic!("expected Blocked, got {:?}", other),
        }
        assert!(cloud.resource(ResourceKind::WorkloadIdentityPool, "github-pool").await.is_none());
        assert!(cloud
            .resource(ResourceKind::WorkloadIdentityProvider, "github-provider")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_forced_setup_fails_on_unobserved_resource() {
        let (cloud, facade) = setup();
        cloud.fail_fetch_once("github-pool", "IAM API returned 503").await;
        let options = SetupOptions {
            force: true,
            ..Default::default()
        };

        let report = facade.setup(&request(), &options).await.unwrap();

        assert!(!report.is_success());
        assert_eq!(
            report.action_for(Target::WorkloadIdentityPool).map(|a| a.outcome),
            Some(ActionOutcome::Failed)
        );
        assert!(report.action_for(Target::WorkloadIdentityProvider).is_none());
        assert!(cloud
            .resource(ResourceKind::WorkloadIdentityProvider, "github-provider")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_service_account_delete_is_recorded() {
        let (cloud, facade) = setup();
        facade.setup(&request(), &SetupOptions::default()).await.unwrap();
        let email = "deployer@acme-prod.iam.gserviceaccount.com";
        cloud.fail_provisioning(email, "IAM API returned 403 Forbidden").await;

        let report = facade.cleanup(&request(), &SetupOptions::default()).await;

        assert!(!report.is_success());
        let failure = report.failures().next().unwrap();
        assert_eq!(failure.target, Target::ServiceAccount);
        assert!(failure.detail.as_ref().unwrap().contains("403 Forbidden"));
        assert!(cloud.resource(ResourceKind::ServiceAccount, email).await.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_removes_in_reverse_order_and_is_repeatable() {
        let (cloud, facade) = setup();
        facade.setup(&request(), &SetupOptions::default()).await.unwrap();

        let report = facade.cleanup(&request(), &SetupOptions::default()).await;
        assert_eq!(
            outcomes(&report),
            vec![
                (Target::Binding, Operation::Delete, ActionOutcome::Applied),
                (Target::WorkloadIdentityProvider, Operation::Delete, ActionOutcome::Applied),
                (Target::WorkloadIdentityPool, Operation::Delete, ActionOutcome::Applied),
                (Target::ServiceAccount, Operation::Delete, ActionOutcome::Applied),
            ]
        );
        assert!(cloud.bindings().await.is_empty());

        let again = facade.cleanup(&request(), &SetupOptions::default()).await;
        assert!(again.is_success());
        assert!(again.actions.iter().all(|a| a.outcome == ActionOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_cleanup_respects_scope() {
        let (cloud, facade) = setup();
        facade.setup(&request(), &SetupOptions::default()).await.unwrap();
        let options = SetupOptions {
            scope: Scope::Bindings,
            ..Default::default()
        };

        let report = facade.cleanup(&request(), &options).await;

        assert_eq!(report.actions.len(), 1);
        assert!(cloud.bindings().await.is_empty());
        assert!(cloud.resource(ResourceKind::WorkloadIdentityPool, "github-pool").await.is_some());
    }

    #[tokio::test]
    async fn test_rollback_only_undoes_created_resources() {
        let (cloud, facade) = setup();
        cloud
            .seed_resource(
                "deployer@acme-prod.iam.gserviceaccount.com",
                ResourceConfig::ServiceAccount(ServiceAccountConfig::default()),
            )
            .await;
        let options = SetupOptions {
            allow_update: true,
            ..Default::default()
        };
        let report = facade.setup(&request(), &options).await.unwrap();
        assert_eq!(
            report.action_for(Target::ServiceAccount).map(|a| a.operation),
            Some(Operation::Update)
        );

        let rollback = facade.rollback(&request(), &report).await;

        let undone: Vec<Target> = rollback.actions.iter().map(|a| a.target).collect();
        assert_eq!(
            undone,
            vec![Target::Binding, Target::WorkloadIdentityProvider, Target::WorkloadIdentityPool]
        );
        assert!(cloud
            .resource(ResourceKind::ServiceAccount, "deployer@acme-prod.iam.gserviceaccount.com")
            .await
            .is_some());
        assert!(cloud.resource(ResourceKind::WorkloadIdentityPool, "github-pool").await.is_none());
    }

    #[test]
    fn test_attribute_mapping_covers_github_claims() {
        let mapping = github_attribute_mapping();
        assert_eq!(mapping["google.subject"], "assertion.sub");
        assert_eq!(mapping["attribute.repository"], "assertion.repository");
        assert_eq!(mapping.len(), 6);
    }
}
