//! Types for workload identity setup

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::config::FederationConfig;
use crate::agents::bindings::IamBinding;
use crate::agents::conflicts::{
    ConflictDetectionResult, DetectionPolicy, RecommendedAction, ResourceDescriptor, ResourceKind,
};
use crate::agents::trust::{CompiledCondition, ConditionError, TrustConditionSpec};

/// Write capability for service accounts, pools and providers
#[async_trait]
pub trait ResourceProvisioner: Send + Sync {
    /// Create the described resource with its desired configuration
    async fn create_resource(&self, descriptor: &ResourceDescriptor) -> Result<()>;

    /// Reconcile an existing resource to its desired configuration
    async fn update_resource(&self, descriptor: &ResourceDescriptor) -> Result<()>;

    /// Delete the resource. Returns `false` if it was already absent.
    async fn delete_resource(&self, descriptor: &ResourceDescriptor) -> Result<bool>;
}

/// What to set up: resource names plus the trust policy for the binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupRequest {
    pub config: FederationConfig,
    pub trust: TrustConditionSpec,
}

impl SetupRequest {
    pub fn new(config: FederationConfig, trust: TrustConditionSpec) -> Self {
        Self { config, trust }
    }
}

/// Resources touched by cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    All,
    #[value(alias = "binding")]
    Bindings,
    Provider,
    Pool,
    #[value(alias = "sa")]
    ServiceAccount,
}

impl Scope {
    pub fn includes(&self, target: Target) -> bool {
        match self {
            Scope::All => true,
            Scope::Bindings => target == Target::Binding,
            Scope::Provider => target == Target::WorkloadIdentityProvider,
            Scope::Pool => target == Target::WorkloadIdentityPool,
            Scope::ServiceAccount => target == Target::ServiceAccount,
        }
    }
}

/// Behaviour switches for setup and cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupOptions {
    /// Create resources that do not exist yet
    pub create_new: bool,
    /// Update existing resources whose configuration differs
    pub allow_update: bool,
    /// Proceed even when conflict detection says not to
    pub force: bool,
    /// Keep going after a failed step
    pub ignore_errors: bool,
    /// Record planned actions without changing anything
    pub dry_run: bool,
    /// Provision the service account and pool concurrently
    pub parallel: bool,
    pub scope: Scope,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            create_new: true,
            allow_update: false,
            force: false,
            ignore_errors: false,
            dry_run: false,
            parallel: true,
            scope: Scope::All,
        }
    }
}

impl SetupOptions {
    pub fn policy(&self) -> DetectionPolicy {
        DetectionPolicy {
            create_new: self.create_new,
            allow_update: self.allow_update,
            ..Default::default()
        }
    }
}

/// Thing an action was applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    ServiceAccount,
    WorkloadIdentityPool,
    WorkloadIdentityProvider,
    Binding,
}

impl From<ResourceKind> for Target {
    fn from(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::ServiceAccount => Target::ServiceAccount,
            ResourceKind::WorkloadIdentityPool => Target::WorkloadIdentityPool,
            ResourceKind::WorkloadIdentityProvider => Target::WorkloadIdentityProvider,
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::ServiceAccount => write!(f, "service account"),
            Target::WorkloadIdentityPool => write!(f, "workload identity pool"),
            Target::WorkloadIdentityProvider => write!(f, "workload identity provider"),
            Target::Binding => write!(f, "binding"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
    /// Leave the live resource alone
    Keep,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
            Operation::Keep => write!(f, "keep"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied,
    Skipped,
    Failed,
    /// Dry run only
    Planned,
}

/// One step of a setup, cleanup or rollback run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub target: Target,
    pub name: String,
    pub operation: Operation,
    pub outcome: ActionOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ActionRecord {
    pub fn new(target: Target, name: impl Into<String>, operation: Operation, outcome: ActionOutcome) -> Self {
        Self {
            target,
            name: name.into(),
            operation,
            outcome,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Everything computed before any change is made
#[derive(Debug, Clone)]
pub struct SetupPlan {
    pub condition: CompiledCondition,
    /// Service account, pool and provider, with their observed live state
    pub descriptors: Vec<ResourceDescriptor>,
    pub binding: IamBinding,
    pub detection: ConflictDetectionResult,
}

/// Result of one setup, cleanup or rollback run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupReport {
    pub run_id: Uuid,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<CompiledCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection: Option<ConflictDetectionResult>,
    pub actions: Vec<ActionRecord>,
    pub completed_at: DateTime<Utc>,
}

impl SetupReport {
    pub(crate) fn start(dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            dry_run,
            condition: None,
            detection: None,
            actions: vec![],
            completed_at: Utc::now(),
        }
    }

    pub(crate) fn finish(mut self) -> Self {
        self.completed_at = Utc::now();
        self
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ActionRecord> {
        self.actions.iter().filter(|a| a.outcome == ActionOutcome::Failed)
    }

    /// Targets this run created, in creation order
    pub fn created(&self) -> impl Iterator<Item = &ActionRecord> {
        self.actions
            .iter()
            .filter(|a| a.operation == Operation::Create && a.outcome == ActionOutcome::Applied)
    }

    pub fn action_for(&self, target: Target) -> Option<&ActionRecord> {
        self.actions.iter().find(|a| a.target == target)
    }
}

/// Errors that stop a setup run before or during provisioning
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Trust condition rejected: {0}")]
    Condition(#[from] ConditionError),

    #[error("Refusing to proceed ({action}): {summary}")]
    Blocked {
        action: RecommendedAction,
        summary: String,
    },

    #[error("Failed to {operation} {target} '{name}': {reason}")]
    OperationFailed {
        target: Target,
        name: String,
        operation: Operation,
        reason: String,
    },
}
