//! Conflict Detection Types
//!
//! Desired/live resource models and the serializable conflict report.
//! Report field names are camelCase and severities serialize as
//! `low|medium|high|critical` for CLI renderers and machine pipelines.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::agents::trust::CompiledCondition;

/// Kind of managed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    ServiceAccount,
    WorkloadIdentityPool,
    WorkloadIdentityProvider,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::ServiceAccount => write!(f, "service account"),
            ResourceKind::WorkloadIdentityPool => write!(f, "workload identity pool"),
            ResourceKind::WorkloadIdentityProvider => write!(f, "workload identity provider"),
        }
    }
}

/// Conflict / difference severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Lifecycle state reported by the IAM API for pools and providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    StateUnspecified,
    #[default]
    Active,
    Deleting,
    Deleted,
}

impl LifecycleState {
    /// Deleted or on its way there; the resource cannot be used or updated
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Deleting | LifecycleState::Deleted)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::StateUnspecified => write!(f, "STATE_UNSPECIFIED"),
            LifecycleState::Active => write!(f, "ACTIVE"),
            LifecycleState::Deleting => write!(f, "DELETING"),
            LifecycleState::Deleted => write!(f, "DELETED"),
        }
    }
}

/// Service account configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountConfig {
    pub display_name: String,
    pub description: String,
    /// Project-level roles granted to the account
    pub roles: BTreeSet<String>,
    pub disabled: bool,
}

/// Workload identity pool configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub display_name: String,
    pub description: String,
    pub disabled: bool,
    pub state: LifecycleState,
}

/// Workload identity provider (OIDC) configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Pool the provider belongs to (identity, not compared)
    pub pool_id: String,
    pub display_name: String,
    pub description: String,
    pub disabled: bool,
    pub state: LifecycleState,
    pub issuer_uri: String,
    pub allowed_audiences: BTreeSet<String>,
    pub attribute_mapping: BTreeMap<String, String>,
    pub condition: Option<CompiledCondition>,
    /// Repository the provider is bound to, when known
    pub repository: Option<String>,
    /// Branch allow-list the condition was compiled from, when known
    pub allowed_branches: Option<BTreeSet<String>>,
    /// Tag allow-list the condition was compiled from, when known
    pub allowed_tags: Option<BTreeSet<String>>,
}

/// Configuration of one resource, tagged by kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ResourceConfig {
    ServiceAccount(ServiceAccountConfig),
    WorkloadIdentityPool(PoolConfig),
    WorkloadIdentityProvider(ProviderConfig),
}

impl ResourceConfig {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceConfig::ServiceAccount(_) => ResourceKind::ServiceAccount,
            ResourceConfig::WorkloadIdentityPool(_) => ResourceKind::WorkloadIdentityPool,
            ResourceConfig::WorkloadIdentityProvider(_) => ResourceKind::WorkloadIdentityProvider,
        }
    }

    /// Lifecycle state, for kinds that have one
    pub fn state(&self) -> Option<LifecycleState> {
        match self {
            ResourceConfig::ServiceAccount(_) => None,
            ResourceConfig::WorkloadIdentityPool(pool) => Some(pool.state),
            ResourceConfig::WorkloadIdentityProvider(provider) => Some(provider.state),
        }
    }
}

/// What is known about a resource's live state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Observation {
    /// Not fetched yet; the detector asks the state fetcher
    #[default]
    Unknown,
    /// Known not to exist
    Absent,
    /// Known live configuration
    Present(ResourceConfig),
}

impl From<Option<ResourceConfig>> for Observation {
    fn from(state: Option<ResourceConfig>) -> Self {
        match state {
            Some(config) => Observation::Present(config),
            None => Observation::Absent,
        }
    }
}

/// One managed resource for a single detection pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub project_id: String,
    /// Resource id (account id or email, pool id, provider id)
    pub name: String,
    pub desired: ResourceConfig,
    pub existing: Observation,
}

impl ResourceDescriptor {
    pub fn new(project_id: impl Into<String>, name: impl Into<String>, desired: ResourceConfig) -> Self {
        Self {
            project_id: project_id.into(),
            name: name.into(),
            desired,
            existing: Observation::Unknown,
        }
    }

    pub fn service_account(project_id: &str, name: &str, config: ServiceAccountConfig) -> Self {
        Self::new(project_id, name, ResourceConfig::ServiceAccount(config))
    }

    pub fn pool(project_id: &str, name: &str, config: PoolConfig) -> Self {
        Self::new(project_id, name, ResourceConfig::WorkloadIdentityPool(config))
    }

    pub fn provider(project_id: &str, name: &str, config: ProviderConfig) -> Self {
        Self::new(project_id, name, ResourceConfig::WorkloadIdentityProvider(config))
    }

    /// Attach a pre-fetched snapshot (`None` = known absent)
    pub fn with_existing(mut self, existing: Option<ResourceConfig>) -> Self {
        self.existing = existing.into();
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.desired.kind()
    }
}

/// A compared configuration field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    DisplayName,
    Description,
    Disabled,
    Roles,
    State,
    IssuerUri,
    AllowedAudiences,
    AttributeMapping,
    AttributeCondition,
    Repository,
    AllowedBranches,
    AllowedTags,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::DisplayName => "displayName",
            Field::Description => "description",
            Field::Disabled => "disabled",
            Field::Roles => "roles",
            Field::State => "state",
            Field::IssuerUri => "issuerUri",
            Field::AllowedAudiences => "allowedAudiences",
            Field::AttributeMapping => "attributeMapping",
            Field::AttributeCondition => "attributeCondition",
            Field::Repository => "repository",
            Field::AllowedBranches => "allowedBranches",
            Field::AllowedTags => "allowedTags",
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A field value as it appears in a difference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Text(String),
    List(Vec<String>),
    Map(BTreeMap<String, String>),
    State(LifecycleState),
    Missing,
}

impl FieldValue {
    pub fn list(items: &BTreeSet<String>) -> Self {
        FieldValue::List(items.iter().cloned().collect())
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Flag(b) => write!(f, "{}", b),
            FieldValue::Text(s) if s.is_empty() => write!(f, "(empty)"),
            FieldValue::Text(s) => write!(f, "'{}'", s),
            FieldValue::List(items) => write!(f, "[{}]", items.join(", ")),
            FieldValue::Map(map) => {
                let pairs: Vec<String> = map.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                write!(f, "{{{}}}", pairs.join(", "))
            }
            FieldValue::State(state) => write!(f, "{}", state),
            FieldValue::Missing => write!(f, "(none)"),
        }
    }
}

/// One mismatched field between desired and live configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDifference {
    pub field: Field,
    pub existing_value: FieldValue,
    pub proposed_value: FieldValue,
    pub severity: Severity,
    pub description: String,
}

/// Structural class of a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictType {
    AlreadyExists,
    ConfigMismatch,
    StateInvalid,
    DependencyMissing,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictType::AlreadyExists => write!(f, "already exists"),
            ConflictType::ConfigMismatch => write!(f, "configuration mismatch"),
            ConflictType::StateInvalid => write!(f, "invalid state"),
            ConflictType::DependencyMissing => write!(f, "missing dependency"),
        }
    }
}

/// How disruptive applying a suggestion is; used to pick the recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Impact {
    #[default]
    None,
    Modify,
    Replace,
}

/// A way to resolve a conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionSuggestion {
    pub title: String,
    pub description: String,
    pub recommended: bool,
    pub automated: bool,
    pub commands: Vec<String>,
    #[serde(skip)]
    pub impact: Impact,
}

/// A conflict on one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConflict {
    pub resource_type: ResourceKind,
    pub resource_name: String,
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub can_auto_resolve: bool,
    pub differences: Vec<FieldDifference>,
    pub suggestions: Vec<ResolutionSuggestion>,
}

impl ResourceConflict {
    /// The single recommended suggestion
    pub fn recommended(&self) -> Option<&ResolutionSuggestion> {
        self.suggestions.iter().find(|s| s.recommended)
    }
}

/// Per-severity conflict counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub critical: usize,
}

impl SeverityCounts {
    pub fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Low => self.low += 1,
            Severity::Medium => self.medium += 1,
            Severity::High => self.high += 1,
            Severity::Critical => self.critical += 1,
        }
    }

    pub fn get(&self, severity: Severity) -> usize {
        match severity {
            Severity::Low => self.low,
            Severity::Medium => self.medium,
            Severity::High => self.high,
            Severity::Critical => self.critical,
        }
    }

    /// Highest severity with a non-zero count
    pub fn max(&self) -> Option<Severity> {
        [Severity::Critical, Severity::High, Severity::Medium, Severity::Low]
            .into_iter()
            .find(|s| self.get(*s) > 0)
    }
}

/// Next step for the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecommendedAction {
    Proceed,
    ProceedWithCaution,
    ResolveThenRetry,
    ManualInterventionRequired,
}

impl std::fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecommendedAction::Proceed => write!(f, "proceed"),
            RecommendedAction::ProceedWithCaution => write!(f, "proceed with caution"),
            RecommendedAction::ResolveThenRetry => write!(f, "resolve conflicts, then retry"),
            RecommendedAction::ManualInterventionRequired => write!(f, "manual intervention required"),
        }
    }
}

/// A descriptor whose live state could not be read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFailure {
    pub resource_type: ResourceKind,
    pub resource_name: String,
    pub error: String,
}

impl FetchFailure {
    pub fn new(descriptor: &ResourceDescriptor, error: &DetectionError) -> Self {
        Self {
            resource_type: descriptor.kind(),
            resource_name: descriptor.name.clone(),
            error: error.to_string(),
        }
    }

    pub fn names(&self, descriptor: &ResourceDescriptor) -> bool {
        self.resource_type == descriptor.kind() && self.resource_name == descriptor.name
    }
}

/// Aggregate result of one detection pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetectionResult {
    pub has_conflicts: bool,
    pub total_conflicts: usize,
    pub severity_counts: SeverityCounts,
    pub can_proceed: bool,
    pub summary: String,
    pub recommended_action: RecommendedAction,
    pub conflicts: Vec<ResourceConflict>,
    pub fetch_failures: Vec<FetchFailure>,
}

impl ConflictDetectionResult {
    /// True when every descriptor's live state was read
    pub fn is_complete(&self) -> bool {
        self.fetch_failures.is_empty()
    }
}

/// Explicit policy for one detection call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionPolicy {
    /// Resources are expected to be created by this run
    pub create_new: bool,
    /// Existing resources may be updated in place instead of recreated
    pub allow_update: bool,
    /// Differences below this severity are not reported
    pub severity_threshold: Severity,
}

impl Default for DetectionPolicy {
    fn default() -> Self {
        Self {
            create_new: false,
            allow_update: false,
            severity_threshold: Severity::Low,
        }
    }
}

impl DetectionPolicy {
    pub fn create_new() -> Self {
        Self {
            create_new: true,
            ..Default::default()
        }
    }

    pub fn allow_update(mut self, allow: bool) -> Self {
        self.allow_update = allow;
        self
    }

    pub fn severity_threshold(mut self, threshold: Severity) -> Self {
        self.severity_threshold = threshold;
        self
    }
}

/// Errors that can occur while detecting conflicts
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectionError {
    /// Live state could not be read for one descriptor
    #[error("Failed to fetch state of {kind} '{name}': {reason}")]
    StateFetchFailed {
        kind: ResourceKind,
        name: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering_and_serialization() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(serde_json::to_string(&Severity::Critical).unwrap(), "\"critical\"");
        assert_eq!(Severity::Medium.to_string(), "medium");
    }

    #[test]
    fn test_severity_counts_max() {
        let mut counts = SeverityCounts::default();
        assert_eq!(counts.max(), None);
        counts.record(Severity::Medium);
        counts.record(Severity::Low);
        assert_eq!(counts.max(), Some(Severity::Medium));
        counts.record(Severity::Critical);
        assert_eq!(counts.max(), Some(Severity::Critical));
        assert_eq!(counts.get(Severity::Low), 1);
    }

    #[test]
    fn test_lifecycle_state_serialization() {
        let state: LifecycleState = serde_json::from_str("\"DELETING\"").unwrap();
        assert_eq!(state, LifecycleState::Deleting);
        assert!(state.is_terminal());
        assert!(!LifecycleState::Active.is_terminal());
    }

    #[test]
    fn test_conflict_serializes_camel_case_fields() {
        let conflict = ResourceConflict {
            resource_type: ResourceKind::ServiceAccount,
            resource_name: "deployer".to_string(),
            conflict_type: ConflictType::ConfigMismatch,
            severity: Severity::Medium,
            can_auto_resolve: true,
            differences: vec![FieldDifference {
                field: Field::Roles,
                existing_value: FieldValue::List(vec!["roles/viewer".to_string()]),
                proposed_value: FieldValue::List(vec![]),
                severity: Severity::Medium,
                description: "roles change".to_string(),
            }],
            suggestions: vec![],
        };

        let json = serde_json::to_value(&conflict).unwrap();
        assert_eq!(json["resourceType"], "ServiceAccount");
        assert_eq!(json["conflictType"], "ConfigMismatch");
        assert_eq!(json["canAutoResolve"], true);
        assert_eq!(json["differences"][0]["field"], "roles");
        assert_eq!(json["differences"][0]["existingValue"][0], "roles/viewer");
        assert_eq!(json["differences"][0]["severity"], "medium");
    }

    #[test]
    fn test_descriptor_with_existing() {
        let descriptor = ResourceDescriptor::pool("proj", "github-pool", PoolConfig::default());
        assert_eq!(descriptor.existing, Observation::Unknown);
        assert_eq!(descriptor.kind(), ResourceKind::WorkloadIdentityPool);

        let absent = descriptor.clone().with_existing(None);
        assert_eq!(absent.existing, Observation::Absent);
    }
}
