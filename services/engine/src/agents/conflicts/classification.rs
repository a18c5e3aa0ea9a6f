//! Field Classification
//!
//! Per-kind field comparison and the closed `(kind, field) -> severity`
//! table used to rank differences.

use std::collections::BTreeSet;

use super::types::{
    Field, FieldDifference, FieldValue, LifecycleState, PoolConfig, ProviderConfig,
    ResourceConfig, ResourceKind, ServiceAccountConfig, Severity,
};

/// Severity of a change to `field` on a resource of `kind`
pub fn classify(kind: ResourceKind, field: Field, existing: &FieldValue, proposed: &FieldValue) -> Severity {
    use Field::*;
    use ResourceKind::*;

    match (kind, field) {
        (_, DisplayName | Description) => Severity::Low,
        (_, Disabled) => Severity::High,

        (ServiceAccount, Roles) => Severity::Medium,

        (WorkloadIdentityPool | WorkloadIdentityProvider, State) => {
            state_change_severity(existing, proposed)
        }

        (WorkloadIdentityProvider, IssuerUri | AttributeMapping | Repository) => Severity::High,
        (WorkloadIdentityProvider, AllowedAudiences | AttributeCondition) => Severity::Medium,
        (WorkloadIdentityProvider, AllowedBranches | AllowedTags) => Severity::Medium,

        // Not produced by the per-kind comparison below.
        (ServiceAccount, State | IssuerUri | AllowedAudiences | AttributeMapping)
        | (ServiceAccount, AttributeCondition | Repository | AllowedBranches | AllowedTags)
        | (WorkloadIdentityPool, Roles | IssuerUri | AllowedAudiences | AttributeMapping)
        | (WorkloadIdentityPool, AttributeCondition | Repository | AllowedBranches | AllowedTags)
        | (WorkloadIdentityProvider, Roles) => Severity::Medium,
    }
}

fn state_change_severity(existing: &FieldValue, proposed: &FieldValue) -> Severity {
    let terminal = |value: &FieldValue| matches!(value, FieldValue::State(s) if s.is_terminal());
    if terminal(existing) || terminal(proposed) {
        Severity::Critical
    } else {
        Severity::Medium
    }
}

/// Compare desired against existing and classify every mismatched field.
///
/// Returns `None` when the two configurations are of different kinds.
pub fn diff(desired: &ResourceConfig, existing: &ResourceConfig) -> Option<Vec<FieldDifference>> {
    let kind = desired.kind();
    let changes = match (desired, existing) {
        (ResourceConfig::ServiceAccount(d), ResourceConfig::ServiceAccount(e)) => {
            service_account_changes(d, e)
        }
        (ResourceConfig::WorkloadIdentityPool(d), ResourceConfig::WorkloadIdentityPool(e)) => {
            pool_changes(d, e)
        }
        (ResourceConfig::WorkloadIdentityProvider(d), ResourceConfig::WorkloadIdentityProvider(e)) => {
            provider_changes(d, e)
        }
        _ => return None,
    };

    Some(
        changes
            .into_iter()
            .map(|(field, existing_value, proposed_value)| {
                let severity = classify(kind, field, &existing_value, &proposed_value);
                let description = describe(kind, field, &existing_value, &proposed_value);
                FieldDifference {
                    field,
                    existing_value,
                    proposed_value,
                    severity,
                    description,
                }
            })
            .collect(),
    )
}

type Change = (Field, FieldValue, FieldValue);

fn push_if_changed(changes: &mut Vec<Change>, field: Field, existing: FieldValue, proposed: FieldValue) {
    if existing != proposed {
        changes.push((field, existing, proposed));
    }
}

fn text(value: &str) -> FieldValue {
    FieldValue::Text(value.to_string())
}

fn service_account_changes(desired: &ServiceAccountConfig, existing: &ServiceAccountConfig) -> Vec<Change> {
    let mut changes = Vec::new();
    push_if_changed(&mut changes, Field::DisplayName, text(&existing.display_name), text(&desired.display_name));
    push_if_changed(&mut changes, Field::Description, text(&existing.description), text(&desired.description));
    push_if_changed(&mut changes, Field::Roles, FieldValue::list(&existing.roles), FieldValue::list(&desired.roles));
    push_if_changed(&mut changes, Field::Disabled, FieldValue::Flag(existing.disabled), FieldValue::Flag(desired.disabled));
    changes
}

fn pool_changes(desired: &PoolConfig, existing: &PoolConfig) -> Vec<Change> {
    let mut changes = Vec::new();
    push_if_changed(&mut changes, Field::DisplayName, text(&existing.display_name), text(&desired.display_name));
    push_if_changed(&mut changes, Field::Description, text(&existing.description), text(&desired.description));
    push_if_changed(&mut changes, Field::Disabled, FieldValue::Flag(existing.disabled), FieldValue::Flag(desired.disabled));
    push_state(&mut changes, existing.state, desired.state);
    changes
}

fn provider_changes(desired: &ProviderConfig, existing: &ProviderConfig) -> Vec<Change> {
    let mut changes = Vec::new();
    push_if_changed(&mut changes, Field::DisplayName, text(&existing.display_name), text(&desired.display_name));
    push_if_changed(&mut changes, Field::Description, text(&existing.description), text(&desired.description));
    push_if_changed(&mut changes, Field::Disabled, FieldValue::Flag(existing.disabled), FieldValue::Flag(desired.disabled));
    push_state(&mut changes, existing.state, desired.state);
    push_if_changed(&mut changes, Field::IssuerUri, text(&existing.issuer_uri), text(&desired.issuer_uri));

    // An empty audience list means "default audience"; treat as equal.
    if !desired.allowed_audiences.is_empty() {
        push_if_changed(
            &mut changes,
            Field::AllowedAudiences,
            FieldValue::list(&existing.allowed_audiences),
            FieldValue::list(&desired.allowed_audiences),
        );
    }

    push_if_changed(
        &mut changes,
        Field::AttributeMapping,
        FieldValue::Map(existing.attribute_mapping.clone()),
        FieldValue::Map(desired.attribute_mapping.clone()),
    );

    let expression = |config: &ProviderConfig| match &config.condition {
        Some(condition) => text(&condition.expression),
        None => FieldValue::Missing,
    };
    push_if_changed(&mut changes, Field::AttributeCondition, expression(existing), expression(desired));

    // Tracked metadata is only compared when both sides know it.
    if let (Some(e), Some(d)) = (&existing.repository, &desired.repository) {
        push_if_changed(&mut changes, Field::Repository, text(e), text(d));
    }
    push_optional_set(&mut changes, Field::AllowedBranches, &existing.allowed_branches, &desired.allowed_branches);
    push_optional_set(&mut changes, Field::AllowedTags, &existing.allowed_tags, &desired.allowed_tags);

    changes
}

fn push_state(changes: &mut Vec<Change>, existing: LifecycleState, desired: LifecycleState) {
    push_if_changed(changes, Field::State, FieldValue::State(existing), FieldValue::State(desired));
}

fn push_optional_set(
    changes: &mut Vec<Change>,
    field: Field,
    existing: &Option<BTreeSet<String>>,
    desired: &Option<BTreeSet<String>>,
) {
    if let (Some(e), Some(d)) = (existing, desired) {
        push_if_changed(changes, field, FieldValue::list(e), FieldValue::list(d));
    }
}

fn describe(kind: ResourceKind, field: Field, existing: &FieldValue, proposed: &FieldValue) -> String {
    match (field, existing, proposed) {
        (Field::Roles, FieldValue::List(current), FieldValue::List(wanted)) => {
            let added: Vec<&str> = wanted
                .iter()
                .filter(|r| !current.contains(r))
                .map(String::as_str)
                .collect();
            let removed: Vec<&str> = current
                .iter()
                .filter(|r| !wanted.contains(r))
                .map(String::as_str)
                .collect();
            format!(
                "IAM roles differ (grant: [{}], revoke: [{}])",
                added.join(", "),
                removed.join(", ")
            )
        }
        (Field::State, FieldValue::State(state), _) if state.is_terminal() => format!(
            "{} is {}; it cannot be used or updated until it is restored or recreated",
            kind, state
        ),
        (Field::AttributeCondition, _, _) => format!(
            "attribute condition will change from {} to {}",
            existing, proposed
        ),
        _ => format!("{} will change from {} to {}", field, existing, proposed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::trust::CompiledCondition;

    fn roles(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classification_table() {
        let a = FieldValue::Text("a".into());
        let b = FieldValue::Text("b".into());

        assert_eq!(classify(ResourceKind::ServiceAccount, Field::DisplayName, &a, &b), Severity::Low);
        assert_eq!(classify(ResourceKind::ServiceAccount, Field::Roles, &a, &b), Severity::Medium);
        assert_eq!(classify(ResourceKind::WorkloadIdentityPool, Field::Disabled, &a, &b), Severity::High);
        assert_eq!(
            classify(ResourceKind::WorkloadIdentityProvider, Field::IssuerUri, &a, &b),
            Severity::High
        );
        assert_eq!(
            classify(ResourceKind::WorkloadIdentityProvider, Field::AttributeCondition, &a, &b),
            Severity::Medium
        );
    }

    #[test]
    fn test_state_toward_deleted_is_critical() {
        let active = FieldValue::State(LifecycleState::Active);
        let deleted = FieldValue::State(LifecycleState::Deleted);
        let unspecified = FieldValue::State(LifecycleState::StateUnspecified);

        assert_eq!(
            classify(ResourceKind::WorkloadIdentityPool, Field::State, &active, &deleted),
            Severity::Critical
        );
        assert_eq!(
            classify(ResourceKind::WorkloadIdentityProvider, Field::State, &deleted, &active),
            Severity::Critical
        );
        assert_eq!(
            classify(ResourceKind::WorkloadIdentityPool, Field::State, &unspecified, &active),
            Severity::Medium
        );
    }

    #[test]
    fn test_service_account_role_diff() {
        let desired = ResourceConfig::ServiceAccount(ServiceAccountConfig {
            roles: roles(&["A", "B", "C"]),
            ..Default::default()
        });
        let existing = ResourceConfig::ServiceAccount(ServiceAccountConfig {
            roles: roles(&["A", "B"]),
            ..Default::default()
        });

        let differences = diff(&desired, &existing).unwrap();

        assert_eq!(differences.len(), 1);
        assert_eq!(differences[0].field, Field::Roles);
        assert_eq!(differences[0].severity, Severity::Medium);
        assert_eq!(differences[0].description, "IAM roles differ (grant: [C], revoke: [])");
    }

    #[test]
    fn test_identical_configs_have_no_differences() {
        let config = ResourceConfig::WorkloadIdentityPool(PoolConfig {
            display_name: "GitHub".into(),
            ..Default::default()
        });
        assert!(diff(&config, &config).unwrap().is_empty());
    }

    #[test]
    fn test_kind_mismatch_returns_none() {
        let sa = ResourceConfig::ServiceAccount(ServiceAccountConfig::default());
        let pool = ResourceConfig::WorkloadIdentityPool(PoolConfig::default());
        assert!(diff(&sa, &pool).is_none());
    }

    #[test]
    fn test_provider_condition_and_untracked_metadata() {
        let desired = ResourceConfig::WorkloadIdentityProvider(ProviderConfig {
            condition: Some(CompiledCondition::new("repo+branch", "repository == 'a/b' && ref == 'refs/heads/main'")),
            repository: Some("a/b".into()),
            allowed_branches: Some(roles(&["main"])),
            ..Default::default()
        });
        let existing = ResourceConfig::WorkloadIdentityProvider(ProviderConfig {
            condition: Some(CompiledCondition::new("repo", "repository == 'a/b'")),
            repository: None,
            allowed_branches: None,
            ..Default::default()
        });

        let differences = diff(&desired, &existing).unwrap();
        let fields: Vec<Field> = differences.iter().map(|d| d.field).collect();

        assert_eq!(fields, vec![Field::AttributeCondition]);
        assert_eq!(differences[0].severity, Severity::Medium);
    }
}
