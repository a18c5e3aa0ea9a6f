//! Resolution Suggestions
//!
//! Builds the suggestion list for a conflict and marks exactly one of them
//! as recommended.

use super::types::{
    ConflictType, Field, FieldDifference, FieldValue, Impact, ResolutionSuggestion,
    ResourceConfig, ResourceDescriptor, ResourceKind, Severity,
};
use crate::agents::bindings::FederatedPrincipal;

/// Suggestions for a conflict, with one marked `recommended`
pub fn suggestions_for(
    descriptor: &ResourceDescriptor,
    conflict_type: ConflictType,
    severity: Severity,
    can_auto_resolve: bool,
    differences: &[FieldDifference],
) -> Vec<ResolutionSuggestion> {
    let target = GcloudTarget::for_descriptor(descriptor);

    let mut suggestions = match conflict_type {
        ConflictType::StateInvalid => vec![recreate(&target, descriptor)],
        ConflictType::ConfigMismatch => {
            let mut list = vec![update_in_place(&target, descriptor, differences)];
            if severity >= Severity::High {
                list.push(recreate(&target, descriptor));
            }
            list
        }
        ConflictType::AlreadyExists => vec![
            adopt_existing(&target),
            ResolutionSuggestion {
                title: "Choose a different name".to_string(),
                description: format!(
                    "Keep the existing {} and create the new one under another id.",
                    descriptor.kind()
                ),
                recommended: false,
                automated: false,
                commands: vec![],
                impact: Impact::Modify,
            },
            recreate(&target, descriptor),
        ],
        ConflictType::DependencyMissing => vec![ResolutionSuggestion {
            title: "Create the missing resource".to_string(),
            description: format!(
                "The {} '{}' does not exist; re-run with resource creation enabled or create it manually.",
                descriptor.kind(),
                descriptor.name
            ),
            recommended: false,
            automated: false,
            commands: vec![target.create(descriptor)],
            impact: Impact::Modify,
        }],
    };

    suggestions.push(ResolutionSuggestion {
        title: "Leave as-is".to_string(),
        description: "Keep the live configuration and skip this resource.".to_string(),
        recommended: false,
        automated: false,
        commands: vec![],
        impact: Impact::None,
    });

    mark_recommended(&mut suggestions, severity, can_auto_resolve);
    suggestions
}

/// Pick the recommended suggestion.
///
/// An automated suggestion wins when the conflict can be auto-resolved.
/// Otherwise the least disruptive suggestion wins, where "leave as-is" is
/// only eligible for conflicts of low severity.
fn mark_recommended(suggestions: &mut [ResolutionSuggestion], severity: Severity, can_auto_resolve: bool) {
    let automated = if can_auto_resolve {
        suggestions.iter().position(|s| s.automated)
    } else {
        None
    };

    let pick = automated.or_else(|| {
        suggestions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.impact != Impact::None || severity <= Severity::Low)
            .min_by_key(|(i, s)| (s.impact, *i))
            .map(|(i, _)| i)
    });

    if let Some(index) = pick {
        suggestions[index].recommended = true;
    }
}

fn update_in_place(
    target: &GcloudTarget,
    descriptor: &ResourceDescriptor,
    differences: &[FieldDifference],
) -> ResolutionSuggestion {
    ResolutionSuggestion {
        title: "Update in place".to_string(),
        description: format!(
            "Apply the desired configuration to the existing {} ({} field(s)).",
            descriptor.kind(),
            differences.len()
        ),
        recommended: false,
        automated: true,
        commands: target.update(descriptor, differences),
        impact: Impact::Modify,
    }
}

fn adopt_existing(target: &GcloudTarget) -> ResolutionSuggestion {
    ResolutionSuggestion {
        title: "Adopt the existing resource".to_string(),
        description: "Re-run allowing update-in-place so the existing resource is reconciled instead of created.".to_string(),
        recommended: false,
        automated: true,
        commands: vec![target.describe()],
        impact: Impact::Modify,
    }
}

fn recreate(target: &GcloudTarget, descriptor: &ResourceDescriptor) -> ResolutionSuggestion {
    let mut commands = Vec::new();
    let description = match descriptor.kind() {
        ResourceKind::ServiceAccount => {
            commands.push(target.delete());
            commands.push(target.create(descriptor));
            "Delete the service account and create it again; existing keys and grants are lost."
                .to_string()
        }
        // Soft-deleted pools and providers keep their id for 30 days; undelete
        // restores them, otherwise a new id is required.
        ResourceKind::WorkloadIdentityPool | ResourceKind::WorkloadIdentityProvider => {
            commands.push(target.undelete());
            format!(
                "Undelete the {} if it is still recoverable, or recreate it under a new id.",
                descriptor.kind()
            )
        }
    };

    ResolutionSuggestion {
        title: "Recreate".to_string(),
        description,
        recommended: false,
        automated: false,
        commands,
        impact: Impact::Replace,
    }
}

/// gcloud command group plus the flags identifying one resource
struct GcloudTarget {
    group: &'static str,
    id_args: String,
    kind: ResourceKind,
}

impl GcloudTarget {
    fn for_descriptor(descriptor: &ResourceDescriptor) -> Self {
        let project = &descriptor.project_id;
        let name = &descriptor.name;
        match &descriptor.desired {
            ResourceConfig::ServiceAccount(_) => Self {
                group: "gcloud iam service-accounts",
                id_args: format!("{} --project={}", name, project),
                kind: ResourceKind::ServiceAccount,
            },
            ResourceConfig::WorkloadIdentityPool(_) => Self {
                group: "gcloud iam workload-identity-pools",
                id_args: format!("{} --project={} --location=global", name, project),
                kind: ResourceKind::WorkloadIdentityPool,
            },
            ResourceConfig::WorkloadIdentityProvider(provider) => Self {
                group: "gcloud iam workload-identity-pools providers",
                id_args: format!(
                    "{} --workload-identity-pool={} --project={} --location=global",
                    name, provider.pool_id, project
                ),
                kind: ResourceKind::WorkloadIdentityProvider,
            },
        }
    }

    fn command(&self, verb: &str, extra: &[String]) -> String {
        let mut command = format!("{} {} {}", self.group, verb, self.id_args);
        for arg in extra {
            command.push(' ');
            command.push_str(arg);
        }
        command
    }

    fn describe(&self) -> String {
        self.command("describe", &[])
    }

    fn delete(&self) -> String {
        self.command("delete", &["--quiet".to_string()])
    }

    fn undelete(&self) -> String {
        self.command("undelete", &[])
    }

    fn create(&self, descriptor: &ResourceDescriptor) -> String {
        let verb = match self.kind {
            ResourceKind::WorkloadIdentityProvider => "create-oidc",
            _ => "create",
        };
        let mut args = Vec::new();
        match &descriptor.desired {
            ResourceConfig::ServiceAccount(sa) => {
                args.push(flag("display-name", &sa.display_name));
            }
            ResourceConfig::WorkloadIdentityPool(pool) => {
                args.push(flag("display-name", &pool.display_name));
            }
            ResourceConfig::WorkloadIdentityProvider(provider) => {
                args.push(flag("issuer-uri", &provider.issuer_uri));
                args.push(flag("attribute-mapping", &mapping_arg(&provider.attribute_mapping)));
                if let Some(condition) = &provider.condition {
                    args.push(flag("attribute-condition", &condition.expression));
                }
            }
        }
        self.command(verb, &args)
    }

    fn update(&self, descriptor: &ResourceDescriptor, differences: &[FieldDifference]) -> Vec<String> {
        let verb = match self.kind {
            ResourceKind::WorkloadIdentityProvider => "update-oidc",
            _ => "update",
        };

        let mut commands = Vec::new();
        let mut args = Vec::new();

        for difference in differences {
            match (difference.field, &difference.proposed_value) {
                (Field::DisplayName, FieldValue::Text(v)) => args.push(flag("display-name", v)),
                (Field::Description, FieldValue::Text(v)) => args.push(flag("description", v)),
                (Field::IssuerUri, FieldValue::Text(v)) => args.push(flag("issuer-uri", v)),
                (Field::AllowedAudiences, FieldValue::List(v)) => {
                    args.push(flag("allowed-audiences", &v.join(",")))
                }
                (Field::AttributeMapping, FieldValue::Map(m)) => {
                    args.push(flag("attribute-mapping", &mapping_arg(m)))
                }
                (Field::AttributeCondition, FieldValue::Text(v)) => {
                    args.push(flag("attribute-condition", v))
                }
                (Field::Disabled, FieldValue::Flag(disabled)) => match self.kind {
                    ResourceKind::ServiceAccount => {
                        let verb = if *disabled { "disable" } else { "enable" };
                        commands.push(self.command(verb, &[]));
                    }
                    _ => args.push(if *disabled {
                        "--disabled".to_string()
                    } else {
                        "--no-disabled".to_string()
                    }),
                },
                (Field::Roles, FieldValue::List(wanted)) => {
                    commands.extend(role_commands(descriptor, &difference.existing_value, wanted));
                }
                _ => {}
            }
        }

        if !args.is_empty() {
            commands.insert(0, self.command(verb, &args));
        }
        commands
    }
}

fn role_commands(descriptor: &ResourceDescriptor, existing: &FieldValue, wanted: &[String]) -> Vec<String> {
    let current: &[String] = match existing {
        FieldValue::List(items) => items,
        _ => &[],
    };
    let member = FederatedPrincipal::service_account(&descriptor.project_id, &descriptor.name);

    let grant = wanted.iter().filter(|r| !current.contains(r)).map(|role| {
        format!(
            "gcloud projects add-iam-policy-binding {} --member={} --role={}",
            descriptor.project_id, member, role
        )
    });
    let revoke = current.iter().filter(|r| !wanted.contains(r)).map(|role| {
        format!(
            "gcloud projects remove-iam-policy-binding {} --member={} --role={}",
            descriptor.project_id, member, role
        )
    });
    grant.chain(revoke).collect()
}

fn mapping_arg(mapping: &std::collections::BTreeMap<String, String>) -> String {
    mapping
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn flag(name: &str, value: &str) -> String {
    format!("--{}=\"{}\"", name, value.replace('"', "\\\""))
}
