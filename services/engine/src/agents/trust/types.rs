//! Types for trust condition compilation and validation
//!
//! A [`TrustConditionSpec`] describes which GitHub Actions tokens may be
//! exchanged for cloud credentials. It compiles into a [`CompiledCondition`],
//! the conditional-access expression attached to a federated binding.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured security policy for a federated credential
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustConditionSpec {
    /// Repository in `owner/name` form (required)
    pub repository: String,
    /// Branch names or `prefix*` patterns
    #[serde(default)]
    pub allowed_branches: Vec<String>,
    /// Tag names or `prefix*` patterns
    #[serde(default)]
    pub allowed_tags: Vec<String>,
    /// Let `refs/pull/*` refs through the branch/tag restriction
    #[serde(default)]
    pub allow_pull_requests: bool,
    /// Reject tokens minted for forks of the repository
    #[serde(default)]
    pub block_forked_repos: bool,
    /// Require the `actor` claim to be present
    #[serde(default)]
    pub require_actor: bool,
    /// Restrict `job_workflow_ref` to workflows defined in the trusted repositories
    #[serde(default)]
    pub validate_workflow_path: bool,
    /// Additional repositories accepted alongside `repository`
    #[serde(default)]
    pub trusted_repos: Vec<String>,
}

impl TrustConditionSpec {
    /// Create a spec for a single repository with no further restrictions
    pub fn new(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            ..Default::default()
        }
    }

    /// Allow a branch (or `prefix*` pattern)
    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.allowed_branches.push(branch.into());
        self
    }

    /// Allow a tag (or `prefix*` pattern)
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.allowed_tags.push(tag.into());
        self
    }

    /// Trust an additional repository
    pub fn trusted_repo(mut self, repository: impl Into<String>) -> Self {
        self.trusted_repos.push(repository.into());
        self
    }

    pub fn allow_pull_requests(mut self, allow: bool) -> Self {
        self.allow_pull_requests = allow;
        self
    }

    pub fn block_forked_repos(mut self, block: bool) -> Self {
        self.block_forked_repos = block;
        self
    }

    pub fn require_actor(mut self, require: bool) -> Self {
        self.require_actor = require;
        self
    }

    pub fn validate_workflow_path(mut self, validate: bool) -> Self {
        self.validate_workflow_path = validate;
        self
    }

    /// Owner half of `repository`, if it is well formed
    pub fn owner(&self) -> Option<&str> {
        self.repository.split_once('/').map(|(owner, _)| owner)
    }
}

/// A conditional-access expression plus its display title
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompiledCondition {
    pub title: String,
    pub expression: String,
}

impl CompiledCondition {
    pub fn new(title: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            expression: expression.into(),
        }
    }

    /// Two conditions are equivalent when their expressions are byte-identical
    pub fn same_expression(&self, other: &CompiledCondition) -> bool {
        self.expression == other.expression
    }
}

impl std::fmt::Display for CompiledCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.title, self.expression)
    }
}

/// The validator check that rejected an expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    NonEmpty,
    BalancedParentheses,
    DoubleEquals,
    RepositoryClaim,
    WellFormedCalls,
}

impl std::fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationRule::NonEmpty => write!(f, "non-empty"),
            ValidationRule::BalancedParentheses => write!(f, "balanced-parentheses"),
            ValidationRule::DoubleEquals => write!(f, "double-equals"),
            ValidationRule::RepositoryClaim => write!(f, "repository-claim"),
            ValidationRule::WellFormedCalls => write!(f, "well-formed-calls"),
        }
    }
}

/// Errors raised while compiling or validating trust conditions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    /// The trust condition spec is malformed (caller error, not retried)
    #[error("Invalid trust condition spec: {0}")]
    InvalidSpec(String),

    /// The expression failed a validator rule
    #[error("Expression invalid ({rule}): {reason}")]
    ExpressionInvalid { rule: ValidationRule, reason: String },
}

impl ConditionError {
    pub(crate) fn invalid(rule: ValidationRule, reason: impl Into<String>) -> Self {
        ConditionError::ExpressionInvalid {
            rule,
            reason: reason.into(),
        }
    }

    /// The failing validator rule, if this is a validation failure
    pub fn rule(&self) -> Option<ValidationRule> {
        match self {
            ConditionError::ExpressionInvalid { rule, .. } => Some(*rule),
            ConditionError::InvalidSpec(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder() {
        let spec = TrustConditionSpec::new("acme/app")
            .branch("main")
            .tag("v*")
            .require_actor(true)
            .trusted_repo("acme/tools");

        assert_eq!(spec.repository, "acme/app");
        assert_eq!(spec.allowed_branches, vec!["main".to_string()]);
        assert_eq!(spec.allowed_tags, vec!["v*".to_string()]);
        assert!(spec.require_actor);
        assert!(!spec.allow_pull_requests);
        assert_eq!(spec.owner(), Some("acme"));
    }

    #[test]
    fn test_spec_deserializes_camel_case_with_defaults() {
        let spec: TrustConditionSpec = serde_json::from_str(
            r#"{"repository":"acme/app","allowedBranches":["main"],"requireActor":true}"#,
        )
        .unwrap();

        assert_eq!(spec.allowed_branches, vec!["main".to_string()]);
        assert!(spec.require_actor);
        assert!(spec.trusted_repos.is_empty());
    }

    #[test]
    fn test_error_display_names_rule() {
        let err = ConditionError::invalid(ValidationRule::DoubleEquals, "bare '=' at offset 11");
        assert_eq!(
            err.to_string(),
            "Expression invalid (double-equals): bare '=' at offset 11"
        );
        assert_eq!(err.rule(), Some(ValidationRule::DoubleEquals));
    }
}
