//! Trust Condition Compiler
//!
//! Turns a [`TrustConditionSpec`] into the conditional-access expression that
//! gates a federated credential. Compilation is pure: identical specs always
//! produce byte-identical expressions, which is what lets the binding manager
//! compare conditions for idempotence.

use super::expr::{Claim, Expr};
use super::types::{CompiledCondition, ConditionError, TrustConditionSpec};

const BRANCH_REF_PREFIX: &str = "refs/heads/";
const TAG_REF_PREFIX: &str = "refs/tags/";
const PULL_REF_PREFIX: &str = "refs/pull/";
const WORKFLOWS_DIR: &str = ".github/workflows/";

/// The only supported wildcard, valid as the final character of a pattern
const WILDCARD: char = '*';

/// Compile a spec into a titled condition
pub fn compile(spec: &TrustConditionSpec) -> Result<CompiledCondition, ConditionError> {
    let expr = build_expression(spec)?;
    Ok(CompiledCondition::new(title_for(spec), expr.render()))
}

/// Build the expression tree for a spec without rendering it
pub fn build_expression(spec: &TrustConditionSpec) -> Result<Expr, ConditionError> {
    let repositories = trusted_set(spec)?;

    let mut clauses = vec![Expr::any(
        repositories
            .iter()
            .map(|repo| Expr::equals(Claim::Repository, repo.as_str()))
            .collect(),
    )];

    let mut ref_matches = Vec::new();
    for branch in dedup(&spec.allowed_branches) {
        ref_matches.push(ref_clause("branch", BRANCH_REF_PREFIX, branch)?);
    }
    for tag in dedup(&spec.allowed_tags) {
        ref_matches.push(ref_clause("tag", TAG_REF_PREFIX, tag)?);
    }
    if !ref_matches.is_empty() {
        if spec.allow_pull_requests {
            ref_matches.push(Expr::starts_with(Claim::Ref, PULL_REF_PREFIX));
        }
        clauses.push(Expr::any(ref_matches));
    }

    if spec.require_actor {
        clauses.push(Expr::Has(Claim::Actor));
    }

    if spec.validate_workflow_path {
        clauses.push(Expr::any(
            repositories
                .iter()
                .map(|repo| {
                    Expr::starts_with(Claim::JobWorkflowRef, format!("{}/{}", repo, WORKFLOWS_DIR))
                })
                .collect(),
        ));
    }

    // Fork tokens carry the fork's repository claim, so the repository
    // clause already rejects them when block_forked_repos is set.
    Ok(Expr::all(clauses))
}

/// Short label naming the active restrictions, e.g. `repo+branch+actor`
pub fn title_for(spec: &TrustConditionSpec) -> String {
    let mut parts = Vec::new();

    let extra_repos = spec
        .trusted_repos
        .iter()
        .any(|repo| repo != &spec.repository);
    parts.push(if extra_repos { "repos" } else { "repo" });

    let has_branches = !spec.allowed_branches.is_empty();
    let has_tags = !spec.allowed_tags.is_empty();
    if has_branches {
        parts.push("branch");
    }
    if has_tags {
        parts.push("tag");
    }
    if spec.allow_pull_requests && (has_branches || has_tags) {
        parts.push("pr");
    }
    if spec.require_actor {
        parts.push("actor");
    }
    if spec.validate_workflow_path {
        parts.push("workflow");
    }
    if spec.block_forked_repos {
        parts.push("nofork");
    }

    parts.join("+")
}

/// Declared repository first, then trusted repositories in input order
fn trusted_set(spec: &TrustConditionSpec) -> Result<Vec<String>, ConditionError> {
    validate_repository(&spec.repository)?;

    let mut repos = vec![spec.repository.clone()];
    for repo in &spec.trusted_repos {
        validate_repository(repo)?;
        if !repos.contains(repo) {
            repos.push(repo.clone());
        }
    }
    Ok(repos)
}

/// Check a repository is `owner/name` with GitHub-safe characters
pub fn validate_repository(repository: &str) -> Result<(), ConditionError> {
    if repository.is_empty() {
        return Err(ConditionError::InvalidSpec(
            "repository is required".to_string(),
        ));
    }

    let malformed = || {
        ConditionError::InvalidSpec(format!(
            "repository must be in owner/name form, got '{}'",
            repository
        ))
    };

    let (owner, name) = repository.split_once('/').ok_or_else(malformed)?;
    let valid_segment = |segment: &str| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };

    if !valid_segment(owner) || !valid_segment(name) {
        return Err(malformed());
    }
    Ok(())
}

fn ref_clause(kind: &str, ref_prefix: &str, pattern: &str) -> Result<Expr, ConditionError> {
    if pattern.is_empty() {
        return Err(ConditionError::InvalidSpec(format!("empty {} pattern", kind)));
    }

    if let Some(bad) = pattern
        .chars()
        .find(|c| matches!(c, '\'' | '"' | '\\' | '?' | '[' | ']') || c.is_whitespace())
    {
        return Err(ConditionError::InvalidSpec(format!(
            "{} pattern '{}' contains unsupported character '{}'",
            kind, pattern, bad
        )));
    }

    match pattern.find(WILDCARD) {
        None => Ok(Expr::equals(Claim::Ref, format!("{}{}", ref_prefix, pattern))),
        Some(pos) if pos == pattern.len() - 1 => Ok(Expr::starts_with(
            Claim::Ref,
            format!("{}{}", ref_prefix, &pattern[..pos]),
        )),
        Some(_) => Err(ConditionError::InvalidSpec(format!(
            "{} pattern '{}' may only use '*' as its final character",
            kind, pattern
        ))),
    }
}

fn dedup(items: &[String]) -> Vec<&str> {
    let mut seen: Vec<&str> = Vec::with_capacity(items.len());
    for item in items {
        if !seen.contains(&item.as_str()) {
            seen.push(item);
        }
    }
    seen
}
