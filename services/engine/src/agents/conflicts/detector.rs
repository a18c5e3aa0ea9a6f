//! Conflict Detector
//!
//! Diffs desired resource configuration against live cloud state and
//! produces a severity-ranked [`ConflictDetectionResult`].
//!
//! Only the state fetch crosses the network. Fetches for all descriptors run
//! concurrently; a failed fetch is recorded for that descriptor and the rest
//! are still evaluated. Results carry no timestamps or counters, so running
//! detection twice against unchanged state yields an identical result.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

use super::classification::diff;
use super::suggestions::suggestions_for;
use super::types::*;

/// Read capability for live resource state
#[async_trait]
pub trait StateFetcher: Send + Sync {
    /// Live configuration of the described resource, or `None` if it does not exist
    async fn fetch_state(&self, descriptor: &ResourceDescriptor) -> Result<Option<ResourceConfig>>;
}

/// Conflict detector over a state fetch capability
pub struct ConflictDetector {
    fetcher: Arc<dyn StateFetcher>,
}

impl ConflictDetector {
    pub fn new(fetcher: Arc<dyn StateFetcher>) -> Self {
        Self { fetcher }
    }

    /// Run one detection pass over `descriptors`
    pub async fn detect(
        &self,
        descriptors: &[ResourceDescriptor],
        policy: DetectionPolicy,
    ) -> ConflictDetectionResult {
        let (observed, failures) = self.observe(descriptors.to_vec()).await;
        assess(&observed, failures, policy)
    }

    /// Resolve every `Unknown` observation with exactly one fetch.
    ///
    /// Descriptors whose fetch fails are returned still `Unknown`, alongside
    /// a [`FetchFailure`] naming them. Order is preserved.
    pub async fn observe(&self, descriptors: Vec<ResourceDescriptor>) -> (Vec<ResourceDescriptor>, Vec<FetchFailure>) {
        let fetched = join_all(descriptors.iter().map(|d| self.fetch(d))).await;

        let mut failures = Vec::new();
        let observed = descriptors
            .into_iter()
            .zip(fetched)
            .map(|(descriptor, fetched)| match fetched {
                None => descriptor,
                Some(Ok(existing)) => descriptor.with_existing(existing),
                Some(Err(e)) => {
                    warn!(
                        kind = %descriptor.kind(),
                        resource = %descriptor.name,
                        error = %e,
                        "Live state unavailable, recording degraded result"
                    );
                    failures.push(FetchFailure::new(&descriptor, &e));
                    descriptor
                }
            })
            .collect();

        (observed, failures)
    }

    /// `None` when the descriptor already carries a snapshot
    async fn fetch(&self, descriptor: &ResourceDescriptor) -> Option<Result<Option<ResourceConfig>, DetectionError>> {
        if descriptor.existing != Observation::Unknown {
            return None;
        }
        let fetched = self
            .fetcher
            .fetch_state(descriptor)
            .await
            .map_err(|e| DetectionError::StateFetchFailed {
                kind: descriptor.kind(),
                name: descriptor.name.clone(),
                reason: format!("{:#}", e),
            });
        Some(fetched)
    }
}

/// Evaluate observed descriptors without fetching anything.
///
/// A descriptor still `Unknown` is reported as a fetch failure; `failures`
/// from a prior [`ConflictDetector::observe`] are reused for those it names.
pub fn assess(
    descriptors: &[ResourceDescriptor],
    mut failures: Vec<FetchFailure>,
    policy: DetectionPolicy,
) -> ConflictDetectionResult {
    let mut conflicts = Vec::new();
    let mut reported = Vec::new();

    for descriptor in descriptors {
        let existing = match &descriptor.existing {
            Observation::Absent => None,
            Observation::Present(config) => Some(config),
            Observation::Unknown => {
                let failure = match failures.iter().position(|f| f.names(descriptor)) {
                    Some(index) => failures.remove(index),
                    None => FetchFailure::new(
                        descriptor,
                        &DetectionError::StateFetchFailed {
                            kind: descriptor.kind(),
                            name: descriptor.name.clone(),
                            reason: "live state was not observed".to_string(),
                        },
                    ),
                };
                reported.push(failure);
                continue;
            }
        };

        match evaluate(descriptor, existing, policy) {
            Ok(Some(conflict)) => conflicts.push(conflict),
            Ok(None) => {}
            Err(e) => {
                warn!(kind = %descriptor.kind(), resource = %descriptor.name, error = %e, "Live state rejected");
                reported.push(FetchFailure::new(descriptor, &e));
            }
        }
    }
    reported.extend(failures);

    let result = aggregate(descriptors.len(), conflicts, reported, policy);

    info!(
        resources = descriptors.len(),
        conflicts = result.total_conflicts,
        can_proceed = result.can_proceed,
        action = %result.recommended_action,
        "Conflict detection complete"
    );

    result
}

/// Evaluate one descriptor against its live state (`None` = absent)
pub fn evaluate(
    descriptor: &ResourceDescriptor,
    existing: Option<&ResourceConfig>,
    policy: DetectionPolicy,
) -> Result<Option<ResourceConflict>, DetectionError> {
    let Some(existing) = existing else {
        if policy.create_new {
            return Ok(None);
        }
        return Ok(Some(build_conflict(
            descriptor,
            ConflictType::DependencyMissing,
            Severity::High,
            vec![],
        )));
    };

    let differences = diff(&descriptor.desired, existing).ok_or_else(|| DetectionError::StateFetchFailed {
        kind: descriptor.kind(),
        name: descriptor.name.clone(),
        reason: format!("live state is a {} but a {} was expected", existing.kind(), descriptor.kind()),
    })?;

    if existing.state().is_some_and(|state| state.is_terminal()) {
        return Ok(Some(build_conflict(
            descriptor,
            ConflictType::StateInvalid,
            Severity::Critical,
            differences,
        )));
    }

    let reported: Vec<FieldDifference> = differences
        .into_iter()
        .filter(|d| d.severity >= policy.severity_threshold)
        .collect();

    if policy.create_new && !policy.allow_update {
        return Ok(Some(build_conflict(
            descriptor,
            ConflictType::AlreadyExists,
            Severity::Critical,
            reported,
        )));
    }

    let Some(severity) = reported.iter().map(|d| d.severity).max() else {
        return Ok(None);
    };

    Ok(Some(build_conflict(
        descriptor,
        ConflictType::ConfigMismatch,
        severity,
        reported,
    )))
}

fn build_conflict(
    descriptor: &ResourceDescriptor,
    conflict_type: ConflictType,
    severity: Severity,
    differences: Vec<FieldDifference>,
) -> ResourceConflict {
    let can_auto_resolve = conflict_type != ConflictType::StateInvalid
        && differences.iter().all(|d| d.severity <= Severity::Medium);

    let suggestions = suggestions_for(descriptor, conflict_type, severity, can_auto_resolve, &differences);

    ResourceConflict {
        resource_type: descriptor.kind(),
        resource_name: descriptor.name.clone(),
        conflict_type,
        severity,
        can_auto_resolve,
        differences,
        suggestions,
    }
}

/// Fold per-descriptor conflicts into the aggregate result
pub fn aggregate(
    resources: usize,
    conflicts: Vec<ResourceConflict>,
    fetch_failures: Vec<FetchFailure>,
    policy: DetectionPolicy,
) -> ConflictDetectionResult {
    let mut counts = SeverityCounts::default();
    for conflict in &conflicts {
        counts.record(conflict.severity);
    }

    let can_proceed = counts.critical == 0 && (counts.high == 0 || policy.create_new);

    let mut action = match (counts.max(), can_proceed) {
        (None, _) | (Some(Severity::Low), _) => RecommendedAction::Proceed,
        (Some(Severity::Medium), _) | (Some(Severity::High), true) => {
            RecommendedAction::ProceedWithCaution
        }
        (Some(Severity::High), false) => RecommendedAction::ResolveThenRetry,
        (Some(Severity::Critical), _) => RecommendedAction::ManualInterventionRequired,
    };
    if !fetch_failures.is_empty()
        && matches!(action, RecommendedAction::Proceed | RecommendedAction::ProceedWithCaution)
    {
        action = RecommendedAction::ResolveThenRetry;
    }

    let summary = summarize(resources, conflicts.len(), &counts, fetch_failures.len(), action);

    ConflictDetectionResult {
        has_conflicts: !conflicts.is_empty(),
        total_conflicts: conflicts.len(),
        severity_counts: counts,
        can_proceed,
        summary,
        recommended_action: action,
        conflicts,
        fetch_failures,
    }
}

fn summarize(
    resources: usize,
    total: usize,
    counts: &SeverityCounts,
    failures: usize,
    action: RecommendedAction,
) -> String {
    let mut summary = if total == 0 {
        format!("No conflicts detected across {} resource(s)", resources)
    } else {
        let breakdown: Vec<String> = [Severity::Critical, Severity::High, Severity::Medium, Severity::Low]
            .into_iter()
            .filter(|s| counts.get(*s) > 0)
            .map(|s| format!("{} {}", counts.get(s), s))
            .collect();
        format!(
            "{} conflict(s) detected across {} resource(s) ({})",
            total,
            resources,
            breakdown.join(", ")
        )
    };

    if failures > 0 {
        summary.push_str(&format!("; state unavailable for {} resource(s)", failures));
    }
    summary.push_str(&format!("; {}", action));
    summary
}
