//! Resource Conflict Detection
//!
//! Compares the desired service account, workload identity pool and
//! provider configuration against live IAM state before anything is
//! provisioned.
//!
//! ## Severity Model
//!
//! - Field differences are ranked by a closed `(kind, field)` table
//!   ([`classification::classify`]).
//! - A conflict's severity is the highest of its differences, or fixed for
//!   structural conflicts (`AlreadyExists` critical, `DependencyMissing` high,
//!   `StateInvalid` critical).
//! - `canProceed` is false when any conflict is critical, or high while
//!   resources are not being created by this run.

pub mod classification;
pub mod detector;
pub mod suggestions;
pub mod types;

pub use detector::{aggregate, assess, evaluate, ConflictDetector, StateFetcher};
pub use types::*;
