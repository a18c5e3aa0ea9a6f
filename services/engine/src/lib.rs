//! Workload Identity Federation Engine Library
//!
//! Compiles GitHub Actions trust policies into IAM conditions, detects
//! conflicts with live cloud state and manages the resulting bindings.

pub mod agents;
pub mod tools;

pub use agents::setup::{FederationConfig, WorkloadIdentitySetup};
pub use agents::trust::{compile, validate, TrustConditionSpec};
pub use tools::{GcpIamClient, InMemoryCloud};
