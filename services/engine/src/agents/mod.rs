//! Agent modules for the Workload Identity Federation engine
//!
//! - `trust`: Trust condition compilation and validation
//! - `conflicts`: Conflict detection against live IAM state
//! - `bindings`: Conditional IAM binding lifecycle
//! - `setup`: Orchestration of a complete federation setup

pub mod bindings;
pub mod conflicts;
pub mod setup;
pub mod trust;

pub use bindings::BindingLifecycleManager;
pub use conflicts::ConflictDetector;
pub use setup::WorkloadIdentitySetup;
