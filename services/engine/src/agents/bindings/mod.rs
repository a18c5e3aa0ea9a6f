//! Binding Lifecycle
//!
//! Create, list and remove conditional IAM bindings that let federated
//! GitHub Actions principals impersonate a service account.
//!
//! A binding's key is `(role, pool, provider, repository)`. Creating a
//! binding that already exists either does nothing (same condition) or
//! replaces its condition, so re-running setup never accumulates
//! duplicates.

pub mod manager;
pub mod types;

pub use manager::{BindingLifecycleManager, BindingTransport};
pub use types::*;
