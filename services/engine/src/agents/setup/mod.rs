//! Workload Identity Setup
//!
//! Facade that turns a repository and its trust policy into a working
//! GitHub Actions federation: service account, pool, provider and the
//! conditional impersonation binding.
//!
//! ## Example Usage
//!
//! ```
//! use std::sync::Arc;
//! use wif_engine::agents::setup::{FederationConfig, SetupOptions, SetupRequest, WorkloadIdentitySetup};
//! use wif_engine::agents::trust::TrustConditionSpec;
//! use wif_engine::tools::InMemoryCloud;
//!
//! # tokio_test::block_on(async {
//! let config = FederationConfig::new("acme-prod", "123456", "deployer", "acme/app");
//! let request = SetupRequest::new(config, TrustConditionSpec::new("acme/app").branch("main"));
//!
//! let setup = WorkloadIdentitySetup::with_cloud(Arc::new(InMemoryCloud::new()));
//! let report = setup.setup(&request, &SetupOptions::default()).await.unwrap();
//! assert!(report.is_success());
//! # });
//! ```

pub mod config;
pub mod orchestrator;
pub mod types;

pub use config::FederationConfig;
pub use orchestrator::{binding_for, descriptors, github_attribute_mapping, WorkloadIdentitySetup};
pub use types::*;
