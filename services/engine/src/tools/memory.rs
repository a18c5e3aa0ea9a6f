//! In-memory cloud
//!
//! A process-local stand-in for the IAM APIs. Implements every capability
//! trait, records each call, and can be told to fail specific operations.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::debug;

use crate::agents::bindings::{BindingTransport, IamBinding};
use crate::agents::conflicts::{ResourceConfig, ResourceDescriptor, ResourceKind, StateFetcher};
use crate::agents::setup::ResourceProvisioner;

#[derive(Default)]
struct CloudState {
    resources: BTreeMap<(ResourceKind, String), ResourceConfig>,
    bindings: Vec<IamBinding>,
    calls: Vec<String>,
    fetch_failures: HashMap<String, String>,
    transient_fetch_failures: HashMap<String, String>,
    provision_failures: HashMap<String, String>,
    binding_failure: Option<String>,
}

/// In-memory implementation of the IAM capabilities
#[derive(Default)]
pub struct InMemoryCloud {
    state: Mutex<CloudState>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a live resource without recording a call
    pub async fn seed_resource(&self, name: &str, config: ResourceConfig) {
        let mut state = self.state.lock().await;
        state.resources.insert((config.kind(), name.to_string()), config);
    }

    /// Store a live binding without recording a call
    pub async fn seed_binding(&self, binding: IamBinding) {
        self.state.lock().await.bindings.push(binding);
    }

    /// Make state fetches for `name` fail with `message`
    pub async fn fail_fetch(&self, name: &str, message: &str) {
        let mut state = self.state.lock().await;
        state.fetch_failures.insert(name.to_string(), message.to_string());
    }

    /// Make only the next state fetch for `name` fail with `message`
    pub async fn fail_fetch_once(&self, name: &str, message: &str) {
        let mut state = self.state.lock().await;
        state
            .transient_fetch_failures
            .insert(name.to_string(), message.to_string());
    }

    /// Make create/update/delete of `name` fail with `message`
    pub async fn fail_provisioning(&self, name: &str, message: &str) {
        let mut state = self.state.lock().await;
        state.provision_failures.insert(name.to_string(), message.to_string());
    }

    /// Make every binding operation fail with `message`
    pub async fn fail_bindings(&self, message: &str) {
        self.state.lock().await.binding_failure = Some(message.to_string());
    }

    pub async fn resource(&self, kind: ResourceKind, name: &str) -> Option<ResourceConfig> {
        let state = self.state.lock().await;
        state.resources.get(&(kind, name.to_string())).cloned()
    }

    pub async fn bindings(&self) -> Vec<IamBinding> {
        self.state.lock().await.bindings.clone()
    }

    /// Every call made so far, as `operation target`
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }
}

impl CloudState {
    fn record(&mut self, operation: &str, target: &str) {
        debug!(operation = %operation, target = %target, "In-memory cloud call");
        self.calls.push(format!("{} {}", operation, target));
    }

    fn check_provisioning(&self, name: &str) -> Result<()> {
        match self.provision_failures.get(name) {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }

    fn check_bindings(&self) -> Result<()> {
        match &self.binding_failure {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }

    fn position(&self, binding: &IamBinding) -> Option<usize> {
        self.bindings.iter().position(|b| b == binding)
    }
}

fn key(descriptor: &ResourceDescriptor) -> (ResourceKind, String) {
    (descriptor.kind(), descriptor.name.clone())
}

#[async_trait]
impl StateFetcher for InMemoryCloud {
    async fn fetch_state(&self, descriptor: &ResourceDescriptor) -> Result<Option<ResourceConfig>> {
        let mut state = self.state.lock().await;
        state.record("fetch", &descriptor.name);

        if let Some(message) = state.transient_fetch_failures.remove(&descriptor.name) {
            return Err(anyhow!(message));
        }
        if let Some(message) = state.fetch_failures.get(&descriptor.name) {
            return Err(anyhow!(message.clone()));
        }
        Ok(state.resources.get(&key(descriptor)).cloned())
    }
}

#[async_trait]
impl ResourceProvisioner for InMemoryCloud {
    async fn create_resource(&self, descriptor: &ResourceDescriptor) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record("create", &descriptor.name);
        state.check_provisioning(&descriptor.name)?;

        if state.resources.contains_key(&key(descriptor)) {
            bail!("{} '{}' already exists", descriptor.kind(), descriptor.name);
        }
        state.resources.insert(key(descriptor), descriptor.desired.clone());
        Ok(())
    }

    async fn update_resource(&self, descriptor: &ResourceDescriptor) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record("update", &descriptor.name);
        state.check_provisioning(&descriptor.name)?;

        match state.resources.get_mut(&key(descriptor)) {
            Some(live) => {
                *live = descriptor.desired.clone();
                Ok(())
            }
            None => bail!("{} '{}' not found", descriptor.kind(), descriptor.name),
        }
    }

    async fn delete_resource(&self, descriptor: &ResourceDescriptor) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.record("delete", &descriptor.name);
        state.check_provisioning(&descriptor.name)?;

        Ok(state.resources.remove(&key(descriptor)).is_some())
    }
}

#[async_trait]
impl BindingTransport for InMemoryCloud {
    async fn list_bindings(&self, principal: &str) -> Result<Vec<IamBinding>> {
        let mut state = self.state.lock().await;
        state.record("list_bindings", principal);
        state.check_bindings()?;

        Ok(state
            .bindings
            .iter()
            .filter(|b| b.member == principal)
            .cloned()
            .collect())
    }

    async fn create_binding(&self, binding: &IamBinding) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record("create_binding", &binding.role);
        state.check_bindings()?;

        state.bindings.push(binding.clone());
        Ok(())
    }

    async fn replace_condition(&self, existing: &IamBinding, replacement: &IamBinding) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record("replace_condition", &existing.role);
        state.check_bindings()?;

        let Some(index) = state.position(existing) else {
            bail!("binding for role {} not found", existing.role);
        };
        state.bindings[index].condition = replacement.condition.clone();
        Ok(())
    }

    async fn remove_binding(&self, binding: &IamBinding) -> Result<()> {
        let mut state = self.state.lock().await;
        state.record("remove_binding", &binding.role);
        state.check_bindings()?;

        if let Some(index) = state.position(binding) {
            state.bindings.remove(index);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::conflicts::PoolConfig;

    fn pool(name: &str) -> ResourceDescriptor {
        ResourceDescriptor::pool("acme-prod", name, PoolConfig::default())
    }

    #[tokio::test]
    async fn test_resource_lifecycle() {
        let cloud = InMemoryCloud::new();
        let descriptor = pool("github-pool");

        assert_eq!(cloud.fetch_state(&descriptor).await.unwrap(), None);
        cloud.create_resource(&descriptor).await.unwrap();
        assert!(cloud.create_resource(&descriptor).await.is_err());
        assert!(cloud.fetch_state(&descriptor).await.unwrap().is_some());
        assert!(cloud.delete_resource(&descriptor).await.unwrap());
        assert!(!cloud.delete_resource(&descriptor).await.unwrap());

        assert_eq!(
            cloud.calls().await,
            vec![
                "fetch github-pool",
                "create github-pool",
                "create github-pool",
                "fetch github-pool",
                "delete github-pool",
                "delete github-pool",
            ]
        );
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let cloud = InMemoryCloud::new();
        cloud.fail_fetch("github-pool", "IAM API returned 500").await;
        cloud.fail_provisioning("other", "quota exceeded").await;

        let err = cloud.fetch_state(&pool("github-pool")).await.unwrap_err();
        assert_eq!(err.to_string(), "IAM API returned 500");
        assert!(cloud.fetch_state(&pool("other")).await.is_ok());
        assert!(cloud.create_resource(&pool("other")).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_fetch_once_recovers() {
        let cloud = InMemoryCloud::new();
        cloud.fail_fetch_once("github-pool", "IAM API returned 503").await;

        assert!(cloud.fetch_state(&pool("github-pool")).await.is_err());
        assert_eq!(cloud.fetch_state(&pool("github-pool")).await.unwrap(), None);
    }

    #[test]
    fn test_blocking_usage() {
        let cloud = InMemoryCloud::new();
        tokio_test::block_on(cloud.fail_bindings("unavailable"));
        let result = tokio_test::block_on(cloud.list_bindings("principal://x"));
        assert!(result.is_err());
    }
}
