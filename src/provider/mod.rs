//! Cloud provider abstraction layer
//!
//! This module provides a trait-based abstraction over the per-cloud
//! "fetch info / get cluster / provision cluster" adapters. Each managed
//! provider (EKS, AKS, GKE, Civo, DigitalOcean, Linode) implements
//! [`ProviderAdapter`] out of tree; the self-hosted MicroK8s adapter lives
//! in [`crate::microk8s`]. Adapters are dispatched through a
//! [`ProviderRegistry`] keyed by [`Provider`] rather than a string switch,
//! so capability lookups are explicit and testable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::types::{CloudCredential, CloudProvisioningRequest, Endpoint, KaasCluster, Provider};
use crate::{Error, Result};

/// Operations a cloud provider adapter exposes to the orchestrator
///
/// `get_cluster` and `provision_cluster` are required; `delete_cluster` is
/// optional (managed providers that bill per cluster implement it, others
/// report unsupported). `fetch_info` feeds the provisioning-form metadata
/// cache.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Fetch the current view of a provisioned cluster
    ///
    /// Called repeatedly while a task is in `WaitingForCluster`; the
    /// returned cluster's `ready` flag and kubeconfig gate the transition
    /// to agent setup.
    async fn get_cluster(&self, credential: &CloudCredential, id: &str) -> Result<KaasCluster>;

    /// Start provisioning a cluster and return its provider-side identifier
    async fn provision_cluster(
        &self,
        credential: &CloudCredential,
        request: &CloudProvisioningRequest,
    ) -> Result<String>;

    /// Tear down the cluster behind an endpoint
    async fn delete_cluster(
        &self,
        _credential: &CloudCredential,
        _endpoint: &Endpoint,
    ) -> Result<()> {
        Err(Error::provider("delete is not supported by this provider"))
    }

    /// Fetch provider metadata (regions, node sizes, versions) for
    /// provisioning forms
    async fn fetch_info(&self, credential: &CloudCredential) -> Result<serde_json::Value>;
}

/// Registry mapping provider keys to adapter implementations
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter for a provider, replacing any existing one
    pub fn register(&mut self, provider: Provider, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(provider, adapter);
    }

    /// Look up the adapter for a provider
    pub fn get(&self, provider: Provider) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or_else(|| Error::provider(format!("no adapter registered for '{}'", provider)))
    }

    /// Providers with a registered adapter
    pub fn providers(&self) -> Vec<Provider> {
        self.adapters.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CredentialId;
    use std::collections::BTreeMap;

    fn credential() -> CloudCredential {
        CloudCredential {
            id: CredentialId(1),
            provider: Provider::Civo,
            name: "test".into(),
            credentials: BTreeMap::new(),
        }
    }

    #[test]
    fn test_lookup_of_unregistered_provider_fails() {
        let registry = ProviderRegistry::new();
        let err = registry.get(Provider::Civo).err().unwrap();
        assert!(err.to_string().contains("no adapter registered"));
        assert!(err.to_string().contains("civo"));
    }

    #[tokio::test]
    async fn test_registered_adapter_is_dispatched() {
        let mut adapter = MockProviderAdapter::new();
        adapter
            .expect_get_cluster()
            .withf(|_, id| id == "c-42")
            .returning(|_, id| {
                Ok(KaasCluster {
                    id: id.to_string(),
                    name: "test".into(),
                    ready: true,
                    kube_config: "apiVersion: v1".into(),
                })
            });

        let mut registry = ProviderRegistry::new();
        registry.register(Provider::Civo, Arc::new(adapter));

        let adapter = registry.get(Provider::Civo).unwrap();
        let cluster = adapter.get_cluster(&credential(), "c-42").await.unwrap();
        assert!(cluster.ready);
        assert_eq!(cluster.id, "c-42");
    }

    #[tokio::test]
    async fn test_delete_cluster_defaults_to_unsupported() {
        struct Minimal;

        #[async_trait]
        impl ProviderAdapter for Minimal {
            async fn get_cluster(
                &self,
                _credential: &CloudCredential,
                _id: &str,
            ) -> Result<KaasCluster> {
                Ok(KaasCluster::default())
            }

            async fn provision_cluster(
                &self,
                _credential: &CloudCredential,
                _request: &CloudProvisioningRequest,
            ) -> Result<String> {
                Ok("c-1".into())
            }

            async fn fetch_info(&self, _credential: &CloudCredential) -> Result<serde_json::Value> {
                Ok(serde_json::json!({}))
            }
        }

        let endpoint = Endpoint {
            id: crate::types::EndpointId(1),
            name: "env".into(),
            url: String::new(),
            group_id: crate::types::GroupId(1),
            status: crate::types::EndpointStatus::Provisioning,
            status_message: String::new(),
            addons: Vec::new(),
            secure_by_default: false,
        };
        let err = Minimal
            .delete_cluster(&credential(), &endpoint)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }
}
