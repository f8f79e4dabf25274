//! Kubernetes client seam for agent deployment and node discovery
//!
//! The coordinator consumes exactly two agent lifecycle calls (deploy the
//! platform agent, read back its address) plus a node listing used by the
//! MicroK8s orchestrator for topology discovery. [`KubeClient`] is the
//! mockable trait; [`AgentKubeClient`] is the production implementation on
//! top of a `kube::Client` built from a cluster's kubeconfig.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Namespace the platform agent is deployed into
pub const AGENT_NAMESPACE: &str = "portainer";

/// Name of the agent's Service
pub const AGENT_SERVICE_NAME: &str = "portainer-agent";

/// Label MicroK8s applies to nodes joined with `--worker`
pub const MICROK8S_WORKER_LABEL: &str = "node.kubernetes.io/microk8s-worker";

/// A node as seen by the orchestrator's topology discovery
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    /// Kubernetes node name (the host's hostname)
    pub name: String,
    /// Internal IP address, used as the SSH target
    pub address: String,
    /// Whether the node runs the control plane
    pub is_master: bool,
}

/// Kubernetes operations consumed by the coordinator and orchestrator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Deploy the platform agent into the cluster
    async fn deploy_agent(&self) -> Result<()>;

    /// Address the agent is reachable on, or an empty string if it has not
    /// reported one yet
    async fn agent_ip_or_hostname(&self) -> Result<String>;

    /// List cluster nodes with their addresses and roles
    async fn get_nodes(&self) -> Result<Vec<NodeInfo>>;
}

/// Builds [`KubeClient`] instances from kubeconfig content
///
/// The coordinator obtains a client once per task during agent setup; tests
/// substitute a mock factory to avoid touching a real API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClientFactory: Send + Sync {
    /// Build a client for the cluster described by the given kubeconfig
    async fn client_for(&self, kubeconfig: &str) -> Result<Arc<dyn KubeClient>>;
}

/// Production [`KubeClient`] backed by a `kube::Client`
pub struct AgentKubeClient {
    client: Client,
    agent_manifests: String,
}

impl AgentKubeClient {
    /// Wrap a kube client with the agent manifests to deploy
    pub fn new(client: Client, agent_manifests: impl Into<String>) -> Self {
        Self {
            client,
            agent_manifests: agent_manifests.into(),
        }
    }
}

#[async_trait]
impl KubeClient for AgentKubeClient {
    async fn deploy_agent(&self) -> Result<()> {
        let params = PatchParams::apply("kaas-orchestrator").force();

        // Parse every document up front: the serde_yaml deserializer is not
        // `Send`, so it cannot be held across the `.await` below.
        let docs: Vec<std::result::Result<serde_json::Value, serde_yaml::Error>> =
            serde_yaml::Deserializer::from_str(&self.agent_manifests)
                .map(serde::Deserialize::deserialize)
                .collect();

        for doc in docs {
            let value: serde_json::Value =
                doc.map_err(|e| Error::serialization(format!("agent manifest: {}", e)))?;
            if value.is_null() {
                continue;
            }

            let api_version = value
                .get("apiVersion")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::serialization("agent manifest missing apiVersion"))?
                .to_string();
            let kind = value
                .get("kind")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::serialization("agent manifest missing kind"))?
                .to_string();
            let name = value
                .pointer("/metadata/name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::serialization("agent manifest missing metadata.name"))?
                .to_string();

            let (group, version) = parse_api_version(&api_version);
            let ar = kube::discovery::ApiResource {
                group: group.to_string(),
                version: version.to_string(),
                api_version: api_version.clone(),
                kind: kind.clone(),
                plural: pluralize_kind(&kind),
            };

            let obj: DynamicObject = serde_json::from_value(value)
                .map_err(|e| Error::serialization(e.to_string()))?;

            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), AGENT_NAMESPACE, &ar);
            api.patch(&name, &params, &Patch::Apply(&obj)).await?;

            info!(kind = %kind, name = %name, "applied agent manifest");
        }

        Ok(())
    }

    async fn agent_ip_or_hostname(&self) -> Result<String> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), AGENT_NAMESPACE);

        let service = match services.get(AGENT_SERVICE_NAME).await {
            Ok(svc) => svc,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!("agent service not created yet");
                return Ok(String::new());
            }
            Err(e) => return Err(e.into()),
        };

        // A LoadBalancer ingress address wins; otherwise fall back to the
        // first node's internal IP (NodePort-style access).
        let lb_address = service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .and_then(|ing| ing.first())
            .and_then(|i| i.ip.clone().or_else(|| i.hostname.clone()));
        if let Some(addr) = lb_address {
            return Ok(addr);
        }

        let nodes = self.get_nodes().await?;
        Ok(nodes
            .into_iter()
            .next()
            .map(|n| n.address)
            .unwrap_or_default())
    }

    async fn get_nodes(&self) -> Result<Vec<NodeInfo>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&Default::default()).await?;

        let mut result = Vec::with_capacity(nodes.items.len());
        for node in nodes.items {
            let name = node.metadata.name.clone().unwrap_or_default();
            let address = node
                .status
                .as_ref()
                .and_then(|s| s.addresses.as_ref())
                .and_then(|addrs| {
                    addrs
                        .iter()
                        .find(|a| a.type_ == "InternalIP")
                        .map(|a| a.address.clone())
                })
                .unwrap_or_default();
            let is_master = !node
                .metadata
                .labels
                .as_ref()
                .map(|l| l.contains_key(MICROK8S_WORKER_LABEL))
                .unwrap_or(false);
            result.push(NodeInfo {
                name,
                address,
                is_master,
            });
        }

        Ok(result)
    }
}

/// Production factory: parses kubeconfig content and builds an
/// [`AgentKubeClient`]
pub struct DefaultKubeClientFactory {
    agent_manifests: String,
}

impl DefaultKubeClientFactory {
    /// Create a factory that deploys the given agent manifests
    pub fn new(agent_manifests: impl Into<String>) -> Self {
        Self {
            agent_manifests: agent_manifests.into(),
        }
    }
}

#[async_trait]
impl KubeClientFactory for DefaultKubeClientFactory {
    async fn client_for(&self, kubeconfig: &str) -> Result<Arc<dyn KubeClient>> {
        let kc = Kubeconfig::from_yaml(kubeconfig)
            .map_err(|e| Error::kubeconfig(format!("parse kubeconfig: {}", e)))?;
        let config = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::kubeconfig(format!("load kubeconfig: {}", e)))?;
        let client = Client::try_from(config)
            .map_err(|e| Error::kubeconfig(format!("build client: {}", e)))?;
        Ok(Arc::new(AgentKubeClient::new(
            client,
            self.agent_manifests.clone(),
        )))
    }
}

/// Parse API version into group and version components
fn parse_api_version(api_version: &str) -> (&str, &str) {
    if let Some(idx) = api_version.rfind('/') {
        (&api_version[..idx], &api_version[idx + 1..])
    } else {
        // Core API (e.g., "v1")
        ("", api_version)
    }
}

/// Convert a Kind to its plural form for Kubernetes API resources
///
/// Standard pluralization (lowercase + 's') covers every kind in the agent
/// manifest set (Namespace, ServiceAccount, Service, DaemonSet, roles).
fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{}ies", stem)
    } else {
        format!("{}s", lower)
    }
}
