//! Core data model for the provisioning orchestrator
//!
//! These types mirror what the durable store persists (tasks, endpoints,
//! credentials) plus the ephemeral per-operation descriptors exchanged with
//! provider adapters and the MicroK8s orchestrator.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Identifier of a provisioning task in the durable store
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a managed environment (endpoint) record
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EndpointId(pub i64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a stored cloud credential
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CredentialId(pub i64);

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an endpoint group
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GroupId(pub i64);

/// Supported cloud providers
///
/// Each variant maps to a stable string key used for adapter registry lookup
/// and cache keying.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Amazon EKS
    Eks,
    /// Azure AKS
    Aks,
    /// Google GKE
    Gke,
    /// Civo managed Kubernetes
    Civo,
    /// DigitalOcean managed Kubernetes
    DigitalOcean,
    /// Linode managed Kubernetes
    Linode,
    /// Self-hosted MicroK8s over SSH
    Microk8s,
    /// A cluster with a pre-installed platform agent
    PreinstalledAgent,
}

impl Provider {
    /// Stable string key for this provider
    pub fn key(&self) -> &'static str {
        match self {
            Provider::Eks => "eks",
            Provider::Aks => "aks",
            Provider::Gke => "gke",
            Provider::Civo => "civo",
            Provider::DigitalOcean => "digitalocean",
            Provider::Linode => "linode",
            Provider::Microk8s => "microk8s",
            Provider::PreinstalledAgent => "preinstalled-agent",
        }
    }

    /// Whether this provider predates multi-credential support
    ///
    /// Legacy providers are cached under the bare provider key and get an
    /// async background refresh on every cache hit.
    pub fn legacy_single_credential(&self) -> bool {
        matches!(
            self,
            Provider::Civo | Provider::DigitalOcean | Provider::Linode
        )
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eks" => Ok(Provider::Eks),
            "aks" => Ok(Provider::Aks),
            "gke" => Ok(Provider::Gke),
            "civo" => Ok(Provider::Civo),
            "digitalocean" => Ok(Provider::DigitalOcean),
            "linode" => Ok(Provider::Linode),
            "microk8s" => Ok(Provider::Microk8s),
            "preinstalled-agent" => Ok(Provider::PreinstalledAgent),
            other => Err(Error::validation(format!("unknown provider '{}'", other))),
        }
    }
}

/// State of an in-flight provisioning task
///
/// Transitions are strictly linear with no backward edges; `Done` is
/// terminal. A task restored after a restart always restarts from `Pending`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningState {
    /// Task accepted, nothing attempted yet
    Pending,
    /// Waiting for the provider to report the cluster as ready
    WaitingForCluster,
    /// Deploying the platform agent into the cluster
    AgentSetup,
    /// Polling for the agent to report an address
    WaitingForAgent,
    /// Writing the agent address and defaults to the endpoint record
    UpdatingEndpoint,
    /// Terminal state; a result is emitted and the task deleted
    Done,
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisioningState::Pending => "pending",
            ProvisioningState::WaitingForCluster => "waiting-for-cluster",
            ProvisioningState::AgentSetup => "agent-setup",
            ProvisioningState::WaitingForAgent => "waiting-for-agent",
            ProvisioningState::UpdatingEndpoint => "updating-endpoint",
            ProvisioningState::Done => "done",
        };
        f.write_str(s)
    }
}

/// An addon selection with optional arguments, as stored on an endpoint and
/// passed to enable commands
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonConfig {
    /// Addon name as known to `microk8s enable`
    pub name: String,
    /// Optional arguments (e.g. an address pool for metallb)
    #[serde(default)]
    pub args: String,
}

impl AddonConfig {
    /// Create an addon selection without arguments
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: String::new(),
        }
    }

    /// Create an addon selection with arguments
    pub fn with_args(name: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: args.into(),
        }
    }
}

/// A request to provision a new KaaS cluster
///
/// Created by the request boundary and immutable once submitted to the
/// coordinator. Provider-specific fields are only read by the matching
/// adapter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloudProvisioningRequest {
    /// Target provider
    pub provider: Provider,
    /// Endpoint record created for this cluster
    pub endpoint_id: EndpointId,
    /// Credential used for provider API or SSH access
    pub credential_id: CredentialId,
    /// Cluster name
    pub name: String,
    /// Provider region
    #[serde(default)]
    pub region: String,
    /// Node size/flavor for managed providers
    #[serde(default)]
    pub node_size: String,
    /// Node count for managed providers
    #[serde(default)]
    pub node_count: u32,
    /// Kubernetes version or MicroK8s snap channel
    #[serde(default)]
    pub kubernetes_version: String,
    /// EKS AMI type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ami_type: Option<String>,
    /// EKS instance type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    /// AKS resource group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
    /// MicroK8s master node addresses
    #[serde(default)]
    pub master_nodes: Vec<String>,
    /// MicroK8s worker node addresses
    #[serde(default)]
    pub worker_nodes: Vec<String>,
    /// MicroK8s addon selections
    #[serde(default)]
    pub addons: Vec<AddonConfig>,
}

/// Durable record of an in-flight provisioning job
///
/// Exclusively owned by its processing task while active; persisted so it
/// survives a restart; deleted once terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloudProvisioningTask {
    /// Task identity
    pub id: TaskId,
    /// Snapshot of the originating request
    pub request: CloudProvisioningRequest,
    /// Current state machine position
    pub state: ProvisioningState,
    /// Retries performed within the current state
    pub retries: u32,
    /// Task-level fatal error; short-circuits the machine to `Done`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    /// Provider-side cluster identifier, set once provisioning is accepted
    #[serde(default)]
    pub cluster_id: String,
    /// Creation timestamp; drives the stale-task purge on restore
    pub created_at: DateTime<Utc>,
}

impl CloudProvisioningTask {
    /// Create a fresh task for a request
    pub fn new(id: TaskId, request: CloudProvisioningRequest, cluster_id: String) -> Self {
        Self {
            id,
            request,
            state: ProvisioningState::Pending,
            retries: 0,
            err: None,
            cluster_id,
            created_at: Utc::now(),
        }
    }

    /// Endpoint this task is provisioning
    pub fn endpoint_id(&self) -> EndpointId {
        self.request.endpoint_id
    }
}

/// Ephemeral view of a provider-side cluster
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KaasCluster {
    /// Provider-side cluster identifier
    pub id: String,
    /// Cluster name
    pub name: String,
    /// Whether the control plane is ready for use
    pub ready: bool,
    /// Admin kubeconfig, empty until the cluster is ready
    pub kube_config: String,
}

/// Request to grow or shrink a MicroK8s cluster
#[derive(Clone, Debug, Default)]
pub struct Microk8sScalingRequest {
    /// Endpoint of the cluster being scaled
    pub endpoint_id: EndpointId,
    /// New master node addresses to install and join
    pub master_nodes_to_add: Vec<String>,
    /// New worker node addresses to install and join
    pub worker_nodes_to_add: Vec<String>,
    /// Node addresses to drain and remove
    pub nodes_to_remove: Vec<String>,
}

/// Request to upgrade a MicroK8s cluster to the next supported channel
#[derive(Clone, Debug)]
pub struct Microk8sUpgradeRequest {
    /// Endpoint of the cluster being upgraded
    pub endpoint_id: EndpointId,
}

/// Parameters for building a new MicroK8s cluster over SSH
#[derive(Clone, Debug, Default)]
pub struct Microk8sProvisioningRequest {
    /// Endpoint record created for this cluster
    pub endpoint_id: EndpointId,
    /// Master node addresses; the first is the connection node
    pub master_nodes: Vec<String>,
    /// Worker node addresses
    pub worker_nodes: Vec<String>,
    /// Addons to enable once all nodes have joined
    pub addons: Vec<AddonConfig>,
    /// Snap channel to install (e.g. "1.30/stable")
    pub channel: String,
}

/// Externally owned secret map for provider API or SSH access
///
/// Read-only to this crate; the keys present depend on the provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloudCredential {
    /// Credential identity
    pub id: CredentialId,
    /// Provider this credential belongs to
    pub provider: Provider,
    /// Human-readable name
    pub name: String,
    /// Secret key/value pairs (ssh username/password/passphrase/privateKey,
    /// or cloud API keys)
    pub credentials: BTreeMap<String, String>,
}

impl CloudCredential {
    /// Look up a secret value by key, treating empty strings as absent
    pub fn secret(&self, key: &str) -> Option<&str> {
        self.credentials
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Operational status of an endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointStatus {
    /// Cluster is being created or configured
    Provisioning,
    /// Agent is connected and the endpoint is usable
    Up,
    /// Provisioning failed; the message carries detail
    Error,
}

/// The platform's record of a managed environment
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Endpoint {
    /// Endpoint identity
    pub id: EndpointId,
    /// Environment name
    pub name: String,
    /// Agent URL (`<address>:9001` once provisioned)
    pub url: String,
    /// Group this endpoint belongs to
    pub group_id: GroupId,
    /// Operational status
    pub status: EndpointStatus,
    /// Milestone or error message shown to the operator
    #[serde(default)]
    pub status_message: String,
    /// Desired MicroK8s addon configuration, persisted across updates
    #[serde(default)]
    pub addons: Vec<AddonConfig>,
    /// Whether default security settings have been applied
    #[serde(default)]
    pub secure_by_default: bool,
}

/// A group of endpoints sharing access policies
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointGroup {
    /// Group identity
    pub id: GroupId,
    /// Group name
    pub name: String,
    /// Whether the group carries user/team access policies
    ///
    /// When true, user authorizations are recomputed after an endpoint in
    /// the group finishes provisioning.
    pub has_access_policies: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    mod provider_keys {
        use super::*;

        #[test]
        fn test_key_round_trip() {
            for p in [
                Provider::Eks,
                Provider::Aks,
                Provider::Gke,
                Provider::Civo,
                Provider::DigitalOcean,
                Provider::Linode,
                Provider::Microk8s,
                Provider::PreinstalledAgent,
            ] {
                let parsed: Provider = p.key().parse().expect("key should parse");
                assert_eq!(parsed, p);
            }
        }

        #[test]
        fn test_unknown_key_is_rejected() {
            let err = "openstack".parse::<Provider>().unwrap_err();
            assert!(err.to_string().contains("unknown provider"));
        }

        #[test]
        fn test_legacy_single_credential_providers() {
            assert!(Provider::Civo.legacy_single_credential());
            assert!(Provider::DigitalOcean.legacy_single_credential());
            assert!(Provider::Linode.legacy_single_credential());
            assert!(!Provider::Eks.legacy_single_credential());
            assert!(!Provider::Microk8s.legacy_single_credential());
        }
    }

    mod task {
        use super::*;

        fn request() -> CloudProvisioningRequest {
            CloudProvisioningRequest {
                provider: Provider::Civo,
                endpoint_id: EndpointId(1),
                credential_id: CredentialId(1),
                name: "test".into(),
                region: "lon1".into(),
                node_size: "g4s.kube.medium".into(),
                node_count: 3,
                kubernetes_version: "1.30".into(),
                ami_type: None,
                instance_type: None,
                resource_group: None,
                master_nodes: Vec::new(),
                worker_nodes: Vec::new(),
                addons: Vec::new(),
            }
        }

        #[test]
        fn test_new_task_starts_pending() {
            let task = CloudProvisioningTask::new(TaskId(7), request(), "c-123".into());
            assert_eq!(task.state, ProvisioningState::Pending);
            assert_eq!(task.retries, 0);
            assert!(task.err.is_none());
            assert_eq!(task.endpoint_id(), EndpointId(1));
        }

        #[test]
        fn test_task_survives_serde_round_trip() {
            let task = CloudProvisioningTask::new(TaskId(7), request(), "c-123".into());
            let json = serde_json::to_string(&task).expect("serialize");
            let back: CloudProvisioningTask = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(back.id, task.id);
            assert_eq!(back.state, ProvisioningState::Pending);
            assert_eq!(back.cluster_id, "c-123");
        }
    }

    mod credential {
        use super::*;

        #[test]
        fn test_empty_secret_values_are_absent() {
            let mut creds = BTreeMap::new();
            creds.insert("username".to_string(), "ubuntu".to_string());
            creds.insert("passphrase".to_string(), String::new());
            let c = CloudCredential {
                id: CredentialId(1),
                provider: Provider::Microk8s,
                name: "ssh".into(),
                credentials: creds,
            };
            assert_eq!(c.secret("username"), Some("ubuntu"));
            assert_eq!(c.secret("passphrase"), None);
            assert_eq!(c.secret("privateKey"), None);
        }
    }
}
