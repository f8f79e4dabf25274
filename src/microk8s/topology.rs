//! Live cluster topology discovery
//!
//! Topology is fetched fresh via the Kubernetes API on every operation and
//! never cached across operations: scale and addon changes mutate the node
//! set, and a stale snapshot would scope commands to the wrong hosts.

use crate::agent::{KubeClient, NodeInfo};
use crate::{Error, Result};

/// A point-in-time view of the cluster's masters and workers
#[derive(Clone, Debug, Default)]
pub struct MasterWorkerNodes {
    /// Control plane nodes
    pub masters: Vec<NodeInfo>,
    /// Worker nodes (joined with `--worker`)
    pub workers: Vec<NodeInfo>,
}

impl MasterWorkerNodes {
    /// Fetch the current topology from the cluster
    pub async fn fetch(kube: &dyn KubeClient) -> Result<Self> {
        let nodes = kube.get_nodes().await?;
        if nodes.is_empty() {
            return Err(Error::provider("cluster reports no nodes"));
        }
        let (masters, workers) = nodes.into_iter().partition(|n| n.is_master);
        Ok(Self { masters, workers })
    }

    /// All nodes, masters first
    ///
    /// Master-first ordering matters for rolling upgrades: the control
    /// plane must move to the new version before workers re-register.
    pub fn all_masters_first(&self) -> Vec<NodeInfo> {
        let mut nodes = self.masters.clone();
        nodes.extend(self.workers.clone());
        nodes
    }

    /// Addresses of every node
    pub fn addresses(&self) -> Vec<String> {
        self.all_masters_first()
            .into_iter()
            .map(|n| n.address)
            .collect()
    }

    /// Find a node by its address
    pub fn find_by_address(&self, address: &str) -> Option<NodeInfo> {
        self.all_masters_first()
            .into_iter()
            .find(|n| n.address == address)
    }

    /// Total node count
    pub fn len(&self) -> usize {
        self.masters.len() + self.workers.len()
    }

    /// Whether the cluster has no nodes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
