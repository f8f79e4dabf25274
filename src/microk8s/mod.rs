//! MicroK8s cluster orchestration over SSH
//!
//! This module builds, scales, upgrades and tears down self-hosted MicroK8s
//! clusters against operator-supplied Linux hosts, with no managed control
//! plane. All node-level work goes through the [`RemoteExecutor`] seam; the
//! only Kubernetes API usage is topology discovery.
//!
//! Concurrency follows the shape of each operation:
//! - Install and addon toggles run concurrently per node - they are
//!   independent. Per-node fan-out goes through a bounded pool so a large
//!   cluster never opens one SSH session per node at once.
//! - Joins run strictly sequentially - join tokens are single-use and must
//!   be fetched from a master immediately before use.
//! - Fan-out failures in removal, addon and upgrade batches are collected
//!   per node and surfaced as a warning summary, never aborting sibling
//!   work.

pub mod addons;
pub mod hosts;
pub mod topology;
pub mod version;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::agent::{KubeClient, KubeClientFactory, NodeInfo};
use crate::provider::ProviderAdapter;
use crate::ssh::{RemoteExecutor, SshCredentials, SshExecutor};
use crate::store::Datastore;
use crate::types::{
    AddonConfig, CloudCredential, CloudProvisioningRequest, Endpoint, EndpointId, KaasCluster,
    Microk8sProvisioningRequest, Microk8sScalingRequest, Microk8sUpgradeRequest,
};
use crate::{Error, Result};

use addons::{diff_addons, parse_enabled_addons, AddonSpec, RequiredOn};
use topology::MasterWorkerNodes;
use version::{next_channel, parse_snap_installed_channel};

/// Annotation marking a node that is being removed from the cluster
pub const REMOVING_NODE_ANNOTATION: &str = "portainer.io/removing-node=true";

/// Attempts to observe `SchedulingDisabled` after a drain
const DRAIN_POLL_ATTEMPTS: u32 = 5;

/// Delay between drain polls
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Maximum concurrent per-node SSH operations within one batch
const MAX_CONCURRENT_NODE_OPS: usize = 50;

/// Node-level MicroK8s operations
///
/// One orchestrator instance is built per operation from the endpoint's SSH
/// credentials; it holds no cluster state of its own. Topology is always
/// re-fetched through the Kubernetes API, never cached.
pub struct Microk8sOrchestrator {
    executor: Arc<dyn RemoteExecutor>,
    drain_poll_interval: Duration,
    node_concurrency: usize,
}

impl Microk8sOrchestrator {
    /// Create an orchestrator over the given executor
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            executor,
            drain_poll_interval: DRAIN_POLL_INTERVAL,
            node_concurrency: MAX_CONCURRENT_NODE_OPS,
        }
    }

    /// Override the drain poll delay (used by tests)
    pub fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    /// Override the per-node fan-out bound (used by tests)
    pub fn with_node_concurrency(mut self, limit: usize) -> Self {
        self.node_concurrency = limit;
        self
    }

    /// Build a new cluster from scratch
    ///
    /// Installs MicroK8s concurrently on every node (all-or-nothing), then
    /// for multi-node clusters distributes a hostname alias table and joins
    /// the remaining nodes sequentially, and finally enables the requested
    /// addons. A single-node cluster skips the alias table and joins
    /// entirely.
    pub async fn provision(&self, request: &Microk8sProvisioningRequest) -> Result<()> {
        let primary = request
            .master_nodes
            .first()
            .ok_or_else(|| Error::validation("at least one master node is required"))?
            .clone();
        let channel = if request.channel.is_empty() {
            version::latest_channel().to_string()
        } else {
            request.channel.clone()
        };

        let mut all = request.master_nodes.clone();
        all.extend(request.worker_nodes.iter().cloned());

        info!(
            nodes = all.len(),
            channel = %channel,
            "provisioning microk8s cluster"
        );

        self.install_all(&all, &channel).await?;

        if all.len() > 1 {
            let entries = hosts::gather_hostnames(self.executor.as_ref(), &all).await?;
            hosts::distribute_host_entries(self.executor.as_ref(), &all, &entries).await?;

            for master in &request.master_nodes[1..] {
                self.join_node(&primary, master, false).await?;
            }
            for worker in &request.worker_nodes {
                self.join_node(&primary, worker, true).await?;
            }
        }

        let warnings = self
            .enable_addons(
                &request.addons,
                &channel,
                &request.master_nodes,
                &all,
                &primary,
            )
            .await;
        for warning in &warnings {
            warn!(warning = %warning, "addon enablement issue during provisioning");
        }

        info!(cluster = %primary, "microk8s cluster provisioned");
        Ok(())
    }

    /// Scale the cluster up
    ///
    /// New nodes are installed at the cluster's current version (queried
    /// live from snap, never assumed), the hostname alias table is rebuilt
    /// over existing and new nodes, new nodes join sequentially, and the
    /// cluster's currently enabled addons are re-enabled scoped to the new
    /// nodes only. Returns a warning summary for addon failures.
    pub async fn add_nodes(
        &self,
        kube: &dyn KubeClient,
        connection_address: &str,
        masters_to_add: &[String],
        workers_to_add: &[String],
        stored_addons: &[AddonConfig],
    ) -> Result<Option<String>> {
        let topo = MasterWorkerNodes::fetch(kube).await?;

        let snap_list = self
            .executor
            .run(connection_address, "snap list microk8s")
            .await?;
        let channel = parse_snap_installed_channel(&snap_list)?;

        let mut new_nodes = masters_to_add.to_vec();
        new_nodes.extend(workers_to_add.iter().cloned());
        if new_nodes.is_empty() {
            return Ok(None);
        }

        info!(
            new_nodes = new_nodes.len(),
            channel = %channel,
            "scaling microk8s cluster up"
        );

        self.install_all(&new_nodes, &channel).await?;

        let mut combined = topo.addresses();
        combined.extend(new_nodes.iter().cloned());
        let entries = hosts::gather_hostnames(self.executor.as_ref(), &combined).await?;
        hosts::distribute_host_entries(self.executor.as_ref(), &combined, &entries).await?;

        for master in masters_to_add {
            self.join_node(connection_address, master, false).await?;
        }
        for worker in workers_to_add {
            self.join_node(connection_address, worker, true).await?;
        }

        // Re-enable configured addons on the freshly joined nodes so
        // per-node components (runtimes, device plugins) exist everywhere.
        let status = self
            .executor
            .run(connection_address, "microk8s status --format short")
            .await?;
        let enabled = parse_enabled_addons(&status);

        let mut all_masters: Vec<String> = topo
            .masters
            .iter()
            .map(|n| n.address.clone())
            .collect();
        all_masters.extend(masters_to_add.iter().cloned());

        let mut warnings = Vec::new();
        for name in &enabled {
            let Some(spec) = addons::find(name) else {
                continue;
            };
            let scope = scope_nodes(
                spec.required_on,
                &all_masters,
                &combined,
                connection_address,
            );
            let targets: Vec<String> = scope
                .into_iter()
                .filter(|n| new_nodes.contains(n))
                .collect();
            if targets.is_empty() {
                continue;
            }
            let args = stored_addons
                .iter()
                .find(|a| &a.name == name)
                .map(|a| a.args.as_str())
                .unwrap_or("");
            warnings.extend(self.enable_addon_on(spec, args, &targets).await);
        }

        Ok(summarize(warnings))
    }

    /// Apply a scaling request: removals first, then additions
    ///
    /// Returns the nodes that could not be removed plus the addon warning
    /// summary from the additions.
    pub async fn scale(
        &self,
        kube: &dyn KubeClient,
        connection_address: &str,
        request: &Microk8sScalingRequest,
        stored_addons: &[AddonConfig],
    ) -> Result<(Vec<String>, Option<String>)> {
        let unremoved = if request.nodes_to_remove.is_empty() {
            Vec::new()
        } else {
            self.remove_nodes(kube, connection_address, &request.nodes_to_remove)
                .await?
        };
        let warnings = if request.master_nodes_to_add.is_empty()
            && request.worker_nodes_to_add.is_empty()
        {
            None
        } else {
            self.add_nodes(
                kube,
                connection_address,
                &request.master_nodes_to_add,
                &request.worker_nodes_to_add,
                stored_addons,
            )
            .await?
        };
        Ok((unremoved, warnings))
    }

    /// Scale the cluster down
    ///
    /// Refuses immediately, before contacting any node, if the target set
    /// includes the SSH/API connection node. Per-node failures are
    /// collected, not fatal to sibling nodes; the returned list names the
    /// nodes that could not be removed.
    pub async fn remove_nodes(
        &self,
        kube: &dyn KubeClient,
        connection_address: &str,
        targets: &[String],
    ) -> Result<Vec<String>> {
        if targets.iter().any(|t| t == connection_address) {
            return Err(Error::validation(format!(
                "cannot remove node {}: it is the cluster connection point",
                connection_address
            )));
        }

        let topo = MasterWorkerNodes::fetch(kube).await?;
        let mut unremoved = Vec::new();

        for target in targets {
            let Some(node) = topo.find_by_address(target) else {
                warn!(node = %target, "node not found in cluster, skipping removal");
                unremoved.push(target.clone());
                continue;
            };

            // Annotation and drain are best-effort; the node may already be
            // unhealthy, which is exactly when removal matters most.
            if let Err(e) = self
                .executor
                .run(
                    connection_address,
                    &format!(
                        "microk8s kubectl annotate node {} {} --overwrite",
                        node.name, REMOVING_NODE_ANNOTATION
                    ),
                )
                .await
            {
                warn!(node = %node.name, error = %e, "failed to annotate node for removal");
            }
            if let Err(e) = self
                .executor
                .run(
                    connection_address,
                    &format!(
                        "microk8s kubectl drain {} --ignore-daemonsets --delete-emptydir-data --timeout=120s",
                        node.name
                    ),
                )
                .await
            {
                warn!(node = %node.name, error = %e, "failed to drain node before removal");
            }

            // Graceful leave first; only this node's own failure escalates
            // to a force-removal from the master.
            match self.executor.run(target, "microk8s leave").await {
                Ok(_) => {
                    info!(node = %node.name, "node left the cluster");
                }
                Err(leave_err) => {
                    warn!(node = %node.name, error = %leave_err, "graceful leave failed, force-removing");
                    if let Err(e) = self
                        .executor
                        .run(
                            connection_address,
                            &format!("microk8s remove-node {} --force", node.name),
                        )
                        .await
                    {
                        warn!(node = %node.name, error = %e, "force removal failed");
                        unremoved.push(target.clone());
                    }
                }
            }
        }

        Ok(unremoved)
    }

    /// Reconcile the cluster's addons with a desired configuration
    ///
    /// The live enabled set is read via `microk8s status`; the diff against
    /// the endpoint's stored configuration decides what to disable and
    /// enable. Per-addon failures become a warning summary rather than
    /// aborting the batch, and the desired list is persisted on the
    /// endpoint regardless of per-addon outcome.
    pub async fn update_addons(
        &self,
        kube: &dyn KubeClient,
        store: &dyn Datastore,
        endpoint_id: EndpointId,
        connection_address: &str,
        desired: &[AddonConfig],
    ) -> Result<Option<String>> {
        let endpoint = store.endpoint(endpoint_id).await?;
        let topo = MasterWorkerNodes::fetch(kube).await?;

        let status = self
            .executor
            .run(connection_address, "microk8s status --format short")
            .await?;
        let live = parse_enabled_addons(&status);
        let diff = diff_addons(&live, &endpoint.addons, desired);

        let masters: Vec<String> = topo.masters.iter().map(|n| n.address.clone()).collect();
        let all = topo.addresses();

        let mut warnings = Vec::new();
        for addon in &diff.disable {
            match addons::find(&addon.name) {
                Some(spec) => {
                    warnings.extend(
                        self.disable_addon(spec, &masters, &all, connection_address)
                            .await,
                    );
                }
                None => warnings.push(format!("{}: unknown addon, cannot disable", addon.name)),
            }
        }
        for addon in &diff.enable {
            match addons::find(&addon.name) {
                Some(spec) => {
                    let scope = scope_nodes(spec.required_on, &masters, &all, connection_address);
                    warnings.extend(self.enable_addon_on(spec, &addon.args, &scope).await);
                }
                None => warnings.push(format!("{}: unknown addon, cannot enable", addon.name)),
            }
        }

        // The desired configuration is the operator's intent; persist it
        // even when individual toggles failed so a retry converges.
        let mut updated = endpoint;
        updated.addons = desired.to_vec();
        store.update_endpoint(&updated).await?;

        Ok(summarize(warnings))
    }

    /// Rolling upgrade to the next supported channel
    ///
    /// Parses the installed channel from snap, steps one entry through the
    /// fixed version table (already-newest short-circuits to success), and
    /// refreshes node by node, masters first. Unless the cluster is
    /// single-node each node is drained and polled for `SchedulingDisabled`
    /// before its refresh, reverted on refresh failure, and uncordoned
    /// after. Previously enabled addons are disabled and re-enabled at the
    /// end to pick up version-specific install logic. Per-node and
    /// per-addon errors are joined into the returned warning summary; the
    /// operation does not abort on individual node failures.
    pub async fn upgrade(
        &self,
        kube: &dyn KubeClient,
        connection_address: &str,
        stored_addons: &[AddonConfig],
    ) -> Result<Option<String>> {
        let topo = MasterWorkerNodes::fetch(kube).await?;

        let snap_list = self
            .executor
            .run(connection_address, "snap list microk8s")
            .await?;
        let current = parse_snap_installed_channel(&snap_list)?;
        let Some(next) = next_channel(&current) else {
            info!(channel = %current, "cluster already on the newest supported channel");
            return Ok(None);
        };

        info!(from = %current, to = %next, nodes = topo.len(), "upgrading microk8s cluster");

        let single_node = topo.len() == 1;
        let mut warnings = Vec::new();

        for node in topo.all_masters_first() {
            if let Some(err) = self
                .upgrade_node(&node, connection_address, next, single_node)
                .await
            {
                warnings.push(format!("{}: {}", node.name, err));
            }
        }

        // Addons carry version-specific install logic; re-enable them on
        // the new channel.
        let status = self
            .executor
            .run(connection_address, "microk8s status --format short")
            .await?;
        let masters: Vec<String> = topo.masters.iter().map(|n| n.address.clone()).collect();
        let all = topo.addresses();
        for name in parse_enabled_addons(&status) {
            let Some(spec) = addons::find(&name) else {
                continue;
            };
            warnings.extend(
                self.disable_addon(spec, &masters, &all, connection_address)
                    .await,
            );
            let args = stored_addons
                .iter()
                .find(|a| a.name == name)
                .map(|a| a.args.as_str())
                .unwrap_or("");
            let scope = scope_nodes(spec.required_on, &masters, &all, connection_address);
            warnings.extend(self.enable_addon_on(spec, args, &scope).await);
        }

        Ok(summarize(warnings))
    }

    /// Upgrade the cluster behind an endpoint record
    ///
    /// Resolves the connection address and stored addon configuration from
    /// the endpoint before delegating to [`Self::upgrade`].
    pub async fn upgrade_endpoint(
        &self,
        kube: &dyn KubeClient,
        store: &dyn Datastore,
        request: &Microk8sUpgradeRequest,
    ) -> Result<Option<String>> {
        let endpoint = store.endpoint(request.endpoint_id).await?;
        let connection_address = endpoint_connection_address(&endpoint)?;
        self.upgrade(kube, &connection_address, &endpoint.addons)
            .await
    }

    /// Upgrade a single node, returning its error if any
    async fn upgrade_node(
        &self,
        node: &NodeInfo,
        connection_address: &str,
        next: &str,
        single_node: bool,
    ) -> Option<String> {
        if !single_node {
            if let Err(e) = self
                .executor
                .run(
                    connection_address,
                    &format!(
                        "microk8s kubectl drain {} --ignore-daemonsets --delete-emptydir-data --timeout=120s",
                        node.name
                    ),
                )
                .await
            {
                warn!(node = %node.name, error = %e, "drain failed before upgrade");
            }
            self.wait_for_scheduling_disabled(connection_address, &node.name)
                .await;
        }

        let mut node_error = None;
        match self
            .executor
            .run(
                &node.address,
                &format!("snap refresh microk8s --channel={} --classic", next),
            )
            .await
        {
            Ok(_) => {
                info!(node = %node.name, channel = %next, "node refreshed");
                if node.is_master {
                    // Addon repositories are wiped by the refresh on
                    // control plane nodes.
                    if let Err(e) = self
                        .executor
                        .run(
                            &node.address,
                            "microk8s addons repo add community https://github.com/canonical/microk8s-community-addons --force",
                        )
                        .await
                    {
                        warn!(node = %node.name, error = %e, "failed to re-register addon repository");
                    }
                }
            }
            Err(refresh_err) => {
                warn!(node = %node.name, error = %refresh_err, "refresh failed, reverting");
                if let Err(e) = self.executor.run(&node.address, "snap revert microk8s").await {
                    warn!(node = %node.name, error = %e, "revert failed");
                }
                node_error = Some(refresh_err.to_string());
            }
        }

        if !single_node {
            if let Err(e) = self
                .executor
                .run(
                    connection_address,
                    &format!("microk8s kubectl uncordon {}", node.name),
                )
                .await
            {
                warn!(node = %node.name, error = %e, "uncordon failed after upgrade");
            }
        }

        node_error
    }

    /// Poll until the node reports `SchedulingDisabled` or attempts run out
    async fn wait_for_scheduling_disabled(&self, connection_address: &str, node_name: &str) {
        for attempt in 1..=DRAIN_POLL_ATTEMPTS {
            match self
                .executor
                .run(
                    connection_address,
                    &format!("microk8s kubectl get node {} --no-headers", node_name),
                )
                .await
            {
                Ok(output) if output.contains("SchedulingDisabled") => return,
                Ok(_) => {}
                Err(e) => {
                    warn!(node = %node_name, attempt, error = %e, "scheduling status check failed")
                }
            }
            tokio::time::sleep(self.drain_poll_interval).await;
        }
        warn!(node = %node_name, "node never reported SchedulingDisabled, continuing");
    }

    /// Tear down the whole cluster
    ///
    /// Discovers every node via the Kubernetes API and purges the snap on
    /// all of them concurrently. Individual failures are logged, not fatal
    /// to sibling nodes, but the aggregate call fails if any node failed -
    /// the operator inspects logs for specifics.
    pub async fn delete_cluster(&self, kube: &dyn KubeClient) -> Result<()> {
        let topo = MasterWorkerNodes::fetch(kube).await?;
        let addresses = topo.addresses();
        let total = addresses.len();

        info!(nodes = total, "deleting microk8s cluster");

        let pool = Arc::new(Semaphore::new(self.node_concurrency));
        let results = join_all(addresses.iter().map(|address| {
            let pool = pool.clone();
            async move {
                let result = match pool.acquire().await {
                    Ok(_permit) => {
                        self.executor
                            .run(address, "snap remove microk8s --purge")
                            .await
                    }
                    Err(e) => Err(Error::ssh(format!("node pool closed: {}", e))),
                };
                if let Err(e) = &result {
                    warn!(node = %address, error = %e, "failed to uninstall microk8s");
                }
                result
            }
        }))
        .await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            return Err(Error::provider(format!(
                "failed to uninstall microk8s on {} of {} nodes; inspect logs for details",
                failed, total
            )));
        }
        Ok(())
    }

    /// Install the snap on every node through the bounded pool; the first
    /// failure aborts the whole batch
    async fn install_all(&self, nodes: &[String], channel: &str) -> Result<()> {
        let pool = Arc::new(Semaphore::new(self.node_concurrency));
        try_join_all(nodes.iter().map(|node| {
            let pool = pool.clone();
            async move {
                let _permit = pool
                    .acquire()
                    .await
                    .map_err(|e| Error::ssh(format!("node pool closed: {}", e)))?;
                self.install_node(node, channel).await
            }
        }))
        .await?;
        Ok(())
    }

    async fn install_node(&self, node: &str, channel: &str) -> Result<()> {
        info!(node = %node, channel = %channel, "installing microk8s");
        self.executor
            .run(
                node,
                &format!("snap install microk8s --classic --channel={}", channel),
            )
            .await?;
        self.executor
            .run(node, "microk8s status --wait-ready --timeout 600")
            .await?;
        Ok(())
    }

    /// Join a node to the cluster through a fresh single-use token
    ///
    /// The token is fetched from the master immediately before the join;
    /// fetching tokens ahead of time does not work because each one is
    /// consumed by a single join.
    async fn join_node(&self, master: &str, node: &str, worker: bool) -> Result<()> {
        let output = self
            .executor
            .run(master, "microk8s add-node --token-ttl 3600")
            .await?;
        let url = parse_join_url(&output)?;

        let command = if worker {
            format!("microk8s join {} --worker", url)
        } else {
            format!("microk8s join {}", url)
        };
        info!(node = %node, worker, "joining node to cluster");
        self.executor.run(node, &command).await?;
        Ok(())
    }

    /// Enable a set of addons, returning per-addon/per-node error strings
    async fn enable_addons(
        &self,
        requested: &[AddonConfig],
        channel: &str,
        masters: &[String],
        all: &[String],
        connection_address: &str,
    ) -> Vec<String> {
        let mut warnings = Vec::new();
        for addon in requested {
            let Some(spec) = addons::find(&addon.name) else {
                warnings.push(format!("{}: unknown addon", addon.name));
                continue;
            };
            if !spec.available_in(channel) {
                warnings.push(format!(
                    "{}: not available in channel {}",
                    addon.name, channel
                ));
                continue;
            }
            let scope = scope_nodes(spec.required_on, masters, all, connection_address);
            warnings.extend(self.enable_addon_on(spec, &addon.args, &scope).await);
        }
        warnings
    }

    /// Enable an addon across a node set, plus its extra install commands,
    /// returning error strings
    async fn enable_addon_on(&self, spec: &AddonSpec, args: &str, nodes: &[String]) -> Vec<String> {
        let mut warnings = self.run_on_nodes(nodes, &spec.enable_command(args)).await;
        for extra in spec.extra_install {
            warnings.extend(self.run_on_nodes(nodes, extra).await);
        }
        warnings
    }

    /// Disable an addon across its node scope, plus its extra uninstall
    /// commands, returning error strings
    async fn disable_addon(
        &self,
        spec: &AddonSpec,
        masters: &[String],
        all: &[String],
        connection_address: &str,
    ) -> Vec<String> {
        let scope = scope_nodes(spec.required_on, masters, all, connection_address);
        let mut warnings = self.run_on_nodes(&scope, &spec.disable_command()).await;
        for extra in spec.extra_uninstall {
            warnings.extend(self.run_on_nodes(&scope, extra).await);
        }
        warnings
    }

    /// Run one command on many nodes through the bounded pool, collecting
    /// error strings
    async fn run_on_nodes(&self, nodes: &[String], command: &str) -> Vec<String> {
        let pool = Arc::new(Semaphore::new(self.node_concurrency));
        let results = join_all(nodes.iter().map(|node| {
            let pool = pool.clone();
            async move {
                let result = match pool.acquire().await {
                    Ok(_permit) => self.executor.run(node, command).await,
                    Err(e) => Err(Error::ssh(format!("node pool closed: {}", e))),
                };
                (node, result)
            }
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(node, result)| {
                result
                    .err()
                    .map(|e| format!("{} on {}: {}", command, node, e))
            })
            .collect()
    }
}

/// Resolve the node set an addon's commands must run on
fn scope_nodes(
    required_on: RequiredOn,
    masters: &[String],
    all: &[String],
    connection_address: &str,
) -> Vec<String> {
    match required_on {
        RequiredOn::Masters => masters.to_vec(),
        RequiredOn::All => all.to_vec(),
        RequiredOn::Single => vec![connection_address.to_string()],
    }
}

/// Extract the join URL from `microk8s add-node` output
fn parse_join_url(output: &str) -> Result<String> {
    output
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("microk8s join "))
        .and_then(|rest| rest.split_whitespace().next())
        .map(str::to_string)
        .ok_or_else(|| Error::provider("no join url in add-node output"))
}

/// Join collected warnings into a single human-readable summary
fn summarize(warnings: Vec<String>) -> Option<String> {
    if warnings.is_empty() {
        None
    } else {
        Some(warnings.join("; "))
    }
}

/// [`ProviderAdapter`] for self-hosted MicroK8s clusters
///
/// The provider-side cluster identifier is the connection address (the
/// first master): there is no cloud control plane to hand out ids.
pub struct Microk8sAdapter {
    kube_factory: Arc<dyn KubeClientFactory>,
}

impl Microk8sAdapter {
    /// Create the adapter with a factory for topology discovery clients
    pub fn new(kube_factory: Arc<dyn KubeClientFactory>) -> Self {
        Self { kube_factory }
    }

    fn executor_for(credential: &CloudCredential) -> Result<Arc<dyn RemoteExecutor>> {
        let credentials = SshCredentials::try_from(credential)?;
        Ok(Arc::new(SshExecutor::new(credentials)))
    }
}

#[async_trait]
impl ProviderAdapter for Microk8sAdapter {
    async fn get_cluster(&self, credential: &CloudCredential, id: &str) -> Result<KaasCluster> {
        let executor = Self::executor_for(credential)?;
        executor
            .run(id, "microk8s status --wait-ready --timeout 30")
            .await?;
        let kube_config = executor.run(id, "microk8s config").await?;
        Ok(KaasCluster {
            id: id.to_string(),
            name: id.to_string(),
            ready: true,
            kube_config,
        })
    }

    async fn provision_cluster(
        &self,
        credential: &CloudCredential,
        request: &CloudProvisioningRequest,
    ) -> Result<String> {
        let executor = Self::executor_for(credential)?;
        let orchestrator = Microk8sOrchestrator::new(executor);

        let provisioning = Microk8sProvisioningRequest {
            endpoint_id: request.endpoint_id,
            master_nodes: request.master_nodes.clone(),
            worker_nodes: request.worker_nodes.clone(),
            addons: request.addons.clone(),
            channel: request.kubernetes_version.clone(),
        };
        orchestrator.provision(&provisioning).await?;

        request
            .master_nodes
            .first()
            .cloned()
            .ok_or_else(|| Error::validation("at least one master node is required"))
    }

    async fn delete_cluster(
        &self,
        credential: &CloudCredential,
        endpoint: &Endpoint,
    ) -> Result<()> {
        let connection_address = endpoint_connection_address(endpoint)?;
        let executor = Self::executor_for(credential)?;

        let kube_config = executor.run(&connection_address, "microk8s config").await?;
        let kube = self.kube_factory.client_for(&kube_config).await?;

        Microk8sOrchestrator::new(executor)
            .delete_cluster(kube.as_ref())
            .await
    }

    async fn fetch_info(&self, _credential: &CloudCredential) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "kubernetesVersions": version::MICROK8S_CHANNELS,
            "addons": addons::ADDONS.iter().map(|a| a.name).collect::<Vec<_>>(),
        }))
    }
}

/// Strip the agent port off an endpoint URL to get the SSH target
fn endpoint_connection_address(endpoint: &Endpoint) -> Result<String> {
    endpoint
        .url
        .split(':')
        .next()
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::validation(format!(
                "endpoint {} has no usable connection address",
                endpoint.id
            ))
        })
}
