//! Host alias table construction
//!
//! MicroK8s's join process requires nodes to resolve each other by
//! hostname. Cloud hosts frequently have no shared DNS, so before joining
//! a multi-node cluster the orchestrator queries each node's hostname over
//! SSH and appends an alias table to `/etc/hosts` on every node (and,
//! best-effort, to the cloud-init hosts template so the entries survive
//! re-rendering).

use tracing::warn;

use crate::ssh::RemoteExecutor;
use crate::Result;

/// Cloud-init template that regenerates /etc/hosts on some images
pub const CLOUD_INIT_HOSTS_TEMPLATE: &str = "/etc/cloud/templates/hosts.debian.tmpl";

/// An `address -> hostname` pair for the alias table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostEntry {
    /// Node IP address
    pub address: String,
    /// Hostname the node reports
    pub hostname: String,
}

/// Query each node for its hostname over SSH
///
/// Runs sequentially; hostname lookups are fast and the result feeds a
/// table written to every node, so there is nothing to overlap with.
pub async fn gather_hostnames(
    executor: &dyn RemoteExecutor,
    addresses: &[String],
) -> Result<Vec<HostEntry>> {
    let mut entries = Vec::with_capacity(addresses.len());
    for address in addresses {
        let hostname = executor.run(address, "hostname").await?;
        entries.push(HostEntry {
            address: address.clone(),
            hostname: hostname.trim().to_string(),
        });
    }
    Ok(entries)
}

/// Render the alias table as `/etc/hosts` lines
pub fn render_host_entries(entries: &[HostEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{} {}", e.address, e.hostname))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Append the alias table to `/etc/hosts` on every node
///
/// The cloud-init template update is best-effort: images without the
/// template skip it, and a failure there never fails the operation.
pub async fn distribute_host_entries(
    executor: &dyn RemoteExecutor,
    addresses: &[String],
    entries: &[HostEntry],
) -> Result<()> {
    let table = render_host_entries(entries);
    for address in addresses {
        executor
            .run(address, &format!("echo '{}' >> /etc/hosts", table))
            .await?;

        let template_cmd = format!(
            "if [ -f {path} ]; then echo '{table}' >> {path}; fi",
            path = CLOUD_INIT_HOSTS_TEMPLATE,
            table = table
        );
        if let Err(e) = executor.run(address, &template_cmd).await {
            warn!(host = %address, error = %e, "failed to update cloud-init hosts template");
        }
    }
    Ok(())
}
