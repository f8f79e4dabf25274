//! Parallel SSH reachability testing
//!
//! Before provisioning a batch of nodes, every candidate address is probed
//! with a full SSH connect-and-authenticate. Probes run through a bounded
//! worker pool so a large node list does not open hundreds of sockets at
//! once.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use super::{SshCredentials, SshExecutor};

/// Maximum concurrent reachability probes
pub const MAX_CONCURRENT_PROBES: usize = 50;

/// Outcome of probing a single address
#[derive(Clone, Debug)]
pub struct ReachabilityResult {
    /// The probed address
    pub address: String,
    /// Whether an authenticated SSH session could be established
    pub reachable: bool,
    /// Failure detail when unreachable
    pub error: Option<String>,
}

/// Probe every address with an authenticated SSH connection
///
/// Results are returned sorted by address so callers get a stable report
/// regardless of probe completion order.
pub async fn test_reachability(
    credentials: &SshCredentials,
    addresses: &[String],
) -> Vec<ReachabilityResult> {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));

    let probes = addresses.iter().cloned().map(|address| {
        let semaphore = semaphore.clone();
        let credentials = credentials.clone();
        tokio::spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    let creds = credentials.clone();
                    let addr = address.clone();
                    tokio::task::spawn_blocking(move || {
                        SshExecutor::connect(&creds, &addr).map(|_| ())
                    })
                    .await
                    .unwrap_or_else(|e| Err(crate::Error::ssh(format!("probe task failed: {}", e))))
                }
                Err(e) => Err(crate::Error::ssh(format!("probe pool closed: {}", e))),
            };

            match outcome {
                Ok(()) => {
                    debug!(address = %address, "ssh probe succeeded");
                    ReachabilityResult {
                        address,
                        reachable: true,
                        error: None,
                    }
                }
                Err(e) => {
                    debug!(address = %address, error = %e, "ssh probe failed");
                    ReachabilityResult {
                        address,
                        reachable: false,
                        error: Some(e.to_string()),
                    }
                }
            }
        })
    });

    // join_all preserves spawn order, so each join result lines up with
    // its input address; a panicked probe task still yields a result.
    let mut results: Vec<ReachabilityResult> = addresses
        .iter()
        .zip(futures::future::join_all(probes).await)
        .map(|(address, joined)| {
            joined.unwrap_or_else(|e| ReachabilityResult {
                address: address.clone(),
                reachable: false,
                error: Some(format!("probe task failed: {}", e)),
            })
        })
        .collect();
    results.sort_by(|a, b| a.address.cmp(&b.address));
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> SshCredentials {
        SshCredentials {
            username: "ubuntu".into(),
            password: "pw".into(),
            passphrase: None,
            private_key: None,
        }
    }

    #[tokio::test]
    async fn test_empty_address_list_yields_no_results() {
        let results = test_reachability(&credentials(), &[]).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_addresses_sorted_by_natural_order() {
        // TEST-NET-1 addresses are guaranteed unroutable; each probe fails
        // at dial time within the 5s timeout.
        let addresses = vec![
            "192.0.2.30:6".to_string(),
            "192.0.2.10:6".to_string(),
            "192.0.2.20:6".to_string(),
        ];
        let results = test_reachability(&credentials(), &addresses).await;

        assert_eq!(results.len(), 3);
        let order: Vec<&str> = results.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(order, vec!["192.0.2.10:6", "192.0.2.20:6", "192.0.2.30:6"]);
        assert!(results.iter().all(|r| !r.reachable));
        assert!(results.iter().all(|r| r.error.is_some()));
    }
}
