//! Provider metadata cache
//!
//! Provisioning forms need per-provider metadata (regions, node sizes,
//! Kubernetes versions) that is slow to fetch from cloud APIs. This cache
//! keeps the latest fetched document per credential and refreshes it on a
//! timer, on demand, and opportunistically after cache hits for legacy
//! single-credential providers.
//!
//! Cache keys are `{provider}_{credential_id}`, except for legacy
//! single-credential providers (Civo, DigitalOcean, Linode) which predate
//! multi-credential support and are keyed by the bare provider name.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::provider::ProviderRegistry;
use crate::store::Datastore;
use crate::types::{CloudCredential, CredentialId, Provider};
use crate::Result;

/// How often every cached document is refetched
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Buffered on-demand refresh requests
const UPDATE_QUEUE_CAPACITY: usize = 32;

/// Cache key for a credential's metadata document
fn cache_key(provider: Provider, credential_id: CredentialId) -> String {
    if provider.legacy_single_credential() {
        provider.key().to_string()
    } else {
        format!("{}_{}", provider.key(), credential_id)
    }
}

/// Shared cache of provider metadata documents
///
/// Clones share the same underlying map and update queue; one clone runs
/// [`InfoCache::run`] while others serve reads.
#[derive(Clone)]
pub struct InfoCache {
    store: Arc<dyn Datastore>,
    registry: Arc<ProviderRegistry>,
    entries: Arc<DashMap<String, Value>>,
    refresh_interval: Duration,
    update_tx: mpsc::Sender<CredentialId>,
}

impl InfoCache {
    /// Create a cache and the receiver its refresh loop consumes
    pub fn new(
        store: Arc<dyn Datastore>,
        registry: Arc<ProviderRegistry>,
    ) -> (Self, mpsc::Receiver<CredentialId>) {
        let (update_tx, update_rx) = mpsc::channel(UPDATE_QUEUE_CAPACITY);
        (
            Self {
                store,
                registry,
                entries: Arc::new(DashMap::new()),
                refresh_interval: DEFAULT_REFRESH_INTERVAL,
                update_tx,
            },
            update_rx,
        )
    }

    /// Override the periodic refresh interval
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Get the metadata document for a credential
    ///
    /// A miss (or `force`) fetches synchronously, exactly once, and caches
    /// the result. A hit returns the cached document immediately; for
    /// legacy single-credential providers a background refresh is also
    /// spawned and its handle returned so callers (and tests) can await
    /// completion.
    pub async fn info(
        &self,
        credential: &CloudCredential,
        force: bool,
    ) -> Result<(Value, Option<JoinHandle<()>>)> {
        let key = cache_key(credential.provider, credential.id);

        if !force {
            if let Some(entry) = self.entries.get(&key) {
                let cached = entry.value().clone();
                drop(entry);

                let handle = if credential.provider.legacy_single_credential() {
                    let cache = self.clone();
                    let credential = credential.clone();
                    Some(tokio::spawn(async move {
                        if let Err(e) = cache.refresh(&credential).await {
                            warn!(
                                provider = %credential.provider,
                                error = %e,
                                "background metadata refresh failed"
                            );
                        }
                    }))
                } else {
                    None
                };
                return Ok((cached, handle));
            }
        }

        let value = self.refresh(credential).await?;
        Ok((value, None))
    }

    /// Queue an out-of-band refresh after a credential change
    ///
    /// The refresh loop answers with a sweep over all configured providers
    /// so every form load after the change sees fresh metadata, without
    /// waiting for the periodic tick.
    pub async fn request_update(&self, credential_id: CredentialId) {
        if self.update_tx.send(credential_id).await.is_err() {
            warn!(credential = %credential_id, "cache refresh loop is gone, update dropped");
        }
    }

    /// Periodic and on-demand refresh loop
    ///
    /// Runs until `shutdown` flips to true. An update signal triggers a
    /// best-effort sweep over every stored credential, same as a timer
    /// tick. Per-credential fetch failures are logged and skipped; one
    /// provider being down never blocks the others.
    pub async fn run(
        &self,
        mut updates: mpsc::Receiver<CredentialId>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.refresh_interval, "provider metadata cache started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh_all().await;
                }
                Some(credential_id) = updates.recv() => {
                    debug!(credential = %credential_id, "on-demand refresh requested");
                    self.refresh_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("provider metadata cache stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Refetch metadata for every stored credential
    async fn refresh_all(&self) {
        let credentials = match self.store.cloud_credentials().await {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(error = %e, "credential listing failed, skipping refresh sweep");
                return;
            }
        };

        debug!(credentials = credentials.len(), "refreshing provider metadata");
        for credential in credentials {
            if let Err(e) = self.refresh(&credential).await {
                warn!(
                    provider = %credential.provider,
                    credential = %credential.id,
                    error = %e,
                    "metadata refresh failed"
                );
            }
        }
    }

    /// Fetch one credential's document through its adapter and cache it
    async fn refresh(&self, credential: &CloudCredential) -> Result<Value> {
        let adapter = self.registry.get(credential.provider)?;
        let value = adapter.fetch_info(credential).await?;
        self.entries
            .insert(cache_key(credential.provider, credential.id), value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProviderAdapter;
    use crate::store::InMemoryStore;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn credential(id: i64, provider: Provider) -> CloudCredential {
        CloudCredential {
            id: CredentialId(id),
            provider,
            name: format!("cred-{}", id),
            credentials: BTreeMap::new(),
        }
    }

    /// Adapter whose fetch_info returns a counter that increments per call
    fn counting_adapter(calls: Arc<AtomicUsize>) -> MockProviderAdapter {
        let mut adapter = MockProviderAdapter::new();
        adapter.expect_fetch_info().returning(move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({ "fetch": n }))
        });
        adapter
    }

    fn cache_with(
        provider: Provider,
        adapter: MockProviderAdapter,
    ) -> (InfoCache, mpsc::Receiver<CredentialId>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let mut registry = ProviderRegistry::new();
        registry.register(provider, Arc::new(adapter));
        let (cache, rx) = InfoCache::new(store.clone(), Arc::new(registry));
        (cache, rx, store)
    }

    #[test]
    fn test_legacy_providers_use_bare_key() {
        assert_eq!(cache_key(Provider::Civo, CredentialId(7)), "civo");
        assert_eq!(cache_key(Provider::Eks, CredentialId(7)), "eks_7");
    }

    #[tokio::test]
    async fn test_miss_fetches_once_then_hits_serve_from_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (cache, _rx, _store) = cache_with(Provider::Eks, counting_adapter(calls.clone()));
        let cred = credential(1, Provider::Eks);

        let (first, handle) = cache.info(&cred, false).await.unwrap();
        assert_eq!(first, json!({ "fetch": 1 }));
        assert!(handle.is_none());

        // Hit: cached value, no second fetch, no background refresh for a
        // multi-credential provider.
        let (second, handle) = cache.info(&cred, false).await.unwrap();
        assert_eq!(second, json!({ "fetch": 1 }));
        assert!(handle.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_force_bypasses_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (cache, _rx, _store) = cache_with(Provider::Eks, counting_adapter(calls.clone()));
        let cred = credential(1, Provider::Eks);

        cache.info(&cred, false).await.unwrap();
        let (refetched, _) = cache.info(&cred, true).await.unwrap();
        assert_eq!(refetched, json!({ "fetch": 2 }));
    }

    /// A legacy-provider hit serves the stale document immediately but
    /// kicks off a background refresh; awaiting the handle makes the next
    /// read see the fresh document.
    #[tokio::test]
    async fn test_legacy_hit_refreshes_in_background() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (cache, _rx, _store) = cache_with(Provider::Civo, counting_adapter(calls.clone()));
        let cred = credential(1, Provider::Civo);

        cache.info(&cred, false).await.unwrap();

        let (stale, handle) = cache.info(&cred, false).await.unwrap();
        assert_eq!(stale, json!({ "fetch": 1 }));
        let handle = handle.expect("legacy hit should spawn a refresh");
        handle.await.unwrap();

        let (fresh, _) = cache.info(&cred, false).await.unwrap();
        assert_eq!(fresh, json!({ "fetch": 2 }));
    }

    #[tokio::test]
    async fn test_missing_adapter_is_an_error_not_a_panic() {
        let (cache, _rx, _store) = cache_with(Provider::Eks, MockProviderAdapter::new());
        let err = cache
            .info(&credential(1, Provider::Gke), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no adapter registered"));
    }

    /// An update signal for one credential sweeps every stored credential,
    /// not just the changed one.
    #[tokio::test]
    async fn test_update_request_refreshes_all_providers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(InMemoryStore::new());
        let mut registry = ProviderRegistry::new();
        registry.register(Provider::Eks, Arc::new(counting_adapter(calls.clone())));
        registry.register(Provider::Gke, Arc::new(counting_adapter(calls.clone())));
        let (cache, rx) = InfoCache::new(store.clone(), Arc::new(registry));
        let cache = cache.with_refresh_interval(Duration::from_secs(3600));
        store.insert_credential(credential(1, Provider::Eks));
        store.insert_credential(credential(2, Provider::Gke));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_cache = cache.clone();
        let worker = tokio::spawn(async move { loop_cache.run(rx, shutdown_rx).await });

        cache.request_update(CredentialId(1)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The first interval tick fetched both credentials; the on-demand
        // request swept both again.
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }
}
