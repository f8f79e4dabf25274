//! Provisioning coordinator
//!
//! The coordinator owns the lifecycle of provisioning requests: it accepts
//! them over a bounded queue, starts provider-side provisioning, persists a
//! task per request and hands each task to its own state machine runner
//! ([`state::TaskRunner`]). Results flow back over an internal channel for
//! finalization, so store writes that end a task always happen in one
//! place.
//!
//! On startup a restore pass re-adopts tasks persisted by a previous
//! process: stale tasks and tasks whose endpoint no longer exists are
//! purged, everything else restarts from `Pending`.

mod state;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::agent::KubeClientFactory;
use crate::provider::ProviderRegistry;
use crate::store::Datastore;
use crate::types::{
    CloudProvisioningRequest, CloudProvisioningTask, Endpoint, EndpointId, EndpointStatus,
    ProvisioningState,
};
use crate::{
    Error, Result, DEFAULT_POLL_INTERVAL_SECS, MAX_STATE_RETRIES, PROVISIONING_QUEUE_CAPACITY,
    STALE_TASK_AGE_DAYS,
};

use state::TaskRunner;

/// Platform-side effects the coordinator triggers but does not own
///
/// Snapshotting and authorization recomputation live elsewhere in the
/// platform; this seam keeps the coordinator testable and the crate free of
/// those subsystems.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlatformHooks: Send + Sync {
    /// Capture an initial resource snapshot of a freshly provisioned
    /// environment
    async fn trigger_snapshot(&self, endpoint: &Endpoint) -> Result<()>;

    /// Recompute user authorizations after an endpoint joins a group with
    /// access policies
    async fn update_user_authorizations(&self, endpoint_id: EndpointId) -> Result<()>;
}

/// Hooks implementation that does nothing, for deployments without the
/// surrounding platform
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHooks;

#[async_trait]
impl PlatformHooks for NoopHooks {
    async fn trigger_snapshot(&self, _endpoint: &Endpoint) -> Result<()> {
        Ok(())
    }

    async fn update_user_authorizations(&self, _endpoint_id: EndpointId) -> Result<()> {
        Ok(())
    }
}

/// Tunables for the task state machines
#[derive(Clone, Copy, Debug)]
pub struct CoordinatorOptions {
    /// Delay between state machine attempts
    pub poll_interval: Duration,
    /// Attempts per state before a task is failed
    pub max_state_retries: u32,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_state_retries: MAX_STATE_RETRIES,
        }
    }
}

/// Submission side of the coordinator's request queue
///
/// Cloning is cheap; `submit` applies backpressure when the queue is full.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CloudProvisioningRequest>,
}

impl CoordinatorHandle {
    /// Queue a provisioning request, waiting if the queue is full
    pub async fn submit(&self, request: CloudProvisioningRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::provider("provisioning coordinator is not running"))
    }
}

/// Create the bounded request queue and its submission handle
pub fn request_channel() -> (CoordinatorHandle, mpsc::Receiver<CloudProvisioningRequest>) {
    let (tx, rx) = mpsc::channel(PROVISIONING_QUEUE_CAPACITY);
    (CoordinatorHandle { tx }, rx)
}

/// Accepts provisioning requests and drives them to completion
pub struct ProvisioningCoordinator {
    store: Arc<dyn Datastore>,
    registry: Arc<ProviderRegistry>,
    kube_factory: Arc<dyn KubeClientFactory>,
    hooks: Arc<dyn PlatformHooks>,
    options: CoordinatorOptions,
}

impl ProvisioningCoordinator {
    /// Create a coordinator over the given store, adapters and hooks
    pub fn new(
        store: Arc<dyn Datastore>,
        registry: Arc<ProviderRegistry>,
        kube_factory: Arc<dyn KubeClientFactory>,
        hooks: Arc<dyn PlatformHooks>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            store,
            registry,
            kube_factory,
            hooks,
            options,
        }
    }

    /// Run until shutdown: restore persisted tasks, then serve the queue
    pub async fn run(
        &self,
        mut requests: mpsc::Receiver<CloudProvisioningRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (result_tx, mut results) = mpsc::channel::<CloudProvisioningTask>(
            PROVISIONING_QUEUE_CAPACITY,
        );

        self.restore_tasks(&result_tx, &shutdown).await;

        info!("provisioning coordinator started");
        loop {
            tokio::select! {
                Some(request) = requests.recv() => {
                    self.launch(request, result_tx.clone(), shutdown.clone());
                }
                Some(task) = results.recv() => {
                    self.finalize(task).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("provisioning coordinator stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Start provisioning for a request and hand the task to a runner
    ///
    /// Provider-side provisioning happens inside the spawned task so a slow
    /// cloud API never blocks the queue. A rejected provisioning call still
    /// creates the task, with the fatal error recorded, so failure reporting
    /// flows through the same finalization path.
    fn launch(
        &self,
        request: CloudProvisioningRequest,
        result_tx: mpsc::Sender<CloudProvisioningTask>,
        shutdown: watch::Receiver<bool>,
    ) {
        let store = self.store.clone();
        let registry = self.registry.clone();
        let kube_factory = self.kube_factory.clone();
        let hooks = self.hooks.clone();
        let options = self.options;

        tokio::spawn(async move {
            info!(
                provider = %request.provider,
                endpoint = %request.endpoint_id,
                name = %request.name,
                "provisioning request accepted"
            );

            let prepared = async {
                let credential = store.cloud_credential(request.credential_id).await?;
                let adapter = registry.get(request.provider)?;
                Ok::<_, Error>((credential, adapter))
            }
            .await;

            let (credential, adapter) = match prepared {
                Ok(pair) => pair,
                Err(e) => {
                    // Nothing to run a state machine against; fail the
                    // endpoint directly.
                    warn!(endpoint = %request.endpoint_id, error = %e, "provisioning request rejected");
                    fail_endpoint(store.as_ref(), request.endpoint_id, &e.to_string()).await;
                    return;
                }
            };

            let task_id = match store.next_task_id().await {
                Ok(id) => id,
                Err(e) => {
                    warn!(endpoint = %request.endpoint_id, error = %e, "task id allocation failed");
                    fail_endpoint(store.as_ref(), request.endpoint_id, &e.to_string()).await;
                    return;
                }
            };

            let mut task = match adapter.provision_cluster(&credential, &request).await {
                Ok(cluster_id) => CloudProvisioningTask::new(task_id, request, cluster_id),
                Err(e) => {
                    let mut task = CloudProvisioningTask::new(task_id, request, String::new());
                    task.err = Some(e.to_string());
                    task
                }
            };
            if let Err(e) = store.create_task(&task).await {
                warn!(task = %task.id, error = %e, "task persistence failed");
                task.err = Some(format!("task persistence failed: {}", e));
            }

            let runner = TaskRunner::new(
                store,
                adapter,
                credential,
                kube_factory,
                hooks,
                options.poll_interval,
                options.max_state_retries,
            );
            let finished = runner.run(task, shutdown).await;
            let _ = result_tx.send(finished).await;
        });
    }

    /// Re-adopt tasks persisted by a previous process
    ///
    /// Tasks older than the stale cutoff, and tasks whose endpoint record
    /// is gone, are deleted. Everything else restarts from `Pending` with a
    /// clean retry counter: intermediate progress is not trusted across a
    /// restart, and every state step is idempotent.
    async fn restore_tasks(
        &self,
        result_tx: &mpsc::Sender<CloudProvisioningTask>,
        shutdown: &watch::Receiver<bool>,
    ) {
        let tasks = match self.store.tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "task listing failed, nothing restored");
                return;
            }
        };
        if tasks.is_empty() {
            return;
        }
        info!(tasks = tasks.len(), "restoring persisted provisioning tasks");

        let cutoff = Utc::now() - ChronoDuration::days(STALE_TASK_AGE_DAYS);
        for mut task in tasks {
            if task.created_at < cutoff {
                warn!(task = %task.id, created_at = %task.created_at, "purging stale task");
                self.delete_task_record(&task).await;
                continue;
            }
            match self.store.endpoint(task.endpoint_id()).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    info!(task = %task.id, "endpoint is gone, purging task");
                    self.delete_task_record(&task).await;
                    continue;
                }
                Err(e) => {
                    warn!(task = %task.id, error = %e, "endpoint lookup failed, keeping task");
                    continue;
                }
            }

            task.state = ProvisioningState::Pending;
            task.retries = 0;
            task.err = None;
            if let Err(e) = self.store.update_task(&task).await {
                warn!(task = %task.id, error = %e, "failed to persist restored task");
            }
            self.relaunch(task, result_tx.clone(), shutdown.clone());
        }
    }

    /// Spawn a runner for a restored task
    ///
    /// Unlike [`Self::launch`], provisioning has already been started in a
    /// previous life; the runner resumes from `Pending` and re-polls the
    /// provider for the cluster recorded on the task.
    fn relaunch(
        &self,
        task: CloudProvisioningTask,
        result_tx: mpsc::Sender<CloudProvisioningTask>,
        shutdown: watch::Receiver<bool>,
    ) {
        let store = self.store.clone();
        let registry = self.registry.clone();
        let kube_factory = self.kube_factory.clone();
        let hooks = self.hooks.clone();
        let options = self.options;

        tokio::spawn(async move {
            let prepared = async {
                let credential = store.cloud_credential(task.request.credential_id).await?;
                let adapter = registry.get(task.request.provider)?;
                Ok::<_, Error>((credential, adapter))
            }
            .await;

            let finished = match prepared {
                Ok((credential, adapter)) => {
                    let runner = TaskRunner::new(
                        store,
                        adapter,
                        credential,
                        kube_factory,
                        hooks,
                        options.poll_interval,
                        options.max_state_retries,
                    );
                    runner.run(task, shutdown).await
                }
                Err(e) => {
                    warn!(task = %task.id, error = %e, "restored task cannot run");
                    let mut task = task;
                    task.err = Some(e.to_string());
                    task.state = ProvisioningState::Done;
                    task
                }
            };
            let _ = result_tx.send(finished).await;
        });
    }

    /// Close out a finished task
    ///
    /// A task interrupted by shutdown (not `Done`) stays persisted for the
    /// next restore pass. A `Done` task with an error marks its endpoint
    /// failed; either way the task record is deleted.
    async fn finalize(&self, task: CloudProvisioningTask) {
        if task.state != ProvisioningState::Done {
            info!(task = %task.id, state = %task.state, "task interrupted, left for restore");
            return;
        }

        if let Some(err) = &task.err {
            warn!(task = %task.id, endpoint = %task.endpoint_id(), error = %err, "provisioning failed");
            fail_endpoint(self.store.as_ref(), task.endpoint_id(), err).await;
        } else {
            info!(task = %task.id, endpoint = %task.endpoint_id(), "provisioning finished");
        }

        self.delete_task_record(&task).await;
    }

    async fn delete_task_record(&self, task: &CloudProvisioningTask) {
        if let Err(e) = self.store.delete_task(task.id).await {
            if !e.is_not_found() {
                warn!(task = %task.id, error = %e, "failed to delete task record");
            }
        }
    }
}

/// Mark an endpoint failed with the given message
///
/// The endpoint may have been deleted by the operator mid-provisioning;
/// absence is not an error here.
async fn fail_endpoint(store: &dyn Datastore, endpoint_id: EndpointId, message: &str) {
    match store.endpoint(endpoint_id).await {
        Ok(mut endpoint) => {
            endpoint.status = EndpointStatus::Error;
            endpoint.status_message = message.to_string();
            if let Err(e) = store.update_endpoint(&endpoint).await {
                warn!(endpoint = %endpoint_id, error = %e, "failed to persist endpoint failure");
            }
        }
        Err(e) if e.is_not_found() => {
            info!(endpoint = %endpoint_id, "endpoint gone before failure could be recorded");
        }
        Err(e) => {
            warn!(endpoint = %endpoint_id, error = %e, "endpoint lookup failed");
        }
    }
}
