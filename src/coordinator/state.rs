//! Provisioning task state machine
//!
//! Each task is driven by its own [`TaskRunner`]: a strictly linear machine
//! (`Pending -> WaitingForCluster -> AgentSetup -> WaitingForAgent ->
//! UpdatingEndpoint -> Done`) with no backward edges. A failed step retries
//! the same state after the poll interval; a successful step transitions
//! and resets the retry counter. Exhausting the per-state retry budget
//! records the last error on the task and short-circuits to `Done`, where
//! the coordinator finalizes it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::agent::{KubeClient, KubeClientFactory};
use crate::provider::ProviderAdapter;
use crate::store::Datastore;
use crate::types::{
    CloudCredential, CloudProvisioningTask, EndpointStatus, ProvisioningState,
};
use crate::{Error, Result, DEFAULT_AGENT_PORT};

use super::PlatformHooks;

/// Operator-visible milestone for a state, written to the endpoint record
/// on every transition
fn milestone(state: ProvisioningState) -> &'static str {
    match state {
        ProvisioningState::Pending => "Request queued",
        ProvisioningState::WaitingForCluster => "Creating KaaS Cluster",
        ProvisioningState::AgentSetup => "Deploying portainer agent",
        ProvisioningState::WaitingForAgent => "Waiting for agent response",
        ProvisioningState::UpdatingEndpoint => "Updating environment",
        ProvisioningState::Done => "",
    }
}

/// The state after `state` in the linear machine
fn next_state(state: ProvisioningState) -> ProvisioningState {
    match state {
        ProvisioningState::Pending => ProvisioningState::WaitingForCluster,
        ProvisioningState::WaitingForCluster => ProvisioningState::AgentSetup,
        ProvisioningState::AgentSetup => ProvisioningState::WaitingForAgent,
        ProvisioningState::WaitingForAgent => ProvisioningState::UpdatingEndpoint,
        ProvisioningState::UpdatingEndpoint => ProvisioningState::Done,
        ProvisioningState::Done => ProvisioningState::Done,
    }
}

/// Per-step context carried across states within one run
///
/// The kube client is built once when the cluster turns ready and reused by
/// the agent states; the agent address bridges `WaitingForAgent` and
/// `UpdatingEndpoint`.
#[derive(Default)]
struct StepContext {
    kube: Option<Arc<dyn KubeClient>>,
    agent_address: Option<String>,
}

/// Drives a single provisioning task to `Done`
pub(crate) struct TaskRunner {
    store: Arc<dyn Datastore>,
    adapter: Arc<dyn ProviderAdapter>,
    credential: CloudCredential,
    kube_factory: Arc<dyn KubeClientFactory>,
    hooks: Arc<dyn PlatformHooks>,
    poll_interval: Duration,
    max_state_retries: u32,
}

impl TaskRunner {
    pub(crate) fn new(
        store: Arc<dyn Datastore>,
        adapter: Arc<dyn ProviderAdapter>,
        credential: CloudCredential,
        kube_factory: Arc<dyn KubeClientFactory>,
        hooks: Arc<dyn PlatformHooks>,
        poll_interval: Duration,
        max_state_retries: u32,
    ) -> Self {
        Self {
            store,
            adapter,
            credential,
            kube_factory,
            hooks,
            poll_interval,
            max_state_retries,
        }
    }

    /// Run the machine until the task is `Done` or shutdown is requested
    ///
    /// On shutdown the task is returned as-is, still persisted, so the
    /// restore pass can restart it from `Pending` after the next boot.
    pub(crate) async fn run(
        &self,
        mut task: CloudProvisioningTask,
        mut shutdown: watch::Receiver<bool>,
    ) -> CloudProvisioningTask {
        info!(task = %task.id, endpoint = %task.endpoint_id(), "provisioning task started");
        let mut ctx = StepContext::default();

        loop {
            if task.state == ProvisioningState::Done {
                return task;
            }
            if *shutdown.borrow() {
                warn!(task = %task.id, state = %task.state, "shutdown requested, leaving task for restore");
                return task;
            }

            let state_before = task.state;
            match self.step(&task, &mut ctx).await {
                Ok(next) => {
                    self.change_state(&mut task, next).await;
                }
                Err(e) => {
                    task.retries += 1;
                    warn!(
                        task = %task.id,
                        state = %task.state,
                        retries = task.retries,
                        error = %e,
                        "provisioning step failed"
                    );
                    if task.retries > self.max_state_retries {
                        error!(task = %task.id, state = %task.state, "retry budget exhausted");
                        task.err = Some(format!(
                            "gave up in state '{}' after {} attempts: {}",
                            task.state, task.retries, e
                        ));
                        self.change_state(&mut task, ProvisioningState::Done).await;
                        continue;
                    }
                    if let Err(e) = self.store.update_task(&task).await {
                        warn!(task = %task.id, error = %e, "failed to persist retry count");
                    }
                }
            }

            // Pending exists only to mark acceptance; it advances without
            // waiting for a poll tick.
            if task.state != ProvisioningState::Done && state_before != ProvisioningState::Pending {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    /// Execute the current state's work and name the state to move to
    async fn step(
        &self,
        task: &CloudProvisioningTask,
        ctx: &mut StepContext,
    ) -> Result<ProvisioningState> {
        // A fatal error recorded at launch (provisioning call rejected)
        // short-circuits straight to finalization.
        if task.err.is_some() {
            return Ok(ProvisioningState::Done);
        }

        match task.state {
            ProvisioningState::Pending => Ok(next_state(task.state)),

            ProvisioningState::WaitingForCluster => {
                let cluster = self
                    .adapter
                    .get_cluster(&self.credential, &task.cluster_id)
                    .await?;
                if !cluster.ready || cluster.kube_config.is_empty() {
                    return Err(Error::provider(format!(
                        "cluster '{}' is not ready yet",
                        task.cluster_id
                    )));
                }
                ctx.kube = Some(self.kube_factory.client_for(&cluster.kube_config).await?);
                Ok(next_state(task.state))
            }

            ProvisioningState::AgentSetup => {
                let kube = ctx
                    .kube
                    .as_ref()
                    .ok_or_else(|| Error::provider("no cluster client available"))?;
                kube.deploy_agent().await?;
                Ok(next_state(task.state))
            }

            ProvisioningState::WaitingForAgent => {
                let kube = ctx
                    .kube
                    .as_ref()
                    .ok_or_else(|| Error::provider("no cluster client available"))?;
                let address = kube.agent_ip_or_hostname().await?;
                if address.is_empty() {
                    return Err(Error::provider("agent has not published an address yet"));
                }
                ctx.agent_address = Some(address);
                Ok(next_state(task.state))
            }

            ProvisioningState::UpdatingEndpoint => {
                let address = ctx
                    .agent_address
                    .as_deref()
                    .ok_or_else(|| Error::provider("no agent address available"))?;
                self.update_endpoint(task, address).await?;
                Ok(next_state(task.state))
            }

            ProvisioningState::Done => Ok(ProvisioningState::Done),
        }
    }

    /// Write the agent URL and final defaults onto the endpoint record
    async fn update_endpoint(&self, task: &CloudProvisioningTask, address: &str) -> Result<()> {
        let mut endpoint = self.store.endpoint(task.endpoint_id()).await?;
        endpoint.url = format!("{}:{}", address, DEFAULT_AGENT_PORT);
        endpoint.status = EndpointStatus::Up;
        endpoint.status_message = String::new();
        endpoint.secure_by_default = true;
        self.store.update_endpoint(&endpoint).await?;

        // Snapshot and authorization refresh are platform conveniences; a
        // failure there must not fail an otherwise healthy environment.
        if let Err(e) = self.hooks.trigger_snapshot(&endpoint).await {
            warn!(endpoint = %endpoint.id, error = %e, "post-provisioning snapshot failed");
        }
        match self.store.endpoint_group(endpoint.group_id).await {
            Ok(group) if group.has_access_policies => {
                if let Err(e) = self.hooks.update_user_authorizations(endpoint.id).await {
                    warn!(endpoint = %endpoint.id, error = %e, "authorization refresh failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(endpoint = %endpoint.id, error = %e, "endpoint group lookup failed"),
        }

        info!(endpoint = %endpoint.id, url = %endpoint.url, "environment is up");
        Ok(())
    }

    /// Transition to `next`, reset the retry counter and persist both the
    /// task and the operator-visible milestone
    async fn change_state(&self, task: &mut CloudProvisioningTask, next: ProvisioningState) {
        info!(task = %task.id, from = %task.state, to = %next, "state transition");
        task.state = next;
        task.retries = 0;
        if let Err(e) = self.store.update_task(task).await {
            warn!(task = %task.id, error = %e, "failed to persist state transition");
        }

        // Terminal transitions and finished endpoints manage their own
        // status message.
        if next == ProvisioningState::Done {
            return;
        }
        match self.store.endpoint(task.endpoint_id()).await {
            Ok(mut endpoint) => {
                endpoint.status_message = milestone(next).to_string();
                if let Err(e) = self.store.update_endpoint(&endpoint).await {
                    warn!(endpoint = %endpoint.id, error = %e, "failed to persist milestone");
                }
            }
            Err(e) => {
                warn!(task = %task.id, error = %e, "endpoint lookup failed during transition")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{MockKubeClient, MockKubeClientFactory};
    use crate::coordinator::MockPlatformHooks;
    use crate::provider::MockProviderAdapter;
    use crate::store::InMemoryStore;
    use crate::types::{
        AddonConfig, CloudProvisioningRequest, CredentialId, Endpoint, EndpointGroup, EndpointId,
        GroupId, KaasCluster, Provider, TaskId,
    };
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn credential() -> CloudCredential {
        CloudCredential {
            id: CredentialId(1),
            provider: Provider::Civo,
            name: "test".into(),
            credentials: BTreeMap::new(),
        }
    }

    fn request() -> CloudProvisioningRequest {
        CloudProvisioningRequest {
            provider: Provider::Civo,
            endpoint_id: EndpointId(1),
            credential_id: CredentialId(1),
            name: "cluster".into(),
            region: "lon1".into(),
            node_size: "medium".into(),
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

    fn seeded_store(has_access_policies: bool) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store.insert_endpoint(Endpoint {
            id: EndpointId(1),
            name: "env".into(),
            url: String::new(),
            group_id: GroupId(1),
            status: EndpointStatus::Provisioning,
            status_message: String::new(),
            addons: vec![AddonConfig::new("dns")],
            secure_by_default: false,
        });
        store.insert_group(EndpointGroup {
            id: GroupId(1),
            name: "group".into(),
            has_access_policies,
        });
        store
    }

    fn ready_adapter() -> MockProviderAdapter {
        let mut adapter = MockProviderAdapter::new();
        adapter.expect_get_cluster().returning(|_, id| {
            Ok(KaasCluster {
                id: id.to_string(),
                name: "cluster".into(),
                ready: true,
                kube_config: "apiVersion: v1".into(),
            })
        });
        adapter
    }

    fn factory_with_agent(address: &'static str) -> MockKubeClientFactory {
        let mut factory = MockKubeClientFactory::new();
        factory.expect_client_for().returning(move |_| {
            let mut kube = MockKubeClient::new();
            kube.expect_deploy_agent().returning(|| Ok(()));
            kube.expect_agent_ip_or_hostname()
                .returning(move || Ok(address.to_string()));
            Ok(Arc::new(kube))
        });
        factory
    }

    fn runner(
        store: Arc<InMemoryStore>,
        adapter: MockProviderAdapter,
        factory: MockKubeClientFactory,
        hooks: MockPlatformHooks,
        max_retries: u32,
    ) -> TaskRunner {
        TaskRunner::new(
            store,
            Arc::new(adapter),
            credential(),
            Arc::new(factory),
            Arc::new(hooks),
            Duration::from_millis(1),
            max_retries,
        )
    }

    fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    /// Milestones are the exact operator-visible progress strings.
    #[test]
    fn test_milestone_strings() {
        assert_eq!(milestone(ProvisioningState::Pending), "Request queued");
        assert_eq!(
            milestone(ProvisioningState::WaitingForCluster),
            "Creating KaaS Cluster"
        );
        assert_eq!(
            milestone(ProvisioningState::AgentSetup),
            "Deploying portainer agent"
        );
        assert_eq!(
            milestone(ProvisioningState::WaitingForAgent),
            "Waiting for agent response"
        );
        assert_eq!(
            milestone(ProvisioningState::UpdatingEndpoint),
            "Updating environment"
        );
        assert_eq!(milestone(ProvisioningState::Done), "");
    }

    /// The machine is strictly linear with Done terminal.
    #[test]
    fn test_state_order_is_linear() {
        let mut state = ProvisioningState::Pending;
        let mut seen = vec![state];
        while state != ProvisioningState::Done {
            state = next_state(state);
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                ProvisioningState::Pending,
                ProvisioningState::WaitingForCluster,
                ProvisioningState::AgentSetup,
                ProvisioningState::WaitingForAgent,
                ProvisioningState::UpdatingEndpoint,
                ProvisioningState::Done,
            ]
        );
        assert_eq!(next_state(ProvisioningState::Done), ProvisioningState::Done);
    }

    /// change_state resets the retry counter, persists the task and writes
    /// the new state's milestone onto the endpoint.
    #[tokio::test]
    async fn test_change_state_resets_retries_and_persists_milestone() {
        let store = seeded_store(false);
        let runner = runner(
            store.clone(),
            MockProviderAdapter::new(),
            MockKubeClientFactory::new(),
            MockPlatformHooks::new(),
            5,
        );

        let mut task = CloudProvisioningTask::new(TaskId(1), request(), "c-1".into());
        task.retries = 42;
        store.create_task(&task).await.unwrap();

        runner
            .change_state(&mut task, ProvisioningState::WaitingForCluster)
            .await;

        assert_eq!(task.state, ProvisioningState::WaitingForCluster);
        assert_eq!(task.retries, 0);
        let persisted = store
            .tasks()
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.id == TaskId(1))
            .unwrap();
        assert_eq!(persisted.state, ProvisioningState::WaitingForCluster);
        assert_eq!(persisted.retries, 0);

        let endpoint = store.endpoint(EndpointId(1)).await.unwrap();
        assert_eq!(endpoint.status_message, "Creating KaaS Cluster");
    }

    /// Full happy path: the task walks every state in order and the
    /// endpoint ends up addressable, up and secured.
    #[tokio::test]
    async fn test_happy_path_brings_endpoint_up() {
        let store = seeded_store(false);
        let mut hooks = MockPlatformHooks::new();
        hooks.expect_trigger_snapshot().returning(|_| Ok(()));

        let runner = runner(
            store.clone(),
            ready_adapter(),
            factory_with_agent("203.0.113.5"),
            hooks,
            5,
        );
        let task = CloudProvisioningTask::new(TaskId(1), request(), "c-1".into());
        store.create_task(&task).await.unwrap();

        let (_shutdown_tx, shutdown) = no_shutdown();
        let finished = runner.run(task, shutdown).await;
        assert_eq!(finished.state, ProvisioningState::Done);
        assert!(finished.err.is_none());

        let endpoint = store.endpoint(EndpointId(1)).await.unwrap();
        assert_eq!(endpoint.url, "203.0.113.5:9001");
        assert_eq!(endpoint.status, EndpointStatus::Up);
        assert!(endpoint.secure_by_default);
        assert!(endpoint.status_message.is_empty());
    }

    /// A cluster that never turns ready burns through the retry budget and
    /// the task finishes Done with the last error recorded. The budget is a
    /// retry budget: a budget of 3 allows the initial attempt plus three
    /// retries before giving up.
    #[tokio::test]
    async fn test_retry_budget_exhaustion_records_error() {
        let store = seeded_store(false);
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_mock = attempts.clone();
        let mut adapter = MockProviderAdapter::new();
        adapter.expect_get_cluster().returning(move |_, _| {
            attempts_in_mock.fetch_add(1, Ordering::SeqCst);
            Err(Error::provider("control plane still booting"))
        });

        let runner = runner(
            store.clone(),
            adapter,
            MockKubeClientFactory::new(),
            MockPlatformHooks::new(),
            3,
        );
        let task = CloudProvisioningTask::new(TaskId(1), request(), "c-1".into());
        store.create_task(&task).await.unwrap();

        let (_shutdown_tx, shutdown) = no_shutdown();
        let finished = runner.run(task, shutdown).await;
        assert_eq!(finished.state, ProvisioningState::Done);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        let err = finished.err.expect("error should be recorded");
        assert!(err.contains("after 4 attempts"));
        assert!(err.contains("waiting-for-cluster"));
        assert!(err.contains("control plane still booting"));
    }

    /// An empty agent address is a retryable condition, not success.
    #[tokio::test]
    async fn test_empty_agent_address_retries_until_published() {
        let store = seeded_store(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_mock = calls.clone();

        let mut factory = MockKubeClientFactory::new();
        factory.expect_client_for().returning(move |_| {
            let calls = calls_in_mock.clone();
            let mut kube = MockKubeClient::new();
            kube.expect_deploy_agent().returning(|| Ok(()));
            kube.expect_agent_ip_or_hostname().returning(move || {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(String::new())
                } else {
                    Ok("203.0.113.9".to_string())
                }
            });
            Ok(Arc::new(kube))
        });
        let mut hooks = MockPlatformHooks::new();
        hooks.expect_trigger_snapshot().returning(|_| Ok(()));

        let runner = runner(store.clone(), ready_adapter(), factory, hooks, 10);
        let task = CloudProvisioningTask::new(TaskId(1), request(), "c-1".into());
        store.create_task(&task).await.unwrap();

        let (_shutdown_tx, shutdown) = no_shutdown();
        let finished = runner.run(task, shutdown).await;
        assert!(finished.err.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let endpoint = store.endpoint(EndpointId(1)).await.unwrap();
        assert_eq!(endpoint.url, "203.0.113.9:9001");
    }

    /// Groups carrying access policies get their user authorizations
    /// recomputed after provisioning.
    #[tokio::test]
    async fn test_access_policy_group_triggers_authorization_refresh() {
        let store = seeded_store(true);
        let mut hooks = MockPlatformHooks::new();
        hooks.expect_trigger_snapshot().returning(|_| Ok(()));
        hooks
            .expect_update_user_authorizations()
            .withf(|id| *id == EndpointId(1))
            .times(1)
            .returning(|_| Ok(()));

        let runner = runner(
            store.clone(),
            ready_adapter(),
            factory_with_agent("203.0.113.5"),
            hooks,
            5,
        );
        let task = CloudProvisioningTask::new(TaskId(1), request(), "c-1".into());
        store.create_task(&task).await.unwrap();

        let (_shutdown_tx, shutdown) = no_shutdown();
        let finished = runner.run(task, shutdown).await;
        assert!(finished.err.is_none());
    }

    /// A task launched with a fatal provisioning error goes straight to
    /// Done without touching the provider again.
    #[tokio::test]
    async fn test_fatal_launch_error_short_circuits() {
        let store = seeded_store(false);
        let runner = runner(
            store.clone(),
            MockProviderAdapter::new(), // no expectations: must not be called
            MockKubeClientFactory::new(),
            MockPlatformHooks::new(),
            5,
        );
        let mut task = CloudProvisioningTask::new(TaskId(1), request(), String::new());
        task.err = Some("quota exceeded".into());
        store.create_task(&task).await.unwrap();

        let (_shutdown_tx, shutdown) = no_shutdown();
        let finished = runner.run(task, shutdown).await;
        assert_eq!(finished.state, ProvisioningState::Done);
        assert_eq!(finished.err.as_deref(), Some("quota exceeded"));
    }
}
