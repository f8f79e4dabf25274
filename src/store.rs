//! Durable store abstraction
//!
//! The orchestrator treats persistence as an opaque keyed store with a
//! distinguished "not found" error. The [`Datastore`] trait is the seam the
//! coordinator and MicroK8s orchestrator talk to; [`InMemoryStore`] is the
//! bundled implementation used by tests and single-process deployments.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

#[cfg(test)]
use mockall::automock;

use crate::types::{
    CloudCredential, CloudProvisioningTask, CredentialId, Endpoint, EndpointGroup, EndpointId,
    GroupId, TaskId,
};
use crate::{Error, Result};

/// Keyed CRUD over tasks, endpoints, credentials and groups
///
/// Lookups for missing records return [`Error::NotFound`]; callers that
/// treat absence as meaningful (task restore, purge) check
/// [`Error::is_not_found`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Allocate the next task identifier
    async fn next_task_id(&self) -> Result<TaskId>;

    /// Persist a new task record
    async fn create_task(&self, task: &CloudProvisioningTask) -> Result<()>;

    /// Overwrite an existing task record
    async fn update_task(&self, task: &CloudProvisioningTask) -> Result<()>;

    /// List all persisted tasks
    async fn tasks(&self) -> Result<Vec<CloudProvisioningTask>>;

    /// Delete a task record
    async fn delete_task(&self, id: TaskId) -> Result<()>;

    /// Fetch an endpoint record
    async fn endpoint(&self, id: EndpointId) -> Result<Endpoint>;

    /// Overwrite an endpoint record
    async fn update_endpoint(&self, endpoint: &Endpoint) -> Result<()>;

    /// Fetch an endpoint group
    async fn endpoint_group(&self, id: GroupId) -> Result<EndpointGroup>;

    /// Fetch a cloud credential
    async fn cloud_credential(&self, id: CredentialId) -> Result<CloudCredential>;

    /// List all stored cloud credentials
    async fn cloud_credentials(&self) -> Result<Vec<CloudCredential>>;
}

/// Thread-safe in-memory implementation of [`Datastore`]
#[derive(Default)]
pub struct InMemoryStore {
    next_task_id: AtomicI64,
    tasks: DashMap<TaskId, CloudProvisioningTask>,
    endpoints: DashMap<EndpointId, Endpoint>,
    groups: DashMap<GroupId, EndpointGroup>,
    credentials: DashMap<CredentialId, CloudCredential>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an endpoint record
    pub fn insert_endpoint(&self, endpoint: Endpoint) {
        self.endpoints.insert(endpoint.id, endpoint);
    }

    /// Remove an endpoint record
    pub fn remove_endpoint(&self, id: EndpointId) {
        self.endpoints.remove(&id);
    }

    /// Insert or replace an endpoint group
    pub fn insert_group(&self, group: EndpointGroup) {
        self.groups.insert(group.id, group);
    }

    /// Insert or replace a credential
    pub fn insert_credential(&self, credential: CloudCredential) {
        self.credentials.insert(credential.id, credential);
    }

    /// Number of persisted tasks
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

#[async_trait]
impl Datastore for InMemoryStore {
    async fn next_task_id(&self) -> Result<TaskId> {
        Ok(TaskId(self.next_task_id.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn create_task(&self, task: &CloudProvisioningTask) -> Result<()> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &CloudProvisioningTask) -> Result<()> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn tasks(&self) -> Result<Vec<CloudProvisioningTask>> {
        Ok(self.tasks.iter().map(|e| e.value().clone()).collect())
    }

    async fn delete_task(&self, id: TaskId) -> Result<()> {
        match self.tasks.remove(&id) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(format!("task {}", id))),
        }
    }

    async fn endpoint(&self, id: EndpointId) -> Result<Endpoint> {
        self.endpoints
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::not_found(format!("endpoint {}", id)))
    }

    async fn update_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        if !self.endpoints.contains_key(&endpoint.id) {
            return Err(Error::not_found(format!("endpoint {}", endpoint.id)));
        }
        self.endpoints.insert(endpoint.id, endpoint.clone());
        Ok(())
    }

    async fn endpoint_group(&self, id: GroupId) -> Result<EndpointGroup> {
        self.groups
            .get(&id)
            .map(|g| g.value().clone())
            .ok_or_else(|| Error::not_found(format!("endpoint group {}", id.0)))
    }

    async fn cloud_credential(&self, id: CredentialId) -> Result<CloudCredential> {
        self.credentials
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or_else(|| Error::not_found(format!("cloud credential {}", id)))
    }

    async fn cloud_credentials(&self) -> Result<Vec<CloudCredential>> {
        Ok(self.credentials.iter().map(|c| c.value().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CloudProvisioningRequest, EndpointStatus, Provider};

    fn request(endpoint_id: EndpointId) -> CloudProvisioningRequest {
        CloudProvisioningRequest {
            provider: Provider::Microk8s,
            endpoint_id,
            credential_id: CredentialId(1),
            name: "m8s".into(),
            region: String::new(),
            node_size: String::new(),
            node_count: 0,
            kubernetes_version: "1.30/stable".into(),
            ami_type: None,
            instance_type: None,
            resource_group: None,
            master_nodes: vec!["10.0.0.1".into()],
            worker_nodes: Vec::new(),
            addons: Vec::new(),
        }
    }

    fn endpoint(id: EndpointId) -> Endpoint {
        Endpoint {
            id,
            name: "env".into(),
            url: String::new(),
            group_id: GroupId(1),
            status: EndpointStatus::Provisioning,
            status_message: String::new(),
            addons: Vec::new(),
            secure_by_default: false,
        }
    }

    #[tokio::test]
    async fn test_task_ids_are_monotonic() {
        let store = InMemoryStore::new();
        let a = store.next_task_id().await.unwrap();
        let b = store.next_task_id().await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_task_crud_round_trip() {
        let store = InMemoryStore::new();
        let id = store.next_task_id().await.unwrap();
        let task = CloudProvisioningTask::new(id, request(EndpointId(1)), String::new());

        store.create_task(&task).await.unwrap();
        assert_eq!(store.tasks().await.unwrap().len(), 1);

        store.delete_task(id).await.unwrap();
        assert!(store.tasks().await.unwrap().is_empty());

        let err = store.delete_task(id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.endpoint(EndpointId(99)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_endpoint_update_requires_existing_record() {
        let store = InMemoryStore::new();
        let ep = endpoint(EndpointId(5));

        let err = store.update_endpoint(&ep).await.unwrap_err();
        assert!(err.is_not_found());

        store.insert_endpoint(ep.clone());
        let mut updated = ep;
        updated.url = "10.0.0.1:9001".into();
        store.update_endpoint(&updated).await.unwrap();
        assert_eq!(
            store.endpoint(EndpointId(5)).await.unwrap().url,
            "10.0.0.1:9001"
        );
    }
}
