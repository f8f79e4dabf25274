//! KaaS - Kubernetes-as-a-Service provisioning and lifecycle orchestrator
//!
//! KaaS drives a cloud provisioning request to a running, agent-connected
//! Kubernetes cluster, and orchestrates the full lifecycle of self-hosted
//! MicroK8s clusters over SSH against operator-supplied Linux hosts.
//!
//! # Architecture
//!
//! Two layers cooperate:
//! - A provider-agnostic **provisioning coordinator** runs a per-task state
//!   machine (Pending -> WaitingForCluster -> AgentSetup -> WaitingForAgent ->
//!   UpdatingEndpoint -> Done) that survives process restarts and bounds
//!   retries per state.
//! - A **MicroK8s orchestrator** builds, scales, upgrades and tears down a
//!   cluster entirely over SSH, with no managed control plane.
//!
//! # Modules
//!
//! - [`types`] - Core data model (requests, tasks, states, clusters, credentials)
//! - [`store`] - Durable store abstraction for tasks, endpoints and credentials
//! - [`coordinator`] - Request/result queue and per-task state machine
//! - [`provider`] - Provider adapter trait and registry
//! - [`agent`] - Kubernetes client seam for agent deployment and node discovery
//! - [`microk8s`] - Node-level MicroK8s operations over SSH
//! - [`ssh`] - One-session-per-command SSH executor and reachability tester
//! - [`cache`] - Per-provider metadata cache backing provisioning forms
//! - [`error`] - Error types for the orchestrator

#![deny(missing_docs)]

pub mod agent;
pub mod cache;
pub mod coordinator;
pub mod error;
pub mod microk8s;
pub mod provider;
pub mod ssh;
pub mod store;
pub mod types;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Port the platform agent listens on inside a provisioned cluster
///
/// Once the agent reports an address, the endpoint URL becomes
/// `<address>:9001`.
pub const DEFAULT_AGENT_PORT: u16 = 9001;

/// Capacity of the provisioning request and result queues
///
/// A full request queue blocks the submitter (backpressure); there is no
/// cancellation of an already-queued request.
pub const PROVISIONING_QUEUE_CAPACITY: usize = 10;

/// Delay between state machine iterations for an in-flight task
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

/// Maximum retries within a single provisioning state before the task is
/// finalized with the last observed error
pub const MAX_STATE_RETRIES: u32 = 480;

/// Age after which a restored task is purged instead of relaunched
pub const STALE_TASK_AGE_DAYS: i64 = 7;
