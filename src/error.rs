//! Error types for the KaaS orchestrator

use thiserror::Error;

/// Main error type for KaaS operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Kubeconfig parsing or client construction error
    #[error("kubeconfig error: {0}")]
    KubeConfig(String),

    /// SSH transport or remote command error
    #[error("ssh error: {0}")]
    Ssh(String),

    /// Infrastructure provider error
    #[error("provider error: {0}")]
    Provider(String),

    /// Validation error for requests and credentials
    #[error("validation error: {0}")]
    Validation(String),

    /// A record was not found in the durable store
    #[error("not found: {0}")]
    NotFound(String),

    /// Durable store error
    #[error("store error: {0}")]
    Store(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a kubeconfig error with the given message
    pub fn kubeconfig(msg: impl Into<String>) -> Self {
        Self::KubeConfig(msg.into())
    }

    /// Create an SSH error with the given message
    pub fn ssh(msg: impl Into<String>) -> Self {
        Self::Ssh(msg.into())
    }

    /// Create a provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a store error with the given message
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether this error is the store's distinguished "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
