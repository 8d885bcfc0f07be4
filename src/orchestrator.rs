//! Orchestrator client facade
//!
//! The gateway talks to the cluster orchestrator only through the
//! [`Orchestrator`] trait. The production implementation is
//! [`crate::docker::SwarmOrchestrator`]; [`memory::InMemoryOrchestrator`]
//! keeps services in process for local development and tests.
//!
//! Every call is a bounded network operation. Implementations report their
//! own timeouts as [`OrchestratorError::Timeout`] and never retry.

pub mod memory;

use crate::credential::RegistryCredential;
use crate::function::FunctionDescriptor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A function-backing service as reported by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfo {
    pub name: String,
    pub image: String,
    pub env_vars: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    /// Running replicas
    pub replicas: u64,
    /// Replicas requested in the service spec
    pub desired_replicas: u64,
    /// Base URL the gateway proxies invocations to, e.g. `http://echo:8080`
    pub backend_address: String,
}

impl ServiceInfo {
    /// Convert to a descriptor carrying the live replica count
    pub fn to_descriptor(&self) -> FunctionDescriptor {
        FunctionDescriptor {
            name: self.name.clone(),
            image: self.image.clone(),
            env_vars: self.env_vars.clone(),
            labels: self.labels.clone(),
            replicas: Some(self.replicas),
        }
    }

    /// Whether the service carries the marker label that makes it a function
    pub fn is_function(&self, function_label: &str) -> bool {
        self.labels.contains_key(function_label)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("service '{0}' not found")]
    NotFound(String),

    #[error("service '{0}' already exists")]
    Conflict(String),

    #[error("orchestrator call '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("orchestrator error: {0}")]
    Api(String),
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Check that the orchestrator is reachable, returning its version string
    async fn ping(&self) -> Result<String, OrchestratorError>;

    /// List every service carrying `label`, from a single API call
    async fn list_services(&self, label: &str) -> Result<Vec<ServiceInfo>, OrchestratorError>;

    /// Look up a single service by exact name
    async fn get_service(&self, name: &str) -> Result<Option<ServiceInfo>, OrchestratorError>;

    /// Create a service. Fails with [`OrchestratorError::Conflict`] if the name is taken.
    async fn create_service(
        &self,
        descriptor: &FunctionDescriptor,
        credential: &RegistryCredential,
    ) -> Result<(), OrchestratorError>;

    /// Replace image, env vars and labels of an existing service
    async fn update_service(
        &self,
        descriptor: &FunctionDescriptor,
        credential: &RegistryCredential,
    ) -> Result<(), OrchestratorError>;

    /// Set the desired replica count of an existing service
    async fn scale_service(&self, name: &str, replicas: u64) -> Result<(), OrchestratorError>;

    /// Request removal of a service. Teardown may complete asynchronously.
    async fn remove_service(&self, name: &str) -> Result<(), OrchestratorError>;
}

pub type SharedOrchestrator = Arc<dyn Orchestrator>;
