//! In-process orchestrator keeping services in a map
//!
//! Replicas converge instantly to the desired count. Failure injection and a
//! call counter make it suitable for exercising the watcher, lifecycle and
//! dispatch paths without a Docker daemon.

use super::{Orchestrator, OrchestratorError, ServiceInfo};
use crate::credential::RegistryCredential;
use crate::function::FunctionDescriptor;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub struct InMemoryOrchestrator {
    services: Mutex<BTreeMap<String, ServiceInfo>>,
    credentials: Mutex<BTreeMap<String, RegistryCredential>>,
    default_backend: String,
    failing: AtomicBool,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl InMemoryOrchestrator {
    /// Create an empty orchestrator. New services get `default_backend` as their address.
    pub fn new(default_backend: impl Into<String>) -> Self {
        Self {
            services: Mutex::new(BTreeMap::new()),
            credentials: Mutex::new(BTreeMap::new()),
            default_backend: default_backend.into(),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            delay: Mutex::new(None),
        }
    }

    /// Insert a service directly, bypassing conflict checks and the call counter
    pub fn insert(&self, service: ServiceInfo) {
        self.services.lock().insert(service.name.clone(), service);
    }

    /// Make every subsequent call fail with an API error until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every subsequent call
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Override the running replica count without touching the desired count
    pub fn set_running(&self, name: &str, replicas: u64) {
        if let Some(service) = self.services.lock().get_mut(name) {
            service.replicas = replicas;
        }
    }

    pub fn set_backend(&self, name: &str, address: impl Into<String>) {
        if let Some(service) = self.services.lock().get_mut(name) {
            service.backend_address = address.into();
        }
    }

    /// Number of facade calls made so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn service(&self, name: &str) -> Option<ServiceInfo> {
        self.services.lock().get(name).cloned()
    }

    pub fn service_count(&self) -> usize {
        self.services.lock().len()
    }

    /// Credential attached to a service at creation, if any
    pub fn credential_for(&self, name: &str) -> Option<RegistryCredential> {
        self.credentials.lock().get(name).cloned()
    }

    async fn enter(&self) -> Result<(), OrchestratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Api("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for InMemoryOrchestrator {
    async fn ping(&self) -> Result<String, OrchestratorError> {
        self.enter().await?;
        Ok("in-memory".to_string())
    }

    async fn list_services(&self, label: &str) -> Result<Vec<ServiceInfo>, OrchestratorError> {
        self.enter().await?;
        Ok(self
            .services
            .lock()
            .values()
            .filter(|s| s.is_function(label))
            .cloned()
            .collect())
    }

    async fn get_service(&self, name: &str) -> Result<Option<ServiceInfo>, OrchestratorError> {
        self.enter().await?;
        Ok(self.services.lock().get(name).cloned())
    }

    async fn create_service(
        &self,
        descriptor: &FunctionDescriptor,
        credential: &RegistryCredential,
    ) -> Result<(), OrchestratorError> {
        self.enter().await?;

        let mut services = self.services.lock();
        if services.contains_key(&descriptor.name) {
            return Err(OrchestratorError::Conflict(descriptor.name.clone()));
        }

        let replicas = descriptor.replicas.unwrap_or(1);
        services.insert(
            descriptor.name.clone(),
            ServiceInfo {
                name: descriptor.name.clone(),
                image: descriptor.image.clone(),
                env_vars: descriptor.env_vars.clone(),
                labels: descriptor.labels.clone(),
                replicas,
                desired_replicas: replicas,
                backend_address: self.default_backend.clone(),
            },
        );
        if !credential.is_empty() {
            self.credentials
                .lock()
                .insert(descriptor.name.clone(), credential.clone());
        }
        Ok(())
    }

    async fn update_service(
        &self,
        descriptor: &FunctionDescriptor,
        _credential: &RegistryCredential,
    ) -> Result<(), OrchestratorError> {
        self.enter().await?;

        let mut services = self.services.lock();
        let service = services
            .get_mut(&descriptor.name)
            .ok_or_else(|| OrchestratorError::NotFound(descriptor.name.clone()))?;
        service.image = descriptor.image.clone();
        service.env_vars = descriptor.env_vars.clone();
        service.labels = descriptor.labels.clone();
        if let Some(replicas) = descriptor.replicas {
            service.replicas = replicas;
            service.desired_replicas = replicas;
        }
        Ok(())
    }

    async fn scale_service(&self, name: &str, replicas: u64) -> Result<(), OrchestratorError> {
        self.enter().await?;

        let mut services = self.services.lock();
        let service = services
            .get_mut(name)
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))?;
        service.replicas = replicas;
        service.desired_replicas = replicas;
        Ok(())
    }

    async fn remove_service(&self, name: &str) -> Result<(), OrchestratorError> {
        self.enter().await?;

        self.credentials.lock().remove(name);
        match self.services.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(OrchestratorError::NotFound(name.to_string())),
        }
    }
}
