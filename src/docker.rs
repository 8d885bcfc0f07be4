//! Docker Swarm implementation of the orchestrator facade
//!
//! Each function is a replicated swarm service named after the function.
//! The gateway reaches replicas through the service's DNS name on the
//! shared overlay network, so the backend address is `http://{name}:{port}`.

use crate::config::OrchestratorConfig;
use crate::credential::RegistryCredential;
use crate::function::FunctionDescriptor;
use crate::orchestrator::{Orchestrator, OrchestratorError, ServiceInfo};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::models::{
    NetworkAttachmentConfig, Service, ServiceSpec, ServiceSpecMode, ServiceSpecModeReplicated,
    TaskSpec, TaskSpecContainerSpec,
};
use bollard::service::{InspectServiceOptions, ListServicesOptions, UpdateServiceOptions};
use bollard::Docker;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Orchestrator facade backed by the Docker Engine swarm API
pub struct SwarmOrchestrator {
    client: Docker,
    timeout: Duration,
    function_port: u16,
    network: Option<String>,
}

impl SwarmOrchestrator {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. `docker_host` from the configuration
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    ///
    /// Connecting does not contact the daemon; call [`Orchestrator::ping`] to verify.
    pub fn connect(config: &OrchestratorConfig) -> anyhow::Result<Self> {
        let timeout_secs = config.timeout_secs;
        let client = if let Some(ref host) = config.docker_host {
            Self::connect_to_host(host, timeout_secs).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host, timeout_secs).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}",
                    host, e
                )
            })?
        } else {
            Self::connect_with_defaults(timeout_secs)?
        };

        Ok(Self {
            client,
            timeout: config.timeout(),
            function_port: config.function_port,
            network: config.network.clone(),
        })
    }

    fn connect_to_host(host: &str, timeout_secs: u64) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, timeout_secs, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, timeout_secs, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    fn connect_with_defaults(timeout_secs: u64) -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();

        let socket_paths = [
            "/var/run/docker.sock".to_string(),
            format!("{}/.docker/run/docker.sock", home),
            format!("{}/.colima/default/docker.sock", home),
        ];

        for path in &socket_paths {
            if path.starts_with('/') && !path.starts_with("//") && std::path::Path::new(path).exists() {
                debug!(path, "Found Docker socket");
                return Docker::connect_with_socket(path, timeout_secs, bollard::API_DEFAULT_VERSION)
                    .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", path, e));
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon: {}. \
                 Set DOCKER_HOST or docker_host in the [orchestrator] configuration.",
                e
            )
        })
    }

    /// Run a Docker API call under the facade timeout
    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T, OrchestratorError>
    where
        F: Future<Output = Result<T, bollard::errors::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| OrchestratorError::Api(format!("{}: {}", operation, e))),
            Err(_) => Err(OrchestratorError::Timeout {
                operation,
                timeout: self.timeout,
            }),
        }
    }

    fn backend_address(&self, name: &str) -> String {
        format!("http://{}:{}", name, self.function_port)
    }

    fn to_service_info(&self, service: Service) -> Option<ServiceInfo> {
        let spec = service.spec?;
        let name = spec.name?;

        let container = spec.task_template.and_then(|t| t.container_spec);
        let image = container
            .as_ref()
            .and_then(|c| c.image.clone())
            .map(|image| strip_digest(&image).to_string())
            .unwrap_or_default();
        let env_vars = container
            .and_then(|c| c.env)
            .map(|env| parse_env(&env))
            .unwrap_or_default();

        let desired_replicas = spec
            .mode
            .and_then(|m| m.replicated)
            .and_then(|r| r.replicas)
            .map(|r| r.max(0) as u64)
            .unwrap_or(0);
        let replicas = service
            .service_status
            .and_then(|s| s.running_tasks)
            .unwrap_or(desired_replicas);

        Some(ServiceInfo {
            backend_address: self.backend_address(&name),
            name,
            image,
            env_vars,
            labels: spec.labels.unwrap_or_default(),
            replicas,
            desired_replicas,
        })
    }

    fn build_spec(&self, descriptor: &FunctionDescriptor, replicas: Option<u64>) -> ServiceSpec {
        let networks = self.network.as_ref().map(|network| {
            vec![NetworkAttachmentConfig {
                target: Some(network.clone()),
                ..Default::default()
            }]
        });

        ServiceSpec {
            name: Some(descriptor.name.clone()),
            labels: Some(descriptor.labels.clone()),
            task_template: Some(TaskSpec {
                container_spec: Some(TaskSpecContainerSpec {
                    image: Some(descriptor.image.clone()),
                    env: Some(descriptor.env_list()),
                    labels: Some(descriptor.labels.clone()),
                    ..Default::default()
                }),
                networks,
                ..Default::default()
            }),
            mode: replicas.map(|replicas| ServiceSpecMode {
                replicated: Some(ServiceSpecModeReplicated {
                    replicas: Some(replicas as i64),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Inspect a service, returning its spec and current version index
    async fn inspect(&self, name: &str) -> Result<(ServiceSpec, u64), OrchestratorError> {
        let options = InspectServiceOptions {
            insert_defaults: false,
        };
        let service = match tokio::time::timeout(
            self.timeout,
            self.client.inspect_service(name, Some(options)),
        )
        .await
        {
            Ok(Ok(service)) => service,
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            })) => return Err(OrchestratorError::NotFound(name.to_string())),
            Ok(Err(e)) => return Err(OrchestratorError::Api(format!("inspect_service: {}", e))),
            Err(_) => {
                return Err(OrchestratorError::Timeout {
                    operation: "inspect_service",
                    timeout: self.timeout,
                })
            }
        };

        let version = service
            .version
            .and_then(|v| v.index)
            .ok_or_else(|| OrchestratorError::Api(format!("service '{}' has no version", name)))?;
        let spec = service
            .spec
            .ok_or_else(|| OrchestratorError::Api(format!("service '{}' has no spec", name)))?;
        Ok((spec, version))
    }

    async fn apply_update(
        &self,
        name: &str,
        spec: ServiceSpec,
        version: u64,
        credentials: Option<DockerCredentials>,
    ) -> Result<(), OrchestratorError> {
        let options = UpdateServiceOptions {
            version,
            ..Default::default()
        };
        match tokio::time::timeout(
            self.timeout,
            self.client.update_service(name, spec, options, credentials),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            })) => Err(OrchestratorError::NotFound(name.to_string())),
            Ok(Err(e)) => Err(OrchestratorError::Api(format!("update_service: {}", e))),
            Err(_) => Err(OrchestratorError::Timeout {
                operation: "update_service",
                timeout: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl Orchestrator for SwarmOrchestrator {
    async fn ping(&self) -> Result<String, OrchestratorError> {
        let version = self.call("version", self.client.version()).await?;
        let api_version = version.api_version.unwrap_or_default();
        let engine_version = version.version.unwrap_or_default();
        info!(api_version, engine_version, "Connected to Docker daemon");
        Ok(format!("{} (API {})", engine_version, api_version))
    }

    async fn list_services(&self, label: &str) -> Result<Vec<ServiceInfo>, OrchestratorError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);
        let options = ListServicesOptions {
            filters,
            status: true,
        };

        let services = self
            .call("list_services", self.client.list_services(Some(options)))
            .await?;
        Ok(services
            .into_iter()
            .filter_map(|s| self.to_service_info(s))
            .collect())
    }

    async fn get_service(&self, name: &str) -> Result<Option<ServiceInfo>, OrchestratorError> {
        // The name filter matches prefixes, so an exact comparison is still needed
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let options = ListServicesOptions {
            filters,
            status: true,
        };

        let services = self
            .call("list_services", self.client.list_services(Some(options)))
            .await?;
        Ok(services
            .into_iter()
            .filter_map(|s| self.to_service_info(s))
            .find(|s| s.name == name))
    }

    async fn create_service(
        &self,
        descriptor: &FunctionDescriptor,
        credential: &RegistryCredential,
    ) -> Result<(), OrchestratorError> {
        let spec = self.build_spec(descriptor, descriptor.replicas);
        let credentials = docker_credentials(credential)?;

        match tokio::time::timeout(self.timeout, self.client.create_service(spec, credentials)).await {
            Ok(Ok(response)) => {
                info!(
                    function = %descriptor.name,
                    service_id = response.id.as_deref().unwrap_or(""),
                    image = %descriptor.image,
                    "Created swarm service"
                );
                Ok(())
            }
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            })) => Err(OrchestratorError::Conflict(descriptor.name.clone())),
            Ok(Err(e)) => Err(OrchestratorError::Api(format!("create_service: {}", e))),
            Err(_) => Err(OrchestratorError::Timeout {
                operation: "create_service",
                timeout: self.timeout,
            }),
        }
    }

    async fn update_service(
        &self,
        descriptor: &FunctionDescriptor,
        credential: &RegistryCredential,
    ) -> Result<(), OrchestratorError> {
        let (current, version) = self.inspect(&descriptor.name).await?;
        let credentials = docker_credentials(credential)?;

        // Keep the current replica count unless the caller asks for a new one
        let replicas = descriptor.replicas.or_else(|| {
            current
                .mode
                .as_ref()
                .and_then(|m| m.replicated.as_ref())
                .and_then(|r| r.replicas)
                .map(|r| r.max(0) as u64)
        });
        let spec = self.build_spec(descriptor, replicas);

        self.apply_update(&descriptor.name, spec, version, credentials)
            .await?;
        info!(function = %descriptor.name, image = %descriptor.image, "Updated swarm service");
        Ok(())
    }

    async fn scale_service(&self, name: &str, replicas: u64) -> Result<(), OrchestratorError> {
        let (mut spec, version) = self.inspect(name).await?;
        spec.mode = Some(ServiceSpecMode {
            replicated: Some(ServiceSpecModeReplicated {
                replicas: Some(replicas as i64),
            }),
            ..Default::default()
        });

        self.apply_update(name, spec, version, None).await?;
        info!(function = name, replicas, "Scaled swarm service");
        Ok(())
    }

    async fn remove_service(&self, name: &str) -> Result<(), OrchestratorError> {
        match tokio::time::timeout(self.timeout, self.client.delete_service(name)).await {
            Ok(Ok(())) => {
                info!(function = name, "Removed swarm service");
                Ok(())
            }
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            })) => Err(OrchestratorError::NotFound(name.to_string())),
            Ok(Err(e)) => Err(OrchestratorError::Api(format!("delete_service: {}", e))),
            Err(_) => Err(OrchestratorError::Timeout {
                operation: "delete_service",
                timeout: self.timeout,
            }),
        }
    }
}

fn docker_credentials(
    credential: &RegistryCredential,
) -> Result<Option<DockerCredentials>, OrchestratorError> {
    let auth = credential
        .decode()
        .map_err(|e| OrchestratorError::Api(format!("invalid registry credential: {}", e)))?;

    Ok(auth.map(|auth| DockerCredentials {
        username: Some(auth.username),
        password: Some(auth.password),
        serveraddress: Some(auth.serveraddress),
        ..Default::default()
    }))
}

/// Swarm pins images by digest (`image:tag@sha256:...`); report the reference as deployed
fn strip_digest(image: &str) -> &str {
    image.split('@').next().unwrap_or(image)
}

fn parse_env(env: &[String]) -> HashMap<String, String> {
    env.iter()
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
