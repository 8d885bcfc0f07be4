//! Function lifecycle management: list, deploy, update, remove and alert scaling
//!
//! Every operation makes at most one mutating orchestrator call and is never
//! retried; a retried deploy or delete could leave duplicate or inconsistent
//! services behind. Failures come back as [`GatewayError`] variants so the
//! HTTP layer can map each to its own status.

use crate::config::ScalingConfig;
use crate::credential::RegistryCredential;
use crate::error::GatewayError;
use crate::function::{validate_name, FunctionDescriptor};
use crate::orchestrator::{ServiceInfo, SharedOrchestrator};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Alertmanager webhook payload
#[derive(Debug, Clone, Deserialize)]
pub struct AlertPayload {
    #[serde(default)]
    pub status: String,
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Alert {
    pub status: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Label naming the function an alert refers to
pub const ALERT_FUNCTION_LABEL: &str = "function_name";

/// Result of applying one alert
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleOutcome {
    pub function_name: String,
    pub previous_replicas: u64,
    pub replicas: u64,
}

pub struct FunctionManager {
    orchestrator: SharedOrchestrator,
    function_label: String,
    scaling: ScalingConfig,
}

impl FunctionManager {
    pub fn new(
        orchestrator: SharedOrchestrator,
        function_label: impl Into<String>,
        scaling: ScalingConfig,
    ) -> Self {
        Self {
            orchestrator,
            function_label: function_label.into(),
            scaling,
        }
    }

    /// List deployed functions with live replica counts, sorted by name.
    /// The result comes from a single orchestrator call.
    pub async fn list(&self) -> Result<Vec<FunctionDescriptor>, GatewayError> {
        let services = self
            .orchestrator
            .list_services(&self.function_label)
            .await?;

        let mut functions: Vec<FunctionDescriptor> =
            services.iter().map(|s| s.to_descriptor()).collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(functions)
    }

    /// Deploy a new function. Fails with `ServiceConflict` if the name is taken.
    pub async fn create(
        &self,
        mut descriptor: FunctionDescriptor,
        credential: &RegistryCredential,
    ) -> Result<(), GatewayError> {
        validate_name(&descriptor.name).map_err(GatewayError::BadRequest)?;
        if descriptor.image.trim().is_empty() {
            return Err(GatewayError::BadRequest("image is required".to_string()));
        }
        descriptor.mark(&self.function_label);

        self.orchestrator
            .create_service(&descriptor, credential)
            .await?;

        info!(
            function = %descriptor.name,
            image = %descriptor.image,
            private_registry = !credential.is_empty(),
            "Function deployed"
        );
        Ok(())
    }

    /// Replace the image, env vars and labels of an existing function
    pub async fn update(
        &self,
        mut descriptor: FunctionDescriptor,
        credential: &RegistryCredential,
    ) -> Result<(), GatewayError> {
        validate_name(&descriptor.name).map_err(GatewayError::BadRequest)?;
        if descriptor.image.trim().is_empty() {
            return Err(GatewayError::BadRequest("image is required".to_string()));
        }
        self.require_function(&descriptor.name).await?;
        descriptor.mark(&self.function_label);

        self.orchestrator
            .update_service(&descriptor, credential)
            .await?;

        info!(function = %descriptor.name, image = %descriptor.image, "Function updated");
        Ok(())
    }

    /// Remove a function. Returns once the orchestrator accepts the removal.
    pub async fn delete(&self, name: &str) -> Result<(), GatewayError> {
        validate_name(name).map_err(GatewayError::BadRequest)?;
        self.require_function(name).await?;

        self.orchestrator.remove_service(name).await?;
        info!(function = name, "Function removed");
        Ok(())
    }

    /// Scale functions named by Alertmanager alerts.
    ///
    /// Firing alerts add `scale_step` replicas up to `max_replicas`; resolved
    /// alerts restore `min_replicas`. Per-alert failures are logged and skipped.
    pub async fn scale_from_alerts(&self, payload: &AlertPayload) -> Vec<ScaleOutcome> {
        let mut outcomes = Vec::new();

        for alert in &payload.alerts {
            let Some(name) = alert.labels.get(ALERT_FUNCTION_LABEL) else {
                warn!(status = %alert.status, "Alert without function_name label ignored");
                continue;
            };
            if validate_name(name).is_err() {
                warn!(function = %name.escape_default(), "Alert names an invalid function");
                continue;
            }

            let service = match self.orchestrator.get_service(name).await {
                Ok(Some(service)) if service.is_function(&self.function_label) => service,
                Ok(_) => {
                    warn!(function = %name, "Alert names an unknown function");
                    continue;
                }
                Err(e) => {
                    warn!(function = %name, error = %e, "Failed to look up function for alert");
                    continue;
                }
            };

            let current = service.desired_replicas;
            let target = self.target_replicas(&alert.status, current);
            if target == current {
                continue;
            }

            match self.orchestrator.scale_service(name, target).await {
                Ok(()) => {
                    info!(
                        function = %name,
                        alert_status = %alert.status,
                        from = current,
                        to = target,
                        "Scaled function from alert"
                    );
                    outcomes.push(ScaleOutcome {
                        function_name: name.clone(),
                        previous_replicas: current,
                        replicas: target,
                    });
                }
                Err(e) => warn!(function = %name, error = %e, "Failed to scale function"),
            }
        }

        outcomes
    }

    /// Look up a service and fail with `FunctionNotFound` unless it is a function
    async fn require_function(&self, name: &str) -> Result<ServiceInfo, GatewayError> {
        match self.orchestrator.get_service(name).await? {
            Some(service) if service.is_function(&self.function_label) => Ok(service),
            _ => Err(GatewayError::FunctionNotFound(name.to_string())),
        }
    }

    fn target_replicas(&self, status: &str, current: u64) -> u64 {
        if status == "firing" {
            current
                .saturating_add(self.scaling.scale_step)
                .min(self.scaling.max_replicas)
        } else {
            self.scaling.min_replicas
        }
    }
}
