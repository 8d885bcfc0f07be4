//! Function descriptors and the naming rules shared by every component
//!
//! A function's `name` is its only identity. Names are case-sensitive and
//! restricted to ASCII letters, digits, `-` and `_`, so the router, the
//! lifecycle manager and the replica watcher all agree on what a given
//! string refers to.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum function name length (Docker service names are limited to 63 characters)
pub const MAX_NAME_LEN: usize = 63;

/// Value stored under the marker label on every function service
pub const MARKER_VALUE: &str = "true";

/// A deployable function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDescriptor {
    /// Unique function name
    #[serde(alias = "service")]
    pub name: String,

    /// Container image reference
    #[serde(default)]
    pub image: String,

    /// Environment variables for the function container
    #[serde(default)]
    pub env_vars: HashMap<String, String>,

    /// Service labels (the marker label is added on deploy)
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Replica count: desired on deploy, live when listed
    #[serde(default, alias = "replicaCount", skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u64>,
}

impl FunctionDescriptor {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            env_vars: HashMap::new(),
            labels: HashMap::new(),
            replicas: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_replicas(mut self, replicas: u64) -> Self {
        self.replicas = Some(replicas);
        self
    }

    /// Ensure the marker label identifying this service as a function is present
    pub fn mark(&mut self, function_label: &str) {
        self.labels
            .insert(function_label.to_string(), MARKER_VALUE.to_string());
    }

    /// Environment variables in `KEY=value` form, sorted by key
    pub fn env_list(&self) -> Vec<String> {
        let mut env: Vec<String> = self
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();
        env
    }
}

/// Check a function name against the identifier pattern `[-a-zA-Z_0-9]+`
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Validate a function name, returning it unchanged on success
pub fn validate_name(name: &str) -> Result<&str, String> {
    if name.is_empty() {
        return Err("function name is required".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!(
            "function name exceeds {} characters",
            MAX_NAME_LEN
        ));
    }
    if !is_valid_name(name) {
        return Err(format!(
            "invalid function name '{}': only letters, digits, '-' and '_' are allowed",
            name.escape_default()
        ));
    }
    Ok(name)
}
