//! Registry credentials for pulling function images from a private registry

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

pub const REGISTRY_HOST_ENV: &str = "DOCKER_REGISTRY_HOST";
pub const REGISTRY_USERNAME_ENV: &str = "DOCKER_REGISTRY_USERNAME";
pub const REGISTRY_PASSWORD_ENV: &str = "DOCKER_REGISTRY_PASSWORD";

/// Registry login, in the JSON shape the Docker API expects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub serveraddress: String,
}

/// Opaque encoded registry credential (base64 of the JSON auth config), or empty
#[derive(Clone, Default, PartialEq)]
pub struct RegistryCredential(String);

impl RegistryCredential {
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Wrap an already-encoded credential
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Encode a registry login
    pub fn encode(auth: &RegistryAuth) -> anyhow::Result<Self> {
        let json = serde_json::to_vec(auth)?;
        Ok(Self(STANDARD.encode(json)))
    }

    /// Build the credential from `DOCKER_REGISTRY_HOST`, `DOCKER_REGISTRY_USERNAME`
    /// and `DOCKER_REGISTRY_PASSWORD`. An unset or empty host yields an empty credential.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup(REGISTRY_HOST_ENV).unwrap_or_default();
        if host.is_empty() {
            return Ok(Self::empty());
        }

        Self::encode(&RegistryAuth {
            username: lookup(REGISTRY_USERNAME_ENV).unwrap_or_default(),
            password: lookup(REGISTRY_PASSWORD_ENV).unwrap_or_default(),
            serveraddress: host,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode back into a registry login
    pub fn decode(&self) -> anyhow::Result<Option<RegistryAuth>> {
        if self.is_empty() {
            return Ok(None);
        }
        let json = STANDARD.decode(&self.0)?;
        Ok(Some(serde_json::from_slice(&json)?))
    }
}

// Never print the encoded secret
impl std::fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            f.write_str("RegistryCredential(empty)")
        } else {
            f.write_str("RegistryCredential(<redacted>)")
        }
    }
}
