use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Abstract credential storage: `get(name)` yields the secret value injected
/// upstream. Lookup failures are internal; handlers must map them to a
/// generic 500 so agents cannot probe which credentials exist.
#[async_trait]
pub trait Vault: Send + Sync {
    async fn get(&self, name: &str) -> Result<String, VaultError>;
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("credential not found: {0}")]
    NotFound(String),
    #[error("vault backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VaultConfig {
    /// Secrets resolved from process environment variables.
    Env {
        #[serde(default = "default_env_prefix")]
        prefix: String,
    },
    /// Secrets inlined in the config file. Intended for development.
    Static {
        #[serde(default)]
        secrets: HashMap<String, String>,
    },
}

impl Default for VaultConfig {
    fn default() -> Self {
        VaultConfig::Env {
            prefix: default_env_prefix(),
        }
    }
}

fn default_env_prefix() -> String {
    "WARDGATE_CREDENTIAL_".into()
}

pub fn from_config(config: &VaultConfig) -> Arc<dyn Vault> {
    match config {
        VaultConfig::Env { prefix } => Arc::new(EnvVault {
            prefix: prefix.clone(),
        }),
        VaultConfig::Static { secrets } => Arc::new(StaticVault {
            secrets: secrets.clone(),
        }),
    }
}

/// Resolves `name` as `{prefix}{NAME}` in the environment, uppercased with
/// dashes folded to underscores.
pub struct EnvVault {
    prefix: String,
}

#[async_trait]
impl Vault for EnvVault {
    async fn get(&self, name: &str) -> Result<String, VaultError> {
        let variable = format!(
            "{}{}",
            self.prefix,
            name.to_ascii_uppercase().replace('-', "_")
        );
        match std::env::var(&variable) {
            Ok(value) if !value.is_empty() => Ok(value),
            Ok(_) => Err(VaultError::NotFound(name.to_string())),
            Err(std::env::VarError::NotPresent) => Err(VaultError::NotFound(name.to_string())),
            Err(err) => Err(VaultError::Backend(err.to_string())),
        }
    }
}

pub struct StaticVault {
    secrets: HashMap<String, String>,
}

#[async_trait]
impl Vault for StaticVault {
    async fn get(&self, name: &str) -> Result<String, VaultError> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(name.to_string()))
    }
}
