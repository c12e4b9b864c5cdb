use config::{Config, ConfigError as BuilderError, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "wardgate-worker.toml";
const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// WebSocket URL of the gateway's registration socket, e.g.
    /// `ws://gateway:8800/conclaves/ws`.
    pub gateway_url: String,
    /// Conclave name this worker registers as.
    pub name: String,
    /// Shared key matching the gateway's conclave endpoint config.
    pub key: String,
    /// Default working directory for pipelines that carry no cwd.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// Combined stdout+stderr cap per exec; beyond it the pipeline is
    /// killed and the terminal frame is marked truncated.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Optional local command allowlist, checked per segment in addition
    /// to the gateway's policy.
    #[serde(default)]
    pub allowlist: Option<Vec<String>>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn default_log_level() -> String {
    "info".into()
}

impl WorkerConfig {
    /// A segment command is allowed when no allowlist is configured or its
    /// basename is listed.
    pub fn command_allowed(&self, command: &str) -> bool {
        match &self.allowlist {
            None => true,
            Some(allowed) => {
                let basename = Path::new(command)
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or(command);
                allowed.iter().any(|entry| entry == basename)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub gateway_url: Option<String>,
    pub name: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Builder(#[from] BuilderError),
}

pub fn load(overrides: ConfigOverrides) -> Result<WorkerConfig, ConfigError> {
    let mut builder = Config::builder();

    match &overrides.config_path {
        Some(path) => builder = builder.add_source(File::from(path.clone())),
        None => {
            builder = builder.add_source(
                File::from(Path::new(DEFAULT_CONFIG_FILE))
                    .required(false)
                    .format(FileFormat::Toml),
            );
        }
    }
    builder = builder.add_source(Environment::with_prefix("WARDGATE_WORKER").separator("__"));

    if let Some(gateway_url) = overrides.gateway_url {
        builder = builder.set_override("gateway_url", gateway_url)?;
    }
    if let Some(name) = overrides.name {
        builder = builder.set_override("name", name)?;
    }
    if let Some(key) = overrides.key {
        builder = builder.set_override("key", key)?;
    }

    let config: WorkerConfig = builder.build()?.try_deserialize()?;
    if config.name.is_empty() || config.key.is_empty() {
        return Err(ConfigError::Message(
            "worker name and key must be non-empty".into(),
        ));
    }
    if !config.gateway_url.starts_with("ws://") && !config.gateway_url.starts_with("wss://") {
        return Err(ConfigError::Message(format!(
            "gateway_url must be a ws:// or wss:// url, got {:?}",
            config.gateway_url
        )));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_allowlist(allowlist: Option<Vec<String>>) -> WorkerConfig {
        WorkerConfig {
            gateway_url: "ws://localhost:8800/conclaves/ws".into(),
            name: "obsidian".into(),
            key: "worker-key".into(),
            workdir: None,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            allowlist,
            log_level: "info".into(),
        }
    }

    #[test]
    fn allowlist_checks_basenames() {
        let config = config_with_allowlist(Some(vec!["echo".into(), "cat".into()]));
        assert!(config.command_allowed("echo"));
        assert!(config.command_allowed("/bin/echo"));
        assert!(!config.command_allowed("rm"));
    }

    #[test]
    fn missing_allowlist_allows_everything() {
        let config = config_with_allowlist(None);
        assert!(config.command_allowed("anything"));
    }
}
