use config::{Config, ConfigError as BuilderError, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::auth::AuthConfig;
use crate::filter::FilterConfig;
use crate::policy::{Rule, RuleAction};
use crate::vault::VaultConfig;

const DEFAULT_CONFIG_FILE: &str = "wardgate.toml";

/// Route names the server claims for itself; endpoints cannot shadow them.
const RESERVED_ENDPOINT_NAMES: &[&str] = &["healthz", "endpoints", "conclaves", "approvals"];

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub observability: ObservabilitySection,
    pub auth: AuthConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
    #[serde(default)]
    pub approvals: Option<ApprovalsSection>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerSection {
    pub fn bind_address(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8800
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilitySection {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalsSection {
    /// How long a suspended request waits for an operator before timing out.
    #[serde(default = "default_approval_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_approval_timeout() -> Duration {
    Duration::from_secs(300)
}

/// One named destination agents can address.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub docs_url: Option<String>,
    #[serde(flatten)]
    pub target: EndpointTarget,
    #[serde(default)]
    pub auth: UpstreamAuth,
    /// Agent ids allowed to see and use this endpoint; absent means all.
    #[serde(default)]
    pub visibility: Option<Vec<String>>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl EndpointConfig {
    pub fn visible_to(&self, agent_id: &str) -> bool {
        match &self.visibility {
            None => true,
            Some(agents) => agents.iter().any(|allowed| allowed == agent_id),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EndpointTarget {
    /// Reverse-proxied HTTP upstream.
    Http { upstream: String },
    /// Shell execution on the conclave worker registered under this
    /// endpoint's name; `key` authenticates the worker's WebSocket.
    Conclave { key: String },
    /// Remote command execution over SSH.
    Ssh(SshTarget),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshTarget {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,
    /// Vault credential holding the password when no key file is used.
    #[serde(default)]
    pub password_credential: Option<String>,
    #[serde(default)]
    pub known_host: Option<String>,
    #[serde(default)]
    pub known_hosts_file: Option<PathBuf>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_max_conns() -> usize {
    4
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

/// How the gateway authenticates to the destination on the agent's behalf.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct UpstreamAuth {
    #[serde(default)]
    pub kind: UpstreamAuthKind,
    #[serde(default)]
    pub credential_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamAuthKind {
    Bearer,
    Basic,
    #[default]
    None,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Builder(#[from] BuilderError),
}

pub fn load(overrides: ConfigOverrides) -> Result<GatewayConfig, ConfigError> {
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

    builder = builder.add_source(Environment::with_prefix("WARDGATE").separator("__"));

    if let Some(host) = overrides.host {
        builder = builder.set_override("server.host", host)?;
    }
    if let Some(port) = overrides.port {
        builder = builder.set_override("server.port", port as i64)?;
    }
    if let Some(log_level) = overrides.log_level {
        builder = builder.set_override("observability.log_level", log_level)?;
    }
    if let Some(log_format) = overrides.log_format {
        builder = builder.set_override("observability.log_format", log_format)?;
    }

    let config: GatewayConfig = builder.build()?.try_deserialize()?;
    validate(&config)?;
    Ok(config)
}

/// Startup validation; any failure here is fatal.
pub fn validate(config: &GatewayConfig) -> Result<(), ConfigError> {
    config
        .server
        .bind_address()
        .map_err(|err| ConfigError::Message(format!("invalid bind address: {err}")))?;

    let mut names = HashSet::new();
    for endpoint in &config.endpoints {
        if endpoint.name.is_empty() || !is_route_safe(&endpoint.name) {
            return Err(ConfigError::Message(format!(
                "endpoint name {:?} is not a valid route segment",
                endpoint.name
            )));
        }
        if RESERVED_ENDPOINT_NAMES.contains(&endpoint.name.as_str()) {
            return Err(ConfigError::Message(format!(
                "endpoint name {:?} is reserved",
                endpoint.name
            )));
        }
        if !names.insert(endpoint.name.clone()) {
            return Err(ConfigError::Message(format!(
                "duplicate endpoint name {:?}",
                endpoint.name
            )));
        }

        match &endpoint.target {
            EndpointTarget::Http { upstream } => {
                Url::parse(upstream).map_err(|err| {
                    ConfigError::Message(format!(
                        "endpoint {:?} has an invalid upstream url: {err}",
                        endpoint.name
                    ))
                })?;
            }
            EndpointTarget::Conclave { key } => {
                if key.is_empty() {
                    return Err(ConfigError::Message(format!(
                        "conclave endpoint {:?} needs a non-empty worker key",
                        endpoint.name
                    )));
                }
            }
            EndpointTarget::Ssh(ssh) => validate_ssh(&endpoint.name, ssh)?,
        }

        if endpoint.auth.kind != UpstreamAuthKind::None
            && endpoint.auth.credential_name.is_none()
        {
            return Err(ConfigError::Message(format!(
                "endpoint {:?} injects credentials but names no credential",
                endpoint.name
            )));
        }

        for rule in &endpoint.rules {
            if rule.rate_limit.is_some() && rule.action != RuleAction::Allow {
                return Err(ConfigError::Message(format!(
                    "endpoint {:?}: rate_limit only applies to allow rules",
                    endpoint.name
                )));
            }
        }
    }

    Ok(())
}

fn validate_ssh(endpoint: &str, ssh: &SshTarget) -> Result<(), ConfigError> {
    let host_key_sources = usize::from(ssh.known_host.is_some())
        + usize::from(ssh.known_hosts_file.is_some())
        + usize::from(ssh.insecure_skip_verify);
    if host_key_sources != 1 {
        return Err(ConfigError::Message(format!(
            "ssh endpoint {endpoint:?}: host key verification required; set exactly one of \
             known_host, known_hosts_file, or insecure_skip_verify"
        )));
    }
    if ssh.private_key_file.is_none() && ssh.password_credential.is_none() {
        return Err(ConfigError::Message(format!(
            "ssh endpoint {endpoint:?}: provide private_key_file or password_credential"
        )));
    }
    if ssh.max_conns == 0 {
        return Err(ConfigError::Message(format!(
            "ssh endpoint {endpoint:?}: max_conns must be at least 1"
        )));
    }
    Ok(())
}

fn is_route_safe(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticKey;

    fn base_config() -> GatewayConfig {
        GatewayConfig {
            server: ServerSection::default(),
            observability: ObservabilitySection::default(),
            auth: AuthConfig {
                static_keys: vec![StaticKey {
                    key: "k".into(),
                    agent: "a".into(),
                }],
                jwt: None,
                operator_keys: Vec::new(),
            },
            vault: VaultConfig::default(),
            filter: None,
            approvals: None,
            endpoints: Vec::new(),
        }
    }

    fn http_endpoint(name: &str) -> EndpointConfig {
        EndpointConfig {
            name: name.into(),
            description: None,
            docs_url: None,
            target: EndpointTarget::Http {
                upstream: "https://api.example.com".into(),
            },
            auth: UpstreamAuth::default(),
            visibility: None,
            timeout: None,
            rules: Vec::new(),
        }
    }

    #[test]
    fn accepts_a_minimal_config() {
        let mut config = base_config();
        config.endpoints.push(http_endpoint("tasks"));
        validate(&config).expect("config validates");
    }

    #[test]
    fn rejects_duplicate_and_reserved_names() {
        let mut config = base_config();
        config.endpoints.push(http_endpoint("tasks"));
        config.endpoints.push(http_endpoint("tasks"));
        assert!(validate(&config).is_err());

        let mut config = base_config();
        config.endpoints.push(http_endpoint("conclaves"));
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_credential_injection_without_a_name() {
        let mut config = base_config();
        let mut endpoint = http_endpoint("tasks");
        endpoint.auth = UpstreamAuth {
            kind: UpstreamAuthKind::Bearer,
            credential_name: None,
        };
        config.endpoints.push(endpoint);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn ssh_requires_exactly_one_host_key_policy() {
        let ssh = |known_host: Option<&str>, file: Option<&str>, skip: bool| SshTarget {
            host: "bastion".into(),
            port: 22,
            user: "deploy".into(),
            private_key_file: Some(PathBuf::from("/etc/wardgate/id_ed25519")),
            password_credential: None,
            known_host: known_host.map(String::from),
            known_hosts_file: file.map(PathBuf::from),
            insecure_skip_verify: skip,
            max_conns: 2,
            idle_timeout: Duration::from_secs(60),
        };

        assert!(validate_ssh("bastion", &ssh(Some("ssh-ed25519 AAAA"), None, false)).is_ok());
        assert!(validate_ssh("bastion", &ssh(None, None, false)).is_err());
        assert!(validate_ssh("bastion", &ssh(Some("k"), None, true)).is_err());
    }

    #[test]
    fn rate_limits_only_attach_to_allow_rules() {
        use crate::policy::RuleQuota;
        let mut config = base_config();
        let mut endpoint = http_endpoint("tasks");
        endpoint.rules.push(Rule {
            method: "GET".into(),
            path: "**".into(),
            action: RuleAction::Deny,
            message: None,
            rate_limit: Some(RuleQuota {
                max: 1,
                window: Duration::from_secs(60),
            }),
            body_predicate: None,
        });
        config.endpoints.push(endpoint);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn parses_a_toml_document() {
        let raw = r#"
            [server]
            host = "0.0.0.0"
            port = 9000

            [auth]
            static_keys = [{ key = "agent-key", agent = "research" }]
            operator_keys = ["op-key"]

            [vault]
            kind = "static"
            secrets = { github = "upstream-secret" }

            [approvals]
            timeout = "2m"

            [filter]
            action = "redact"
            patterns = ["otp_codes"]

            [[endpoints]]
            name = "github"
            kind = "http"
            upstream = "https://api.github.com"
            auth = { kind = "bearer", credential_name = "github" }
            timeout = "10s"

            [[endpoints.rules]]
            method = "GET"
            path = "**"
            action = "allow"
            rate_limit = { max = 2, window = "1m" }

            [[endpoints]]
            name = "obsidian"
            kind = "conclave"
            key = "worker-key"

            [[endpoints.rules]]
            action = "ask"
        "#;

        let config: GatewayConfig = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()
            .expect("builds")
            .try_deserialize()
            .expect("deserializes");
        validate(&config).expect("validates");

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(
            config.approvals.expect("approvals section").timeout,
            Duration::from_secs(120)
        );
        let github = &config.endpoints[0];
        assert!(matches!(github.target, EndpointTarget::Http { .. }));
        assert_eq!(github.timeout, Some(Duration::from_secs(10)));
        assert_eq!(github.rules.len(), 1);
    }
}
