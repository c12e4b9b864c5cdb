use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect, Sig};
use russh_keys::{key, PublicKeyBase64};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SshTarget;
use crate::ssh::SshError;
use crate::vault::Vault;

/// Captured output of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// The pool works against this surface so tests can substitute a fake.
#[async_trait]
pub trait SshClient: Send + Sync {
    async fn exec(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, SshError>;
    async fn is_alive(&self) -> bool;
    async fn close(&self);
}

enum HostKeyPolicy {
    Inline(key::PublicKey),
    KnownHostsFile(PathBuf),
    InsecureSkipVerify,
}

struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        self,
        server_public_key: &key::PublicKey,
    ) -> Result<(Self, bool), Self::Error> {
        let result = match &self.policy {
            HostKeyPolicy::InsecureSkipVerify => {
                warn!(host = %self.host, "skipping host key verification");
                Ok(true)
            }
            HostKeyPolicy::Inline(pinned) => {
                Ok(pinned.public_key_base64() == server_public_key.public_key_base64())
            }
            HostKeyPolicy::KnownHostsFile(path) => {
                match russh_keys::check_known_hosts_path(
                    &self.host,
                    self.port,
                    server_public_key,
                    path,
                ) {
                    Ok(known) => Ok(known),
                    Err(err) => {
                        warn!(host = %self.host, %err, "known_hosts lookup failed");
                        Ok(false)
                    }
                }
            }
        };
        result.map(|ok| (self, ok))
    }
}

/// Dial and authenticate a new connection for the target.
pub async fn connect(target: &SshTarget, vault: &dyn Vault) -> Result<RusshClient, SshError> {
    let policy = host_key_policy(target)?;
    let handler = ClientHandler {
        host: target.host.clone(),
        port: target.port,
        policy,
    };

    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(config, (target.host.as_str(), target.port), handler)
        .await
        .map_err(|err| match err {
            russh::Error::UnknownKey => SshError::HostKey("server key rejected".into()),
            other => SshError::ConnectFailed(other.to_string()),
        })?;

    let authenticated = if let Some(path) = &target.private_key_file {
        let key_pair = russh_keys::load_secret_key(path, None)
            .map_err(|err| SshError::ConnectFailed(format!("cannot load private key: {err}")))?;
        handle
            .authenticate_publickey(&target.user, Arc::new(key_pair))
            .await
            .map_err(|err| SshError::ConnectFailed(err.to_string()))?
    } else if let Some(credential) = &target.password_credential {
        let password = vault
            .get(credential)
            .await
            .map_err(|err| SshError::ConnectFailed(err.to_string()))?;
        handle
            .authenticate_password(&target.user, &password)
            .await
            .map_err(|err| SshError::ConnectFailed(err.to_string()))?
    } else {
        false
    };

    if !authenticated {
        return Err(SshError::AuthFailed);
    }

    Ok(RusshClient {
        handle: tokio::sync::Mutex::new(handle),
    })
}

fn host_key_policy(target: &SshTarget) -> Result<HostKeyPolicy, SshError> {
    if target.insecure_skip_verify {
        return Ok(HostKeyPolicy::InsecureSkipVerify);
    }
    if let Some(line) = &target.known_host {
        // Accepts either a bare base64 key or a full `<algo> <base64>` line.
        let key = line
            .split_whitespace()
            .find_map(|part| russh_keys::parse_public_key_base64(part).ok())
            .ok_or_else(|| SshError::HostKey("invalid known_host entry".into()))?;
        return Ok(HostKeyPolicy::Inline(key));
    }
    if let Some(path) = &target.known_hosts_file {
        return Ok(HostKeyPolicy::KnownHostsFile(path.clone()));
    }
    Err(SshError::HostKey("host key verification required".into()))
}

/// Live russh connection; the pool hands it to one request at a time.
pub struct RusshClient {
    handle: tokio::sync::Mutex<Handle<ClientHandler>>,
}

#[async_trait]
impl SshClient for RusshClient {
    async fn exec(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, SshError> {
        let handle = self.handle.lock().await;
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|err| SshError::ExecFailed(err.to_string()))?;
        drop(handle);

        channel
            .exec(true, command)
            .await
            .map_err(|err| SshError::ExecFailed(err.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    // Kill the remote process before surfacing cancellation.
                    let _ = channel.signal(Sig::KILL).await;
                    return Err(SshError::Cancelled);
                }
                message = channel.wait() => match message {
                    None => break,
                    Some(ChannelMsg::Data { ref data }) => stdout.extend_from_slice(data),
                    Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                        stderr.extend_from_slice(data);
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status as i32);
                    }
                    Some(other) => debug!(?other, "ignoring channel message"),
                },
            }
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exit_code.unwrap_or(-1),
        })
    }

    async fn is_alive(&self) -> bool {
        !self.handle.lock().await.is_closed()
    }

    async fn close(&self) {
        let handle = self.handle.lock().await;
        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}
