//! Remote command execution over SSH with per-endpoint connection pooling.
//!
//! Handshakes are expensive, so clients are pooled and reused; a counting
//! semaphore bounds concurrent connections per endpoint and a liveness check
//! gates reuse so one stale entry cannot poison later requests.

mod client;
mod pool;

pub use client::{connect, ExecOutput, RusshClient, SshClient};
pub use pool::{ClientFactory, PooledClient, SshPool};

use std::borrow::Cow;
use thiserror::Error;

use wardgate_protocol::ExecRequest;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("ssh connect failed: {0}")]
    ConnectFailed(String),
    #[error("ssh authentication failed")]
    AuthFailed,
    #[error("host key verification failed: {0}")]
    HostKey(String),
    #[error("remote execution failed: {0}")]
    ExecFailed(String),
    #[error("connection limit reached for endpoint")]
    MaxConns,
    #[error("ssh exec cancelled")]
    Cancelled,
}

/// Render an exec request as the remote command line. Segments are joined
/// back into a pipeline; a non-empty cwd wraps the whole pipeline in a
/// shell-escaped `cd`.
pub fn build_command(request: &ExecRequest) -> String {
    let pipeline = request
        .segments
        .iter()
        .map(|segment| {
            if segment.args.is_empty() {
                segment.command.clone()
            } else {
                format!("{} {}", segment.command, segment.args)
            }
        })
        .collect::<Vec<_>>()
        .join(" | ");

    match request.cwd.as_deref().filter(|cwd| !cwd.is_empty()) {
        Some(cwd) => {
            let quoted = shlex::try_quote(cwd).unwrap_or(Cow::Borrowed(cwd));
            format!("cd {quoted} && {pipeline}")
        }
        None => pipeline,
    }
}
