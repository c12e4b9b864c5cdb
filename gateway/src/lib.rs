//! Wardgate - identity- and policy-aware gateway for untrusted agents
//!
//! Agents address the gateway with a bearer token; every request is
//! authenticated, evaluated against declarative per-endpoint policy, held
//! for human approval when a rule asks for it, and only then dispatched:
//! - HTTP endpoints are reverse-proxied with the upstream credential
//!   injected from a vault the agent never sees.
//! - Conclave endpoints forward shell pipelines to a worker connected over
//!   a persistent WebSocket.
//! - SSH endpoints run the pipeline on a remote host through a pooled
//!   client.
//!
//! Upstream responses pass through a sensitive-data filter before they
//! reach the agent.

pub mod approval;
pub mod auth;
pub mod conclave;
pub mod config;
pub mod error;
pub mod filter;
pub mod policy;
pub mod proxy;
pub mod rate_limit;
pub mod server;
pub mod ssh;
pub mod telemetry;
pub mod vault;

pub use config::{ConfigOverrides, GatewayConfig};
pub use server::{router, spawn_housekeeping, AppState};
