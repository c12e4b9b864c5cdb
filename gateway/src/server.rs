use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use wardgate_protocol::{validate_request, ExecRequest, ExecResponse};

use crate::approval::{ApprovalBroker, ApprovalOutcome, ApprovalRequest};
use crate::auth::{bearer_token, Authenticator, AGENT_HEADER};
use crate::conclave::{ConclaveError, ConclaveRegistry};
use crate::config::{EndpointConfig, EndpointTarget, GatewayConfig};
use crate::error::HttpError;
use crate::filter::ResponseFilter;
use crate::policy::{Decision, PolicyEngine, PolicyRequest};
use crate::proxy::{ProxiedRequest, ReverseProxy};
use crate::rate_limit::RateLimiterRegistry;
use crate::ssh::{build_command, SshError, SshPool};
use crate::vault::{self, Vault};

const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REQUEST_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Authenticated agent identity, attached to request extensions by the auth
/// middleware.
#[derive(Debug, Clone)]
pub struct AgentIdentity(pub String);

/// Every owned singleton, constructed once at startup and handed to
/// handlers by reference.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub authenticator: Arc<Authenticator>,
    pub rates: Arc<RateLimiterRegistry>,
    pub policy: Arc<PolicyEngine>,
    pub approvals: Option<Arc<ApprovalBroker>>,
    pub filter: Option<Arc<ResponseFilter>>,
    pub vault: Arc<dyn Vault>,
    pub conclaves: Arc<ConclaveRegistry>,
    pub ssh: Arc<SshPool>,
    pub proxy: Arc<ReverseProxy>,
}

impl AppState {
    pub fn from_config(config: GatewayConfig) -> anyhow::Result<Self> {
        let authenticator = Arc::new(Authenticator::from_config(&config.auth)?);
        let rates = Arc::new(RateLimiterRegistry::new());
        let policy = Arc::new(PolicyEngine::new(rates.clone()));
        let approvals = config
            .approvals
            .as_ref()
            .map(|section| Arc::new(ApprovalBroker::new(section.timeout)));
        let filter = config
            .filter
            .as_ref()
            .filter(|section| section.enabled)
            .map(ResponseFilter::from_config)
            .transpose()?
            .map(Arc::new);
        let vault = vault::from_config(&config.vault);

        let worker_keys: HashMap<String, String> = config
            .endpoints
            .iter()
            .filter_map(|endpoint| match &endpoint.target {
                EndpointTarget::Conclave { key } => {
                    Some((endpoint.name.clone(), key.clone()))
                }
                _ => None,
            })
            .collect();
        let conclaves = Arc::new(ConclaveRegistry::new(worker_keys));
        let ssh = Arc::new(SshPool::new(vault.clone()));
        let proxy = Arc::new(ReverseProxy::new(
            vault.clone(),
            filter.clone(),
            approvals.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            authenticator,
            rates,
            policy,
            approvals,
            filter,
            vault,
            conclaves,
            ssh,
            proxy,
        })
    }

    fn endpoint(&self, name: &str, agent_id: &str) -> Result<&EndpointConfig, HttpError> {
        self.config
            .endpoints
            .iter()
            .find(|endpoint| endpoint.name == name)
            .filter(|endpoint| endpoint.visible_to(agent_id))
            .ok_or_else(|| HttpError::not_found("unknown endpoint"))
    }
}

pub fn router(state: AppState) -> Router {
    let agent_routes = Router::new()
        .route("/endpoints", get(list_endpoints))
        .route("/conclaves", get(list_conclaves))
        .route("/conclaves/:name/exec", post(conclave_exec))
        .fallback(dispatch_endpoint)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_agent,
        ));

    let operator_routes = Router::new()
        .route("/approvals", get(list_approvals))
        .route("/approvals/:id/approve", post(approve_request))
        .route("/approvals/:id/deny", post(deny_request))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_operator,
        ));

    Router::new()
        .route("/healthz", get(|| async { StatusCode::OK }))
        .route("/conclaves/ws", get(worker_socket))
        .merge(operator_routes)
        .merge(agent_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Spawns the periodic reaper for idle SSH connections and quiet rate
/// limiters.
pub fn spawn_housekeeping(state: &AppState) -> tokio::task::JoinHandle<()> {
    let ssh = state.ssh.clone();
    let rates = state.rates.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        loop {
            tick.tick().await;
            ssh.cleanup_idle().await;
            rates.prune_idle(Duration::from_secs(600));
        }
    })
}

async fn require_agent(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, HttpError> {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(HttpError::unauthorized)?;
    let token = bearer_token(header_value)?;
    let agent_id = state.authenticator.authenticate_agent(token)?;

    if let Ok(value) = agent_id.parse() {
        request.headers_mut().insert(AGENT_HEADER, value);
    }
    request.extensions_mut().insert(AgentIdentity(agent_id));
    Ok(next.run(request).await)
}

async fn require_operator(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, HttpError> {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(HttpError::unauthorized)?;
    let token = bearer_token(header_value)?;
    state.authenticator.authenticate_operator(token)?;
    Ok(next.run(request).await)
}

fn agent_identity(request: &Request) -> Result<String, HttpError> {
    request
        .extensions()
        .get::<AgentIdentity>()
        .map(|identity| identity.0.clone())
        .ok_or_else(|| HttpError::internal("agent identity missing from request"))
}

// ---------------------------------------------------------------------------
// Listing surfaces

async fn list_endpoints(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<Value>, HttpError> {
    let agent_id = agent_identity(&request)?;
    let endpoints: Vec<Value> = state
        .config
        .endpoints
        .iter()
        .filter(|endpoint| endpoint.visible_to(&agent_id))
        .map(|endpoint| {
            let upstream = match &endpoint.target {
                EndpointTarget::Http { upstream } => Some(upstream.clone()),
                _ => None,
            };
            json!({
                "name": endpoint.name,
                "description": endpoint.description,
                "upstream": upstream,
                "docs_url": endpoint.docs_url,
            })
        })
        .collect();
    Ok(Json(json!({ "endpoints": endpoints })))
}

async fn list_conclaves(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<Value>, HttpError> {
    let agent_id = agent_identity(&request)?;
    let conclaves: Vec<Value> = state
        .config
        .endpoints
        .iter()
        .filter(|endpoint| matches!(endpoint.target, EndpointTarget::Conclave { .. }))
        .filter(|endpoint| endpoint.visible_to(&agent_id))
        .map(|endpoint| {
            json!({
                "name": endpoint.name,
                "connected": state.conclaves.is_connected(&endpoint.name),
            })
        })
        .collect();
    Ok(Json(json!({ "conclaves": conclaves })))
}

// ---------------------------------------------------------------------------
// Operator approval surface

async fn list_approvals(State(state): State<AppState>) -> Result<Json<Value>, HttpError> {
    let Some(approvals) = &state.approvals else {
        return Err(HttpError::unavailable("approvals are not configured"));
    };
    let pending: Vec<Value> = approvals
        .list_pending()
        .into_iter()
        .map(|record| {
            // Request bodies can hold secrets of their own; display copies
            // go through the response filter in redact mode.
            let summary = redact_for_display(&state, &record.summary);
            let body = record.body.as_deref().map(|body| redact_for_display(&state, body));
            json!({
                "id": record.id,
                "endpoint": record.endpoint,
                "method": record.method,
                "path": record.path,
                "agent_id": record.agent_id,
                "content_type": record.content_type,
                "summary": summary,
                "body": body,
                "created_at": record.created_at,
                "deadline": record.deadline,
            })
        })
        .collect();
    Ok(Json(json!({ "pending": pending })))
}

fn redact_for_display(state: &AppState, text: &str) -> String {
    match &state.filter {
        Some(filter) => {
            let matches = filter.scan(text);
            filter.apply(text, &matches)
        }
        None => text.to_string(),
    }
}

async fn approve_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, HttpError> {
    let Some(approvals) = &state.approvals else {
        return Err(HttpError::unavailable("approvals are not configured"));
    };
    approvals.approve(&id)?;
    Ok(StatusCode::OK)
}

async fn deny_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, HttpError> {
    let Some(approvals) = &state.approvals else {
        return Err(HttpError::unavailable("approvals are not configured"));
    };
    approvals.deny(&id)?;
    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------
// Policy + approval gate shared by every dispatch path

struct GateRequest<'a> {
    endpoint: &'a EndpointConfig,
    method: &'a Method,
    /// Endpoint-relative path, query stripped by the glob matcher.
    policy_path: &'a str,
    agent_id: &'a str,
    body_json: Option<&'a Value>,
    content_type: Option<String>,
    body_text: Option<String>,
}

/// Run the policy engine and, on `Ask`, suspend on the approval broker.
/// Returns only when the request may proceed.
async fn authorize(
    state: &AppState,
    gate: GateRequest<'_>,
    cancel: &CancellationToken,
) -> Result<(), HttpError> {
    let decision = state.policy.evaluate(
        &gate.endpoint.name,
        &gate.endpoint.rules,
        &PolicyRequest {
            method: gate.method.as_str(),
            path: gate.policy_path,
            agent_id: gate.agent_id,
            body: gate.body_json,
        },
    );

    match decision {
        Decision::Allow => Ok(()),
        Decision::Deny(message) => {
            info!(
                endpoint = %gate.endpoint.name,
                agent = %gate.agent_id,
                "policy denied request"
            );
            let message = if message.is_empty() {
                "request denied by policy".to_string()
            } else {
                message
            };
            Err(HttpError::forbidden(message))
        }
        Decision::RateLimited { retry_after_secs } => {
            Err(HttpError::rate_limited(retry_after_secs))
        }
        Decision::Ask => {
            let Some(approvals) = &state.approvals else {
                return Err(HttpError::unavailable("approvals are not configured"));
            };
            let outcome = approvals
                .request_approval(
                    ApprovalRequest {
                        endpoint: gate.endpoint.name.clone(),
                        method: gate.method.to_string(),
                        path: gate.policy_path.to_string(),
                        agent_id: gate.agent_id.to_string(),
                        content_type: gate.content_type,
                        summary: format!("{} {}", gate.method, gate.policy_path),
                        body: gate.body_text,
                    },
                    cancel,
                )
                .await?;
            match outcome {
                ApprovalOutcome::Approved => Ok(()),
                ApprovalOutcome::Denied => Err(HttpError::forbidden("approval denied")),
                ApprovalOutcome::TimedOut => Err(HttpError::forbidden("approval timed out")),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Conclave exec

async fn conclave_exec(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Request,
) -> Result<Response, HttpError> {
    let agent_id = agent_identity(&request)?;
    let endpoint = state.endpoint(&name, &agent_id)?;
    if !matches!(endpoint.target, EndpointTarget::Conclave { .. }) {
        return Err(HttpError::not_found("unknown endpoint"));
    }
    let endpoint = endpoint.clone();

    let body = read_body(request).await?;
    let (exec, body_json) = parse_exec_body(&body)?;

    let cancel = CancellationToken::new();
    let gate = authorize(
        &state,
        GateRequest {
            endpoint: &endpoint,
            method: &Method::POST,
            policy_path: "/exec",
            agent_id: &agent_id,
            body_json: Some(&body_json),
            content_type: Some("application/json".into()),
            body_text: Some(exec.raw.clone()),
        },
        &cancel,
    )
    .await;
    if let Err(err) = gate {
        return Ok(exec_gate_response(err));
    }

    let timeout = endpoint.timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT);
    let result = state
        .conclaves
        .execute(&endpoint.name, exec, timeout, &cancel)
        .await
        .map_err(map_conclave_error)?;

    let mut response = ExecResponse::allow(result.stdout, result.stderr, result.exit_code);
    if result.truncated {
        response.message = Some("output truncated".into());
    }
    Ok(Json(response).into_response())
}

/// Exec routes report denials in the exec response shape (`{action:
/// "deny", message}`) instead of the generic error body.
fn exec_gate_response(err: HttpError) -> Response {
    if err.status() == StatusCode::FORBIDDEN {
        (
            StatusCode::FORBIDDEN,
            Json(ExecResponse::deny(err.message())),
        )
            .into_response()
    } else {
        err.into_response()
    }
}

fn map_conclave_error(err: ConclaveError) -> HttpError {
    match err {
        ConclaveError::NotConnected => HttpError::unavailable("conclave not connected"),
        ConclaveError::Disconnected => HttpError::bad_gateway("conclave disconnected"),
        ConclaveError::Worker(message) => HttpError::bad_gateway(message),
        ConclaveError::Timeout => HttpError::gateway_timeout("conclave exec timed out"),
        ConclaveError::Cancelled => HttpError::bad_request("request cancelled"),
    }
}

fn map_ssh_error(err: SshError) -> HttpError {
    match err {
        // Dial/auth/host-key detail stays in the logs.
        SshError::ConnectFailed(detail) => {
            warn!(%detail, "ssh connect failed");
            HttpError::bad_gateway("ssh connection failed")
        }
        SshError::AuthFailed => HttpError::bad_gateway("ssh connection failed"),
        SshError::HostKey(detail) => {
            warn!(%detail, "ssh host key verification failed");
            HttpError::bad_gateway("ssh connection failed")
        }
        SshError::ExecFailed(detail) => {
            warn!(%detail, "ssh exec failed");
            HttpError::bad_gateway("remote execution failed")
        }
        SshError::MaxConns => HttpError::unavailable("ssh connection limit reached"),
        SshError::Cancelled => HttpError::bad_request("request cancelled"),
    }
}

// ---------------------------------------------------------------------------
// Catch-all endpoint dispatch: reverse proxy and SSH exec

async fn dispatch_endpoint(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, HttpError> {
    let agent_id = agent_identity(&request)?;
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);

    let trimmed = path.trim_start_matches('/');
    let (name, rest) = match trimmed.split_once('/') {
        Some((name, rest)) => (name.to_string(), format!("/{rest}")),
        None if !trimmed.is_empty() => (trimmed.to_string(), String::new()),
        _ => return Err(HttpError::not_found("unknown endpoint")),
    };
    let endpoint = state.endpoint(&name, &agent_id)?.clone();

    let method = request.method().clone();
    let headers = request.headers().clone();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = read_body(request).await?;

    match &endpoint.target {
        EndpointTarget::Http { upstream } => {
            let upstream = upstream.clone();

            // Bodies are only parsed when some rule actually inspects them.
            let body_json: Option<Value> = if PolicyEngine::needs_body(&endpoint.rules) {
                serde_json::from_slice(&body).ok()
            } else {
                None
            };
            let body_text = if body.is_empty() {
                None
            } else {
                Some(String::from_utf8_lossy(&body).into_owned())
            };

            let cancel = CancellationToken::new();
            authorize(
                &state,
                GateRequest {
                    endpoint: &endpoint,
                    method: &method,
                    policy_path: &rest,
                    agent_id: &agent_id,
                    body_json: body_json.as_ref(),
                    content_type,
                    body_text,
                },
                &cancel,
            )
            .await?;

            let suffix = match &query {
                Some(query) => format!("{rest}?{query}"),
                None => rest,
            };
            state
                .proxy
                .forward(
                    &endpoint,
                    &upstream,
                    ProxiedRequest {
                        method,
                        suffix,
                        headers,
                        body,
                        agent_id,
                    },
                    &cancel,
                )
                .await
        }
        EndpointTarget::Ssh(target) => {
            if method != Method::POST || rest != "/exec" {
                return Err(HttpError::bad_request(
                    "ssh endpoints accept POST /{name}/exec",
                ));
            }
            let target = target.clone();
            let (exec, body_json) = parse_exec_body(&body)?;

            let cancel = CancellationToken::new();
            let gate = authorize(
                &state,
                GateRequest {
                    endpoint: &endpoint,
                    method: &Method::POST,
                    policy_path: "/exec",
                    agent_id: &agent_id,
                    body_json: Some(&body_json),
                    content_type,
                    body_text: Some(exec.raw.clone()),
                },
                &cancel,
            )
            .await;
            if let Err(err) = gate {
                return Ok(exec_gate_response(err));
            }

            let timeout = endpoint.timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT);
            let command = build_command(&exec);
            let pooled = state
                .ssh
                .get(&endpoint.name, &target, timeout)
                .await
                .map_err(map_ssh_error)?;

            let output = tokio::time::timeout(timeout, pooled.client.exec(&command, &cancel))
                .await
                .map_err(|_| HttpError::gateway_timeout("remote execution timed out"))?
                .map_err(map_ssh_error)?;
            state.ssh.put(&endpoint.name, pooled).await;

            Ok(Json(ExecResponse::allow(
                output.stdout,
                output.stderr,
                output.exit_code,
            ))
            .into_response())
        }
        EndpointTarget::Conclave { .. } => Err(HttpError::bad_request(
            "conclave endpoints accept POST /conclaves/{name}/exec",
        )),
    }
}

// ---------------------------------------------------------------------------
// Worker registration socket

async fn worker_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let registry = state.conclaves.clone();
    ws.on_upgrade(move |socket| crate::conclave::run_worker_socket(socket, registry))
}

// ---------------------------------------------------------------------------
// Helpers

async fn read_body(request: Request) -> Result<Bytes, HttpError> {
    axum::body::to_bytes(request.into_body(), MAX_REQUEST_BODY_BYTES)
        .await
        .map_err(|_| HttpError::bad_request("request body too large or unreadable"))
}

fn parse_exec_body(body: &Bytes) -> Result<(ExecRequest, Value), HttpError> {
    let body_json: Value = serde_json::from_slice(body)
        .map_err(|err| HttpError::bad_request(format!("invalid exec body: {err}")))?;
    let exec: ExecRequest = serde_json::from_value(body_json.clone())
        .map_err(|err| HttpError::bad_request(format!("invalid exec body: {err}")))?;
    validate_request(&exec).map_err(|err| HttpError::bad_request(err.to_string()))?;
    Ok((exec, body_json))
}
