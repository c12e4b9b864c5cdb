use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use base64::Engine;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::approval::{ApprovalBroker, ApprovalOutcome, ApprovalRequest};
use crate::config::{EndpointConfig, UpstreamAuthKind};
use crate::error::HttpError;
use crate::filter::{is_filterable_content_type, FilterAction, ResponseFilter};
use crate::vault::Vault;

const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers that never travel between the agent and the upstream.
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// The agent request facts the proxy needs after policy has allowed it.
pub struct ProxiedRequest {
    pub method: Method,
    /// Path below the endpoint name, query string included.
    pub suffix: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub agent_id: String,
}

/// Credential-injecting reverse proxy for http-kind endpoints.
pub struct ReverseProxy {
    client: reqwest::Client,
    vault: Arc<dyn Vault>,
    filter: Option<Arc<ResponseFilter>>,
    approvals: Option<Arc<ApprovalBroker>>,
}

impl ReverseProxy {
    pub fn new(
        vault: Arc<dyn Vault>,
        filter: Option<Arc<ResponseFilter>>,
        approvals: Option<Arc<ApprovalBroker>>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            vault,
            filter,
            approvals,
        }
    }

    /// Forward an already-authorized request upstream and filter the
    /// response. Policy and approval have been resolved by the caller.
    pub async fn forward(
        &self,
        endpoint: &EndpointConfig,
        upstream: &str,
        request: ProxiedRequest,
        cancel: &CancellationToken,
    ) -> Result<Response, HttpError> {
        let url = build_upstream_url(upstream, &request.suffix);
        let timeout = endpoint.timeout.unwrap_or(DEFAULT_UPSTREAM_TIMEOUT);

        let mut headers = sanitize_headers(&request.headers);
        // The agent's bearer never reaches the upstream; the injected
        // credential replaces it wholesale.
        if let Some(value) = self.authorization_for(endpoint).await? {
            headers.insert(header::AUTHORIZATION, value);
        }

        let upstream_request = self
            .client
            .request(request.method.clone(), &url)
            .headers(headers)
            .body(request.body.clone())
            .timeout(timeout);

        info!(
            endpoint = %endpoint.name,
            agent = %request.agent_id,
            method = %request.method,
            suffix = %request.suffix,
            "proxying to upstream"
        );

        let response = tokio::select! {
            response = upstream_request.send() => response.map_err(map_upstream_error)?,
            () = cancel.cancelled() => return Err(HttpError::bad_request("request cancelled")),
        };

        self.relay_response(endpoint, &request, response, cancel)
            .await
    }

    async fn authorization_for(
        &self,
        endpoint: &EndpointConfig,
    ) -> Result<Option<HeaderValue>, HttpError> {
        let Some(name) = endpoint.auth.credential_name.as_deref() else {
            return Ok(None);
        };
        let secret = self.vault.get(name).await?;
        let rendered = match endpoint.auth.kind {
            UpstreamAuthKind::None => return Ok(None),
            UpstreamAuthKind::Bearer => format!("Bearer {secret}"),
            UpstreamAuthKind::Basic => format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(secret.as_bytes())
            ),
        };
        HeaderValue::from_str(&rendered)
            .map(Some)
            .map_err(|err| HttpError::internal(format!("credential not header-safe: {err}")))
    }

    async fn relay_response(
        &self,
        endpoint: &EndpointConfig,
        request: &ProxiedRequest,
        response: reqwest::Response,
        cancel: &CancellationToken,
    ) -> Result<Response, HttpError> {
        let status =
            StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut headers = sanitize_headers(response.headers());

        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let filterable = is_filterable_content_type(&content_type);
        let Some(filter) = self.filter.as_ref().filter(|_| filterable) else {
            let mut relayed = Response::builder()
                .status(status)
                .body(Body::from_stream(response.bytes_stream()))
                .map_err(HttpError::internal)?;
            *relayed.headers_mut() = headers;
            return Ok(relayed);
        };

        if let Some(length) = response.content_length() {
            if length > filter.max_body_bytes() as u64 {
                return Err(HttpError::bad_gateway("response too large to filter"));
            }
        }
        let body = response.bytes().await.map_err(map_upstream_error)?;
        if body.len() > filter.max_body_bytes() {
            return Err(HttpError::bad_gateway("response too large to filter"));
        }

        let text = String::from_utf8_lossy(&body);
        let matches = filter.scan(&text);
        let body = if matches.is_empty() {
            body
        } else {
            let names = ResponseFilter::matched_names(&matches).join(", ");
            match filter.action() {
                FilterAction::Block => {
                    return Err(HttpError::forbidden(format!("output blocked: {names}")));
                }
                FilterAction::Redact => Bytes::from(filter.apply(&text, &matches)),
                FilterAction::Log => {
                    warn!(
                        endpoint = %endpoint.name,
                        agent = %request.agent_id,
                        patterns = %names,
                        "sensitive data detected in upstream response"
                    );
                    body
                }
                FilterAction::Ask => {
                    self.ask_release(endpoint, request, &names, cancel).await?;
                    body
                }
            }
        };

        let mut relayed = Response::builder()
            .status(status)
            .body(Body::from(body))
            .map_err(HttpError::internal)?;
        *relayed.headers_mut() = headers;
        Ok(relayed)
    }

    /// Filter action `ask`: the response is released only with operator
    /// approval. Anything short of an approval blocks.
    async fn ask_release(
        &self,
        endpoint: &EndpointConfig,
        request: &ProxiedRequest,
        patterns: &str,
        cancel: &CancellationToken,
    ) -> Result<(), HttpError> {
        let Some(approvals) = &self.approvals else {
            return Err(HttpError::unavailable(
                "response held: approvals are not configured",
            ));
        };
        let outcome = approvals
            .request_approval(
                ApprovalRequest {
                    endpoint: endpoint.name.clone(),
                    method: request.method.to_string(),
                    path: request.suffix.clone(),
                    agent_id: request.agent_id.clone(),
                    content_type: None,
                    summary: format!("release upstream response containing: {patterns}"),
                    body: None,
                },
                cancel,
            )
            .await?;
        match outcome {
            ApprovalOutcome::Approved => Ok(()),
            ApprovalOutcome::Denied => {
                Err(HttpError::forbidden(format!("output blocked: {patterns}")))
            }
            ApprovalOutcome::TimedOut => {
                Err(HttpError::forbidden(format!("output blocked: {patterns}")))
            }
        }
    }
}

fn build_upstream_url(upstream: &str, suffix: &str) -> String {
    let base = upstream.trim_end_matches('/');
    if suffix.is_empty() {
        base.to_string()
    } else if suffix.starts_with('/') {
        format!("{base}{suffix}")
    } else {
        format!("{base}/{suffix}")
    }
}

/// Copy headers through, dropping hop-by-hop headers plus Host,
/// Authorization, and Content-Length (re-derived on each side).
fn sanitize_headers(headers: &HeaderMap) -> HeaderMap {
    let mut sanitized = HeaderMap::new();
    for (name, value) in headers {
        if HOP_BY_HOP.contains(name)
            || name == header::HOST
            || name == header::AUTHORIZATION
            || name == header::CONTENT_LENGTH
        {
            continue;
        }
        sanitized.append(name.clone(), value.clone());
    }
    sanitized
}

fn map_upstream_error(err: reqwest::Error) -> HttpError {
    if err.is_timeout() {
        HttpError::gateway_timeout("upstream timed out")
    } else if err.is_connect() {
        warn!(%err, "upstream connection failed");
        HttpError::bad_gateway("upstream unreachable")
    } else {
        warn!(%err, "upstream request failed");
        HttpError::bad_gateway("upstream error")
    }
}
