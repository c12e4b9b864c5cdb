//! Full-pipeline tests: a real gateway on a TCP port, a stub upstream, and
//! a fake conclave worker speaking the WebSocket protocol.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::Request;
use axum::http::header;
use axum::routing::{get, put};
use axum::{Json, Router};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use wardgate_gateway::auth::{AuthConfig, StaticKey};
use wardgate_gateway::config::{
    ApprovalsSection, EndpointConfig, EndpointTarget, GatewayConfig, ObservabilitySection,
    ServerSection, UpstreamAuth, UpstreamAuthKind,
};
use wardgate_gateway::filter::{FilterAction, FilterConfig};
use wardgate_gateway::policy::{Rule, RuleAction, RuleQuota};
use wardgate_gateway::vault::VaultConfig;
use wardgate_gateway::{router, AppState};
use wardgate_protocol::{Frame, OutputStream};

const AGENT_KEY: &str = "agent-key";
const OPERATOR_KEY: &str = "op-key";
const WORKER_KEY: &str = "worker-key";

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener binds");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });
    addr
}

/// Stub upstream: echoes what it observed so tests can assert on the
/// forwarded request, plus fixed routes for the approval and filter flows.
async fn spawn_upstream() -> SocketAddr {
    async fn echo(request: Request) -> Json<Value> {
        let auth = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Json(json!({
            "observed_authorization": auth,
            "path": request.uri().path(),
            "query": request.uri().query(),
        }))
    }

    let app = Router::new()
        .route("/y", put(|| async { "approved-ok" }))
        .route(
            "/code",
            get(|| async { Json(json!({"msg": "Your verification code is 123456"})) }),
        )
        .fallback(echo);
    serve(app).await
}

fn base_config(upstream: SocketAddr, rules: Vec<Rule>) -> GatewayConfig {
    GatewayConfig {
        server: ServerSection::default(),
        observability: ObservabilitySection::default(),
        auth: AuthConfig {
            static_keys: vec![StaticKey {
                key: AGENT_KEY.into(),
                agent: "research".into(),
            }],
            jwt: None,
            operator_keys: vec![OPERATOR_KEY.into()],
        },
        vault: VaultConfig::Static {
            secrets: HashMap::from([("github".to_string(), "upstream-secret".to_string())]),
        },
        filter: None,
        approvals: Some(ApprovalsSection {
            timeout: Duration::from_secs(10),
        }),
        endpoints: vec![
            EndpointConfig {
                name: "api".into(),
                description: None,
                docs_url: None,
                target: EndpointTarget::Http {
                    upstream: format!("http://{upstream}"),
                },
                auth: UpstreamAuth {
                    kind: UpstreamAuthKind::Bearer,
                    credential_name: Some("github".into()),
                },
                visibility: None,
                timeout: Some(Duration::from_secs(5)),
                rules,
            },
            EndpointConfig {
                name: "obsidian".into(),
                description: None,
                docs_url: None,
                target: EndpointTarget::Conclave {
                    key: WORKER_KEY.into(),
                },
                auth: UpstreamAuth::default(),
                visibility: None,
                timeout: Some(Duration::from_secs(5)),
                rules: vec![allow_all()],
            },
        ],
    }
}

fn allow_all() -> Rule {
    Rule {
        method: "*".into(),
        path: "**".into(),
        action: RuleAction::Allow,
        message: None,
        rate_limit: None,
        body_predicate: None,
    }
}

async fn spawn_gateway(config: GatewayConfig) -> SocketAddr {
    let state = AppState::from_config(config).expect("state builds");
    serve(router(state)).await
}

#[tokio::test]
async fn injects_the_upstream_credential_and_preserves_the_query() {
    let upstream = spawn_upstream().await;
    let gateway = spawn_gateway(base_config(upstream, vec![allow_all()])).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{gateway}/api/tasks/1?full=true"))
        .header(header::AUTHORIZATION, format!("Bearer {AGENT_KEY}"))
        .send()
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.expect("json body");
    // The agent's own bearer never reaches the upstream.
    assert_eq!(body["observed_authorization"], "Bearer upstream-secret");
    assert_eq!(body["path"], "/tasks/1");
    assert_eq!(body["query"], "full=true");
}

#[tokio::test]
async fn sliding_window_rate_limit_returns_retry_after() {
    let upstream = spawn_upstream().await;
    let rules = vec![Rule {
        method: "GET".into(),
        path: "**".into(),
        action: RuleAction::Allow,
        message: None,
        rate_limit: Some(RuleQuota {
            max: 2,
            window: Duration::from_secs(60),
        }),
        body_predicate: None,
    }];
    let gateway = spawn_gateway(base_config(upstream, rules)).await;

    let client = reqwest::Client::new();
    for _ in 0..2 {
        let response = client
            .get(format!("http://{gateway}/api/x"))
            .header(header::AUTHORIZATION, format!("Bearer {AGENT_KEY}"))
            .send()
            .await
            .expect("request succeeds");
        assert_eq!(response.status(), 200);
    }

    let response = client
        .get(format!("http://{gateway}/api/x"))
        .header(header::AUTHORIZATION, format!("Bearer {AGENT_KEY}"))
        .send()
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), 429);
    assert_eq!(
        response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok()),
        Some("60")
    );
}

#[tokio::test]
async fn ask_rules_suspend_until_the_operator_approves() {
    let upstream = spawn_upstream().await;
    let rules = vec![
        Rule {
            method: "PUT".into(),
            path: "**".into(),
            action: RuleAction::Ask,
            message: None,
            rate_limit: None,
            body_predicate: None,
        },
        allow_all(),
    ];
    let gateway = spawn_gateway(base_config(upstream, rules)).await;

    let agent = tokio::spawn(async move {
        reqwest::Client::new()
            .put(format!("http://{gateway}/api/y"))
            .header(header::AUTHORIZATION, format!("Bearer {AGENT_KEY}"))
            .send()
            .await
            .expect("request completes")
    });

    // Wait for exactly one pending record to surface, then approve it.
    let operator = reqwest::Client::new();
    let id = loop {
        let body: Value = operator
            .get(format!("http://{gateway}/approvals"))
            .header(header::AUTHORIZATION, format!("Bearer {OPERATOR_KEY}"))
            .send()
            .await
            .expect("list succeeds")
            .json()
            .await
            .expect("json body");
        let pending = body["pending"].as_array().expect("pending array").clone();
        if let Some(record) = pending.first() {
            assert_eq!(pending.len(), 1);
            assert_eq!(record["method"], "PUT");
            assert_eq!(record["agent_id"], "research");
            break record["id"].as_str().expect("id").to_string();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    let resolved = operator
        .post(format!("http://{gateway}/approvals/{id}/approve"))
        .header(header::AUTHORIZATION, format!("Bearer {OPERATOR_KEY}"))
        .send()
        .await
        .expect("approve succeeds");
    assert_eq!(resolved.status(), 200);

    let response = agent.await.expect("agent task joins");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.expect("body"), "approved-ok");

    // Exactly-once: the record is gone and cannot be resolved again.
    let again = operator
        .post(format!("http://{gateway}/approvals/{id}/approve"))
        .header(header::AUTHORIZATION, format!("Bearer {OPERATOR_KEY}"))
        .send()
        .await
        .expect("second resolve completes");
    assert_eq!(again.status(), 404);
}

#[tokio::test]
async fn approval_denial_is_forbidden() {
    let upstream = spawn_upstream().await;
    let rules = vec![Rule {
        method: "PUT".into(),
        path: "**".into(),
        action: RuleAction::Ask,
        message: None,
        rate_limit: None,
        body_predicate: None,
    }];
    let gateway = spawn_gateway(base_config(upstream, rules)).await;

    let agent = tokio::spawn(async move {
        reqwest::Client::new()
            .put(format!("http://{gateway}/api/y"))
            .header(header::AUTHORIZATION, format!("Bearer {AGENT_KEY}"))
            .send()
            .await
            .expect("request completes")
    });

    let operator = reqwest::Client::new();
    let id = loop {
        let body: Value = operator
            .get(format!("http://{gateway}/approvals"))
            .header(header::AUTHORIZATION, format!("Bearer {OPERATOR_KEY}"))
            .send()
            .await
            .expect("list succeeds")
            .json()
            .await
            .expect("json body");
        if let Some(record) = body["pending"].as_array().and_then(|p| p.first()) {
            break record["id"].as_str().expect("id").to_string();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    operator
        .post(format!("http://{gateway}/approvals/{id}/deny"))
        .header(header::AUTHORIZATION, format!("Bearer {OPERATOR_KEY}"))
        .send()
        .await
        .expect("deny succeeds");

    let response = agent.await.expect("agent task joins");
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn filter_blocks_otp_codes_in_upstream_responses() {
    let upstream = spawn_upstream().await;
    let mut config = base_config(upstream, vec![allow_all()]);
    config.filter = Some(FilterConfig {
        enabled: true,
        action: FilterAction::Block,
        replacement: "[REDACTED]".into(),
        patterns: vec!["otp_codes".into()],
        custom_patterns: Vec::new(),
        max_body_bytes: 1024 * 1024,
    });
    let gateway = spawn_gateway(config).await;

    let response = reqwest::Client::new()
        .get(format!("http://{gateway}/api/code"))
        .header(header::AUTHORIZATION, format!("Bearer {AGENT_KEY}"))
        .send()
        .await
        .expect("request completes");
    assert_eq!(response.status(), 403);

    let body: Value = response.json().await.expect("json body");
    assert_eq!(body["error"], "output blocked: otp_codes");
}

#[tokio::test]
async fn filter_redacts_matches_in_place() {
    let upstream = spawn_upstream().await;
    let mut config = base_config(upstream, vec![allow_all()]);
    config.filter = Some(FilterConfig {
        enabled: true,
        action: FilterAction::Redact,
        replacement: "[REDACTED]".into(),
        patterns: vec!["otp_codes".into()],
        custom_patterns: Vec::new(),
        max_body_bytes: 1024 * 1024,
    });
    let gateway = spawn_gateway(config).await;

    let response = reqwest::Client::new()
        .get(format!("http://{gateway}/api/code"))
        .header(header::AUTHORIZATION, format!("Bearer {AGENT_KEY}"))
        .send()
        .await
        .expect("request completes");
    assert_eq!(response.status(), 200);

    let body = response.text().await.expect("body");
    assert_eq!(body, r#"{"msg":"Your verification code is [REDACTED]"}"#);
}

type WorkerSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Drive a fake worker through the registration handshake.
async fn register_worker(
    gateway: SocketAddr,
    name: &str,
    key: &str,
) -> (
    SplitSink<WorkerSocket, Message>,
    SplitStream<WorkerSocket>,
) {
    let (socket, _) = connect_async(format!("ws://{gateway}/conclaves/ws"))
        .await
        .expect("worker connects");
    let (mut sink, mut stream) = socket.split();

    let auth = serde_json::to_string(&Frame::Auth {
        name: name.into(),
        key: key.into(),
    })
    .expect("auth serializes");
    sink.send(Message::Text(auth)).await.expect("auth sends");

    let reply = stream
        .next()
        .await
        .expect("gateway replies")
        .expect("frame reads");
    let frame: Frame = match reply {
        Message::Text(raw) => serde_json::from_str(&raw).expect("frame parses"),
        other => panic!("unexpected registration reply: {other:?}"),
    };
    assert!(matches!(frame, Frame::AuthOk), "worker auth should succeed");
    (sink, stream)
}

#[tokio::test]
async fn exec_round_trips_through_a_connected_worker() {
    let upstream = spawn_upstream().await;
    let gateway = spawn_gateway(base_config(upstream, vec![allow_all()])).await;

    let (mut sink, mut stream) = register_worker(gateway, "obsidian", WORKER_KEY).await;

    // Fake worker: answer the first exec request with streamed output.
    let worker = tokio::spawn(async move {
        loop {
            let message = match stream.next().await {
                Some(Ok(Message::Text(raw))) => raw,
                Some(Ok(Message::Ping(payload))) => {
                    sink.send(Message::Pong(payload)).await.expect("pong sends");
                    continue;
                }
                Some(Ok(_)) => continue,
                other => panic!("worker socket ended early: {other:?}"),
            };
            let frame: Frame = serde_json::from_str(&message).expect("frame parses");
            if let Frame::Exec { id, segments, raw, .. } = frame {
                assert_eq!(segments[0].command, "echo");
                assert_eq!(raw, "echo hi | tee /tmp/x");
                for frame in [
                    Frame::Chunk {
                        id: id.clone(),
                        stream: OutputStream::Stdout,
                        data: "hi\n".into(),
                    },
                    Frame::Done {
                        id,
                        exit_code: 0,
                        truncated: false,
                    },
                ] {
                    let encoded = serde_json::to_string(&frame).expect("frame serializes");
                    sink.send(Message::Text(encoded)).await.expect("frame sends");
                }
                break;
            }
        }
    });

    let response = reqwest::Client::new()
        .post(format!("http://{gateway}/conclaves/obsidian/exec"))
        .header(header::AUTHORIZATION, format!("Bearer {AGENT_KEY}"))
        .json(&json!({
            "segments": [
                {"command": "echo", "args": "hi"},
                {"command": "tee", "args": "/tmp/x"},
            ],
            "raw": "echo hi | tee /tmp/x",
        }))
        .send()
        .await
        .expect("exec completes");
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.expect("json body");
    assert_eq!(body["action"], "allow");
    assert_eq!(body["stdout"], "hi\n");
    assert_eq!(body["exit_code"], 0);

    worker.await.expect("worker task joins");
}

#[tokio::test]
async fn workers_with_a_bad_key_are_rejected() {
    let upstream = spawn_upstream().await;
    let gateway = spawn_gateway(base_config(upstream, vec![allow_all()])).await;

    let (socket, _) = connect_async(format!("ws://{gateway}/conclaves/ws"))
        .await
        .expect("worker connects");
    let (mut sink, mut stream) = socket.split();

    let auth = serde_json::to_string(&Frame::Auth {
        name: "obsidian".into(),
        key: "wrong".into(),
    })
    .expect("auth serializes");
    sink.send(Message::Text(auth)).await.expect("auth sends");

    let reply = stream
        .next()
        .await
        .expect("gateway replies")
        .expect("frame reads");
    let frame: Frame = match reply {
        Message::Text(raw) => serde_json::from_str(&raw).expect("frame parses"),
        other => panic!("unexpected registration reply: {other:?}"),
    };
    assert!(matches!(frame, Frame::AuthErr { .. }));
}
