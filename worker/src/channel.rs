use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use wardgate_protocol::{validate_request, ExecRequest, ExecSegment, Frame};

use crate::config::WorkerConfig;
use crate::exec::{run_pipeline, PipelineOutcome};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Reconnect loop: serve the gateway connection until it drops, then retry
/// with exponential backoff and full jitter.
pub async fn run(config: Arc<WorkerConfig>) -> Result<()> {
    let mut attempt: u32 = 0;
    loop {
        match serve_connection(&config).await {
            Ok(()) => {
                info!("gateway connection closed, reconnecting");
                attempt = 0;
            }
            Err(err) => {
                warn!(%err, "gateway connection failed");
                attempt = attempt.saturating_add(1);
            }
        }

        let delay = backoff_delay(attempt);
        info!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
        tokio::time::sleep(delay).await;
    }
}

/// Full jitter: a uniform draw from zero up to the capped exponential.
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(5);
    let ceiling = BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(BACKOFF_CAP);
    let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
    Duration::from_millis(millis)
}

async fn serve_connection(config: &Arc<WorkerConfig>) -> Result<()> {
    let (socket, _) = connect_async(config.gateway_url.as_str())
        .await
        .context("cannot reach gateway")?;
    let (mut sink, mut stream) = socket.split();

    let auth = Frame::Auth {
        name: config.name.clone(),
        key: config.key.clone(),
    };
    sink.send(Message::Text(serde_json::to_string(&auth)?))
        .await
        .context("failed to send auth frame")?;

    match stream.next().await {
        Some(Ok(Message::Text(raw))) => match serde_json::from_str::<Frame>(&raw)? {
            Frame::AuthOk => info!(conclave = %config.name, "registered with gateway"),
            Frame::AuthErr { message } => bail!("gateway rejected registration: {message}"),
            other => bail!("unexpected frame during registration: {other:?}"),
        },
        other => bail!("gateway closed during registration: {other:?}"),
    }

    // Single writer task serializes every outbound frame (and pong).
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        match stream.next().await {
            Some(Ok(Message::Text(raw))) => match serde_json::from_str::<Frame>(&raw) {
                Ok(Frame::Exec {
                    id,
                    segments,
                    cwd,
                    raw,
                    stdin,
                }) => {
                    let request = ExecRequest {
                        segments,
                        cwd,
                        raw,
                        stdin,
                    };
                    spawn_exec(config.clone(), id, request, outbound.clone());
                }
                Ok(other) => warn!(?other, "unexpected frame from gateway"),
                Err(err) => warn!(%err, "undecodable frame from gateway"),
            },
            Some(Ok(Message::Ping(payload))) => {
                if outbound.send(Message::Pong(payload)).is_err() {
                    break Ok(());
                }
            }
            Some(Ok(Message::Close(_))) | None => break Ok(()),
            Some(Ok(_)) => {}
            Some(Err(err)) => break Err(anyhow!("socket error: {err}")),
        }
    };

    drop(outbound);
    let _ = writer.await;
    result
}

/// Each exec request runs on its own task so a long pipeline never blocks
/// the reader (or other requests on the same connection).
fn spawn_exec(
    config: Arc<WorkerConfig>,
    id: String,
    request: ExecRequest,
    outbound: mpsc::UnboundedSender<Message>,
) {
    tokio::spawn(async move {
        let send_frame = |frame: &Frame| {
            serde_json::to_string(frame)
                .ok()
                .and_then(|encoded| outbound.send(Message::Text(encoded)).ok())
                .is_some()
        };

        // The worker re-validates; it does not trust the gateway's parse.
        if let Err(err) = validate_request(&request) {
            send_frame(&Frame::Error {
                id: Some(id),
                message: err.to_string(),
            });
            return;
        }
        if let Some(denied) = first_disallowed(&config, &request.segments) {
            send_frame(&Frame::Error {
                id: Some(id),
                message: format!("command not allowed on this conclave: {denied}"),
            });
            return;
        }

        info!(request_id = %id, raw = %request.raw, "executing pipeline");
        let (events, mut event_rx) = mpsc::unbounded_channel();
        let forwarder = {
            let id = id.clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                while let Some((stream, data)) = event_rx.recv().await {
                    let frame = Frame::Chunk {
                        id: id.clone(),
                        stream,
                        data,
                    };
                    let Ok(encoded) = serde_json::to_string(&frame) else {
                        continue;
                    };
                    if outbound.send(Message::Text(encoded)).is_err() {
                        break;
                    }
                }
            })
        };

        let outcome = run_pipeline(
            &request,
            config.workdir.as_deref(),
            config.max_output_bytes,
            events,
        )
        .await;
        let _ = forwarder.await;

        match outcome {
            Ok(PipelineOutcome {
                exit_code,
                truncated,
            }) => {
                send_frame(&Frame::Done {
                    id,
                    exit_code,
                    truncated,
                });
            }
            Err(err) => {
                error!(%err, "pipeline failed");
                send_frame(&Frame::Error {
                    id: Some(id),
                    message: err.to_string(),
                });
            }
        }
    });
}

fn first_disallowed<'a>(
    config: &WorkerConfig,
    segments: &'a [ExecSegment],
) -> Option<&'a str> {
    segments
        .iter()
        .map(|segment| segment.command.as_str())
        .find(|command| !config.command_allowed(command))
}
