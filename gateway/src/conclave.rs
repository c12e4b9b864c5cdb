use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use wardgate_protocol::{ExecRequest, Frame, OutputStream};

const AUTH_DEADLINE: Duration = Duration::from_secs(10);
const DISCONNECTED_MESSAGE: &str = "conclave disconnected";
const PING_INTERVAL: Duration = Duration::from_secs(15);
const LIVENESS_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConclaveError {
    #[error("conclave not connected")]
    NotConnected,
    #[error("conclave disconnected")]
    Disconnected,
    #[error("worker error: {0}")]
    Worker(String),
    #[error("conclave exec timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
}

/// Aggregated result of one exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub truncated: bool,
}

/// One authenticated worker connection.
///
/// `outbound` feeds the session's single writer task; `pending` is the
/// demultiplexing table the reader routes inbound frames through. The
/// generation id distinguishes a session from its replacement after
/// last-writer-wins eviction.
pub struct Session {
    name: String,
    generation: Uuid,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<String, mpsc::UnboundedSender<Frame>>>,
    last_seen: Mutex<Instant>,
}

impl Session {
    pub fn new(name: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            name: name.into(),
            generation: Uuid::new_v4(),
            outbound,
            pending: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(Instant::now()),
        });
        (session, outbound_rx)
    }

    /// Route an inbound frame to the request that owns its id. Frames for
    /// unknown ids (already-finished requests) are dropped.
    pub fn route_frame(&self, frame: Frame) {
        *self.last_seen.lock() = Instant::now();
        let Some(id) = frame.request_id().map(str::to_string) else {
            debug!(conclave = %self.name, "dropping untagged frame");
            return;
        };
        let pending = self.pending.lock();
        match pending.get(&id) {
            Some(sender) => {
                let _ = sender.send(frame);
            }
            None => debug!(conclave = %self.name, request_id = %id, "frame for unknown request"),
        }
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn stale(&self) -> bool {
        self.last_seen.lock().elapsed() > LIVENESS_WINDOW
    }

    /// Fail every in-flight request, used on disconnect and eviction.
    fn fail_pending(&self, message: &str) {
        let mut pending = self.pending.lock();
        for (id, sender) in pending.drain() {
            let _ = sender.send(Frame::Error {
                id: Some(id),
                message: message.to_string(),
            });
        }
    }
}

// Removes the pending entry when an exec finishes or unwinds.
struct PendingGuard {
    session: Arc<Session>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.session.pending.lock().remove(&self.id);
    }
}

/// Registry of live conclave sessions plus the worker key table.
pub struct ConclaveRegistry {
    keys: HashMap<String, String>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl ConclaveRegistry {
    /// `keys` maps conclave endpoint names to their worker keys.
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self {
            keys,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.keys.contains_key(name)
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.sessions.lock().contains_key(name)
    }

    fn authenticate(&self, name: &str, key: &str) -> bool {
        self.keys
            .get(name)
            .is_some_and(|expected| bool::from(expected.as_bytes().ct_eq(key.as_bytes())))
    }

    /// Insert a session; an existing one for the same name is evicted
    /// (last-writer-wins) and its in-flight requests fail fast.
    pub fn register(&self, session: Arc<Session>) {
        let evicted = self
            .sessions
            .lock()
            .insert(session.name.clone(), session.clone());
        if let Some(evicted) = evicted {
            warn!(conclave = %session.name, "replacing existing worker session");
            evicted.fail_pending(DISCONNECTED_MESSAGE);
        }
        info!(conclave = %session.name, "worker registered");
    }

    /// Remove the session unless a newer generation already took its place.
    pub fn remove(&self, session: &Session) {
        let mut sessions = self.sessions.lock();
        if let Some(current) = sessions.get(&session.name) {
            if current.generation == session.generation {
                sessions.remove(&session.name);
                info!(conclave = %session.name, "worker session removed");
            }
        }
        session.fail_pending(DISCONNECTED_MESSAGE);
    }

    fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(name).cloned()
    }

    /// Forward an exec request to the named worker and aggregate its frames
    /// until the terminal one.
    pub async fn execute(
        &self,
        name: &str,
        request: ExecRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecResult, ConclaveError> {
        let session = self.get(name).ok_or(ConclaveError::NotConnected)?;

        let id = Uuid::new_v4().to_string();
        let (sender, mut frames) = mpsc::unbounded_channel();
        session.pending.lock().insert(id.clone(), sender);
        let _guard = PendingGuard {
            session: session.clone(),
            id: id.clone(),
        };

        session
            .outbound
            .send(Frame::Exec {
                id: id.clone(),
                segments: request.segments,
                cwd: request.cwd,
                raw: request.raw,
                stdin: request.stdin,
            })
            .map_err(|_| ConclaveError::NotConnected)?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = &mut deadline => return Err(ConclaveError::Timeout),
                () = cancel.cancelled() => return Err(ConclaveError::Cancelled),
                frame = frames.recv() => match frame {
                    None => return Err(ConclaveError::Disconnected),
                    Some(Frame::Chunk { stream, data, .. }) => match stream {
                        OutputStream::Stdout => stdout.push_str(&data),
                        OutputStream::Stderr => stderr.push_str(&data),
                    },
                    Some(Frame::Done { exit_code, truncated, .. }) => {
                        return Ok(ExecResult { stdout, stderr, exit_code, truncated });
                    }
                    Some(Frame::Error { message, .. }) => {
                        if message == DISCONNECTED_MESSAGE {
                            return Err(ConclaveError::Disconnected);
                        }
                        return Err(ConclaveError::Worker(message));
                    }
                    Some(other) => {
                        debug!(request_id = %id, ?other, "unexpected frame kind");
                    }
                },
            }
        }
    }
}

/// Drive one worker WebSocket: frame-level auth, then a writer task that
/// serializes outbound frames and pings, while this task reads and
/// demultiplexes until the connection dies or goes stale.
pub async fn run_worker_socket(socket: WebSocket, registry: Arc<ConclaveRegistry>) {
    let (mut sink, mut stream) = socket.split();

    let name = match tokio::time::timeout(AUTH_DEADLINE, stream.next()).await {
        Ok(Some(Ok(Message::Text(raw)))) => match serde_json::from_str::<Frame>(&raw) {
            Ok(Frame::Auth { name, key }) if registry.authenticate(&name, &key) => {
                let _ = sink.send(frame_message(&Frame::AuthOk)).await;
                name
            }
            Ok(Frame::Auth { name, .. }) => {
                warn!(conclave = %name, "worker auth rejected");
                let _ = sink
                    .send(frame_message(&Frame::AuthErr {
                        message: "authentication rejected".into(),
                    }))
                    .await;
                return;
            }
            _ => {
                let _ = sink
                    .send(frame_message(&Frame::AuthErr {
                        message: "expected auth frame".into(),
                    }))
                    .await;
                return;
            }
        },
        _ => {
            debug!("worker connection closed before authenticating");
            return;
        }
    };

    let (session, mut outbound_rx) = Session::new(name.clone());
    registry.register(session.clone());

    // Writer half: serialized frames plus keepalive pings, one task.
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => {
                        if sink.send(frame_message(&frame)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader half: never waits on the writer, so keepalive stays live even
    // under outbound backpressure.
    let mut liveness = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Text(raw))) => match serde_json::from_str::<Frame>(&raw) {
                    Ok(frame) => session.route_frame(frame),
                    Err(err) => {
                        warn!(conclave = %name, %err, "undecodable frame from worker");
                        session.touch();
                    }
                },
                Some(Ok(Message::Pong(_))) => session.touch(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Binary(_))) => session.touch(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(err)) => {
                    debug!(conclave = %name, %err, "worker socket error");
                    break;
                }
            },
            _ = liveness.tick() => {
                if session.stale() {
                    warn!(conclave = %name, "worker missed keepalive window");
                    break;
                }
            }
        }
    }

    registry.remove(&session);
    writer.abort();
}

fn frame_message(frame: &Frame) -> Message {
    Message::Text(serde_json::to_string(frame).expect("frames serialize"))
}
