use serde::{Deserialize, Serialize};

use crate::exec::ExecSegment;

/// Which output stream a chunk frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A gateway<->worker WebSocket frame.
///
/// The worker opens the connection and sends `Auth` first; the gateway
/// answers with `AuthOk` or `AuthErr` and closes on the latter. After that
/// the gateway sends `Exec` frames and the worker streams back zero or more
/// `Chunk` frames per request id followed by exactly one `Done` or `Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Auth {
        name: String,
        key: String,
    },
    AuthOk,
    AuthErr {
        message: String,
    },
    Exec {
        id: String,
        segments: Vec<ExecSegment>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        raw: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stdin: Option<String>,
    },
    Chunk {
        id: String,
        stream: OutputStream,
        data: String,
    },
    Done {
        id: String,
        exit_code: i32,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        truncated: bool,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },
}

impl Frame {
    /// Request id the frame is tagged with, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Frame::Exec { id, .. } | Frame::Chunk { id, .. } | Frame::Done { id, .. } => Some(id),
            Frame::Error { id, .. } => id.as_deref(),
            _ => None,
        }
    }
}
