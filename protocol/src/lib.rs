//! Wardgate protocol - shared wire types for the gateway and conclave workers
//!
//! Two surfaces live here:
//! - The WebSocket frames exchanged between the gateway and a conclave worker
//!   (authentication, exec dispatch, streamed output, terminal results).
//! - The agent-facing exec API bodies (`POST /conclaves/{name}/exec` and the
//!   SSH exec routes) together with pipeline parsing and the unsafe-shell
//!   validation both sides apply before anything is executed.
//!
//! Every frame is a single WebSocket text message carrying one JSON object
//! discriminated by its `type` field.

mod exec;
mod frames;

pub use exec::{
    parse_pipeline, validate_request, ExecParseError, ExecRequest, ExecResponse, ExecSegment,
    UNSAFE_SHELL_MESSAGE,
};
pub use frames::{Frame, OutputStream};
