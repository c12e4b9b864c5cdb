use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use wardgate_protocol::{ExecRequest, OutputStream};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("cannot tokenize arguments for {0}")]
    BadArgs(String),
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("pipeline io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal state of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub exit_code: i32,
    pub truncated: bool,
}

/// Execute the pipeline, streaming output chunks as they appear.
///
/// Segments are spawned concurrently with each stdout piped into the next
/// stdin; the final stdout and every stderr stream to `events`. Combined
/// output is capped at `max_output_bytes`: on overflow the children are
/// killed and the outcome is marked truncated.
pub async fn run_pipeline(
    request: &ExecRequest,
    default_cwd: Option<&Path>,
    max_output_bytes: usize,
    events: mpsc::UnboundedSender<(OutputStream, String)>,
) -> Result<PipelineOutcome, ExecError> {
    let budget = Arc::new(AtomicI64::new(max_output_bytes as i64));
    let overflow = Arc::new(Notify::new());
    let mut children = Vec::new();
    let mut pumps = Vec::new();
    let mut previous_stdout: Option<tokio::process::ChildStdout> = None;
    let last = request.segments.len().saturating_sub(1);

    for (index, segment) in request.segments.iter().enumerate() {
        let args = if segment.args.is_empty() {
            Vec::new()
        } else {
            shlex::split(&segment.args).ok_or_else(|| ExecError::BadArgs(segment.command.clone()))?
        };

        let mut command = Command::new(&segment.command);
        command.args(&args);
        command.kill_on_drop(true);
        if let Some(cwd) = request.cwd.as_deref().map(Path::new).or(default_cwd) {
            command.current_dir(cwd);
        }

        match previous_stdout.take() {
            Some(stdout) => {
                let stdin: Stdio = stdout.try_into().map_err(ExecError::Io)?;
                command.stdin(stdin);
            }
            None if request.stdin.is_some() => {
                command.stdin(Stdio::piped());
            }
            None => {
                command.stdin(Stdio::null());
            }
        }
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            command: segment.command.clone(),
            source,
        })?;

        if index == 0 {
            if let (Some(data), Some(mut stdin)) = (request.stdin.clone(), child.stdin.take()) {
                tokio::spawn(async move {
                    let _ = stdin.write_all(data.as_bytes()).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(
                stderr,
                OutputStream::Stderr,
                events.clone(),
                budget.clone(),
                overflow.clone(),
            )));
        }

        if index == last {
            if let Some(stdout) = child.stdout.take() {
                pumps.push(tokio::spawn(pump(
                    stdout,
                    OutputStream::Stdout,
                    events.clone(),
                    budget.clone(),
                    overflow.clone(),
                )));
            }
        } else {
            previous_stdout = child.stdout.take();
        }

        children.push(child);
    }

    // Kill the pipeline as soon as any pump trips the cap; the remaining
    // pumps then drain to EOF instead of waiting on a silent process.
    let drained = futures::future::join_all(pumps);
    tokio::pin!(drained);
    let results = tokio::select! {
        results = &mut drained => results,
        () = overflow.notified() => {
            debug!("output cap exceeded, killing pipeline");
            for child in &mut children {
                let _ = child.start_kill();
            }
            drained.await
        }
    };
    let truncated = results
        .into_iter()
        .any(|result| result.unwrap_or(false));

    let mut exit_code = 0;
    for child in &mut children {
        let status = child.wait().await?;
        exit_code = status.code().unwrap_or(-1);
    }

    Ok(PipelineOutcome {
        exit_code,
        truncated,
    })
}

/// Copy a child stream to the event channel, honoring the shared byte
/// budget. Returns true when the budget was exhausted.
async fn pump(
    mut reader: impl AsyncRead + Unpin,
    stream: OutputStream,
    events: mpsc::UnboundedSender<(OutputStream, String)>,
    budget: Arc<AtomicI64>,
    overflow: Arc<Notify>,
) -> bool {
    let mut buffer = [0u8; 8192];
    loop {
        let read = match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => return false,
            Ok(read) => read,
        };

        let before = budget.fetch_sub(read as i64, Ordering::SeqCst);
        if before <= 0 {
            overflow.notify_one();
            return true;
        }
        let emit = read.min(before as usize);
        let chunk = String::from_utf8_lossy(&buffer[..emit]).into_owned();
        if events.send((stream, chunk)).is_err() {
            // Gateway side is gone; stop producing.
            return true;
        }
        if emit < read {
            overflow.notify_one();
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wardgate_protocol::ExecSegment;

    fn request(segments: Vec<(&str, &str)>) -> ExecRequest {
        ExecRequest {
            segments: segments
                .into_iter()
                .map(|(command, args)| ExecSegment {
                    command: command.into(),
                    args: args.into(),
                })
                .collect(),
            cwd: None,
            raw: String::new(),
            stdin: None,
        }
    }

    async fn collect(
        mut receiver: mpsc::UnboundedReceiver<(OutputStream, String)>,
    ) -> (String, String) {
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some((stream, chunk)) = receiver.recv().await {
            match stream {
                OutputStream::Stdout => stdout.push_str(&chunk),
                OutputStream::Stderr => stderr.push_str(&chunk),
            }
        }
        (stdout, stderr)
    }

    #[tokio::test]
    async fn runs_a_single_command() {
        let (sender, receiver) = mpsc::unbounded_channel();
        let outcome = run_pipeline(&request(vec![("echo", "hi")]), None, 1024 * 1024, sender)
            .await
            .expect("pipeline runs");
        let (stdout, stderr) = collect(receiver).await;

        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.truncated);
        assert_eq!(stdout, "hi\n");
        assert!(stderr.is_empty());
    }

    #[tokio::test]
    async fn chains_segments_through_pipes() {
        let (sender, receiver) = mpsc::unbounded_channel();
        let outcome = run_pipeline(
            &request(vec![("echo", "hello world"), ("tr", "'a-z' 'A-Z'")]),
            None,
            1024 * 1024,
            sender,
        )
        .await
        .expect("pipeline runs");
        let (stdout, _) = collect(receiver).await;

        assert_eq!(outcome.exit_code, 0);
        assert_eq!(stdout, "HELLO WORLD\n");
    }

    #[tokio::test]
    async fn surfaces_nonzero_exit_codes() {
        let (sender, _receiver) = mpsc::unbounded_channel();
        let outcome = run_pipeline(&request(vec![("false", "")]), None, 1024, sender)
            .await
            .expect("pipeline runs");
        assert_ne!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn captures_stderr() {
        let (sender, receiver) = mpsc::unbounded_channel();
        let outcome = run_pipeline(
            &request(vec![("ls", "/wardgate-does-not-exist")]),
            None,
            1024 * 1024,
            sender,
        )
        .await
        .expect("pipeline runs");
        let (_, stderr) = collect(receiver).await;

        assert_ne!(outcome.exit_code, 0);
        assert!(!stderr.is_empty());
    }

    #[tokio::test]
    async fn feeds_stdin_to_the_first_segment() {
        let mut exec = request(vec![("cat", "")]);
        exec.stdin = Some("hello stdin".into());
        let (sender, receiver) = mpsc::unbounded_channel();
        let outcome = run_pipeline(&exec, None, 1024 * 1024, sender)
            .await
            .expect("pipeline runs");
        let (stdout, _) = collect(receiver).await;

        assert_eq!(outcome.exit_code, 0);
        assert_eq!(stdout, "hello stdin");
    }

    #[tokio::test]
    async fn caps_output_and_reports_truncation() {
        let (sender, receiver) = mpsc::unbounded_channel();
        let outcome = run_pipeline(&request(vec![("yes", "")]), None, 4096, sender)
            .await
            .expect("pipeline runs");
        let (stdout, _) = collect(receiver).await;

        assert!(outcome.truncated);
        assert!(stdout.len() <= 4096);
    }

    #[tokio::test]
    async fn unknown_command_is_a_spawn_error() {
        let (sender, _receiver) = mpsc::unbounded_channel();
        let err = run_pipeline(
            &request(vec![("wardgate-no-such-binary", "")]),
            None,
            1024,
            sender,
        )
        .await
        .expect_err("spawn fails");
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
