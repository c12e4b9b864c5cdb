use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message returned to callers when a command uses constructs the policy
/// engine cannot reason about.
pub const UNSAFE_SHELL_MESSAGE: &str =
    "Commands containing $(), backticks, subshells, chaining, or redirection are not supported";

/// One stage of a shell pipeline: the executable plus its argument string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSegment {
    pub command: String,
    #[serde(default)]
    pub args: String,
}

/// Body of an agent exec request (`POST /conclaves/{name}/exec` and the SSH
/// exec routes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub segments: Vec<ExecSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub raw: String,
    /// Bytes piped into the first segment's stdin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

/// Body of an exec response sent back to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResponse {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ExecResponse {
    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            action: "deny".into(),
            message: Some(message.into()),
            stdout: None,
            stderr: None,
            exit_code: None,
        }
    }

    pub fn allow(stdout: String, stderr: String, exit_code: i32) -> Self {
        Self {
            action: "allow".into(),
            message: None,
            stdout: Some(stdout),
            stderr: Some(stderr),
            exit_code: Some(exit_code),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecParseError {
    #[error("{UNSAFE_SHELL_MESSAGE}")]
    UnsafeShell,
    #[error("command pipeline is empty")]
    Empty,
    #[error("pipeline segment {0} has an empty command")]
    EmptyCommand(usize),
}

// Characters that would let a command escape per-segment policy evaluation.
// Pipes are absent: the pipeline structure is carried by the segment list.
const FORBIDDEN: &[char] = &['`', '(', ')', ';', '&', '<', '>', '\n', '\r'];

fn contains_unsafe(text: &str) -> bool {
    text.contains("$(") || text.chars().any(|c| FORBIDDEN.contains(&c))
}

/// Validate a parsed exec request.
///
/// Both sides run this: the gateway before a request reaches policy
/// evaluation, and the worker again before anything is spawned (the worker
/// does not trust the gateway's parse).
pub fn validate_request(request: &ExecRequest) -> Result<(), ExecParseError> {
    if contains_unsafe(&request.raw) {
        return Err(ExecParseError::UnsafeShell);
    }
    if request.segments.is_empty() {
        return Err(ExecParseError::Empty);
    }
    for (index, segment) in request.segments.iter().enumerate() {
        if segment.command.trim().is_empty() {
            return Err(ExecParseError::EmptyCommand(index));
        }
        if contains_unsafe(&segment.command) || contains_unsafe(&segment.args) {
            return Err(ExecParseError::UnsafeShell);
        }
    }
    Ok(())
}

/// Split a raw command line into pipeline segments.
///
/// `raw` is split on unquoted-looking `|` boundaries; each side becomes a
/// segment whose command is the first whitespace token and whose args are the
/// remainder verbatim. Unsafe constructs are rejected before splitting.
pub fn parse_pipeline(raw: &str) -> Result<ExecRequest, ExecParseError> {
    if contains_unsafe(raw) {
        return Err(ExecParseError::UnsafeShell);
    }

    let mut segments = Vec::new();
    for part in raw.split('|') {
        let part = part.trim();
        if part.is_empty() {
            return Err(ExecParseError::Empty);
        }
        let (command, args) = match part.split_once(char::is_whitespace) {
            Some((command, rest)) => (command.to_string(), rest.trim().to_string()),
            None => (part.to_string(), String::new()),
        };
        segments.push(ExecSegment { command, args });
    }
    if segments.is_empty() {
        return Err(ExecParseError::Empty);
    }

    let request = ExecRequest {
        segments,
        cwd: None,
        raw: raw.to_string(),
        stdin: None,
    };
    validate_request(&request)?;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_two_stage_pipeline() {
        let request = parse_pipeline("echo hi | tee /tmp/x").expect("pipeline parses");
        assert_eq!(
            request.segments,
            vec![
                ExecSegment {
                    command: "echo".into(),
                    args: "hi".into()
                },
                ExecSegment {
                    command: "tee".into(),
                    args: "/tmp/x".into()
                },
            ]
        );
        assert_eq!(request.raw, "echo hi | tee /tmp/x");
    }

    #[test]
    fn rejects_command_substitution() {
        let err = parse_pipeline("echo $(cat /etc/passwd)").expect_err("substitution rejected");
        assert_eq!(err, ExecParseError::UnsafeShell);
        assert!(err.to_string().contains("$()"));
    }

    #[test]
    fn rejects_backticks_and_subshells() {
        assert_eq!(
            parse_pipeline("echo `id`"),
            Err(ExecParseError::UnsafeShell)
        );
        assert_eq!(
            parse_pipeline("(cd /; ls)"),
            Err(ExecParseError::UnsafeShell)
        );
        assert_eq!(
            parse_pipeline("true && rm -rf /"),
            Err(ExecParseError::UnsafeShell)
        );
        assert_eq!(
            parse_pipeline("cat foo > bar"),
            Err(ExecParseError::UnsafeShell)
        );
    }

    #[test]
    fn rejects_empty_pipeline_stages() {
        assert_eq!(parse_pipeline("echo hi |"), Err(ExecParseError::Empty));
        assert_eq!(parse_pipeline("   "), Err(ExecParseError::Empty));
    }

    #[test]
    fn validates_segments_supplied_by_an_agent() {
        let request = ExecRequest {
            segments: vec![ExecSegment {
                command: "ls".into(),
                args: "-la; rm -rf /".into(),
            }],
            cwd: None,
            raw: "ls -la".into(),
            stdin: None,
        };
        assert_eq!(validate_request(&request), Err(ExecParseError::UnsafeShell));
    }

    #[test]
    fn segment_args_split_cleanly_for_spawning() {
        // Workers tokenize args with shlex before spawning; quoting survives.
        let request = parse_pipeline("grep 'a b' file.txt").expect("pipeline parses");
        let words = shlex::split(&request.segments[0].args).expect("args tokenize");
        assert_eq!(words, vec!["a b".to_string(), "file.txt".to_string()]);
    }
}
