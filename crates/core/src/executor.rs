//! Shell command execution.
//!
//! The executor runs a claimed job's command in a subshell, captures exit
//! status and output, and enforces a timeout. It never touches the store.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Upper bound on captured output kept for `last_error`.
pub const MAX_CAPTURED_OUTPUT: usize = 4096;

/// Result of a single command execution.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// Process exit code; -1 is synthesized for timeout, signal death and
    /// spawn failure.
    pub exit_code: i32,
    /// Merged stdout/stderr, truncated to [`MAX_CAPTURED_OUTPUT`] bytes.
    pub output: String,
    pub timed_out: bool,
}

impl ExecOutcome {
    /// Whether the attempt counts as a success.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Executes job commands in a subshell.
#[derive(Debug, Clone, Default)]
pub struct Executor;

impl Executor {
    pub fn new() -> Self {
        Self
    }

    /// Run `command` under `sh -c`, waiting at most `timeout`.
    ///
    /// On timeout the shell is killed and a synthetic non-zero outcome is
    /// returned; the same shape is used when the shell cannot be spawned.
    pub async fn run(&self, command: &str, timeout: Duration) -> ExecOutcome {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return ExecOutcome {
                    exit_code: -1,
                    output: truncate_output(&format!("failed to spawn shell: {e}")),
                    timed_out: false,
                }
            }
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => {
                let mut merged = String::from_utf8_lossy(&out.stdout).into_owned();
                merged.push_str(&String::from_utf8_lossy(&out.stderr));
                ExecOutcome {
                    exit_code: out.status.code().unwrap_or(-1),
                    output: truncate_output(&merged),
                    timed_out: false,
                }
            }
            Ok(Err(e)) => ExecOutcome {
                exit_code: -1,
                output: truncate_output(&format!("failed to collect output: {e}")),
                timed_out: false,
            },
            // Dropping the wait future drops the child; kill_on_drop
            // takes the shell down with it.
            Err(_) => ExecOutcome {
                exit_code: -1,
                output: format!("timed out after {}s", timeout.as_secs()),
                timed_out: true,
            },
        }
    }
}

/// Truncate to at most [`MAX_CAPTURED_OUTPUT`] bytes on a char boundary.
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_CAPTURED_OUTPUT {
        return s.to_string();
    }
    let mut end = MAX_CAPTURED_OUTPUT;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
