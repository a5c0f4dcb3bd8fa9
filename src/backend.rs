//! Process execution backend.
//!
//! The agent runs two kinds of external programs: user tasks, which are
//! started in the background and then watched by the watchdog, and helper
//! commands such as `tar`, which run to completion under a timeout.

mod local;

pub use local::LocalRunner;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// Result of running a command to completion.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Exit code of the process (0 = success).
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

/// Trait for process execution backends.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `program` to completion, killing it if it outlives `timeout`.
    async fn run(&self, program: &Path, args: &[String], timeout: Duration)
        -> Result<ExecutionResult>;

    /// Start `program` in the background and return its pid.
    ///
    /// The child is not waited on: whoever holds the pid must reap it.
    async fn spawn(&self, program: &Path, args: &[String], timeout: Duration) -> Result<u32>;
}

/// Expand a leading `~` and `$VAR` / `${VAR}` references in a task path.
///
/// Unset variables expand to nothing, as in a shell.
pub fn expand_path(raw: &str) -> PathBuf {
    let mut out = String::with_capacity(raw.len());

    let rest = match (raw.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with('/') => {
            out.push_str(&home.to_string_lossy());
            rest
        }
        _ => raw,
    };

    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let braced = chars.next_if_eq(&'{').is_some();
        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if braced && next == '}' {
                chars.next();
                break;
            }
            if !braced && !(next.is_ascii_alphanumeric() || next == '_') {
                break;
            }
            name.push(next);
            chars.next();
        }

        if name.is_empty() {
            out.push('$');
        } else {
            out.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }

    PathBuf::from(out)
}
