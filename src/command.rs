#![allow(dead_code)]

//! Command and result models shared by every adapter.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::error::{Error, ErrorKind};

/// How a command's stdout/stderr are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    /// Collect into the result's bounded buffers.
    #[default]
    Capture,
    /// Forward to the caller's streams only.
    Stream,
    /// Drop all output.
    Discard,
    /// Forward and capture.
    Tee,
}

impl IoMode {
    pub fn captures(self) -> bool {
        matches!(self, IoMode::Capture | IoMode::Tee)
    }

    pub fn streams(self) -> bool {
        matches!(self, IoMode::Stream | IoMode::Tee)
    }
}

/// Shell selection for a command given as a single string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shell {
    /// The target's default interpreter (`sh -c`).
    Default,
    /// A specific interpreter, invoked as `<program> -c <command>`.
    Program(String),
}

/// Stdin for the remote process.
#[derive(Debug, Clone, PartialEq)]
pub enum StdinSource {
    /// In-memory bytes, written then closed.
    Inline(Bytes),
    /// A local file streamed to the remote stdin.
    File(PathBuf),
}

/// Environment overlay for a command. Merged over the adapter's base
/// environment unless `replace` is set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnvOverlay {
    pub vars: HashMap<String, String>,
    pub replace: bool,
}

/// Immutable description of one command invocation. Every `with_*` method
/// returns a new value; equality is by value.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub argv: Vec<String>,
    pub shell: Option<Shell>,
    pub stdin: Option<StdinSource>,
    pub env: EnvOverlay,
    pub cwd: Option<String>,
    /// `None` and `Some(ZERO)` both mean no timeout.
    pub timeout: Option<Duration>,
    pub user: Option<String>,
    pub io_mode: IoMode,
    /// Surface a non-zero exit as `NonZeroExit` instead of a normal result.
    pub check: bool,
}

impl Command {
    /// Command from an argv array, executed directly (no shell).
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Command {
            argv: argv.into_iter().map(Into::into).collect(),
            shell: None,
            stdin: None,
            env: EnvOverlay::default(),
            cwd: None,
            timeout: None,
            user: None,
            io_mode: IoMode::default(),
            check: true,
        }
    }

    /// Command from a single string, interpreted by the default shell.
    pub fn shell(line: impl Into<String>) -> Self {
        let mut cmd = Command::new([line.into()]);
        cmd.shell = Some(Shell::Default);
        cmd
    }

    pub fn with_args<I, S>(&self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = self.clone();
        next.argv = argv.into_iter().map(Into::into).collect();
        next
    }

    pub fn with_env(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        let _ = next.env.vars.insert(name.into(), value.into());
        next
    }

    pub fn with_env_map(&self, vars: HashMap<String, String>) -> Self {
        let mut next = self.clone();
        next.env.vars.extend(vars);
        next
    }

    pub fn with_env_replace(&self, replace: bool) -> Self {
        let mut next = self.clone();
        next.env.replace = replace;
        next
    }

    pub fn with_cwd(&self, cwd: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.cwd = Some(cwd.into());
        next
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut next = self.clone();
        next.timeout = Some(timeout);
        next
    }

    pub fn with_stdin(&self, stdin: StdinSource) -> Self {
        let mut next = self.clone();
        next.stdin = Some(stdin);
        next
    }

    pub fn with_shell(&self, shell: Shell) -> Self {
        let mut next = self.clone();
        next.shell = Some(shell);
        next
    }

    pub fn with_user(&self, user: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.user = Some(user.into());
        next
    }

    pub fn with_io_mode(&self, mode: IoMode) -> Self {
        let mut next = self.clone();
        next.io_mode = mode;
        next
    }

    /// Non-zero exits become normal results instead of errors.
    pub fn nothrow(&self) -> Self {
        let mut next = self.clone();
        next.check = false;
        next
    }

    /// Effective timeout, treating zero as unset.
    pub fn effective_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }

    /// One-line summary for logs and error context.
    pub fn summary(&self) -> String {
        let line = self.argv.join(" ");
        const MAX: usize = 120;
        if line.chars().count() > MAX {
            let truncated: String = line.chars().take(MAX).collect();
            format!("{truncated}…")
        } else {
            line
        }
    }

    /// The `sh -c` line for adapters that execute through a remote shell,
    /// honoring an explicit interpreter.
    pub fn shell_program(&self) -> String {
        match &self.shell {
            Some(Shell::Program(p)) => p.clone(),
            _ => "sh".to_string(),
        }
    }
}

/// Exit status as reported by an adapter; the engine stamps timing and
/// captured output around it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitDetails {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitDetails {
    pub fn code(code: i32) -> Self {
        ExitDetails {
            exit_code: Some(code),
            signal: None,
        }
    }
}

/// Which captured stream a helper reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Immutable outcome of one execution.
///
/// Exactly one of `exit_code` and `signal` is set when the command ran;
/// fatal transport failures surface as [`Error`] instead of a result.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub stdout: Bytes,
    pub stderr: Bytes,
    /// Set when either capture buffer overflowed and dropped oldest bytes.
    pub truncated: bool,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    pub duration: Duration,
    pub command: Command,
    /// Dotted identifier of the target that executed the command.
    pub target: String,
}

impl ExecResult {
    pub fn ok(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }

    pub fn failed(&self) -> bool {
        !self.ok()
    }

    fn stream(&self, kind: StreamKind) -> &Bytes {
        match kind {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }

    /// Captured bytes split on LF, lossily decoded.
    pub fn lines(&self, kind: StreamKind) -> Vec<String> {
        let text = String::from_utf8_lossy(self.stream(kind));
        text.lines().map(str::to_string).collect()
    }

    /// Parse a captured stream as JSON.
    pub fn json(&self, kind: StreamKind) -> Result<serde_json::Value, Error> {
        serde_json::from_slice(self.stream(kind)).map_err(|e| {
            Error::new(ErrorKind::Parse, format!("output is not valid JSON: {e}"))
                .with_target(self.target.clone())
                .with_command(self.command.summary())
        })
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

impl fmt::Display for ExecResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match (self.exit_code, &self.signal) {
            (Some(code), _) => format!("exit {code}"),
            (None, Some(sig)) => format!("signal {sig}"),
            (None, None) => "no status".to_string(),
        };
        write!(
            f,
            "{} on {} ({}, {})",
            status,
            self.target,
            self.command.summary(),
            humantime::format_duration(self.duration),
        )?;
        if self.failed() && !self.stderr.is_empty() {
            const PREVIEW: usize = 200;
            let preview = String::from_utf8_lossy(
                &self.stderr[..self.stderr.len().min(PREVIEW)],
            );
            write!(f, ": {}", preview.trim_end())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_returns_new_values() {
        let base = Command::new(["echo", "hello"]);
        let timed = base.with_timeout(Duration::from_secs(5));
        assert_eq!(base.timeout, None);
        assert_eq!(timed.timeout, Some(Duration::from_secs(5)));
        assert_eq!(base.argv, timed.argv);
    }

    #[test]
    fn equality_is_by_value() {
        let a = Command::shell("true").with_env("K", "v");
        let b = Command::shell("true").with_env("K", "v");
        assert_eq!(a, b);
        assert_ne!(a, b.nothrow());
    }

    #[test]
    fn zero_timeout_means_none() {
        let cmd = Command::new(["true"]).with_timeout(Duration::ZERO);
        assert_eq!(cmd.effective_timeout(), None);
    }

    #[test]
    fn result_helpers() {
        let cmd = Command::new(["true"]);
        let now = SystemTime::now();
        let result = ExecResult {
            exit_code: Some(0),
            signal: None,
            stdout: Bytes::from_static(b"a\nb\n"),
            stderr: Bytes::from_static(b"{\"k\":1}"),
            truncated: false,
            started_at: now,
            finished_at: now,
            duration: Duration::ZERO,
            command: cmd,
            target: "local".to_string(),
        };
        assert!(result.ok());
        assert_eq!(result.lines(StreamKind::Stdout), vec!["a", "b"]);
        assert_eq!(
            result.json(StreamKind::Stderr).unwrap()["k"],
            serde_json::json!(1)
        );
        assert_eq!(
            result.json(StreamKind::Stdout).unwrap_err().kind,
            ErrorKind::Parse
        );
    }
}
