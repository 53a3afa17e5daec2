//! The closed error taxonomy shared by every adapter and the engine.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::command::ExecResult;

/// Every failure in the system is one of these kinds. Adapters produce a
/// kind; the engine enriches with target and command context but never
/// rewraps into a different kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Config,
    TargetNotFound,
    Connect,
    Auth,
    HostKey,
    Transport,
    Spawn,
    ContainerNotFound,
    PodNotFound,
    NotReady,
    Timeout,
    Cancelled,
    NonZeroExit,
    Io,
    Parse,
    Unavailable,
}

impl ErrorKind {
    /// Whether the engine's retry middleware retries this kind by default.
    pub fn retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::Connect
                | ErrorKind::Transport
                | ErrorKind::NotReady
                | ErrorKind::Io
                | ErrorKind::Unavailable
        )
    }

    /// Process exit code for the CLI.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Config | ErrorKind::Parse => 2,
            ErrorKind::TargetNotFound
            | ErrorKind::ContainerNotFound
            | ErrorKind::PodNotFound
            | ErrorKind::NotReady => 3,
            ErrorKind::Auth | ErrorKind::HostKey => 4,
            ErrorKind::Connect | ErrorKind::Transport | ErrorKind::Unavailable => 5,
            ErrorKind::Timeout => 124,
            ErrorKind::Cancelled => 130,
            ErrorKind::NonZeroExit | ErrorKind::Spawn | ErrorKind::Io => 1,
        }
    }

    fn label(self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::TargetNotFound => "target-not-found",
            ErrorKind::Connect => "connect",
            ErrorKind::Auth => "auth",
            ErrorKind::HostKey => "host-key",
            ErrorKind::Transport => "transport",
            ErrorKind::Spawn => "spawn",
            ErrorKind::ContainerNotFound => "container-not-found",
            ErrorKind::PodNotFound => "pod-not-found",
            ErrorKind::NotReady => "not-ready",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NonZeroExit => "non-zero-exit",
            ErrorKind::Io => "io",
            ErrorKind::Parse => "parse",
            ErrorKind::Unavailable => "unavailable",
        }
    }
}

/// A failure with its kind and execution context.
#[derive(Error, Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    /// Dotted identifier of the target involved, when known.
    pub target: Option<String>,
    /// One-line summary of the command that failed, when applicable.
    pub command: Option<String>,
    pub duration: Option<Duration>,
    /// Which attempt this was (1-based) when the retry middleware ran.
    pub attempt: Option<u32>,
    /// Remote exit code, for `NonZeroExit`.
    pub exit_code: Option<i32>,
    /// The full result, when the command ran to completion but failed.
    pub result: Option<Box<ExecResult>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            target: None,
            command: None,
            duration: None,
            attempt: None,
            exit_code: None,
            result: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Config, message)
    }

    pub fn cancelled() -> Self {
        Error::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn timeout(limit: Duration) -> Self {
        Error::new(
            ErrorKind::Timeout,
            format!("timed out after {}", humantime::format_duration(limit)),
        )
    }

    pub fn non_zero(result: ExecResult) -> Self {
        let code = result.exit_code.unwrap_or(-1);
        let mut err = Error::new(
            ErrorKind::NonZeroExit,
            format!("command exited with status {code}"),
        );
        err.exit_code = result.exit_code;
        err.target = Some(result.target.clone());
        err.result = Some(Box::new(result));
        err
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_command(mut self, summary: impl Into<String>) -> Self {
        self.command = Some(summary.into());
        self
    }

    /// Suggestion line keyed off (kind, exit code), shown under the context
    /// block.
    fn suggestion(&self) -> Option<String> {
        match (self.kind, self.exit_code) {
            (ErrorKind::NonZeroExit, Some(127)) => self.command.as_ref().map(|c| {
                let word = c.split_whitespace().next().unwrap_or(c);
                format!("command not found; try `which {word}` on the target")
            }),
            (ErrorKind::NonZeroExit, Some(126)) => {
                Some("command found but not executable; check permissions".to_string())
            }
            (ErrorKind::HostKey, _) => {
                Some("host key unknown or changed; verify the host and update known_hosts, or set known_hosts: accept-new".to_string())
            }
            (ErrorKind::Auth, _) => {
                Some("check the key path, agent socket, or the referenced secret".to_string())
            }
            (ErrorKind::Unavailable, _) => {
                Some("is the daemon/cluster running and reachable?".to_string())
            }
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.label(), self.message)?;
        if let Some(ref target) = self.target {
            write!(f, "\n  target: {target}")?;
        }
        if let Some(ref command) = self.command {
            write!(f, "\n  command: {command}")?;
        }
        if let Some(duration) = self.duration {
            write!(f, "\n  duration: {}", humantime::format_duration(duration))?;
        }
        if let Some(attempt) = self.attempt {
            if attempt > 1 {
                write!(f, "\n  attempt: {attempt}")?;
            }
        }
        if let Some(suggestion) = self.suggestion() {
            write!(f, "\n  hint: {suggestion}")?;
        }
        Ok(())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::new(ErrorKind::Io, e.to_string())
    }
}

impl From<hop_expr::ParseError> for Error {
    fn from(e: hop_expr::ParseError) -> Self {
        Error::config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::new(ErrorKind::Parse, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_documented_table() {
        assert_eq!(ErrorKind::Config.exit_code(), 2);
        assert_eq!(ErrorKind::TargetNotFound.exit_code(), 3);
        assert_eq!(ErrorKind::Auth.exit_code(), 4);
        assert_eq!(ErrorKind::Unavailable.exit_code(), 5);
        assert_eq!(ErrorKind::Timeout.exit_code(), 124);
        assert_eq!(ErrorKind::Cancelled.exit_code(), 130);
        assert_eq!(ErrorKind::NonZeroExit.exit_code(), 1);
    }

    #[test]
    fn retriable_defaults() {
        assert!(ErrorKind::Connect.retriable());
        assert!(ErrorKind::Transport.retriable());
        assert!(ErrorKind::Unavailable.retriable());
        assert!(!ErrorKind::NonZeroExit.retriable());
        assert!(!ErrorKind::Auth.retriable());
        assert!(!ErrorKind::Cancelled.retriable());
    }

    #[test]
    fn display_includes_context_lines() {
        let mut err = Error::new(ErrorKind::NonZeroExit, "command exited with status 127")
            .with_target("hosts.web-1")
            .with_command("deploytool --now");
        err.exit_code = Some(127);
        let rendered = err.to_string();
        assert!(rendered.starts_with("[non-zero-exit]"));
        assert!(rendered.contains("target: hosts.web-1"));
        assert!(rendered.contains("which deploytool"));
    }
}
