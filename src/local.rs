//! Local adapter: spawn child processes on this host.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command as TokioCommand};
use tracing::{debug, warn};

use crate::command::{Command, ExitDetails, Shell, StdinSource};
use crate::error::{Error, ErrorKind};
use crate::stream::SinkSet;

/// Grace window between SIGTERM and SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct LocalAdapter;

impl LocalAdapter {
    /// Spawn the command, wire its stdio to the sinks, honor timeout and
    /// cancellation, and report how it exited.
    pub async fn execute(&self, cmd: &Command, sinks: &SinkSet) -> Result<ExitDetails, Error> {
        let mut builder = self.build(cmd)?;
        builder
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = builder.spawn().map_err(|e| spawn_error(cmd, &e))?;

        if let Some(source) = cmd.stdin.clone() {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = tokio::spawn(async move {
                    let result = match source {
                        StdinSource::Inline(bytes) => stdin.write_all(&bytes).await,
                        StdinSource::File(path) => match tokio::fs::File::open(&path).await {
                            Ok(mut file) => tokio::io::copy(&mut file, &mut stdin)
                                .await
                                .map(|_| ()),
                            Err(e) => Err(e),
                        },
                    };
                    if let Err(e) = result {
                        debug!(error = %e, "stdin write ended early");
                    }
                    // dropping the handle closes the child's stdin
                });
            }
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_pump = {
            let sink = sinks.stdout.clone();
            tokio::spawn(async move {
                if let Some(reader) = stdout {
                    let _ = sink.pump(reader).await;
                }
            })
        };
        let err_pump = {
            let sink = sinks.stderr.clone();
            tokio::spawn(async move {
                if let Some(reader) = stderr {
                    let _ = sink.pump(reader).await;
                }
            })
        };

        let timeout = cmd.effective_timeout();
        // the wait future borrows the child, so arms only mark what
        // happened; termination runs after the select releases the borrow
        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status.map_err(Error::from)?),
            _ = sinks.closed().cancelled() => Waited::Cancelled,
            _ = sleep_or_forever(timeout) => Waited::TimedOut,
        };

        let status = match waited {
            Waited::Exited(status) => status,
            Waited::Cancelled => {
                terminate(&mut child).await;
                let _ = out_pump.await;
                let _ = err_pump.await;
                return Err(Error::cancelled());
            }
            Waited::TimedOut => {
                terminate(&mut child).await;
                let _ = out_pump.await;
                let _ = err_pump.await;
                return Err(Error::timeout(timeout.unwrap_or_default()));
            }
        };

        let _ = out_pump.await;
        let _ = err_pump.await;

        Ok(exit_details(status))
    }

    fn build(&self, cmd: &Command) -> Result<TokioCommand, Error> {
        let mut builder = match &cmd.shell {
            Some(shell) => {
                let program = match shell {
                    Shell::Default => "sh".to_string(),
                    Shell::Program(p) => p.clone(),
                };
                let line = cmd.argv.join(" ");
                let mut b = TokioCommand::new(program);
                let _ = b.arg("-c").arg(line);
                b
            }
            None => {
                let Some((program, rest)) = cmd.argv.split_first() else {
                    return Err(Error::new(ErrorKind::Spawn, "empty argv"));
                };
                let mut b = TokioCommand::new(program);
                let _ = b.args(rest);
                b
            }
        };

        if cmd.env.replace {
            let _ = builder.env_clear();
        }
        let _ = builder.envs(&cmd.env.vars);

        if let Some(ref cwd) = cmd.cwd {
            let _ = builder.current_dir(cwd);
        }

        if let Some(ref user) = cmd.user {
            let (uid, gid) = parse_uid_gid(user)?;
            let _ = builder.uid(uid);
            if let Some(gid) = gid {
                let _ = builder.gid(gid);
            }
        }

        Ok(builder)
    }
}

/// Numeric `uid` or `uid:gid`; symbolic names are rejected at config load.
pub fn parse_uid_gid(user: &str) -> Result<(u32, Option<u32>), Error> {
    let (uid_str, gid_str) = match user.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (user, None),
    };
    let uid = uid_str.parse::<u32>().map_err(|_| {
        Error::config(format!(
            "local user must be numeric uid[:gid], got '{user}'"
        ))
    })?;
    let gid = gid_str
        .map(|g| {
            g.parse::<u32>().map_err(|_| {
                Error::config(format!(
                    "local user must be numeric uid[:gid], got '{user}'"
                ))
            })
        })
        .transpose()?;
    Ok((uid, gid))
}

enum Waited {
    Exited(std::process::ExitStatus),
    Cancelled,
    TimedOut,
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

/// SIGTERM, then SIGKILL after the grace window.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        tokio::select! {
            _ = child.wait() => return,
            _ = tokio::time::sleep(TERM_GRACE) => {}
        }
    }
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill child process");
    }
    let _ = child.wait().await;
}

fn spawn_error(cmd: &Command, e: &std::io::Error) -> Error {
    let kind = match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => ErrorKind::Spawn,
        _ => ErrorKind::Io,
    };
    Error::new(kind, format!("failed to spawn: {e}")).with_command(cmd.summary())
}

fn exit_details(status: std::process::ExitStatus) -> ExitDetails {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => ExitDetails::code(code),
        None => ExitDetails {
            exit_code: None,
            signal: status
                .signal()
                .map(|n| match Signal::try_from(n) {
                    Ok(sig) => sig.as_str().to_string(),
                    Err(_) => format!("signal {n}"),
                }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::IoMode;
    use crate::stream::{SinkSet, StreamOpts};
    use tokio_util::sync::CancellationToken;

    fn sinks() -> (SinkSet, CancellationToken) {
        let ctx = CancellationToken::new();
        let sinks = SinkSet::new(&StreamOpts::new(IoMode::Capture, "test"), &ctx);
        (sinks, ctx)
    }

    #[tokio::test]
    async fn captures_echo_output() {
        let adapter = LocalAdapter;
        let (sinks, _ctx) = sinks();
        let cmd = Command::new(["echo", "hello"]);
        let status = adapter.execute(&cmd, &sinks).await.unwrap();
        assert_eq!(status, ExitDetails::code(0));
        let captured = sinks.finish().await;
        assert_eq!(&captured.stdout[..], b"hello\n");
        assert!(captured.stderr.is_empty());
    }

    #[tokio::test]
    async fn shell_mode_expands_variables() {
        let adapter = LocalAdapter;
        let (sinks, _ctx) = sinks();
        let cmd = Command::shell("echo $GREETING").with_env("GREETING", "hi");
        let status = adapter.execute(&cmd, &sinks).await.unwrap();
        assert_eq!(status.exit_code, Some(0));
        let captured = sinks.finish().await;
        assert_eq!(&captured.stdout[..], b"hi\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_normal_status() {
        let adapter = LocalAdapter;
        let (sinks, _ctx) = sinks();
        let cmd = Command::shell("exit 42");
        let status = adapter.execute(&cmd, &sinks).await.unwrap();
        assert_eq!(status.exit_code, Some(42));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let adapter = LocalAdapter;
        let (sinks, _ctx) = sinks();
        let cmd = Command::new(["definitely-not-a-real-binary-necessarily"]);
        let err = adapter.execute(&cmd, &sinks).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Spawn);
    }

    #[tokio::test]
    async fn stdin_bytes_reach_the_child() {
        let adapter = LocalAdapter;
        let (sinks, _ctx) = sinks();
        let cmd = Command::new(["cat"])
            .with_stdin(StdinSource::Inline(bytes::Bytes::from_static(b"piped")));
        let status = adapter.execute(&cmd, &sinks).await.unwrap();
        assert_eq!(status.exit_code, Some(0));
        let captured = sinks.finish().await;
        assert_eq!(&captured.stdout[..], b"piped");
    }

    #[tokio::test]
    async fn timeout_terminates_within_grace() {
        let adapter = LocalAdapter;
        let (sinks, _ctx) = sinks();
        let cmd = Command::shell("sleep 10").with_timeout(Duration::from_millis(200));
        let start = std::time::Instant::now();
        let err = adapter.execute(&cmd, &sinks).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(start.elapsed() < Duration::from_millis(200) + TERM_GRACE + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn cancellation_terminates_the_child() {
        let adapter = LocalAdapter;
        let (sinks, ctx) = sinks();
        let cmd = Command::shell("sleep 10");
        let cancel = tokio::spawn({
            let ctx = ctx.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                ctx.cancel();
            }
        });
        let err = adapter.execute(&cmd, &sinks).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        cancel.await.unwrap();
    }

    #[test]
    fn uid_gid_parsing() {
        assert_eq!(parse_uid_gid("1000").unwrap(), (1000, None));
        assert_eq!(parse_uid_gid("1000:100").unwrap(), (1000, Some(100)));
        assert!(parse_uid_gid("deploy").is_err());
    }
}
