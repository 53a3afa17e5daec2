//! Execution engine: the single entry point for running a command against
//! any target.
//!
//! Middleware order: timeout computation, retry loop, `${...}` scope
//! interpolation, stream routing, adapter dispatch, audit. Adapters produce
//! errors from the closed kind set; the engine enriches them with target
//! and command context but never changes the kind.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::{AuditLog, AuditRecord};
use crate::command::{Command, ExecResult};
use crate::config::BackoffKind;
use crate::error::{Error, ErrorKind};
use crate::registry::{Binding, BoundTarget, TargetRegistry};
use crate::stream::{ForwardTo, SinkSet, StreamOpts};

/// Engine-level retry policy. `NonZeroExit` is never retried unless listed
/// explicitly in `retry_on`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub backoff: BackoffKind,
    /// Kinds to retry; empty means each kind's default retriability.
    pub retry_on: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 1,
            initial_delay: Duration::from_secs(1),
            backoff: BackoffKind::None,
            retry_on: HashSet::new(),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffKind::None => self.initial_delay,
            BackoffKind::Linear => self.initial_delay * attempt,
            BackoffKind::Exponential => {
                self.initial_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
            }
        }
    }

    fn should_retry(&self, kind: ErrorKind) -> bool {
        if kind == ErrorKind::Cancelled {
            return false;
        }
        if self.retry_on.is_empty() {
            kind.retriable()
        } else {
            self.retry_on.contains(&kind)
        }
    }
}

/// Per-call options beyond the command itself.
#[derive(Default)]
pub struct ExecOptions<'a> {
    pub retry: RetryPolicy,
    /// Scope for `${...}` interpolation of argv, env values and cwd.
    pub scope: Option<&'a dyn hop_expr::Scope>,
    /// Where streamed output goes (console unless redirected).
    pub forward: ForwardTo,
    /// Label for console line prefixes (step or task name).
    pub label: Option<String>,
    /// Additional ceiling on the effective timeout (task-level).
    pub timeout_cap: Option<Duration>,
}

pub struct Engine {
    registry: Arc<TargetRegistry>,
    audit: Option<AuditLog>,
}

impl Engine {
    pub fn new(registry: Arc<TargetRegistry>, audit: Option<AuditLog>) -> Self {
        Engine { registry, audit }
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    /// Execute with default options.
    pub async fn execute(
        &self,
        ctx: &CancellationToken,
        target: &str,
        cmd: &Command,
    ) -> Result<ExecResult, Error> {
        self.execute_with(ctx, target, cmd, &ExecOptions::default())
            .await
    }

    pub async fn execute_with(
        &self,
        ctx: &CancellationToken,
        target: &str,
        cmd: &Command,
        opts: &ExecOptions<'_>,
    ) -> Result<ExecResult, Error> {
        let bound = self.registry.resolve(target).await.map_err(|e| {
            let mut e = e;
            if e.target.is_none() {
                e.target = Some(target.to_string());
            }
            e
        })?;

        let prepared = self.prepare(&bound, cmd, opts)?;

        let mut last_error: Option<Error> = None;
        for attempt in 1..=opts.retry.attempts.max(1) {
            if ctx.is_cancelled() {
                return Err(Error::cancelled()
                    .with_target(bound.id.clone())
                    .with_command(prepared.summary()));
            }
            if attempt > 1 {
                let delay = opts.retry.delay_for(attempt - 1);
                warn!(
                    target = %bound.id,
                    attempt,
                    delay = %humantime::format_duration(delay),
                    "retrying command"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancelled() => return Err(Error::cancelled()),
                }
            }

            match self.run_once(ctx, &bound, &prepared, opts, attempt).await {
                Ok(result) => {
                    if result.failed() && prepared.check {
                        let mut err = Error::non_zero(result);
                        err.attempt = Some(attempt);
                        err.command = Some(prepared.summary());
                        if attempt < opts.retry.attempts
                            && opts.retry.retry_on.contains(&ErrorKind::NonZeroExit)
                        {
                            last_error = Some(err);
                            continue;
                        }
                        self.audit_failure(&bound.id, &err).await;
                        return Err(err);
                    }
                    self.audit_result(&bound.id, &result).await;
                    return Ok(result);
                }
                Err(mut err) => {
                    if err.target.is_none() {
                        err.target = Some(bound.id.clone());
                    }
                    if err.command.is_none() {
                        err.command = Some(prepared.summary());
                    }
                    err.attempt = Some(attempt);
                    if attempt < opts.retry.attempts && opts.retry.should_retry(err.kind) {
                        last_error = Some(err);
                        continue;
                    }
                    self.audit_failure(&bound.id, &err).await;
                    return Err(err);
                }
            }
        }

        // the loop always returns on the final attempt; retries never
        // swallow the most recent error
        let err = last_error.unwrap_or_else(|| Error::new(ErrorKind::Io, "no attempts executed"));
        self.audit_failure(&bound.id, &err).await;
        Err(err)
    }

    /// Apply interpolation, env layering and the effective timeout.
    fn prepare(
        &self,
        bound: &BoundTarget,
        cmd: &Command,
        opts: &ExecOptions<'_>,
    ) -> Result<Command, Error> {
        let mut prepared = cmd.clone();

        if let Some(scope) = opts.scope {
            for arg in &mut prepared.argv {
                *arg = hop_expr::interpolate(arg, scope)?;
            }
            for value in prepared.env.vars.values_mut() {
                *value = hop_expr::interpolate(value, scope)?;
            }
            if let Some(cwd) = prepared.cwd.take() {
                prepared.cwd = Some(hop_expr::interpolate(&cwd, scope)?);
            }
        }

        // target env underlays the command's own overlay
        let mut env = bound.settings.env.clone();
        env.extend(prepared.env.vars.drain());
        prepared.env.vars = env;

        // effective timeout: the smallest configured ceiling wins
        let ceilings = [
            prepared.effective_timeout(),
            bound.settings.timeout,
            opts.timeout_cap,
        ];
        prepared.timeout = ceilings.into_iter().flatten().min();

        Ok(prepared)
    }

    async fn run_once(
        &self,
        ctx: &CancellationToken,
        bound: &BoundTarget,
        cmd: &Command,
        opts: &ExecOptions<'_>,
        attempt: u32,
    ) -> Result<ExecResult, Error> {
        let label = opts.label.clone().unwrap_or_else(|| bound.id.clone());
        let stream_opts = StreamOpts::new(cmd.io_mode, label)
            .with_cap(bound.settings.output_cap)
            .with_forward(opts.forward.clone());
        let sinks = SinkSet::new(&stream_opts, ctx);

        info!(
            target = %bound.id,
            command = %cmd.summary(),
            attempt,
            "executing"
        );

        let started_at = SystemTime::now();
        let started = Instant::now();

        let outcome = match &bound.binding {
            Binding::Local(adapter) => adapter.execute(cmd, &sinks).await,
            Binding::Ssh(config) => {
                self.registry.ssh_adapter().execute(config, cmd, &sinks).await
            }
            Binding::Docker { adapter, config } => adapter.execute(config, cmd, &sinks).await,
            Binding::K8s { adapter, config } => adapter.execute(config, cmd, &sinks).await,
        };

        let duration = started.elapsed();
        let finished_at = SystemTime::now();

        let details = match outcome {
            Ok(details) => details,
            Err(mut e) => {
                e.duration = Some(duration);
                return Err(e);
            }
        };

        let captured = sinks.finish().await;
        Ok(ExecResult {
            exit_code: details.exit_code,
            signal: details.signal,
            stdout: captured.stdout,
            stderr: captured.stderr,
            truncated: captured.truncated,
            started_at,
            finished_at,
            duration,
            command: cmd.clone(),
            target: bound.id.clone(),
        })
    }

    async fn audit_result(&self, target: &str, result: &ExecResult) {
        if let Some(ref audit) = self.audit {
            let mut record = AuditRecord::new("exec", target, result.duration);
            record.user = result.command.user.clone();
            record.exit_code = result.exit_code;
            audit.append(&record).await;
        }
    }

    async fn audit_failure(&self, target: &str, err: &Error) {
        if let Some(ref audit) = self.audit {
            let mut record =
                AuditRecord::new("exec", target, err.duration.unwrap_or_default());
            record.exit_code = err.exit_code;
            record.error = Some(err.message.clone());
            audit.append(&record).await;
        }
    }

    /// Drain shared transport resources.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{IoMode, StreamKind};
    use crate::config::{Defaults, TargetsSection};
    use crate::secrets::StaticSecrets;
    use std::collections::BTreeMap;

    fn engine() -> Engine {
        let registry = TargetRegistry::new(
            TargetsSection::default(),
            Defaults::default(),
            Arc::new(StaticSecrets::default()),
        );
        Engine::new(Arc::new(registry), None)
    }

    #[tokio::test]
    async fn local_echo_end_to_end() {
        let engine = engine();
        let ctx = CancellationToken::new();
        let cmd = Command::new(["echo", "hello"]);
        let result = engine.execute(&ctx, "local", &cmd).await.unwrap();
        assert!(result.ok());
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(&result.stdout[..], b"hello\n");
        assert!(result.stderr.is_empty());
        assert_eq!(result.target, "local");
        assert!(result.finished_at >= result.started_at);
    }

    #[tokio::test]
    async fn env_round_trip() {
        let engine = engine();
        let ctx = CancellationToken::new();
        let cmd = Command::shell("echo $X").with_env("X", "v");
        let result = engine.execute(&ctx, "local", &cmd).await.unwrap();
        assert_eq!(&result.stdout[..], b"v\n");
    }

    #[tokio::test]
    async fn non_zero_exit_surfaces_as_error_with_code() {
        let engine = engine();
        let ctx = CancellationToken::new();
        let cmd = Command::new(["sh", "-c", "exit 42"]);
        let err = engine.execute(&ctx, "local", &cmd).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NonZeroExit);
        assert_eq!(err.exit_code, Some(42));
        assert!(err.result.is_some());
    }

    #[tokio::test]
    async fn nothrow_returns_a_normal_result() {
        let engine = engine();
        let ctx = CancellationToken::new();
        let cmd = Command::new(["sh", "-c", "exit 3"]).nothrow();
        let result = engine.execute(&ctx, "local", &cmd).await.unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert!(result.failed());
    }

    #[tokio::test]
    async fn interpolation_uses_the_scope() {
        let engine = engine();
        let ctx = CancellationToken::new();
        let mut scope = BTreeMap::new();
        let _ = scope.insert(
            "name".to_string(),
            hop_expr::Value::Str("world".to_string()),
        );
        let cmd = Command::new(["echo", "hello ${name}"]);
        let opts = ExecOptions {
            scope: Some(&scope),
            ..Default::default()
        };
        let result = engine
            .execute_with(&ctx, "local", &cmd, &opts)
            .await
            .unwrap();
        assert_eq!(&result.stdout[..], b"hello world\n");
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_failures() {
        let engine = engine();
        let ctx = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran-once");
        // first run creates the marker and exits 7; second run sees it and
        // succeeds
        let script = format!(
            "if [ -f {m} ]; then echo done; else touch {m}; exit 7; fi",
            m = marker.display()
        );
        let cmd = Command::shell(script);
        let opts = ExecOptions {
            retry: RetryPolicy {
                attempts: 3,
                initial_delay: Duration::from_millis(10),
                backoff: BackoffKind::None,
                retry_on: HashSet::from([ErrorKind::NonZeroExit]),
            },
            ..Default::default()
        };
        let result = engine
            .execute_with(&ctx, "local", &cmd, &opts)
            .await
            .unwrap();
        assert_eq!(result.lines(StreamKind::Stdout), vec!["done"]);
    }

    #[tokio::test]
    async fn retries_preserve_the_last_error() {
        let engine = engine();
        let ctx = CancellationToken::new();
        let cmd = Command::shell("exit 9");
        let opts = ExecOptions {
            retry: RetryPolicy {
                attempts: 2,
                initial_delay: Duration::from_millis(5),
                backoff: BackoffKind::None,
                retry_on: HashSet::from([ErrorKind::NonZeroExit]),
            },
            ..Default::default()
        };
        let err = engine
            .execute_with(&ctx, "local", &cmd, &opts)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NonZeroExit);
        assert_eq!(err.exit_code, Some(9));
        assert_eq!(err.attempt, Some(2));
    }

    #[tokio::test]
    async fn effective_timeout_takes_the_minimum() {
        let engine = engine();
        let ctx = CancellationToken::new();
        let cmd = Command::shell("sleep 5").with_timeout(Duration::from_secs(60));
        let opts = ExecOptions {
            timeout_cap: Some(Duration::from_millis(150)),
            ..Default::default()
        };
        let started = Instant::now();
        let err = engine
            .execute_with(&ctx, "local", &cmd, &opts)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn discard_mode_captures_nothing() {
        let engine = engine();
        let ctx = CancellationToken::new();
        let cmd = Command::new(["echo", "noisy"]).with_io_mode(IoMode::Discard);
        let result = engine.execute(&ctx, "local", &cmd).await.unwrap();
        assert!(result.stdout.is_empty());
    }

    #[tokio::test]
    async fn backoff_schedules() {
        let policy = RetryPolicy {
            attempts: 4,
            initial_delay: Duration::from_secs(1),
            backoff: BackoffKind::Exponential,
            retry_on: HashSet::new(),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));

        let linear = RetryPolicy {
            backoff: BackoffKind::Linear,
            ..policy
        };
        assert_eq!(linear.delay_for(3), Duration::from_secs(3));
    }
}
