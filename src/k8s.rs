//! Kubernetes adapter: exec into pods over the cluster API.
//!
//! The client honors a kubeconfig file and context. Pod selection supports
//! exact names, label selectors (with first/random/newest pick strategies)
//! and field selectors. Exec rides a websocket-upgraded channel; the exit
//! status is read from the final status frame. Port-forwards bridge a
//! local TCP listener onto per-connection forward streams; log streaming
//! is independent of exec.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, LogParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::response::{Status, StatusSummary};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Client, Config};
use shell_escape::escape;
use futures::{AsyncBufReadExt as _, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{Command, ExitDetails, StdinSource};
use crate::config::PodPick;
use crate::error::{Error, ErrorKind};
use crate::stream::SinkSet;

/// A fully resolved pod target.
#[derive(Debug, Clone)]
pub struct K8sTargetConfig {
    pub id: String,
    pub namespace: String,
    pub pod: Option<String>,
    pub selector: Option<String>,
    pub field_selector: Option<String>,
    pub pick: PodPick,
    pub container: Option<String>,
    pub context: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub wait_ready: Option<Duration>,
}

pub struct K8sAdapter {
    client: Client,
    namespace: String,
}

impl K8sAdapter {
    pub async fn connect(target: &K8sTargetConfig) -> Result<Self, Error> {
        let config = if let Some(ref path) = target.kubeconfig {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::config(format!("kubeconfig {}: {e}", path.display())))?;
            let options = KubeConfigOptions {
                context: target.context.clone(),
                ..Default::default()
            };
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| Error::config(format!("kubeconfig: {e}")))?
        } else if let Some(ref context) = target.context {
            let kubeconfig = Kubeconfig::read()
                .map_err(|e| Error::config(format!("kubeconfig: {e}")))?;
            let options = KubeConfigOptions {
                context: Some(context.clone()),
                ..Default::default()
            };
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| Error::config(format!("kubeconfig: {e}")))?
        } else {
            Config::infer().await.map_err(|e| {
                Error::new(ErrorKind::Unavailable, format!("cluster config: {e}"))
            })?
        };

        let client = Client::try_from(config)
            .map_err(|e| Error::new(ErrorKind::Unavailable, format!("cluster client: {e}")))?;

        Ok(K8sAdapter {
            client,
            namespace: target.namespace.clone(),
        })
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Resolve the target to one pod name.
    pub async fn select_pod(&self, target: &K8sTargetConfig) -> Result<String, Error> {
        if let Some(ref name) = target.pod {
            return Ok(name.clone());
        }

        let mut params = ListParams::default();
        if let Some(ref selector) = target.selector {
            params = params.labels(selector);
        }
        if let Some(ref fields) = target.field_selector {
            params = params.fields(fields);
        }
        if target.selector.is_none() && target.field_selector.is_none() {
            return Err(Error::config(format!(
                "target '{}' has neither a pod name nor a selector",
                target.id
            )));
        }

        let list = self.pods().list(&params).await.map_err(map_kube_error)?;
        let mut names: Vec<(String, Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Time>)> =
            list.items
                .iter()
                .filter_map(|pod| {
                    pod.metadata
                        .name
                        .clone()
                        .map(|n| (n, pod.metadata.creation_timestamp.clone()))
                })
                .collect();

        if names.is_empty() {
            return Err(Error::new(
                ErrorKind::PodNotFound,
                format!("no pods match selector for target '{}'", target.id),
            ));
        }

        names.sort_by(|a, b| a.0.cmp(&b.0));
        let chosen = match target.pick {
            PodPick::First => names.remove(0),
            PodPick::Random => names.remove(fastrand::usize(..names.len())),
            PodPick::Newest => {
                names.sort_by(|a, b| a.1.cmp(&b.1));
                names.pop().expect("non-empty list")
            }
        };
        debug!(pod = %chosen.0, "selected pod");
        Ok(chosen.0)
    }

    /// Wait for the pod to reach Running.
    pub async fn wait_running(&self, pod: &str, limit: Duration) -> Result<(), Error> {
        let cond = await_condition(self.pods(), pod, conditions::is_pod_running());
        match tokio::time::timeout(limit, cond).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::new(
                ErrorKind::NotReady,
                format!("waiting for pod '{pod}': {e}"),
            )),
            Err(_) => Err(Error::new(
                ErrorKind::NotReady,
                format!(
                    "pod '{pod}' not running after {}",
                    humantime::format_duration(limit)
                ),
            )),
        }
    }

    pub async fn execute(
        &self,
        target: &K8sTargetConfig,
        cmd: &Command,
        sinks: &SinkSet,
    ) -> Result<ExitDetails, Error> {
        let pod = self.select_pod(target).await?;
        if let Some(limit) = target.wait_ready {
            self.wait_running(&pod, limit).await?;
        }
        if cmd.user.is_some() {
            warn!(target = %target.id, "the exec API has no user option; ignoring");
        }

        let argv = exec_argv(cmd);
        debug!(pod = %pod, argv = ?argv, "opening exec channel");

        let mut params = kube::api::AttachParams::default()
            .stdin(cmd.stdin.is_some())
            .stdout(true)
            .stderr(true);
        if let Some(ref container) = target.container {
            params = params.container(container);
        }

        let mut attached = self
            .pods()
            .exec(&pod, argv, &params)
            .await
            .map_err(map_kube_error)?;

        if let Some(source) = cmd.stdin.clone() {
            if let Some(mut stdin) = attached.stdin() {
                let _ = tokio::spawn(async move {
                    let payload = match source {
                        StdinSource::Inline(bytes) => bytes,
                        StdinSource::File(path) => match tokio::fs::read(&path).await {
                            Ok(data) => bytes::Bytes::from(data),
                            Err(e) => {
                                warn!(path = %path.display(), error = %e, "cannot read stdin file");
                                return;
                            }
                        },
                    };
                    let _ = stdin.write_all(&payload).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let out_sink = sinks.stdout.clone();
        let err_sink = sinks.stderr.clone();
        let out_pump = tokio::spawn(async move {
            if let Some(reader) = stdout {
                let _ = out_sink.pump(reader).await;
            }
        });
        let err_pump = tokio::spawn(async move {
            if let Some(reader) = stderr {
                let _ = err_sink.pump(reader).await;
            }
        });

        let status_future = attached.take_status();
        let timeout = cmd.effective_timeout();

        let status = tokio::select! {
            status = async {
                match status_future {
                    Some(fut) => fut.await,
                    None => None,
                }
            } => status,
            _ = sinks.closed().cancelled() => {
                // dropping the attached process closes the channel and the
                // remote exec with it
                out_pump.abort();
                err_pump.abort();
                return Err(Error::cancelled());
            }
            _ = sleep_or_forever(timeout) => {
                out_pump.abort();
                err_pump.abort();
                return Err(Error::timeout(timeout.unwrap_or_default()));
            }
        };

        let _ = out_pump.await;
        let _ = err_pump.await;
        let _ = attached.join().await;

        let status = status.and_then(|raw| {
            serde_json::to_value(&raw)
                .ok()
                .and_then(|v| serde_json::from_value::<Status>(v).ok())
        });
        exit_from_status(status)
    }

    /// Follow or dump pod logs into the stdout sink.
    pub async fn stream_logs(
        &self,
        target: &K8sTargetConfig,
        follow: bool,
        tail: Option<i64>,
        timestamps: bool,
        sinks: &SinkSet,
    ) -> Result<(), Error> {
        let pod = self.select_pod(target).await?;
        let params = LogParams {
            container: target.container.clone(),
            follow,
            tail_lines: tail,
            timestamps,
            ..Default::default()
        };
        let stream = self
            .pods()
            .log_stream(&pod, &params)
            .await
            .map_err(map_kube_error)?;

        let mut lines = stream.lines();
        loop {
            tokio::select! {
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        sinks.stdout.write(line.as_bytes()).await;
                        sinks.stdout.write(b"\n").await;
                    }
                    None => break,
                    Some(Err(e)) => return Err(Error::new(ErrorKind::Io, format!("log stream: {e}"))),
                },
                _ = sinks.closed().cancelled() => break,
            }
        }
        Ok(())
    }

    /// Forward a local port to a pod port. Each accepted connection opens
    /// its own forward stream; the listener runs until the guard is
    /// stopped.
    pub async fn port_forward(
        &self,
        target: &K8sTargetConfig,
        local_port: u16,
        remote_port: u16,
    ) -> Result<ForwardGuard, Error> {
        let pod = self.select_pod(target).await?;
        let addr: SocketAddr = ([127, 0, 0, 1], local_port).into();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::Io, format!("bind {addr}: {e}")))?;
        let bound = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::Io, e.to_string()))?;

        info!(pod = %pod, local = %bound, remote_port, "port-forward established");

        let stop = CancellationToken::new();
        let pods = self.pods();
        let task_stop = stop.clone();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = task_stop.cancelled() => break,
                };
                let Ok((mut conn, peer)) = accepted else { break };
                debug!(peer = %peer, "forward connection accepted");

                let pods = pods.clone();
                let pod = pod.clone();
                let conn_stop = task_stop.clone();
                let _ = tokio::spawn(async move {
                    let mut forwarder = match pods.portforward(&pod, &[remote_port]).await {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(error = %e, "port-forward stream failed");
                            return;
                        }
                    };
                    let Some(mut upstream) = forwarder.take_stream(remote_port) else {
                        warn!("forwarder returned no stream");
                        return;
                    };
                    tokio::select! {
                        result = tokio::io::copy_bidirectional(&mut conn, &mut upstream) => {
                            if let Err(e) = result {
                                debug!(error = %e, "forward connection ended");
                            }
                        }
                        _ = conn_stop.cancelled() => {}
                    }
                });
            }
        });

        Ok(ForwardGuard {
            local_addr: bound,
            stop,
            task,
        })
    }
}

/// A running port-forward; dropping or stopping it closes the listener.
pub struct ForwardGuard {
    pub local_addr: SocketAddr,
    stop: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ForwardGuard {
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ForwardGuard {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn exec_argv(cmd: &Command) -> Vec<String> {
    let base = if cmd.shell.is_some() {
        cmd.argv.join(" ")
    } else if cmd.env.vars.is_empty() && cmd.cwd.is_none() {
        return cmd.argv.clone();
    } else {
        cmd.argv
            .iter()
            .map(|a| escape(a.as_str().into()).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    };

    // the exec API has no env or cwd options; inject them through a shell
    let with_cwd = match &cmd.cwd {
        Some(dir) => format!("cd {} && {}", escape(dir.as_str().into()), base),
        None => base,
    };
    let with_env = if cmd.env.vars.is_empty() {
        with_cwd
    } else {
        let exports: Vec<String> = cmd
            .env
            .vars
            .iter()
            .map(|(k, v)| format!("export {}={}", k, escape(v.as_str().into())))
            .collect();
        format!("{} && {}", exports.join(" && "), with_cwd)
    };

    vec![cmd.shell_program(), "-c".to_string(), with_env]
}

/// The exec channel reports the outcome in a final Status frame; a missing
/// frame after clean close means success.
fn exit_from_status(status: Option<Status>) -> Result<ExitDetails, Error> {
    let Some(status) = status else {
        return Ok(ExitDetails::code(0));
    };

    if status.status == Some(StatusSummary::Success) {
        return Ok(ExitDetails::code(0));
    }

    if status.reason == "NonZeroExitCode" {
        if let Some(details) = &status.details {
            for cause in &details.causes {
                if cause.reason == "ExitCode" {
                    if let Ok(code) = cause.message.trim().parse::<i32>() {
                        return Ok(ExitDetails::code(code));
                    }
                }
            }
        }
        return Ok(ExitDetails::code(1));
    }

    Err(Error::new(
        ErrorKind::Transport,
        if status.message.is_empty() {
            "exec channel closed with an unknown failure".to_string()
        } else {
            status.message.clone()
        },
    ))
}

fn map_kube_error(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(response) => {
            let kind = match response.code {
                404 => ErrorKind::PodNotFound,
                401 | 403 => ErrorKind::Auth,
                _ => ErrorKind::Transport,
            };
            Error::new(kind, response.message)
        }
        other => {
            let text = other.to_string();
            let lower = text.to_lowercase();
            if lower.contains("connect") || lower.contains("dns") || lower.contains("timed out") {
                Error::new(ErrorKind::Unavailable, format!("cluster: {text}"))
            } else {
                Error::new(ErrorKind::Transport, format!("cluster: {text}"))
            }
        }
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::response::{StatusCause, StatusDetails, StatusSummary};

    #[test]
    fn plain_argv_passes_through() {
        let cmd = Command::new(["ls", "-la"]);
        assert_eq!(exec_argv(&cmd), vec!["ls", "-la"]);
    }

    #[test]
    fn env_and_cwd_are_shell_injected() {
        let cmd = Command::new(["printenv", "K"])
            .with_env("K", "v")
            .with_cwd("/app");
        let argv = exec_argv(&cmd);
        assert_eq!(argv[0], "sh");
        assert_eq!(argv[1], "-c");
        assert!(argv[2].contains("export K=v"));
        assert!(argv[2].contains("cd /app"));
    }

    #[test]
    fn missing_status_frame_is_success() {
        assert_eq!(exit_from_status(None).unwrap(), ExitDetails::code(0));
    }

    #[test]
    fn success_status_is_exit_zero() {
        let status = Status {
            status: Some(StatusSummary::Success),
            ..Default::default()
        };
        assert_eq!(exit_from_status(Some(status)).unwrap(), ExitDetails::code(0));
    }

    #[test]
    fn non_zero_exit_code_is_parsed_from_causes() {
        let status = Status {
            status: Some(StatusSummary::Failure),
            reason: "NonZeroExitCode".to_string(),
            details: Some(StatusDetails {
                causes: vec![StatusCause {
                    reason: "ExitCode".to_string(),
                    message: "42".to_string(),
                    field: String::new(),
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            exit_from_status(Some(status)).unwrap(),
            ExitDetails::code(42)
        );
    }

    #[test]
    fn other_failures_are_transport_errors() {
        let status = Status {
            status: Some(StatusSummary::Failure),
            message: "container not found".to_string(),
            ..Default::default()
        };
        let err = exit_from_status(Some(status)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transport);
    }
}
