//! Docker adapter: execute in containers via the daemon API.
//!
//! Three modes: `exec` into a running container, `run` a fresh container
//! from an image to completion, and `hybrid` (exec if the named container
//! is running, otherwise create it from the run spec and exec). File copy
//! rides the daemon's archive endpoints as tar streams.

use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    KillContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::service::{HealthConfig, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::{API_DEFAULT_VERSION, Docker};
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::command::{Command, ExitDetails, StdinSource};
use crate::config::{CreateSpec, RunMode};
use crate::error::{Error, ErrorKind};
use crate::stream::SinkSet;

/// A fully resolved container target.
#[derive(Debug, Clone)]
pub struct DockerTargetConfig {
    pub id: String,
    pub container: Option<String>,
    pub image: Option<String>,
    pub run_mode: RunMode,
    pub create: Option<CreateSpec>,
    pub wait_healthy: Option<Duration>,
    pub user: Option<String>,
}

pub struct DockerAdapter {
    docker: Docker,
}

impl DockerAdapter {
    /// Connect to the daemon: local socket by default, or an explicit
    /// `unix://` / `tcp://` / `http://` endpoint.
    pub async fn connect(host: Option<&str>) -> Result<Self, Error> {
        let docker = match host {
            None => Docker::connect_with_local_defaults(),
            Some(url) if url.starts_with("unix://") => Docker::connect_with_socket(
                url.trim_start_matches("unix://"),
                120,
                API_DEFAULT_VERSION,
            ),
            Some(url) => Docker::connect_with_http(url, 120, API_DEFAULT_VERSION),
        }
        .map_err(|e| Error::new(ErrorKind::Unavailable, format!("docker: {e}")))?;

        docker
            .ping()
            .await
            .map_err(|e| Error::new(ErrorKind::Unavailable, format!("docker daemon: {e}")))?;

        Ok(DockerAdapter { docker })
    }

    pub async fn execute(
        &self,
        target: &DockerTargetConfig,
        cmd: &Command,
        sinks: &SinkSet,
    ) -> Result<ExitDetails, Error> {
        match target.run_mode {
            RunMode::Exec => {
                let name = self.require_container(target)?;
                self.ensure_running(&name).await?;
                if let Some(limit) = target.wait_healthy {
                    self.wait_until_healthy(&name, limit).await?;
                }
                self.exec_in(target, &name, cmd, sinks).await
            }
            RunMode::Run => self.run_container(target, cmd, sinks).await,
            RunMode::Hybrid => {
                let name = self.require_container(target)?;
                match self.container_state(&name).await? {
                    ContainerState::Running => {
                        self.exec_in(target, &name, cmd, sinks).await
                    }
                    ContainerState::Stopped => {
                        info!(container = %name, "starting stopped container");
                        self.docker
                            .start_container(&name, None::<StartContainerOptions<String>>)
                            .await
                            .map_err(map_docker_error)?;
                        if let Some(limit) = target.wait_healthy {
                            self.wait_until_healthy(&name, limit).await?;
                        }
                        self.exec_in(target, &name, cmd, sinks).await
                    }
                    ContainerState::Missing => {
                        info!(container = %name, "creating container from run spec");
                        self.create_named(target, &name, None).await?;
                        self.docker
                            .start_container(&name, None::<StartContainerOptions<String>>)
                            .await
                            .map_err(map_docker_error)?;
                        if let Some(limit) = target.wait_healthy {
                            self.wait_until_healthy(&name, limit).await?;
                        }
                        self.exec_in(target, &name, cmd, sinks).await
                    }
                }
            }
        }
    }

    fn require_container<'a>(&self, target: &'a DockerTargetConfig) -> Result<&'a str, Error> {
        target.container.as_deref().ok_or_else(|| {
            Error::config(format!(
                "target '{}' has no container name for {} mode",
                target.id,
                match target.run_mode {
                    RunMode::Exec => "exec",
                    _ => "hybrid",
                }
            ))
        })
    }

    async fn ensure_running(&self, name: &str) -> Result<(), Error> {
        match self.container_state(name).await? {
            ContainerState::Running => Ok(()),
            ContainerState::Stopped => Err(Error::new(
                ErrorKind::NotReady,
                format!("container '{name}' exists but is not running"),
            )),
            ContainerState::Missing => Err(Error::new(
                ErrorKind::ContainerNotFound,
                format!("container '{name}' not found"),
            )),
        }
    }

    async fn container_state(&self, name: &str) -> Result<ContainerState, Error> {
        match self
            .docker
            .inspect_container(name, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
        {
            Ok(details) => {
                let running = details
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                Ok(if running {
                    ContainerState::Running
                } else {
                    ContainerState::Stopped
                })
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(ContainerState::Missing),
            Err(e) => Err(map_docker_error(e)),
        }
    }

    /// Create-exec / attach / start / poll-for-exit inside a running
    /// container.
    async fn exec_in(
        &self,
        target: &DockerTargetConfig,
        container: &str,
        cmd: &Command,
        sinks: &SinkSet,
    ) -> Result<ExitDetails, Error> {
        let argv = exec_argv(cmd);
        debug!(container = %container, argv = ?argv, "creating exec instance");

        let env: Vec<String> = cmd
            .env
            .vars
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let options = CreateExecOptions {
            cmd: Some(argv),
            env: if env.is_empty() { None } else { Some(env) },
            working_dir: cmd.cwd.clone(),
            user: cmd.user.clone().or_else(|| target.user.clone()),
            attach_stdin: Some(cmd.stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(container, options)
            .await
            .map_err(map_docker_error)?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(map_docker_error)?;

        let StartExecResults::Attached { mut output, mut input } = started else {
            return Err(Error::new(
                ErrorKind::Transport,
                "exec started detached unexpectedly",
            ));
        };

        if let Some(source) = cmd.stdin.clone() {
            let _ = tokio::spawn(async move {
                let payload: Bytes = match source {
                    StdinSource::Inline(bytes) => bytes,
                    StdinSource::File(path) => match tokio::fs::read(&path).await {
                        Ok(data) => Bytes::from(data),
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "cannot read stdin file");
                            return;
                        }
                    },
                };
                let _ = input.write_all(&payload).await;
                let _ = input.shutdown().await;
            });
        }

        let timeout = cmd.effective_timeout();
        let drain = async {
            while let Some(chunk) = output.next().await {
                match chunk.map_err(map_docker_error)? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        sinks.stdout.write(&message).await;
                    }
                    LogOutput::StdErr { message } => {
                        sinks.stderr.write(&message).await;
                    }
                    LogOutput::StdIn { .. } => {}
                }
            }
            Ok::<(), Error>(())
        };

        tokio::select! {
            result = drain => result?,
            _ = sinks.closed().cancelled() => return Err(Error::cancelled()),
            _ = sleep_or_forever(timeout) => {
                return Err(Error::timeout(timeout.unwrap_or_default()));
            }
        }

        // exec has no kill API; the exit code arrives via inspect once the
        // stream closes
        for _ in 0..50 {
            let inspect = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(map_docker_error)?;
            if inspect.running != Some(true) {
                return Ok(ExitDetails::code(
                    inspect.exit_code.unwrap_or(-1) as i32
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(Error::new(
            ErrorKind::Transport,
            "exec stream closed but the instance never reported an exit code",
        ))
    }

    /// `run` mode: fresh container from the image, stream logs until exit,
    /// optionally auto-remove.
    async fn run_container(
        &self,
        target: &DockerTargetConfig,
        cmd: &Command,
        sinks: &SinkSet,
    ) -> Result<ExitDetails, Error> {
        if cmd.stdin.is_some() {
            warn!(target = %target.id, "stdin is not forwarded in run mode");
        }
        let name = format!("hop-{}-{}", sanitize_name(&target.id), random_suffix());
        self.create_named(target, &name, Some(cmd)).await?;

        let auto_remove = target
            .create
            .as_ref()
            .and_then(|c| c.auto_remove)
            .unwrap_or(true);

        let result = self.run_to_completion(target, &name, cmd, sinks).await;

        if auto_remove {
            let _ = self
                .docker
                .remove_container(
                    &name,
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await;
        }

        result
    }

    async fn run_to_completion(
        &self,
        target: &DockerTargetConfig,
        name: &str,
        cmd: &Command,
        sinks: &SinkSet,
    ) -> Result<ExitDetails, Error> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_docker_error)?;

        let mut logs = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                tail: "all".to_string(),
                ..Default::default()
            }),
        );

        let mut wait = self
            .docker
            .wait_container(name, None::<WaitContainerOptions<String>>);

        let timeout = cmd.effective_timeout();
        let drain = async {
            while let Some(chunk) = logs.next().await {
                match chunk.map_err(map_docker_error)? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        sinks.stdout.write(&message).await;
                    }
                    LogOutput::StdErr { message } => {
                        sinks.stderr.write(&message).await;
                    }
                    LogOutput::StdIn { .. } => {}
                }
            }
            Ok::<(), Error>(())
        };

        let status = tokio::select! {
            (drained, status) = async { tokio::join!(drain, wait.next()) } => {
                drained?;
                status
            }
            _ = sinks.closed().cancelled() => {
                self.kill(name).await;
                return Err(Error::cancelled());
            }
            _ = sleep_or_forever(timeout) => {
                self.kill(name).await;
                return Err(Error::timeout(timeout.unwrap_or_default()));
            }
        };

        match status {
            Some(Ok(response)) => Ok(ExitDetails::code(response.status_code as i32)),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                Ok(ExitDetails::code(code as i32))
            }
            Some(Err(e)) => Err(map_docker_error(e)),
            None => Err(Error::new(
                ErrorKind::Transport,
                "container wait stream ended without a status",
            )),
        }
    }

    async fn kill(&self, name: &str) {
        if let Err(e) = self
            .docker
            .kill_container(name, None::<KillContainerOptions<String>>)
            .await
        {
            debug!(container = %name, error = %e, "kill after cancel failed");
        }
    }

    /// Create a container from the target's image and create spec, pulling
    /// the image when it is missing locally. `run` mode passes the command
    /// so the container executes it; `hybrid` leaves the image's default
    /// entrypoint in place and execs afterwards.
    async fn create_named(
        &self,
        target: &DockerTargetConfig,
        name: &str,
        command: Option<&Command>,
    ) -> Result<(), Error> {
        let image = target.image.as_deref().ok_or_else(|| {
            Error::config(format!("target '{}' has no image for run mode", target.id))
        })?;
        let config = build_container_config(target, image, command);

        let options = CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        };

        match self
            .docker
            .create_container(Some(options.clone()), config.clone())
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                self.pull_image(image).await?;
                let _ = self
                    .docker
                    .create_container(Some(options), config)
                    .await
                    .map_err(map_docker_error)?;
                Ok(())
            }
            Err(e) => Err(map_docker_error(e)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), Error> {
        info!(image = %image, "pulling image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(step) = pull.next().await {
            let _ = step.map_err(|e| {
                Error::new(ErrorKind::Unavailable, format!("pulling {image}: {e}"))
            })?;
        }
        Ok(())
    }

    /// Poll the container's healthcheck until healthy or the limit passes.
    /// Containers without a healthcheck pass as soon as they are running.
    pub async fn wait_until_healthy(&self, name: &str, limit: Duration) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let details = self
                .docker
                .inspect_container(name, None::<bollard::query_parameters::InspectContainerOptions>)
                .await
                .map_err(map_docker_error)?;
            let state = details.state.as_ref();
            let running = state.and_then(|s| s.running).unwrap_or(false);
            match state.and_then(|s| s.health.as_ref()).and_then(|h| h.status) {
                Some(bollard::service::HealthStatusEnum::HEALTHY) => return Ok(()),
                Some(bollard::service::HealthStatusEnum::UNHEALTHY) => {
                    return Err(Error::new(
                        ErrorKind::NotReady,
                        format!("container '{name}' is unhealthy"),
                    ));
                }
                // STARTING, NONE, or no healthcheck configured
                _ => {
                    if running && state.and_then(|s| s.health.as_ref()).is_none() {
                        return Ok(());
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::new(
                    ErrorKind::NotReady,
                    format!(
                        "container '{name}' not healthy after {}",
                        humantime::format_duration(limit)
                    ),
                ));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Follow or dump container logs into the sinks.
    pub async fn stream_logs(
        &self,
        target: &DockerTargetConfig,
        follow: bool,
        tail: Option<i64>,
        timestamps: bool,
        sinks: &SinkSet,
    ) -> Result<(), Error> {
        let name = target.container.as_deref().ok_or_else(|| {
            Error::config(format!("target '{}' has no container name for logs", target.id))
        })?;
        let mut logs = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                follow,
                stdout: true,
                stderr: true,
                timestamps,
                tail: tail.map(|t| t.to_string()).unwrap_or_else(|| "all".to_string()),
                ..Default::default()
            }),
        );
        loop {
            let chunk = tokio::select! {
                chunk = logs.next() => chunk,
                _ = sinks.closed().cancelled() => break,
            };
            let Some(chunk) = chunk else { break };
            match chunk.map_err(map_docker_error)? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    sinks.stdout.write(&message).await;
                }
                LogOutput::StdErr { message } => {
                    sinks.stderr.write(&message).await;
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(())
    }

    /// Upload a tar stream to a path inside the container.
    pub async fn upload_archive(
        &self,
        container: &str,
        path: &str,
        archive: Bytes,
    ) -> Result<(), Error> {
        self.docker
            .upload_to_container(
                container,
                Some(UploadToContainerOptions {
                    path: path.to_string(),
                    ..Default::default()
                }),
                bollard::docker::body_full(archive),
            )
            .await
            .map_err(map_docker_error)
    }

    /// Download a path inside the container as a tar archive.
    pub async fn download_archive(&self, container: &str, path: &str) -> Result<Bytes, Error> {
        let mut stream = self.docker.download_from_container(
            container,
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        );
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk.map_err(map_docker_error)?);
        }
        Ok(Bytes::from(archive))
    }

    /// Container name used for transfers: the configured one, required.
    pub fn transfer_container<'a>(
        &self,
        target: &'a DockerTargetConfig,
    ) -> Result<&'a str, Error> {
        target.container.as_deref().ok_or_else(|| {
            Error::config(format!(
                "target '{}' has no container name for copy",
                target.id
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerState {
    Running,
    Stopped,
    Missing,
}

fn exec_argv(cmd: &Command) -> Vec<String> {
    if cmd.shell.is_some() {
        vec![
            cmd.shell_program(),
            "-c".to_string(),
            cmd.argv.join(" "),
        ]
    } else {
        cmd.argv.clone()
    }
}

fn build_container_config(
    target: &DockerTargetConfig,
    image: &str,
    command: Option<&Command>,
) -> ContainerConfig<String> {
    let spec = target.create.clone().unwrap_or_default();

    let mut env: Vec<String> = spec
        .env
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    if let Some(cmd) = command {
        env.extend(cmd.env.vars.iter().map(|(k, v)| format!("{k}={v}")));
    }

    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for mapping in &spec.ports {
        if let Some((host, container)) = mapping.split_once(':') {
            let key = format!("{container}/tcp");
            let _ = exposed_ports.insert(key.clone(), HashMap::new());
            let _ = port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host.to_string()),
                }]),
            );
        } else {
            warn!(mapping = %mapping, "ignoring port mapping without ':'");
        }
    }

    let restart_policy = spec.restart.as_deref().map(|name| RestartPolicy {
        name: Some(match name {
            "always" => RestartPolicyNameEnum::ALWAYS,
            "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
            "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
            _ => RestartPolicyNameEnum::NO,
        }),
        ..Default::default()
    });

    let healthcheck = spec.healthcheck.as_ref().map(|h| HealthConfig {
        test: Some(h.test.clone()),
        interval: h.interval.map(|d| d.as_nanos() as i64),
        timeout: h.timeout.map(|d| d.as_nanos() as i64),
        retries: h.retries.map(i64::from),
        ..Default::default()
    });

    let host_config = HostConfig {
        binds: if spec.volumes.is_empty() {
            None
        } else {
            Some(spec.volumes.clone())
        },
        port_bindings: if port_bindings.is_empty() {
            None
        } else {
            Some(port_bindings)
        },
        memory: spec.memory,
        nano_cpus: spec.cpus.map(|c| (c * 1e9) as i64),
        network_mode: spec.network.clone(),
        restart_policy,
        ..Default::default()
    };

    ContainerConfig {
        image: Some(image.to_string()),
        cmd: command.map(exec_argv),
        working_dir: command.and_then(|c| c.cwd.clone()),
        env: if env.is_empty() { None } else { Some(env) },
        user: command
            .and_then(|c| c.user.clone())
            .or_else(|| target.user.clone()),
        exposed_ports: if exposed_ports.is_empty() {
            None
        } else {
            Some(exposed_ports)
        },
        healthcheck,
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn map_docker_error(e: bollard::errors::Error) -> Error {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => Error::new(ErrorKind::ContainerNotFound, message),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => Error::new(ErrorKind::NotReady, message),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message,
        } if message.contains("port is already allocated") => {
            Error::new(ErrorKind::Spawn, message)
        }
        bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message,
        } if message.contains("mounting") || message.contains("mount") => {
            Error::new(ErrorKind::Spawn, message)
        }
        other => {
            let text = other.to_string();
            let lower = text.to_lowercase();
            if lower.contains("connection refused")
                || lower.contains("no such file")
                || lower.contains("connect")
            {
                Error::new(ErrorKind::Unavailable, format!("docker daemon: {text}"))
            } else {
                Error::new(ErrorKind::Transport, format!("docker: {text}"))
            }
        }
    }
}

fn sanitize_name(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .to_lowercase()
}

fn random_suffix() -> String {
    (0..6)
        .map(|_| fastrand::alphanumeric())
        .collect::<String>()
        .to_lowercase()
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

    fn target_with(create: CreateSpec) -> DockerTargetConfig {
        DockerTargetConfig {
            id: "containers.app".to_string(),
            container: Some("app".to_string()),
            image: Some("nginx:alpine".to_string()),
            run_mode: RunMode::Run,
            create: Some(create),
            wait_healthy: None,
            user: None,
        }
    }

    #[test]
    fn exec_argv_wraps_shell_commands() {
        let direct = Command::new(["ls", "-la"]);
        assert_eq!(exec_argv(&direct), vec!["ls", "-la"]);

        let shelled = Command::shell("ls | wc -l");
        assert_eq!(exec_argv(&shelled), vec!["sh", "-c", "ls | wc -l"]);
    }

    #[test]
    fn container_config_reflects_the_create_spec() {
        let spec = CreateSpec {
            volumes: vec!["/data:/data:ro".to_string()],
            ports: vec!["8080:80".to_string()],
            env: HashMap::from([("MODE".to_string(), "test".to_string())]),
            network: Some("bridge".to_string()),
            memory: Some(512 * 1024 * 1024),
            cpus: Some(1.5),
            restart: Some("no".to_string()),
            healthcheck: None,
            auto_remove: Some(false),
        };
        let cmd = Command::shell("nginx -g 'daemon off;'");
        let config = build_container_config(&target_with(spec), "nginx:alpine", Some(&cmd));

        assert_eq!(config.image.as_deref(), Some("nginx:alpine"));
        assert_eq!(
            config.cmd.as_ref().unwrap()[..2],
            ["sh".to_string(), "-c".to_string()]
        );
        assert!(config.env.unwrap().contains(&"MODE=test".to_string()));
        let host = config.host_config.unwrap();
        assert_eq!(host.binds.unwrap(), vec!["/data:/data:ro"]);
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(1_500_000_000));
        let bindings = host.port_bindings.unwrap();
        let binding = bindings["80/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8080"));
    }

    #[test]
    fn generated_names_are_dns_safe() {
        let name = format!("hop-{}-{}", sanitize_name("containers.app"), random_suffix());
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
        assert!(name.starts_with("hop-containers-app-"));
    }
}
