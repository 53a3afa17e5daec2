//! SSH adapter: execute commands on remote hosts over pooled, multiplexed
//! sessions.
//!
//! Sessions are master connections managed by the openssh crate; commands
//! multiplex as channels over them. The pool is keyed by
//! `(destination, port, proxy-chain)` so distinct targets resolving to the
//! same endpoint share connections. Proxy chains ride the OpenSSH jump-host
//! mechanism, so intermediate hops need no sessions of their own.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use openssh::{ForwardType, KnownHosts, Session, SessionBuilder, Socket, Stdio};
use openssh_sftp_client::Sftp;
use shell_escape::escape;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::command::{Command, ExitDetails, StdinSource};
use crate::config::KnownHostsMode;
use crate::error::{Error, ErrorKind};
use crate::pool::{Pool, PoolConfig, ResourceFactory};
use crate::stream::SinkSet;

/// Sudo elevation settings resolved from the target config and secrets.
#[derive(Debug, Clone)]
pub struct SudoConfig {
    pub command: String,
    /// Password written to `sudo -S` on stdin, from the secrets reader.
    pub password: Option<Vec<u8>>,
}

/// A fully resolved SSH target: config defaults applied, key path
/// expanded, proxy chain flattened into hop destinations, secrets fetched.
#[derive(Debug, Clone)]
pub struct SshTargetConfig {
    pub id: String,
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub key: Option<PathBuf>,
    pub known_hosts: KnownHostsMode,
    pub keepalive: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    /// Jump destinations in hop order, e.g. `["user@bastion:22"]`.
    pub jump_hosts: Vec<String>,
    pub sudo: Option<SudoConfig>,
    pub pool: PoolConfig,
}

impl SshTargetConfig {
    /// `user@host` destination for the ssh client.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    fn pool_key(&self) -> SessionKey {
        SessionKey {
            destination: self.destination(),
            port: self.port,
            jump_chain: self.jump_hosts.join(","),
        }
    }
}

/// Pool key: same endpoint through the same chain shares sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    destination: String,
    port: Option<u16>,
    jump_chain: String,
}

/// Connection recipe the factory uses for a key; registered at binding.
#[derive(Debug, Clone)]
struct ConnectSpec {
    destination: String,
    port: Option<u16>,
    key: Option<PathBuf>,
    known_hosts: KnownHostsMode,
    keepalive: Option<Duration>,
    connect_timeout: Option<Duration>,
    jump_hosts: Vec<String>,
}

pub struct SessionFactory {
    specs: RwLock<HashMap<SessionKey, ConnectSpec>>,
}

#[async_trait]
impl ResourceFactory for Arc<SessionFactory> {
    type Key = SessionKey;
    type Resource = Arc<Session>;

    async fn create(&self, key: &SessionKey) -> Result<Arc<Session>, Error> {
        let spec = {
            let specs = self.specs.read().await;
            specs
                .get(key)
                .cloned()
                .ok_or_else(|| Error::config(format!("no connect spec for {key:?}")))?
        };

        info!(destination = %spec.destination, "establishing SSH connection");

        let mut builder = SessionBuilder::default();
        let _ = builder.known_hosts_check(match spec.known_hosts {
            KnownHostsMode::Strict => KnownHosts::Strict,
            KnownHostsMode::AcceptNew => KnownHosts::Accept,
        });
        if let Some(port) = spec.port {
            let _ = builder.port(port);
        }
        if let Some(ref path) = spec.key {
            let _ = builder.keyfile(path);
        }
        if let Some(keepalive) = spec.keepalive {
            let _ = builder.server_alive_interval(keepalive);
        }
        if let Some(timeout) = spec.connect_timeout {
            let _ = builder.connect_timeout(timeout);
        }
        if !spec.jump_hosts.is_empty() {
            let _ = builder.jump_hosts(spec.jump_hosts.iter());
        }

        let session = builder
            .connect(&spec.destination)
            .await
            .map_err(|e| classify_connect_error(&spec.destination, &e))?;
        Ok(Arc::new(session))
    }

    async fn test(&self, session: &Arc<Session>) -> bool {
        session.check().await.is_ok()
    }

    async fn destroy(&self, session: Arc<Session>) {
        match Arc::try_unwrap(session) {
            Ok(session) => {
                if let Err(e) = session.close().await {
                    debug!(error = %e, "error closing SSH session");
                }
            }
            // still referenced elsewhere (e.g. an in-flight SFTP handle);
            // the master exits when the last clone drops
            Err(_) => {}
        }
    }
}

/// Missing or mismatched keys, refused auth and plain connection failures
/// all surface as one openssh error; classify by the client's message.
fn classify_connect_error(destination: &str, e: &openssh::Error) -> Error {
    let text = e.to_string();
    let lower = text.to_lowercase();
    let kind = if lower.contains("host key verification failed")
        || lower.contains("remote host identification has changed")
    {
        ErrorKind::HostKey
    } else if lower.contains("permission denied") || lower.contains("authentication") {
        ErrorKind::Auth
    } else {
        ErrorKind::Connect
    };
    Error::new(kind, format!("ssh {destination}: {text}"))
}

fn classify_runtime_error(e: &openssh::Error) -> Error {
    let text = e.to_string();
    let lower = text.to_lowercase();
    let kind = if lower.contains("broken pipe")
        || lower.contains("disconnected")
        || lower.contains("connection")
    {
        ErrorKind::Transport
    } else {
        ErrorKind::Io
    };
    Error::new(kind, format!("ssh: {text}"))
}

/// Process-wide SSH adapter: one shared session pool for every host target.
pub struct SshAdapter {
    factory: Arc<SessionFactory>,
    pool: Pool<Arc<SessionFactory>>,
}

impl SshAdapter {
    pub fn new(defaults: PoolConfig) -> Self {
        let factory = Arc::new(SessionFactory {
            specs: RwLock::new(HashMap::new()),
        });
        let pool = Pool::new(factory.clone(), defaults);
        SshAdapter { factory, pool }
    }

    /// Register a target's connection recipe and pool sizing, then
    /// pre-create `min` sessions. Called once when the target is bound.
    pub async fn bind(&self, target: &SshTargetConfig) -> Result<(), Error> {
        let key = target.pool_key();
        {
            let mut specs = self.factory.specs.write().await;
            let _ = specs.entry(key.clone()).or_insert_with(|| ConnectSpec {
                destination: target.destination(),
                port: target.port,
                key: target.key.clone(),
                known_hosts: target.known_hosts,
                keepalive: target.keepalive,
                connect_timeout: target.connect_timeout,
                jump_hosts: target.jump_hosts.clone(),
            });
        }
        self.pool.configure_key(&key, target.pool.clone()).await;
        self.pool.warm(&key).await
    }

    /// Execute a command on the target, streaming output into the sinks.
    pub async fn execute(
        &self,
        target: &SshTargetConfig,
        cmd: &Command,
        sinks: &SinkSet,
    ) -> Result<ExitDetails, Error> {
        let key = target.pool_key();
        // acquire is not cancel-safe mid-create; its wait is bounded by
        // the pool's acquire_timeout instead
        let lease = self.pool.acquire(&key).await?;
        let session: Arc<Session> = (*lease).clone();

        let result = run_remote(&session, target, cmd, sinks).await;
        self.pool.release(lease).await;
        result
    }

    /// Borrow a session for SFTP or port-forward work.
    pub async fn session(&self, target: &SshTargetConfig) -> Result<Arc<Session>, Error> {
        let key = target.pool_key();
        let lease = self.pool.acquire(&key).await?;
        let session = (*lease).clone();
        self.pool.release(lease).await;
        Ok(session)
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.pool.shutdown(grace).await;
    }
}

/// A fully assembled remote invocation.
struct RemoteInvocation {
    /// argv handed to the ssh channel (each element escaped in transit)
    argv: Vec<String>,
    /// the `sh -c` payload, for logs
    line: String,
    /// whether the invocation goes through the elevation command
    uses_sudo: bool,
}

/// Assemble the remote `sh -c` line: exports, cwd, elevation.
fn remote_command_line(target: &SshTargetConfig, cmd: &Command) -> RemoteInvocation {
    let base = if cmd.shell.is_some() {
        cmd.argv.join(" ")
    } else {
        cmd.argv
            .iter()
            .map(|a| escape(a.as_str().into()).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    };

    let with_cwd = match &cmd.cwd {
        Some(dir) => format!("cd {} && {}", escape(dir.as_str().into()), base),
        None => base,
    };

    // sshd rejects protocol-level env requests unless AcceptEnv is
    // configured, so inject variables into the command line instead
    let with_env = if cmd.env.vars.is_empty() {
        with_cwd
    } else if cmd.env.replace {
        let pairs: Vec<String> = cmd
            .env
            .vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, escape(v.as_str().into())))
            .collect();
        format!(
            "env -i {} {} -c {}",
            pairs.join(" "),
            cmd.shell_program(),
            escape(with_cwd.into())
        )
    } else {
        let exports: Vec<String> = cmd
            .env
            .vars
            .iter()
            .map(|(k, v)| format!("export {}={}", k, escape(v.as_str().into())))
            .collect();
        format!("{} && {}", exports.join(" && "), with_cwd)
    };

    // elevation: requested by a per-command user, or by target-level sudo
    // config (which marks the whole target as elevated)
    let uses_sudo = cmd.user.is_some() || target.sudo.is_some();
    let argv = if uses_sudo {
        let sudo_cmd = target
            .sudo
            .as_ref()
            .map(|s| s.command.clone())
            .unwrap_or_else(|| "sudo".to_string());
        let mut argv = vec![sudo_cmd, "-S".to_string(), "-p".to_string(), String::new()];
        if let Some(ref user) = cmd.user {
            argv.push("-u".to_string());
            argv.push(user.clone());
        }
        argv.push(cmd.shell_program());
        argv.push("-c".to_string());
        argv.push(with_env.clone());
        argv
    } else {
        vec![cmd.shell_program(), "-c".to_string(), with_env.clone()]
    };

    RemoteInvocation {
        argv,
        line: with_env,
        uses_sudo,
    }
}

async fn run_remote(
    session: &Session,
    target: &SshTargetConfig,
    cmd: &Command,
    sinks: &SinkSet,
) -> Result<ExitDetails, Error> {
    let invocation = remote_command_line(target, cmd);
    debug!(target = %target.id, command = %invocation.line, "executing remote command");

    let (program, rest) = invocation
        .argv
        .split_first()
        .expect("assembled argv is never empty");
    let mut remote = session.command(program);
    let _ = remote.args(rest);

    let sudo_password = if invocation.uses_sudo {
        target.sudo.as_ref().and_then(|s| s.password.clone())
    } else {
        None
    };

    if cmd.stdin.is_some() || sudo_password.is_some() {
        let _ = remote.stdin(Stdio::piped());
    } else {
        let _ = remote.stdin(Stdio::null());
    }
    let _ = remote.stdout(Stdio::piped());
    let _ = remote.stderr(Stdio::piped());

    let mut child = remote
        .spawn()
        .await
        .map_err(|e| classify_runtime_error(&e))?;

    if let Some(mut stdin) = child.stdin().take() {
        let stdin_source = cmd.stdin.clone();
        let _ = tokio::spawn(async move {
            if let Some(password) = sudo_password {
                let _ = stdin.write_all(&password).await;
                let _ = stdin.write_all(b"\n").await;
            }
            match stdin_source {
                Some(StdinSource::Inline(bytes)) => {
                    let _ = stdin.write_all(&bytes).await;
                }
                Some(StdinSource::File(path)) => {
                    if let Ok(mut file) = tokio::fs::File::open(&path).await {
                        let _ = tokio::io::copy(&mut file, &mut stdin).await;
                    }
                }
                None => {}
            }
            drop(stdin);
        });
    }

    let stdout = child.stdout().take();
    let stderr = child.stderr().take();
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

    let timeout = cmd.effective_timeout();
    let status = tokio::select! {
        status = child.wait() => Some(status.map_err(|e| classify_runtime_error(&e))?),
        _ = sinks.closed().cancelled() => None,
        _ = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        } => {
            // dropping the child closes the channel; sshd signals the
            // remote process group
            out_pump.abort();
            err_pump.abort();
            return Err(Error::timeout(timeout.unwrap_or_default()));
        }
    };

    let Some(status) = status else {
        out_pump.abort();
        err_pump.abort();
        return Err(Error::cancelled());
    };

    let _ = out_pump.await;
    let _ = err_pump.await;

    let code = status.code();
    if code == Some(1)
        && invocation.uses_sudo
        && target.sudo.as_ref().is_some_and(|s| s.password.is_some())
    {
        let stderr_tail = sinks.stderr.peek_captured().await;
        let text = String::from_utf8_lossy(&stderr_tail).to_lowercase();
        if text.contains("incorrect password") || text.contains("sorry, try again") {
            return Err(Error::new(
                ErrorKind::Auth,
                "sudo authentication failed on remote host",
            ));
        }
    }

    Ok(ExitDetails {
        exit_code: code,
        signal: None,
    })
}

// --- SFTP file transfer -------------------------------------------------

async fn open_sftp(session: Arc<Session>) -> Result<Sftp, Error> {
    Sftp::from_clonable_session(session, Default::default())
        .await
        .map_err(|e| Error::new(ErrorKind::Transport, format!("sftp: {e}")))
}

fn sftp_err(e: openssh_sftp_client::Error) -> Error {
    Error::new(ErrorKind::Io, format!("sftp: {e}"))
}

/// Upload one local file to the remote path.
pub async fn upload_file(
    session: Arc<Session>,
    local_path: &Path,
    remote_path: &str,
) -> Result<u64, Error> {
    debug!(local = %local_path.display(), remote = %remote_path, "uploading file");

    let contents = tokio::fs::read(local_path).await?;
    let sftp = open_sftp(session).await?;
    let mut remote_file = sftp.create(remote_path).await.map_err(sftp_err)?;
    remote_file.write_all(&contents).await.map_err(sftp_err)?;
    remote_file.close().await.map_err(sftp_err)?;
    sftp.close().await.map_err(sftp_err)?;
    Ok(contents.len() as u64)
}

/// Download one remote file to the local path.
pub async fn download_file(
    session: Arc<Session>,
    remote_path: &str,
    local_path: &Path,
) -> Result<u64, Error> {
    debug!(remote = %remote_path, local = %local_path.display(), "downloading file");

    let sftp = open_sftp(session).await?;
    let mut remote_file = sftp.open(remote_path).await.map_err(sftp_err)?;

    let mut contents = Vec::new();
    loop {
        let buf = BytesMut::with_capacity(8192);
        match remote_file.read(8192, buf).await.map_err(sftp_err)? {
            Some(data) => contents.extend_from_slice(&data),
            None => break,
        }
    }
    remote_file.close().await.map_err(sftp_err)?;
    sftp.close().await.map_err(sftp_err)?;

    if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let len = contents.len() as u64;
    tokio::fs::write(local_path, &contents).await?;
    Ok(len)
}

/// Recursively upload a directory tree with bounded parallelism.
pub async fn upload_dir(
    session: Arc<Session>,
    local_root: &Path,
    remote_root: &str,
    parallelism: usize,
) -> Result<u64, Error> {
    let mut files = Vec::new();
    let mut dirs = vec![remote_root.to_string()];
    collect_local_files(local_root, remote_root, &mut files, &mut dirs)?;

    // directories first so file creation never races its parent
    let sftp = open_sftp(session.clone()).await?;
    for dir in &dirs {
        match sftp.fs().create_dir(Path::new(dir)).await {
            Ok(()) => {}
            // already exists is fine
            Err(e) if e.to_string().to_lowercase().contains("exist") => {}
            Err(e) => return Err(sftp_err(e)),
        }
    }
    sftp.close().await.map_err(sftp_err)?;

    let total = futures::stream::iter(files.into_iter().map(|(local, remote)| {
        let session = session.clone();
        async move { upload_file(session, &local, &remote).await }
    }))
    .buffer_unordered(parallelism.max(1))
    .fold(Ok(0u64), |acc, next| async move {
        match (acc, next) {
            (Ok(sum), Ok(n)) => Ok(sum + n),
            (Err(e), _) => Err(e),
            (_, Err(e)) => Err(e),
        }
    })
    .await?;

    Ok(total)
}

fn collect_local_files(
    local: &Path,
    remote: &str,
    files: &mut Vec<(PathBuf, String)>,
    dirs: &mut Vec<String>,
) -> Result<(), Error> {
    for entry in std::fs::read_dir(local)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let remote_child = format!("{}/{}", remote.trim_end_matches('/'), name);
        if entry.file_type()?.is_dir() {
            dirs.push(remote_child.clone());
            collect_local_files(&entry.path(), &remote_child, files, dirs)?;
        } else {
            files.push((entry.path(), remote_child));
        }
    }
    Ok(())
}

/// Recursively download a remote directory tree.
pub async fn download_dir(
    session: Arc<Session>,
    remote_root: &str,
    local_root: &Path,
    parallelism: usize,
) -> Result<u64, Error> {
    let mut files = Vec::new();
    collect_remote_files(session.clone(), remote_root, local_root, &mut files).await?;

    let total = futures::stream::iter(files.into_iter().map(|(remote, local)| {
        let session = session.clone();
        async move { download_file(session, &remote, &local).await }
    }))
    .buffer_unordered(parallelism.max(1))
    .fold(Ok(0u64), |acc, next| async move {
        match (acc, next) {
            (Ok(sum), Ok(n)) => Ok(sum + n),
            (Err(e), _) => Err(e),
            (_, Err(e)) => Err(e),
        }
    })
    .await?;

    Ok(total)
}

async fn collect_remote_files(
    session: Arc<Session>,
    remote: &str,
    local: &Path,
    files: &mut Vec<(String, PathBuf)>,
) -> Result<(), Error> {
    let sftp = open_sftp(session.clone()).await?;
    let mut pending = vec![(remote.to_string(), local.to_path_buf())];

    while let Some((remote_dir, local_dir)) = pending.pop() {
        tokio::fs::create_dir_all(&local_dir).await?;
        let mut read_dir = sftp
            .fs()
            .open_dir(Path::new(&remote_dir))
            .await
            .map_err(sftp_err)?
            .read_dir();
        while let Some(entry) = read_dir.next().await {
            let entry = entry.map_err(sftp_err)?;
            let name = entry.filename().to_string_lossy().into_owned();
            if name == "." || name == ".." {
                continue;
            }
            let remote_child = format!("{}/{}", remote_dir.trim_end_matches('/'), name);
            let local_child = local_dir.join(&name);
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                pending.push((remote_child, local_child));
            } else {
                files.push((remote_child, local_child));
            }
        }
    }

    sftp.close().await.map_err(sftp_err)?;
    Ok(())
}

// --- Port forwarding ----------------------------------------------------

/// Forward local connections to `remote_host:remote_port` via the session.
pub async fn setup_port_forward(
    session: &Session,
    local_port: u16,
    remote_host: &str,
    remote_port: u16,
) -> Result<(), Error> {
    info!(
        local_port,
        remote_host = %remote_host,
        remote_port,
        "setting up SSH port forward"
    );
    let local_socket = Socket::new("127.0.0.1", local_port);
    let remote_socket = Socket::new(remote_host, remote_port);
    session
        .request_port_forward(ForwardType::Local, local_socket, remote_socket)
        .await
        .map_err(|e| classify_runtime_error(&e))
}

pub async fn close_port_forward(
    session: &Session,
    local_port: u16,
    remote_host: &str,
    remote_port: u16,
) -> Result<(), Error> {
    let local_socket = Socket::new("127.0.0.1", local_port);
    let remote_socket = Socket::new(remote_host, remote_port);
    session
        .close_port_forward(ForwardType::Local, local_socket, remote_socket)
        .await
        .map_err(|e| classify_runtime_error(&e))
}

/// Expand a leading `~` against the home directory.
pub fn expand_key_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches('/'));
        }
        warn!("no home directory to expand '~' in key path");
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Shell;

    fn target() -> SshTargetConfig {
        SshTargetConfig {
            id: "hosts.web-1".to_string(),
            host: "web-1.example.com".to_string(),
            port: None,
            user: Some("deploy".to_string()),
            key: None,
            known_hosts: KnownHostsMode::Strict,
            keepalive: None,
            connect_timeout: None,
            jump_hosts: vec![],
            sudo: None,
            pool: PoolConfig::default(),
        }
    }

    #[test]
    fn destination_includes_user() {
        assert_eq!(target().destination(), "deploy@web-1.example.com");
    }

    #[test]
    fn pool_key_separates_proxy_chains() {
        let direct = target();
        let mut via_bastion = target();
        via_bastion.jump_hosts = vec!["deploy@bastion".to_string()];
        assert_ne!(direct.pool_key(), via_bastion.pool_key());
    }

    #[test]
    fn argv_is_escaped_for_the_remote_shell() {
        let cmd = Command::new(["echo", "two words", "it's"]);
        let invocation = remote_command_line(&target(), &cmd);
        assert!(invocation.line.contains("'two words'"));
        assert_eq!(invocation.argv[0], "sh");
        assert_eq!(invocation.argv[1], "-c");
        assert!(!invocation.uses_sudo);
    }

    #[test]
    fn shell_line_passes_through() {
        let cmd = Command::shell("echo $HOME | wc -c");
        let invocation = remote_command_line(&target(), &cmd);
        assert_eq!(invocation.line, "echo $HOME | wc -c");
    }

    #[test]
    fn env_and_cwd_are_injected() {
        let cmd = Command::shell("make deploy")
            .with_env("VERSION", "1.2.3")
            .with_cwd("/srv/app");
        let invocation = remote_command_line(&target(), &cmd);
        assert!(invocation.line.contains("export VERSION=1.2.3"));
        assert!(invocation.line.contains("cd /srv/app && make deploy"));
    }

    #[test]
    fn replace_env_uses_env_dash_i() {
        let cmd = Command::shell("printenv")
            .with_env("ONLY", "this")
            .with_env_replace(true);
        let invocation = remote_command_line(&target(), &cmd);
        assert!(invocation.line.starts_with("env -i "));
        assert!(invocation.line.contains("ONLY=this"));
    }

    #[test]
    fn per_command_user_adds_sudo() {
        let cmd = Command::shell("whoami").with_user("root");
        let invocation = remote_command_line(&target(), &cmd);
        assert_eq!(invocation.argv[0], "sudo");
        assert!(invocation.uses_sudo);
        assert!(invocation.argv.contains(&"-u".to_string()));
        assert!(invocation.argv.contains(&"root".to_string()));
        assert!(invocation.argv.contains(&"-S".to_string()));
    }

    #[test]
    fn custom_interpreter_is_used() {
        let cmd = Command::shell("print('hi')").with_shell(Shell::Program("python3".into()));
        let invocation = remote_command_line(&target(), &cmd);
        assert_eq!(invocation.argv[0], "python3");
    }

    #[test]
    fn tilde_expansion() {
        let expanded = expand_key_path("~/.ssh/id_ed25519");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert_eq!(expand_key_path("/abs/key"), PathBuf::from("/abs/key"));
    }
}
