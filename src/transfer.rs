//! Uniform file transfer across targets.
//!
//! `copy(src, dst)` accepts local paths and `target:/path` endpoints and
//! dispatches per adapter: plain filesystem copies locally, SFTP for SSH
//! hosts, the daemon's archive endpoints (tar streams) for containers and
//! a tar-over-exec pattern for pods. Remote-to-remote copies stage through
//! a local temporary directory. Local destinations are written to a
//! `.part` file and renamed, so an interrupted copy leaves no partial
//! file behind.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::command::{Command, IoMode};
use crate::engine::Engine;
use crate::error::{Error, ErrorKind};
use crate::registry::{Binding, BoundTarget};
use crate::stream::{SinkSet, StreamOpts};

/// One progress report per transferred file.
#[derive(Debug, Clone)]
pub struct Progress {
    pub path: String,
    pub bytes: u64,
}

pub struct CopyOptions {
    /// Concurrent file transfers within a directory tree.
    pub parallelism: usize,
    pub progress: Option<mpsc::Sender<Progress>>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        CopyOptions {
            parallelism: 4,
            progress: None,
        }
    }
}

impl CopyOptions {
    async fn report(&self, path: &str, bytes: u64) {
        if let Some(ref tx) = self.progress {
            let _ = tx
                .send(Progress {
                    path: path.to_string(),
                    bytes,
                })
                .await;
        }
    }
}

/// A copy endpoint: a plain local path or `target:/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local(PathBuf),
    Remote { target: String, path: String },
}

impl Endpoint {
    /// `hosts.web-1:/etc/app.conf` is remote; `local:/x` and anything
    /// without a target prefix are local.
    pub fn parse(raw: &str) -> Endpoint {
        if let Some((prefix, rest)) = raw.split_once(':') {
            let looks_like_target =
                !prefix.is_empty() && !prefix.contains('/') && !rest.is_empty();
            if looks_like_target && prefix == "local" {
                return Endpoint::Local(PathBuf::from(rest));
            }
            if looks_like_target && (prefix.contains('.') || prefix == "docker" || prefix == "pod")
            {
                return Endpoint::Remote {
                    target: prefix.to_string(),
                    path: rest.to_string(),
                };
            }
        }
        Endpoint::Local(PathBuf::from(raw))
    }
}

/// Copy between two endpoints. Returns total bytes moved.
pub async fn copy(
    engine: &Engine,
    ctx: &CancellationToken,
    src: &str,
    dst: &str,
    opts: &CopyOptions,
) -> Result<u64, Error> {
    let src_ep = Endpoint::parse(src);
    let dst_ep = Endpoint::parse(dst);
    info!(src = %src, dst = %dst, "copy");

    match (src_ep, dst_ep) {
        (Endpoint::Local(from), Endpoint::Local(to)) => copy_local(&from, &to, opts).await,
        (Endpoint::Local(from), Endpoint::Remote { target, path }) => {
            let bound = engine.registry().resolve(&target).await?;
            upload(engine, ctx, &from, &bound, &path, opts).await
        }
        (Endpoint::Remote { target, path }, Endpoint::Local(to)) => {
            let bound = engine.registry().resolve(&target).await?;
            download(engine, ctx, &bound, &path, &to, opts).await
        }
        (
            Endpoint::Remote {
                target: src_target,
                path: src_path,
            },
            Endpoint::Remote {
                target: dst_target,
                path: dst_path,
            },
        ) => {
            // stage through a local temp dir
            let staging = tempfile::tempdir()?;
            let name = base_name(&src_path);
            let local = staging.path().join(&name);
            let src_bound = engine.registry().resolve(&src_target).await?;
            let bytes = download(engine, ctx, &src_bound, &src_path, &local, opts).await?;
            let dst_bound = engine.registry().resolve(&dst_target).await?;
            let _ = upload(engine, ctx, &local, &dst_bound, &dst_path, opts).await?;
            Ok(bytes)
        }
    }
}

// --- local <-> local ----------------------------------------------------

async fn copy_local(from: &Path, to: &Path, opts: &CopyOptions) -> Result<u64, Error> {
    if tokio::fs::metadata(from).await?.is_dir() {
        let mut total = 0u64;
        let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
        while let Some((src_dir, dst_dir)) = pending.pop() {
            tokio::fs::create_dir_all(&dst_dir).await?;
            let mut entries = tokio::fs::read_dir(&src_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let src = entry.path();
                let dst = dst_dir.join(entry.file_name());
                if entry.file_type().await?.is_dir() {
                    pending.push((src, dst));
                } else {
                    total += copy_local_file(&src, &dst).await?;
                    opts.report(&dst.to_string_lossy(), total).await;
                }
            }
        }
        Ok(total)
    } else {
        let bytes = copy_local_file(from, to).await?;
        opts.report(&to.to_string_lossy(), bytes).await;
        Ok(bytes)
    }
}

/// Write via a `.part` sibling then rename; a failure removes the partial.
async fn copy_local_file(from: &Path, to: &Path) -> Result<u64, Error> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part = part_path(to);
    let result = tokio::fs::copy(from, &part).await;
    match result {
        Ok(bytes) => {
            tokio::fs::rename(&part, to).await?;
            Ok(bytes)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&part).await;
            Err(e.into())
        }
    }
}

fn part_path(to: &Path) -> PathBuf {
    let mut name = to.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    to.with_file_name(name)
}

fn base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

fn parent_dir(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string())
}

// --- upload (local -> target) ------------------------------------------

async fn upload(
    engine: &Engine,
    ctx: &CancellationToken,
    from: &Path,
    bound: &BoundTarget,
    remote_path: &str,
    opts: &CopyOptions,
) -> Result<u64, Error> {
    let is_dir = tokio::fs::metadata(from).await?.is_dir();
    match &bound.binding {
        Binding::Local(_) => copy_local(from, Path::new(remote_path), opts).await,
        Binding::Ssh(config) => {
            let session = engine.registry().ssh_adapter().session(config).await?;
            let bytes = if is_dir {
                crate::ssh::upload_dir(session, from, remote_path, opts.parallelism).await?
            } else {
                crate::ssh::upload_file(session, from, remote_path).await?
            };
            opts.report(remote_path, bytes).await;
            Ok(bytes)
        }
        Binding::Docker { adapter, config } => {
            let container = adapter.transfer_container(config)?;
            let archive = tar_archive(from, &base_name(remote_path)).await?;
            let bytes = archive.len() as u64;
            adapter
                .upload_archive(container, &parent_dir(remote_path), archive)
                .await?;
            opts.report(remote_path, bytes).await;
            Ok(bytes)
        }
        Binding::K8s { adapter, config } => {
            let archive = tar_archive(from, &base_name(remote_path)).await?;
            let bytes = archive.len() as u64;
            let argv = vec![
                "tar".to_string(),
                "-xf".to_string(),
                "-".to_string(),
                "-C".to_string(),
                parent_dir(remote_path),
            ];
            let cmd = Command::new(argv)
                .with_stdin(crate::command::StdinSource::Inline(archive))
                .with_io_mode(IoMode::Discard);
            let sinks = SinkSet::new(&StreamOpts::new(IoMode::Discard, "copy"), ctx);
            let details = adapter.execute(config, &cmd, &sinks).await?;
            if details.exit_code != Some(0) {
                return Err(Error::new(
                    ErrorKind::Io,
                    format!("remote tar exited with {:?}", details.exit_code),
                ));
            }
            opts.report(remote_path, bytes).await;
            Ok(bytes)
        }
    }
}

// --- download (target -> local) ----------------------------------------

async fn download(
    engine: &Engine,
    ctx: &CancellationToken,
    bound: &BoundTarget,
    remote_path: &str,
    to: &Path,
    opts: &CopyOptions,
) -> Result<u64, Error> {
    match &bound.binding {
        Binding::Local(_) => copy_local(Path::new(remote_path), to, opts).await,
        Binding::Ssh(config) => {
            let session = engine.registry().ssh_adapter().session(config).await?;
            // a remote directory downloads recursively; probe with a stat
            // through sftp by trying the file path first
            let bytes = match crate::ssh::download_file(session.clone(), remote_path, to).await
            {
                Ok(bytes) => bytes,
                Err(_) => {
                    crate::ssh::download_dir(session, remote_path, to, opts.parallelism)
                        .await?
                }
            };
            opts.report(&to.to_string_lossy(), bytes).await;
            Ok(bytes)
        }
        Binding::Docker { adapter, config } => {
            let container = adapter.transfer_container(config)?;
            let archive = adapter.download_archive(container, remote_path).await?;
            let bytes = archive.len() as u64;
            unpack_to(archive, &base_name(remote_path), to).await?;
            opts.report(&to.to_string_lossy(), bytes).await;
            Ok(bytes)
        }
        Binding::K8s { adapter, config } => {
            let argv = vec![
                "tar".to_string(),
                "-cf".to_string(),
                "-".to_string(),
                "-C".to_string(),
                parent_dir(remote_path),
                base_name(remote_path),
            ];
            let cmd = Command::new(argv);
            // captured archive bypasses the normal output cap
            let stream_opts = StreamOpts::new(IoMode::Capture, "copy").with_cap(usize::MAX);
            let sinks = SinkSet::new(&stream_opts, ctx);
            let details = adapter.execute(config, &cmd, &sinks).await?;
            if details.exit_code != Some(0) {
                return Err(Error::new(
                    ErrorKind::Io,
                    format!("remote tar exited with {:?}", details.exit_code),
                ));
            }
            let captured = sinks.finish().await;
            let bytes = captured.stdout.len() as u64;
            unpack_to(captured.stdout, &base_name(remote_path), to).await?;
            opts.report(&to.to_string_lossy(), bytes).await;
            Ok(bytes)
        }
    }
}

// --- tar helpers --------------------------------------------------------

/// Build a tar archive of a file or directory, with the top-level entry
/// renamed so the destination basename wins.
async fn tar_archive(src: &Path, entry_name: &str) -> Result<Bytes, Error> {
    let src = src.to_path_buf();
    let entry_name = entry_name.to_string();
    let archive = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        if src.is_dir() {
            builder.append_dir_all(&entry_name, &src)?;
        } else {
            builder.append_path_with_name(&src, &entry_name)?;
        }
        builder.into_inner()
    })
    .await
    .map_err(|e| Error::new(ErrorKind::Io, format!("tar task: {e}")))??;
    Ok(Bytes::from(archive))
}

/// Unpack an archive into a staging dir, then move the expected entry to
/// the destination.
async fn unpack_to(archive: Bytes, entry_name: &str, to: &Path) -> Result<(), Error> {
    let staging = tempfile::tempdir()?;
    let staging_path = staging.path().to_path_buf();
    let _ = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut reader = tar::Archive::new(archive.as_ref());
        reader.unpack(&staging_path)
    })
    .await
    .map_err(|e| Error::new(ErrorKind::Io, format!("untar task: {e}")))??;

    let extracted = staging.path().join(entry_name);
    let source = if extracted.exists() {
        extracted
    } else {
        // single-entry archive with a different name
        let mut entries = tokio::fs::read_dir(staging.path()).await?;
        let Some(first) = entries.next_entry().await? else {
            return Err(Error::new(ErrorKind::Io, "archive was empty"));
        };
        first.path()
    };

    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::metadata(&source).await?.is_dir() {
        debug!(to = %to.display(), "moving extracted tree into place");
        move_tree(&source, to).await
    } else {
        match tokio::fs::rename(&source, to).await {
            Ok(()) => Ok(()),
            // cross-device staging directory
            Err(_) => copy_local_file(&source, to).await.map(|_| ()),
        }
    }
}

async fn move_tree(from: &Path, to: &Path) -> Result<(), Error> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((src_dir, dst_dir)) = pending.pop() {
        tokio::fs::create_dir_all(&dst_dir).await?;
        let mut entries = tokio::fs::read_dir(&src_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let src = entry.path();
            let dst = dst_dir.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((src, dst));
            } else {
                let _ = copy_local_file(&src, &dst).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Defaults, TargetsSection};
    use crate::registry::TargetRegistry;
    use crate::secrets::StaticSecrets;
    use std::sync::Arc;

    fn engine() -> Engine {
        let registry = TargetRegistry::new(
            TargetsSection::default(),
            Defaults::default(),
            Arc::new(StaticSecrets::default()),
        );
        Engine::new(Arc::new(registry), None)
    }

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            Endpoint::parse("/tmp/file"),
            Endpoint::Local(PathBuf::from("/tmp/file"))
        );
        assert_eq!(
            Endpoint::parse("./rel"),
            Endpoint::Local(PathBuf::from("./rel"))
        );
        assert_eq!(
            Endpoint::parse("local:/tmp/file"),
            Endpoint::Local(PathBuf::from("/tmp/file"))
        );
        assert_eq!(
            Endpoint::parse("hosts.web-1:/etc/app.conf"),
            Endpoint::Remote {
                target: "hosts.web-1".to_string(),
                path: "/etc/app.conf".to_string()
            }
        );
        assert_eq!(
            Endpoint::parse("containers.app:/opt/data"),
            Endpoint::Remote {
                target: "containers.app".to_string(),
                path: "/opt/data".to_string()
            }
        );
    }

    #[test]
    fn path_helpers() {
        assert_eq!(base_name("/a/b/c.txt"), "c.txt");
        assert_eq!(parent_dir("/a/b/c.txt"), "/a/b");
        assert_eq!(parent_dir("file"), "/");
        assert_eq!(part_path(Path::new("/x/y.bin")), PathBuf::from("/x/y.bin.part"));
    }

    #[tokio::test]
    async fn local_file_round_trip_preserves_bytes() {
        let engine = engine();
        let ctx = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let payload: Vec<u8> = (0..=255u8).cycle().take(65_537).collect();
        tokio::fs::write(&src, &payload).await.unwrap();

        let dst = dir.path().join("nested/dst.bin");
        let bytes = copy(
            &engine,
            &ctx,
            &src.to_string_lossy(),
            &dst.to_string_lossy(),
            &CopyOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(bytes, payload.len() as u64);
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), payload);
        // no partial file left behind
        assert!(!part_path(&dst).exists());
    }

    #[tokio::test]
    async fn local_directory_copy_recurses() {
        let engine = engine();
        let ctx = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree");
        tokio::fs::create_dir_all(src.join("sub")).await.unwrap();
        tokio::fs::write(src.join("a.txt"), b"a").await.unwrap();
        tokio::fs::write(src.join("sub/b.txt"), b"bb").await.unwrap();

        let dst = dir.path().join("copy");
        let (tx, mut rx) = mpsc::channel(16);
        let opts = CopyOptions {
            parallelism: 2,
            progress: Some(tx),
        };
        let bytes = copy(
            &engine,
            &ctx,
            &src.to_string_lossy(),
            &dst.to_string_lossy(),
            &opts,
        )
        .await
        .unwrap();
        drop(opts);

        assert_eq!(bytes, 3);
        assert_eq!(tokio::fs::read(dst.join("a.txt")).await.unwrap(), b"a");
        assert_eq!(tokio::fs::read(dst.join("sub/b.txt")).await.unwrap(), b"bb");
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn tar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("payload.txt");
        tokio::fs::write(&src, b"tar me").await.unwrap();

        let archive = tar_archive(&src, "renamed.txt").await.unwrap();
        let dst = dir.path().join("out/renamed.txt");
        unpack_to(archive, "renamed.txt", &dst).await.unwrap();
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"tar me");
    }

    #[tokio::test]
    async fn copy_to_unknown_target_fails_cleanly() {
        let engine = engine();
        let ctx = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("f");
        tokio::fs::write(&src, b"x").await.unwrap();
        let err = copy(
            &engine,
            &ctx,
            &src.to_string_lossy(),
            "hosts.nope:/tmp/f",
            &CopyOptions::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TargetNotFound);
    }
}
