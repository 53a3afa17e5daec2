//! Optional append-only audit sink.
//!
//! One JSON record per executed command. Writes are best-effort: a failure
//! to append is logged at warn and never blocks or fails the operation.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::warn;

#[derive(Debug, Serialize)]
pub struct AuditRecord {
    /// seconds since the epoch
    pub timestamp: u64,
    pub action: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditRecord {
    pub fn new(action: impl Into<String>, target: impl Into<String>, duration: Duration) -> Self {
        AuditRecord {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            action: action.into(),
            target: target.into(),
            user: None,
            duration_ms: duration.as_millis(),
            exit_code: None,
            error: None,
        }
    }
}

pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        AuditLog { path }
    }

    pub async fn append(&self, record: &AuditRecord) {
        if let Err(e) = self.try_append(record).await {
            warn!(path = %self.path.display(), error = %e, "failed to write audit record");
        }
    }

    async fn try_append(&self, record: &AuditRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record).map_err(std::io::Error::other)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_one_json_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::new(path.clone());

        let mut record = AuditRecord::new("exec", "hosts.web-1", Duration::from_millis(42));
        record.exit_code = Some(0);
        log.append(&record).await;
        log.append(&AuditRecord::new("copy", "local", Duration::ZERO)).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["action"], "exec");
        assert_eq!(first["target"], "hosts.web-1");
        assert_eq!(first["exit_code"], 0);
    }

    #[tokio::test]
    async fn write_failure_does_not_panic() {
        let log = AuditLog::new(PathBuf::from("/nonexistent-dir/audit.jsonl"));
        log.append(&AuditRecord::new("exec", "local", Duration::ZERO))
            .await;
    }
}
