//! Consumed boundary to the secrets subsystem.
//!
//! The engine only ever reads: `get(name)` returns bytes or a not-found
//! error. Secret values are resolved when a target is bound and cached on
//! the binding; they are never written back or persisted.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{Error, ErrorKind};

pub trait SecretReader: Send + Sync {
    /// Fetch a secret by name. Absent names are an error, not an empty
    /// value.
    fn get(&self, name: &str) -> Result<Vec<u8>, Error>;

    /// Existence probe used by config validation.
    fn contains(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }
}

fn not_found(name: &str) -> Error {
    Error::new(ErrorKind::Config, format!("secret '{name}' not found"))
}

/// Reader over a directory of one-file-per-secret, the layout the secrets
/// subsystem maintains. Falls back to `HOP_SECRET_<NAME>` environment
/// variables so tests and CI can inject material without files.
pub struct FileSecrets {
    dir: Option<PathBuf>,
}

impl FileSecrets {
    pub fn new(dir: Option<PathBuf>) -> Self {
        FileSecrets { dir }
    }

    fn env_key(name: &str) -> String {
        let mangled: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("HOP_SECRET_{mangled}")
    }
}

impl SecretReader for FileSecrets {
    fn get(&self, name: &str) -> Result<Vec<u8>, Error> {
        if let Some(ref dir) = self.dir {
            let path = dir.join(name);
            if path.is_file() {
                return std::fs::read(&path).map_err(|e| {
                    Error::new(
                        ErrorKind::Config,
                        format!("secret '{name}' unreadable: {e}"),
                    )
                });
            }
        }
        if let Ok(value) = std::env::var(Self::env_key(name)) {
            return Ok(value.into_bytes());
        }
        Err(not_found(name))
    }
}

/// In-memory reader for tests.
#[cfg(test)]
#[derive(Default)]
pub struct StaticSecrets {
    values: HashMap<String, Vec<u8>>,
}

#[cfg(test)]
impl StaticSecrets {
    pub fn new<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        StaticSecrets {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
impl SecretReader for StaticSecrets {
    fn get(&self, name: &str) -> Result<Vec<u8>, Error> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_reader_round_trip() {
        let secrets = StaticSecrets::new([("db-password", "hunter2")]);
        assert_eq!(secrets.get("db-password").unwrap(), b"hunter2");
        assert_eq!(
            secrets.get("missing").unwrap_err().kind,
            ErrorKind::Config
        );
        assert!(secrets.contains("db-password"));
        assert!(!secrets.contains("missing"));
    }

    #[test]
    fn file_reader_prefers_directory_over_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("token"), b"from-file").unwrap();
        let secrets = FileSecrets::new(Some(dir.path().to_path_buf()));
        assert_eq!(secrets.get("token").unwrap(), b"from-file");
        assert!(secrets.get("absent").is_err());
    }
}
