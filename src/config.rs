//! Declarative configuration: targets, defaults, profiles and tasks.
//!
//! Loaded once at startup from `hopfile.yml`. Unknown fields are rejected
//! with a diagnostic; durations are humantime strings ("30s", "5m");
//! profiles overlay onto the base document before deserialization.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::secrets::SecretReader;

/// Optional humantime duration fields ("30s", "5m").
pub mod duration_str {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| {
            humantime::parse_duration(&s)
                .map_err(|e| serde::de::Error::custom(format!("invalid duration '{s}': {e}")))
        })
        .transpose()
    }
}

/// Dotenv settings, applied before anything else reads the environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DotenvSettings {
    #[serde(default)]
    pub load: bool,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KnownHostsMode {
    /// Reject unknown or mismatched host keys.
    #[default]
    Strict,
    /// Accept-on-first-use.
    AcceptNew,
}

/// Pool sizing knobs, target-level override of the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    pub min: Option<usize>,
    pub max: Option<usize>,
    #[serde(default, with = "duration_str")]
    pub idle_timeout: Option<Duration>,
    #[serde(default, with = "duration_str")]
    pub acquire_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SudoSpec {
    /// Elevation command prefix, `sudo` unless overridden.
    pub command: Option<String>,
    /// Secret holding the sudo password, written to stdin via `-S`.
    pub password_secret: Option<String>,
}

/// An SSH host target.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshTargetSpec {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    /// Path to the private key; `~` expands to the home directory.
    pub key: Option<String>,
    /// Secret holding the key passphrase.
    pub passphrase_secret: Option<String>,
    /// Dotted reference to the jump host (chains allowed, cycles rejected).
    pub proxy: Option<String>,
    #[serde(default)]
    pub known_hosts: Option<KnownHostsMode>,
    #[serde(default, with = "duration_str")]
    pub keepalive: Option<Duration>,
    #[serde(default, with = "duration_str")]
    pub connect_timeout: Option<Duration>,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub sudo: Option<SudoSpec>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, with = "duration_str")]
    pub timeout: Option<Duration>,
    pub output_cap: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Exec inside an existing running container.
    #[default]
    Exec,
    /// Create a fresh container from the image, run to completion.
    Run,
    /// Exec if the named container is running, otherwise create then exec.
    Hybrid,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthcheckSpec {
    /// Docker command form, e.g. ["CMD-SHELL", "curl -f localhost"].
    pub test: Vec<String>,
    #[serde(default, with = "duration_str")]
    pub interval: Option<Duration>,
    #[serde(default, with = "duration_str")]
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

/// Container create spec for `run` and `hybrid` modes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSpec {
    /// Bind mounts, `host:container[:ro]`.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Port bindings, `host:container`.
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub network: Option<String>,
    /// Memory limit in bytes.
    pub memory: Option<i64>,
    /// CPU limit in whole or fractional CPUs.
    pub cpus: Option<f64>,
    pub restart: Option<String>,
    #[serde(default)]
    pub healthcheck: Option<HealthcheckSpec>,
    /// Remove the container after a `run` completes.
    pub auto_remove: Option<bool>,
}

/// A Docker container target.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerTargetSpec {
    /// Existing container id or name (exec/hybrid modes).
    pub container: Option<String>,
    pub image: Option<String>,
    #[serde(default)]
    pub run_mode: RunMode,
    #[serde(default)]
    pub create: Option<CreateSpec>,
    /// Daemon endpoint; unset means the local socket.
    pub host: Option<String>,
    /// Wait until the container reports healthy before executing.
    #[serde(default, with = "duration_str")]
    pub wait_healthy: Option<Duration>,
    pub user: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, with = "duration_str")]
    pub timeout: Option<Duration>,
    pub output_cap: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodPick {
    #[default]
    First,
    Random,
    Newest,
}

/// A Kubernetes pod target.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PodTargetSpec {
    pub namespace: Option<String>,
    /// Exact pod name; alternative to `selector`.
    pub pod: Option<String>,
    /// Label selector, e.g. `app=frontend`.
    pub selector: Option<String>,
    /// Field selector, e.g. `status.phase=Running`.
    pub field_selector: Option<String>,
    #[serde(default)]
    pub pick: PodPick,
    pub container: Option<String>,
    /// kubeconfig context; unset means the current one.
    pub context: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    /// Wait for the pod to reach Running before executing.
    #[serde(default, with = "duration_str")]
    pub wait_ready: Option<Duration>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, with = "duration_str")]
    pub timeout: Option<Duration>,
    pub output_cap: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetsSection {
    #[serde(default)]
    pub hosts: BTreeMap<String, SshTargetSpec>,
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerTargetSpec>,
    #[serde(default)]
    pub pods: BTreeMap<String, PodTargetSpec>,
}

/// SSH-wide defaults overlaid under each host's own settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshDefaults {
    pub port: Option<u16>,
    pub user: Option<String>,
    #[serde(default)]
    pub known_hosts: Option<KnownHostsMode>,
    #[serde(default, with = "duration_str")]
    pub keepalive: Option<Duration>,
    #[serde(default, with = "duration_str")]
    pub connect_timeout: Option<Duration>,
    #[serde(default)]
    pub pool: PoolSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    #[serde(default, with = "duration_str")]
    pub timeout: Option<Duration>,
    pub output_cap: Option<usize>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub ssh: SshDefaults,
}

/// Parameter types a task accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Number,
    Bool,
    Enum,
    List,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: ParamType,
    #[serde(default)]
    pub default: Option<serde_yaml::Value>,
    #[serde(default)]
    pub required: bool,
    /// Allowed values for `enum` parameters.
    #[serde(default)]
    pub values: Vec<String>,
    /// Regex the rendered value must match.
    pub pattern: Option<String>,
}

/// `on_failure`: a bare mode string or a retry record.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OnFailureSpec {
    Mode(FailureMode),
    Retry(RetrySpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    Abort,
    Continue,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    None,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySpec {
    pub retry: u32,
    #[serde(default, with = "duration_str")]
    pub delay: Option<Duration>,
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Step name run instead when all attempts fail.
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelSpec {
    pub max_concurrency: Option<usize>,
    #[serde(default = "default_true")]
    pub fail_fast: bool,
    pub steps: Vec<StepSpec>,
}

fn default_true() -> bool {
    true
}

/// One step. Exactly one of `run`, `argv`, `task`, `script`, `parallel`
/// must be set; checked at load.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    pub name: Option<String>,
    /// Shell command line, interpolated against the scope.
    pub run: Option<String>,
    /// Exec-style argv (no shell), each element interpolated.
    pub argv: Option<Vec<String>>,
    /// Invoke another task by name.
    pub task: Option<String>,
    /// Parameter bindings for a task step.
    #[serde(default)]
    pub params: BTreeMap<String, serde_yaml::Value>,
    /// Expression producing a value to register.
    pub script: Option<String>,
    pub parallel: Option<Box<ParallelSpec>>,
    /// Scope name the step's result is stored under.
    pub register: Option<String>,
    /// Skip the step unless this expression is truthy.
    pub when: Option<String>,
    pub on_failure: Option<OnFailureSpec>,
    /// Run during unwinding even after the task aborted.
    #[serde(default)]
    pub always_run: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub replace_env: bool,
    /// Per-step target override.
    pub target: Option<String>,
    pub cwd: Option<String>,
    pub user: Option<String>,
    #[serde(default, with = "duration_str")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub nothrow: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HooksSpec {
    #[serde(default)]
    pub before: Vec<StepSpec>,
    #[serde(default)]
    pub after: Vec<StepSpec>,
    #[serde(default)]
    pub on_error: Vec<StepSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Target references or globs; empty means local. Multiple targets
    /// dispatch one invocation per target.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Dispatch multi-target invocations concurrently.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, with = "duration_str")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub hooks: HooksSpec,
    pub steps: Vec<StepSpec>,
}

/// The whole document, pre-overlay. Profiles are raw YAML fragments merged
/// over the matching top-level sections when selected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDoc {
    #[serde(default)]
    pub dotenv: DotenvSettings,
    #[serde(default)]
    pub defaults: Defaults,
    /// Directory the secrets subsystem keeps one-file-per-secret in.
    pub secrets_dir: Option<PathBuf>,
    /// Append-only JSONL audit log; unset disables auditing.
    pub audit_log: Option<PathBuf>,
    #[serde(default)]
    pub profiles: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub targets: TargetsSection,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskSpec>,
}

impl ConfigDoc {
    /// Load a document, optionally applying a profile overlay. The overlay
    /// is merged at the YAML level so the final typed deserialization (and
    /// its unknown-field diagnostics) sees the effective document.
    pub fn load(path: &Path, profile: Option<&str>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::parse(&text, profile)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e.message)))
    }

    pub fn parse(text: &str, profile: Option<&str>) -> Result<Self, Error> {
        let mut doc: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| Error::config(format!("invalid YAML: {e}")))?;

        if let Some(name) = profile {
            let overlay = doc
                .get("profiles")
                .and_then(|p| p.get(name))
                .cloned()
                .ok_or_else(|| Error::config(format!("profile '{name}' not defined")))?;
            let serde_yaml::Value::Mapping(overlay_map) = overlay else {
                return Err(Error::config(format!("profile '{name}' is not a mapping")));
            };
            let Some(doc_map) = doc.as_mapping_mut() else {
                return Err(Error::config("config root is not a mapping"));
            };
            for (key, value) in overlay_map {
                match doc_map.get_mut(&key) {
                    Some(slot) => merge_yaml(slot, value),
                    None => {
                        let _ = doc_map.insert(key, value);
                    }
                }
            }
        }

        serde_yaml::from_value(doc).map_err(|e| Error::config(format!("invalid config: {e}")))
    }

    /// Structural validation that needs more than serde: step shapes,
    /// expression syntax, references between tasks, secret references and
    /// proxy chains. Runs before any adapter is touched.
    pub fn validate(&self, secrets: &dyn SecretReader) -> Result<(), Error> {
        crate::registry::validate_targets(&self.targets, secrets)?;
        for (name, task) in &self.tasks {
            let _ = crate::task::compile(name, task, &self.tasks)
                .map_err(|e| Error::config(format!("task '{name}': {}", e.message)))?;
        }
        Ok(())
    }
}

/// Mapping-wise overlay merge; scalars and sequences in the overlay win.
fn merge_yaml(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge_yaml(slot, value),
                    None => {
                        let _ = base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Load dotenv files per the document settings.
pub fn load_dotenv(settings: &DotenvSettings) -> Result<(), Error> {
    if !settings.load {
        return Ok(());
    }
    let paths = if settings.paths.is_empty() {
        vec![".env".to_string()]
    } else {
        settings.paths.clone()
    };
    for path in &paths {
        let p = Path::new(path);
        if p.exists() {
            match dotenvy::from_path(p) {
                Ok(_) => tracing::info!(path = %path, "loaded dotenv file"),
                Err(e) => {
                    if settings.required {
                        return Err(Error::config(format!("failed to load {path}: {e}")));
                    }
                    tracing::warn!(path = %path, error = %e, "failed to load dotenv file");
                }
            }
        } else if settings.required {
            return Err(Error::config(format!("dotenv file not found: {path}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
defaults:
  timeout: 5m
  ssh:
    port: 22

targets:
  hosts:
    web-1:
      host: web-1.example.com
      user: deploy
  containers:
    app:
      container: my-app
      run_mode: hybrid
      image: nginx:alpine
  pods:
    frontend:
      namespace: default
      selector: app=frontend
      pick: newest

profiles:
  prod:
    defaults:
      timeout: 10m

tasks:
  hello:
    steps:
      - run: echo hello
        register: greeting
      - run: echo again
        when: greeting.exitCode == 0
"#;

    #[test]
    fn parses_the_sample_document() {
        let doc = ConfigDoc::parse(SAMPLE, None).unwrap();
        assert_eq!(doc.defaults.timeout, Some(Duration::from_secs(300)));
        assert_eq!(doc.targets.hosts["web-1"].user.as_deref(), Some("deploy"));
        assert_eq!(doc.targets.containers["app"].run_mode, RunMode::Hybrid);
        assert_eq!(doc.targets.pods["frontend"].pick, PodPick::Newest);
        assert_eq!(doc.tasks["hello"].steps.len(), 2);
    }

    #[test]
    fn profile_overlay_wins() {
        let doc = ConfigDoc::parse(SAMPLE, Some("prod")).unwrap();
        assert_eq!(doc.defaults.timeout, Some(Duration::from_secs(600)));
        // untouched sections survive the overlay
        assert!(doc.targets.hosts.contains_key("web-1"));
    }

    #[test]
    fn unknown_profile_is_a_config_error() {
        let err = ConfigDoc::parse(SAMPLE, Some("nope")).unwrap_err();
        assert!(err.message.contains("profile 'nope'"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = ConfigDoc::parse("tasks: {}\nbogus: 1\n", None).unwrap_err();
        assert!(err.message.contains("bogus"));
    }

    #[test]
    fn durations_parse_humantime() {
        let doc = ConfigDoc::parse("defaults:\n  timeout: 1h 30m\n", None).unwrap();
        assert_eq!(doc.defaults.timeout, Some(Duration::from_secs(5400)));
        assert!(ConfigDoc::parse("defaults:\n  timeout: nonsense\n", None).is_err());
    }

    #[test]
    fn on_failure_forms() {
        let text = r#"
tasks:
  t:
    steps:
      - run: a
        on_failure: continue
      - run: b
        on_failure:
          retry: 3
          delay: 2s
          backoff: exponential
"#;
        let doc = ConfigDoc::parse(text, None).unwrap();
        let steps = &doc.tasks["t"].steps;
        assert!(matches!(
            steps[0].on_failure,
            Some(OnFailureSpec::Mode(FailureMode::Continue))
        ));
        match &steps[1].on_failure {
            Some(OnFailureSpec::Retry(r)) => {
                assert_eq!(r.retry, 3);
                assert_eq!(r.delay, Some(Duration::from_secs(2)));
                assert_eq!(r.backoff, BackoffKind::Exponential);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
