//! Target registry: resolve dotted names and wildcards to bound adapters.
//!
//! Descriptors come from configuration; bindings (live adapters with their
//! transport resources) are created lazily on first resolution, under a
//! per-name cell so two concurrent resolutions cannot race pool
//! initialization. Inline descriptors bind transiently without caching.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::config::{
    ContainerTargetSpec, Defaults, KnownHostsMode, PodTargetSpec, PoolSettings, RunMode,
    SshTargetSpec, TargetsSection,
};
use crate::docker::{DockerAdapter, DockerTargetConfig};
use crate::error::{Error, ErrorKind};
use crate::k8s::{K8sAdapter, K8sTargetConfig};
use crate::local::LocalAdapter;
use crate::pool::PoolConfig;
use crate::secrets::SecretReader;
use crate::ssh::{SshAdapter, SshTargetConfig, SudoConfig, expand_key_path};
use crate::stream::DEFAULT_OUTPUT_CAP;

/// Cross-cutting settings every target carries.
#[derive(Debug, Clone)]
pub struct TargetSettings {
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub output_cap: usize,
}

/// A live adapter binding.
pub enum Binding {
    Local(LocalAdapter),
    Ssh(SshTargetConfig),
    Docker {
        adapter: DockerAdapter,
        config: DockerTargetConfig,
    },
    K8s {
        adapter: K8sAdapter,
        config: K8sTargetConfig,
    },
}

pub struct BoundTarget {
    pub id: String,
    pub settings: TargetSettings,
    pub binding: Binding,
}

pub struct TargetRegistry {
    targets: TargetsSection,
    defaults: Defaults,
    secrets: Arc<dyn SecretReader>,
    /// shared process-wide SSH adapter (one session pool for all hosts)
    ssh: Arc<SshAdapter>,
    bindings: Mutex<HashMap<String, Arc<OnceCell<Arc<BoundTarget>>>>>,
}

impl TargetRegistry {
    pub fn new(
        targets: TargetsSection,
        defaults: Defaults,
        secrets: Arc<dyn SecretReader>,
    ) -> Self {
        let pool_defaults = merge_pool(&PoolConfig::default(), &defaults.ssh.pool);
        TargetRegistry {
            targets,
            defaults,
            secrets,
            ssh: Arc::new(SshAdapter::new(pool_defaults)),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn ssh_adapter(&self) -> Arc<SshAdapter> {
        self.ssh.clone()
    }

    /// All registered dotted names, ordered: local, then hosts, containers,
    /// pods alphabetically.
    pub fn target_names(&self) -> Vec<String> {
        let mut names = vec!["local".to_string()];
        names.extend(self.targets.hosts.keys().map(|k| format!("hosts.{k}")));
        names.extend(
            self.targets
                .containers
                .keys()
                .map(|k| format!("containers.{k}")),
        );
        names.extend(self.targets.pods.keys().map(|k| format!("pods.{k}")));
        names
    }

    /// Resolve one dotted name (or an inline descriptor) to a binding.
    pub async fn resolve(&self, name: &str) -> Result<Arc<BoundTarget>, Error> {
        if let Some(inline) = parse_inline(name) {
            debug!(target = %name, "binding inline descriptor");
            return self.bind_inline(name, inline).await;
        }

        let cell = {
            let mut bindings = self.bindings.lock().await;
            bindings
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let bound = cell
            .get_or_try_init(|| self.bind(name))
            .await?
            .clone();
        Ok(bound)
    }

    /// Expand a wildcard pattern to the ordered list of matching bound
    /// targets; a plain name resolves to a single-element list.
    pub async fn resolve_pattern(&self, pattern: &str) -> Result<Vec<Arc<BoundTarget>>, Error> {
        if !pattern.contains(['*', '?', '[']) {
            return Ok(vec![self.resolve(pattern).await?]);
        }
        let matcher = glob::Pattern::new(pattern)
            .map_err(|e| Error::config(format!("bad target pattern '{pattern}': {e}")))?;
        let names: Vec<String> = self
            .target_names()
            .into_iter()
            .filter(|name| matcher.matches(name))
            .collect();
        if names.is_empty() {
            return Err(Error::new(
                ErrorKind::TargetNotFound,
                format!("no targets match '{pattern}'"),
            ));
        }
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            out.push(self.resolve(&name).await?);
        }
        Ok(out)
    }

    async fn bind(&self, name: &str) -> Result<Arc<BoundTarget>, Error> {
        if name == "local" {
            return Ok(Arc::new(BoundTarget {
                id: name.to_string(),
                settings: self.base_settings(&HashMap::new(), None, None),
                binding: Binding::Local(LocalAdapter),
            }));
        }

        let (kind, short) = name.split_once('.').ok_or_else(|| {
            Error::new(
                ErrorKind::TargetNotFound,
                format!("'{name}' is not a dotted target name"),
            )
        })?;

        match kind {
            "hosts" => {
                let spec = self.targets.hosts.get(short).ok_or_else(|| not_found(name))?;
                let config = self.resolve_ssh(name, spec)?;
                self.ssh.bind(&config).await?;
                Ok(Arc::new(BoundTarget {
                    id: name.to_string(),
                    settings: self.base_settings(&spec.env, spec.timeout, spec.output_cap),
                    binding: Binding::Ssh(config),
                }))
            }
            "containers" => {
                let spec = self
                    .targets
                    .containers
                    .get(short)
                    .ok_or_else(|| not_found(name))?;
                let adapter = DockerAdapter::connect(spec.host.as_deref()).await?;
                let config = resolve_docker(name, spec);
                Ok(Arc::new(BoundTarget {
                    id: name.to_string(),
                    settings: self.base_settings(&spec.env, spec.timeout, spec.output_cap),
                    binding: Binding::Docker { adapter, config },
                }))
            }
            "pods" => {
                let spec = self.targets.pods.get(short).ok_or_else(|| not_found(name))?;
                let config = resolve_pod(name, spec);
                let adapter = K8sAdapter::connect(&config).await?;
                Ok(Arc::new(BoundTarget {
                    id: name.to_string(),
                    settings: self.base_settings(&spec.env, spec.timeout, spec.output_cap),
                    binding: Binding::K8s { adapter, config },
                }))
            }
            _ => Err(not_found(name)),
        }
    }

    async fn bind_inline(
        &self,
        name: &str,
        inline: InlineTarget,
    ) -> Result<Arc<BoundTarget>, Error> {
        match inline {
            InlineTarget::Ssh { host, port, user } => {
                let spec = SshTargetSpec {
                    host,
                    port,
                    user,
                    key: None,
                    passphrase_secret: None,
                    proxy: None,
                    known_hosts: None,
                    keepalive: None,
                    connect_timeout: None,
                    pool: PoolSettings::default(),
                    sudo: None,
                    env: HashMap::new(),
                    timeout: None,
                    output_cap: None,
                };
                let config = self.resolve_ssh(name, &spec)?;
                self.ssh.bind(&config).await?;
                Ok(Arc::new(BoundTarget {
                    id: name.to_string(),
                    settings: self.base_settings(&HashMap::new(), None, None),
                    binding: Binding::Ssh(config),
                }))
            }
            InlineTarget::Docker { container } => {
                let adapter = DockerAdapter::connect(None).await?;
                let config = DockerTargetConfig {
                    id: name.to_string(),
                    container: Some(container),
                    image: None,
                    run_mode: RunMode::Exec,
                    create: None,
                    wait_healthy: None,
                    user: None,
                };
                Ok(Arc::new(BoundTarget {
                    id: name.to_string(),
                    settings: self.base_settings(&HashMap::new(), None, None),
                    binding: Binding::Docker { adapter, config },
                }))
            }
            InlineTarget::Pod { namespace, pod } => {
                let config = K8sTargetConfig {
                    id: name.to_string(),
                    namespace: namespace.unwrap_or_else(|| "default".to_string()),
                    pod: Some(pod),
                    selector: None,
                    field_selector: None,
                    pick: Default::default(),
                    container: None,
                    context: None,
                    kubeconfig: None,
                    wait_ready: None,
                };
                let adapter = K8sAdapter::connect(&config).await?;
                Ok(Arc::new(BoundTarget {
                    id: name.to_string(),
                    settings: self.base_settings(&HashMap::new(), None, None),
                    binding: Binding::K8s { adapter, config },
                }))
            }
        }
    }

    fn base_settings(
        &self,
        target_env: &HashMap<String, String>,
        timeout: Option<Duration>,
        output_cap: Option<usize>,
    ) -> TargetSettings {
        let mut env = self.defaults.env.clone();
        env.extend(target_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        TargetSettings {
            env,
            timeout: timeout.or(self.defaults.timeout),
            output_cap: output_cap
                .or(self.defaults.output_cap)
                .unwrap_or(DEFAULT_OUTPUT_CAP),
        }
    }

    fn resolve_ssh(&self, id: &str, spec: &SshTargetSpec) -> Result<SshTargetConfig, Error> {
        let ssh_defaults = &self.defaults.ssh;

        let sudo = match &spec.sudo {
            Some(sudo_spec) => {
                let password = sudo_spec
                    .password_secret
                    .as_deref()
                    .map(|name| self.secrets.get(name))
                    .transpose()?;
                Some(SudoConfig {
                    command: sudo_spec
                        .command
                        .clone()
                        .unwrap_or_else(|| "sudo".to_string()),
                    password,
                })
            }
            None => None,
        };

        if let Some(ref secret) = spec.passphrase_secret {
            // encrypted keys are unlocked through the agent by the
            // multiplexed OpenSSH transport; the secret is validated to
            // exist so a missing reference still fails fast
            let _ = self.secrets.get(secret)?;
            warn!(target = %id, "key passphrases are supplied via ssh-agent; passphrase_secret is only validated");
        }

        Ok(SshTargetConfig {
            id: id.to_string(),
            host: spec.host.clone(),
            port: spec.port.or(ssh_defaults.port),
            user: spec.user.clone().or_else(|| ssh_defaults.user.clone()),
            key: spec.key.as_deref().map(expand_key_path),
            known_hosts: spec
                .known_hosts
                .or(ssh_defaults.known_hosts)
                .unwrap_or(KnownHostsMode::Strict),
            keepalive: spec.keepalive.or(ssh_defaults.keepalive),
            connect_timeout: spec.connect_timeout.or(ssh_defaults.connect_timeout),
            jump_hosts: self.proxy_chain(id, spec)?,
            sudo,
            pool: merge_pool(
                &merge_pool(&PoolConfig::default(), &ssh_defaults.pool),
                &spec.pool,
            ),
        })
    }

    /// Walk proxy references into `-J`-style hop destinations, outermost
    /// hop first. Cycles were rejected at load.
    fn proxy_chain(&self, id: &str, spec: &SshTargetSpec) -> Result<Vec<String>, Error> {
        let mut chain = Vec::new();
        let mut current = spec.proxy.clone();
        let mut seen = vec![id.to_string()];

        while let Some(reference) = current {
            if seen.contains(&reference) {
                return Err(Error::config(format!(
                    "proxy chain cycle through '{reference}'"
                )));
            }
            seen.push(reference.clone());

            let short = reference
                .strip_prefix("hosts.")
                .ok_or_else(|| {
                    Error::config(format!("proxy '{reference}' must reference a hosts.* target"))
                })?;
            let hop = self
                .targets
                .hosts
                .get(short)
                .ok_or_else(|| Error::config(format!("proxy '{reference}' is not defined")))?;

            let user = hop.user.clone().or_else(|| self.defaults.ssh.user.clone());
            let port = hop.port.or(self.defaults.ssh.port);
            let mut destination = match user {
                Some(user) => format!("{}@{}", user, hop.host),
                None => hop.host.clone(),
            };
            if let Some(port) = port {
                destination = format!("{destination}:{port}");
            }
            chain.push(destination);
            current = hop.proxy.clone();
        }

        // walked target-outward; ssh -J wants outermost hop first
        chain.reverse();
        Ok(chain)
    }

    /// Drain shared transport resources.
    pub async fn shutdown(&self) {
        self.ssh.shutdown(Duration::from_secs(5)).await;
    }
}

fn not_found(name: &str) -> Error {
    Error::new(
        ErrorKind::TargetNotFound,
        format!("target '{name}' is not defined"),
    )
}

fn merge_pool(base: &PoolConfig, settings: &PoolSettings) -> PoolConfig {
    PoolConfig {
        min: settings.min.unwrap_or(base.min),
        max: settings.max.unwrap_or(base.max),
        idle_timeout: settings.idle_timeout.unwrap_or(base.idle_timeout),
        acquire_timeout: settings.acquire_timeout.unwrap_or(base.acquire_timeout),
        ..base.clone()
    }
}

fn resolve_docker(id: &str, spec: &ContainerTargetSpec) -> DockerTargetConfig {
    DockerTargetConfig {
        id: id.to_string(),
        container: spec.container.clone(),
        image: spec.image.clone(),
        run_mode: spec.run_mode,
        create: spec.create.clone(),
        wait_healthy: spec.wait_healthy,
        user: spec.user.clone(),
    }
}

fn resolve_pod(id: &str, spec: &PodTargetSpec) -> K8sTargetConfig {
    K8sTargetConfig {
        id: id.to_string(),
        namespace: spec
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string()),
        pod: spec.pod.clone(),
        selector: spec.selector.clone(),
        field_selector: spec.field_selector.clone(),
        pick: spec.pick,
        container: spec.container.clone(),
        context: spec.context.clone(),
        kubeconfig: spec.kubeconfig.clone(),
        wait_ready: spec.wait_ready,
    }
}

/// Inline descriptors: `ssh://user@host:port`, `docker://container`,
/// `pod://namespace/name`.
enum InlineTarget {
    Ssh {
        host: String,
        port: Option<u16>,
        user: Option<String>,
    },
    Docker {
        container: String,
    },
    Pod {
        namespace: Option<String>,
        pod: String,
    },
}

fn parse_inline(name: &str) -> Option<InlineTarget> {
    if let Some(rest) = name.strip_prefix("ssh://") {
        let (user, host_port) = match rest.split_once('@') {
            Some((user, rest)) => (Some(user.to_string()), rest),
            None => (None, rest),
        };
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), Some(port)),
                Err(_) => (host_port.to_string(), None),
            },
            None => (host_port.to_string(), None),
        };
        return Some(InlineTarget::Ssh { host, port, user });
    }
    if let Some(container) = name.strip_prefix("docker://") {
        return Some(InlineTarget::Docker {
            container: container.to_string(),
        });
    }
    if let Some(rest) = name.strip_prefix("pod://") {
        let (namespace, pod) = match rest.split_once('/') {
            Some((ns, pod)) => (Some(ns.to_string()), pod.to_string()),
            None => (None, rest.to_string()),
        };
        return Some(InlineTarget::Pod { namespace, pod });
    }
    None
}

/// Load-time validation: required fields, secret references, proxy graph.
pub fn validate_targets(
    section: &TargetsSection,
    secrets: &dyn SecretReader,
) -> Result<(), Error> {
    // proxy chain graph: nodes are hosts, edges point at the jump host
    let mut graph = DiGraph::<&str, ()>::new();
    let mut nodes = HashMap::new();
    for name in section.hosts.keys() {
        let idx = graph.add_node(name.as_str());
        let _ = nodes.insert(name.as_str(), idx);
    }
    for (name, spec) in &section.hosts {
        if spec.host.is_empty() {
            return Err(Error::config(format!("hosts.{name}: host must not be empty")));
        }
        let mut secret_refs: Vec<&str> = Vec::new();
        if let Some(ref s) = spec.passphrase_secret {
            secret_refs.push(s);
        }
        if let Some(s) = spec.sudo.as_ref().and_then(|s| s.password_secret.as_deref()) {
            secret_refs.push(s);
        }
        for secret in secret_refs {
            if !secrets.contains(secret) {
                return Err(Error::config(format!(
                    "hosts.{name}: secret '{secret}' does not exist"
                )));
            }
        }
        if let Some(ref proxy) = spec.proxy {
            let Some(short) = proxy.strip_prefix("hosts.") else {
                return Err(Error::config(format!(
                    "hosts.{name}: proxy '{proxy}' must reference a hosts.* target"
                )));
            };
            let Some(&hop_idx) = nodes.get(short) else {
                return Err(Error::config(format!(
                    "hosts.{name}: proxy '{proxy}' is not defined"
                )));
            };
            let _ = graph.add_edge(nodes[name.as_str()], hop_idx, ());
        }
    }
    if is_cyclic_directed(&graph) {
        return Err(Error::config("proxy chain contains a cycle"));
    }

    for (name, spec) in &section.containers {
        if let Some(ref host) = spec.host {
            let parsed = url::Url::parse(host).map_err(|e| {
                Error::config(format!("containers.{name}: bad daemon endpoint '{host}': {e}"))
            })?;
            if !matches!(parsed.scheme(), "unix" | "tcp" | "http" | "https") {
                return Err(Error::config(format!(
                    "containers.{name}: daemon endpoint must be unix://, tcp://, http:// or https://"
                )));
            }
        }
        match spec.run_mode {
            RunMode::Exec => {
                if spec.container.is_none() {
                    return Err(Error::config(format!(
                        "containers.{name}: exec mode requires a container name"
                    )));
                }
            }
            RunMode::Run => {
                if spec.image.is_none() {
                    return Err(Error::config(format!(
                        "containers.{name}: run mode requires an image"
                    )));
                }
            }
            RunMode::Hybrid => {
                if spec.container.is_none() || spec.image.is_none() {
                    return Err(Error::config(format!(
                        "containers.{name}: hybrid mode requires a container name and an image"
                    )));
                }
            }
        }
    }

    for (name, spec) in &section.pods {
        if spec.pod.is_none() && spec.selector.is_none() && spec.field_selector.is_none() {
            return Err(Error::config(format!(
                "pods.{name}: set a pod name, a selector, or a field selector"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::StaticSecrets;

    fn sample_section() -> TargetsSection {
        crate::config::ConfigDoc::parse(
            r#"
targets:
  hosts:
    bastion:
      host: bastion.example.com
      user: jump
    web-1:
      host: web-1.internal
      user: deploy
      proxy: hosts.bastion
  containers:
    app:
      container: my-app
  pods:
    frontend:
      selector: app=frontend
"#,
            None,
        )
        .unwrap()
        .targets
    }

    fn registry() -> TargetRegistry {
        TargetRegistry::new(
            sample_section(),
            Defaults::default(),
            Arc::new(StaticSecrets::default()),
        )
    }

    #[tokio::test]
    async fn local_always_resolves() {
        let registry = registry();
        let bound = registry.resolve("local").await.unwrap();
        assert!(matches!(bound.binding, Binding::Local(_)));
    }

    #[tokio::test]
    async fn unknown_names_are_target_not_found() {
        let registry = registry();
        let err = registry.resolve("hosts.nope").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TargetNotFound);
        let err = registry.resolve("nonsense").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TargetNotFound);
    }

    #[tokio::test]
    async fn ssh_binding_resolves_proxy_chain() {
        let registry = registry();
        let bound = registry.resolve("hosts.web-1").await.unwrap();
        let Binding::Ssh(ref config) = bound.binding else {
            panic!("expected ssh binding");
        };
        assert_eq!(config.destination(), "deploy@web-1.internal");
        assert_eq!(config.jump_hosts, vec!["jump@bastion.example.com"]);
    }

    #[tokio::test]
    async fn pattern_expansion_is_ordered() {
        let registry = registry();
        let names: Vec<String> = registry
            .target_names()
            .into_iter()
            .filter(|n| glob::Pattern::new("hosts.*").unwrap().matches(n))
            .collect();
        assert_eq!(names, vec!["hosts.bastion", "hosts.web-1"]);
    }

    #[tokio::test]
    async fn pattern_with_no_matches_errors() {
        let registry = registry();
        let err = registry.resolve_pattern("pods.nothing-*").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TargetNotFound);
    }

    #[test]
    fn validation_rejects_proxy_cycles() {
        let section = crate::config::ConfigDoc::parse(
            r#"
targets:
  hosts:
    a:
      host: a.example.com
      proxy: hosts.b
    b:
      host: b.example.com
      proxy: hosts.a
"#,
            None,
        )
        .unwrap()
        .targets;
        let err = validate_targets(&section, &StaticSecrets::default()).unwrap_err();
        assert!(err.message.contains("cycle"));
    }

    #[test]
    fn validation_rejects_missing_secret() {
        let section = crate::config::ConfigDoc::parse(
            r#"
targets:
  hosts:
    web:
      host: web.example.com
      sudo:
        password_secret: nope
"#,
            None,
        )
        .unwrap()
        .targets;
        let err = validate_targets(&section, &StaticSecrets::default()).unwrap_err();
        assert!(err.message.contains("nope"));
    }

    #[test]
    fn validation_requires_mode_fields() {
        let section = crate::config::ConfigDoc::parse(
            r#"
targets:
  containers:
    app:
      run_mode: run
"#,
            None,
        )
        .unwrap()
        .targets;
        let err = validate_targets(&section, &StaticSecrets::default()).unwrap_err();
        assert!(err.message.contains("image"));
    }

    #[test]
    fn inline_descriptors_parse() {
        assert!(matches!(
            parse_inline("ssh://deploy@host:2222"),
            Some(InlineTarget::Ssh { port: Some(2222), .. })
        ));
        assert!(matches!(
            parse_inline("docker://my-app"),
            Some(InlineTarget::Docker { .. })
        ));
        assert!(matches!(
            parse_inline("pod://staging/web-0"),
            Some(InlineTarget::Pod { .. })
        ));
        assert!(parse_inline("hosts.web-1").is_none());
    }
}
