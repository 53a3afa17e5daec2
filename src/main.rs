mod audit;
mod command;
mod config;
mod docker;
mod engine;
mod error;
mod k8s;
mod local;
mod pool;
mod registry;
mod secrets;
mod ssh;
mod stream;
mod task;
mod transfer;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::audit::AuditLog;
use crate::command::{Command, IoMode};
use crate::config::ConfigDoc;
use crate::engine::Engine;
use crate::error::Error;
use crate::registry::{Binding, TargetRegistry};
use crate::secrets::{FileSecrets, SecretReader};
use crate::task::{CompiledTask, TaskOutcome, TaskRunner, TaskState};

#[derive(Parser)]
#[command(name = "hop")]
#[command(about = "Run commands and tasks across local, SSH, Docker and Kubernetes targets", long_about = None)]
struct Cli {
    /// Path to the config file
    #[arg(short, long, global = true, default_value = "hopfile.yml")]
    config: PathBuf,

    /// Profile overlay to apply
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress status output, only show command output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a named task
    Run {
        /// Task name
        task: String,

        /// Parameter bindings, name=value
        #[arg(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,

        /// Target (or pattern) overriding the task's own
        #[arg(long)]
        target: Option<String>,
    },

    /// Run an ad-hoc command on one target
    In {
        /// Target name (`local`, `hosts.web-1`, `ssh://user@host`, ...)
        target: String,

        /// Command timeout, e.g. "30s"
        #[arg(long)]
        timeout: Option<String>,

        /// Extra environment, NAME=VALUE
        #[arg(long = "env", value_name = "NAME=VALUE")]
        env: Vec<String>,

        /// Working directory inside the target
        #[arg(long)]
        cwd: Option<String>,

        /// The command line
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Run an ad-hoc command on every target matching a pattern
    On {
        /// Target pattern, e.g. 'hosts.*'
        pattern: String,

        /// The command line
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Copy files between local paths and targets (`target:/path`)
    Copy {
        src: String,
        dst: String,

        /// Concurrent transfers within a directory tree
        #[arg(long, default_value_t = 4)]
        parallelism: usize,
    },

    /// Stream logs from a container or pod target
    Logs {
        /// Target name
        target: String,

        /// Keep following new output
        #[arg(short, long)]
        follow: bool,

        /// Only the last N lines
        #[arg(long)]
        tail: Option<i64>,

        /// Prefix lines with timestamps
        #[arg(long)]
        timestamps: bool,
    },

    /// Forward a local port to a target port (SSH tunnel or pod forward)
    Forward {
        /// Target name
        target: String,

        /// Port mapping, local:remote
        mapping: String,
    },

    /// List targets and tasks
    List {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate the config file
    Validate,
}

/// JSON shape for `list --format json`
#[derive(Serialize)]
struct ListOutput {
    targets: Vec<String>,
    tasks: Vec<TaskInfo>,
}

#[derive(Serialize)]
struct TaskInfo {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    targets: Vec<String>,
    steps: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose, cli.quiet);

    match run(cli).await {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(e.kind.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<i32, Error> {
    let doc = if cli.config.exists() {
        ConfigDoc::load(&cli.config, cli.profile.as_deref())?
    } else if matches!(cli.command, Commands::Validate) {
        return Err(Error::config(format!(
            "config file {} not found",
            cli.config.display()
        )));
    } else {
        // ad-hoc commands work without a config file (inline targets)
        ConfigDoc::default()
    };

    config::load_dotenv(&doc.dotenv)?;

    let secrets: Arc<dyn SecretReader> = Arc::new(FileSecrets::new(doc.secrets_dir.clone()));
    doc.validate(secrets.as_ref())?;

    let mut tasks: BTreeMap<String, CompiledTask> = BTreeMap::new();
    for (name, spec) in &doc.tasks {
        let _ = tasks.insert(name.clone(), task::compile(name, spec, &doc.tasks)?);
    }

    let registry = Arc::new(TargetRegistry::new(
        doc.targets.clone(),
        doc.defaults.clone(),
        secrets,
    ));
    let audit = doc.audit_log.clone().map(AuditLog::new);
    let engine = Engine::new(registry, audit);

    let ctx = CancellationToken::new();
    spawn_signal_handler(ctx.clone());

    let code = dispatch(&cli.command, &engine, &tasks, &ctx).await;
    engine.shutdown().await;
    code
}

async fn dispatch(
    command: &Commands,
    engine: &Engine,
    tasks: &BTreeMap<String, CompiledTask>,
    ctx: &CancellationToken,
) -> Result<i32, Error> {
    match command {
        Commands::Run {
            task,
            params,
            target,
        } => {
            let bindings = parse_pairs(params, "param")?;
            let runner = TaskRunner::new(engine, tasks);
            let outcomes = runner.run(ctx, task, &bindings, target.as_deref()).await?;
            print_outcomes(&outcomes);
            if ctx.is_cancelled() {
                return Ok(130);
            }
            Ok(if outcomes.iter().all(TaskOutcome::ok) {
                0
            } else {
                1
            })
        }

        Commands::In {
            target,
            timeout,
            env,
            cwd,
            command,
        } => {
            let mut cmd = Command::shell(command.join(" ")).with_io_mode(IoMode::Tee);
            for (name, value) in parse_pairs(env, "env")? {
                cmd = cmd.with_env(name, value);
            }
            if let Some(ref dir) = cwd {
                cmd = cmd.with_cwd(dir.clone());
            }
            if let Some(ref raw) = timeout {
                let parsed = humantime::parse_duration(raw)
                    .map_err(|e| Error::config(format!("invalid timeout '{raw}': {e}")))?;
                cmd = cmd.with_timeout(parsed);
            }
            let _ = engine.execute(ctx, target, &cmd).await?;
            Ok(0)
        }

        Commands::On { pattern, command } => {
            let targets = engine.registry().resolve_pattern(pattern).await?;
            let cmd = Command::shell(command.join(" ")).with_io_mode(IoMode::Tee);
            let results = futures::future::join_all(targets.iter().map(|bound| {
                let cmd = cmd.clone();
                let id = bound.id.clone();
                async move { (id, engine.execute(ctx, &bound.id, &cmd).await) }
            }))
            .await;

            let mut failed = false;
            println!("\n{}", "Results:".bold());
            for (id, result) in results {
                match result {
                    Ok(_) => println!("  {} {id}", "✓".green()),
                    Err(e) => {
                        failed = true;
                        println!("  {} {id}: {}", "✗".red(), e.message);
                    }
                }
            }
            Ok(if ctx.is_cancelled() {
                130
            } else if failed {
                1
            } else {
                0
            })
        }

        Commands::Copy {
            src,
            dst,
            parallelism,
        } => {
            let opts = transfer::CopyOptions {
                parallelism: *parallelism,
                progress: None,
            };
            let bytes = transfer::copy(engine, ctx, src, dst, &opts).await?;
            println!("{} copied {bytes} bytes", "✓".green());
            Ok(0)
        }

        Commands::Logs {
            target,
            follow,
            tail,
            timestamps,
        } => {
            let bound = engine.registry().resolve(target).await?;
            let sinks = stream::SinkSet::new(
                &stream::StreamOpts::new(IoMode::Stream, bound.id.clone()),
                ctx,
            );
            match &bound.binding {
                Binding::Docker { adapter, config } => {
                    adapter
                        .stream_logs(config, *follow, *tail, *timestamps, &sinks)
                        .await?;
                }
                Binding::K8s { adapter, config } => {
                    adapter
                        .stream_logs(config, *follow, *tail, *timestamps, &sinks)
                        .await?;
                }
                _ => {
                    return Err(Error::config(format!(
                        "target '{target}' does not produce logs (containers and pods do)"
                    )));
                }
            }
            Ok(if ctx.is_cancelled() { 130 } else { 0 })
        }

        Commands::Forward { target, mapping } => forward(engine, ctx, target, mapping).await,

        Commands::List { format } => {
            list(engine, tasks, format);
            Ok(0)
        }

        Commands::Validate => {
            println!("{} Config is valid!", "✓".green());
            println!("  {} targets defined", engine.registry().target_names().len() - 1);
            println!("  {} tasks defined", tasks.len());
            Ok(0)
        }
    }
}

async fn forward(
    engine: &Engine,
    ctx: &CancellationToken,
    target: &str,
    mapping: &str,
) -> Result<i32, Error> {
    let (local_raw, remote_raw) = mapping.split_once(':').ok_or_else(|| {
        Error::config(format!("port mapping must be local:remote, got '{mapping}'"))
    })?;
    let local: u16 = local_raw
        .parse()
        .map_err(|_| Error::config(format!("bad local port '{local_raw}'")))?;
    let remote: u16 = remote_raw
        .parse()
        .map_err(|_| Error::config(format!("bad remote port '{remote_raw}'")))?;

    let bound = engine.registry().resolve(target).await?;
    match &bound.binding {
        Binding::Ssh(config) => {
            let session = engine.registry().ssh_adapter().session(config).await?;
            ssh::setup_port_forward(&session, local, "localhost", remote).await?;
            println!(
                "{} forwarding 127.0.0.1:{local} -> {}:{remote} (ctrl-c to stop)",
                "✓".green(),
                config.host
            );
            ctx.cancelled().await;
            let _ = ssh::close_port_forward(&session, local, "localhost", remote).await;
            Ok(130)
        }
        Binding::K8s { adapter, config } => {
            let guard = adapter.port_forward(config, local, remote).await?;
            println!(
                "{} forwarding {} -> pod:{remote} (ctrl-c to stop)",
                "✓".green(),
                guard.local_addr
            );
            ctx.cancelled().await;
            guard.stop().await;
            Ok(130)
        }
        _ => Err(Error::config(format!(
            "target '{target}' does not support port forwarding"
        ))),
    }
}

fn list(engine: &Engine, tasks: &BTreeMap<String, CompiledTask>, format: &str) {
    match format {
        "json" => {
            let output = ListOutput {
                targets: engine.registry().target_names(),
                tasks: tasks
                    .values()
                    .map(|t| TaskInfo {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        targets: t.targets.clone(),
                        steps: t.steps.len(),
                    })
                    .collect(),
            };
            match serde_json::to_string_pretty(&output) {
                Ok(text) => println!("{text}"),
                Err(e) => eprintln!("failed to render json: {e}"),
            }
        }
        _ => {
            println!("{}", "Targets:".bold());
            for name in engine.registry().target_names() {
                println!("  {} {name}", "•".cyan());
            }
            println!("\n{}", "Tasks:".bold());
            for task in tasks.values() {
                let description = task
                    .description
                    .as_deref()
                    .map(|d| format!(" ({d})"))
                    .unwrap_or_default();
                println!("  {} {}{}", "•".cyan(), task.name, description.dimmed());
            }
        }
    }
}

fn parse_pairs(pairs: &[String], what: &str) -> Result<HashMap<String, String>, Error> {
    let mut out = HashMap::new();
    for pair in pairs {
        let Some((name, value)) = pair.split_once('=') else {
            return Err(Error::config(format!(
                "--{what} expects NAME=VALUE, got '{pair}'"
            )));
        };
        let _ = out.insert(name.to_string(), value.to_string());
    }
    Ok(out)
}

fn print_outcomes(outcomes: &[TaskOutcome]) {
    println!("\n{}", "Results:".bold());
    for outcome in outcomes {
        let status = match outcome.state {
            TaskState::Succeeded => "✓".green(),
            TaskState::Failed => "✗".red(),
            TaskState::Aborted => "○".yellow(),
        };
        println!("  {} {} on {}", status, outcome.task, outcome.target);
        for step in &outcome.steps {
            let mark = match step.status {
                task::StepStatus::Succeeded => "✓".green(),
                task::StepStatus::Failed => "✗".red(),
                task::StepStatus::Skipped => "○".dimmed(),
                task::StepStatus::Cancelled => "!".yellow(),
            };
            let attempts = if step.attempts > 1 {
                format!(" ({} attempts)", step.attempts).dimmed().to_string()
            } else {
                String::new()
            };
            println!("      {} {}{}", mark, step.name, attempts);
        }
        if let Some(ref err) = outcome.error {
            eprintln!("{err}");
        }
    }
}

/// First ctrl-c cancels the context for a clean unwind; a second one
/// exits immediately.
fn spawn_signal_handler(ctx: CancellationToken) {
    let _ = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted, unwinding (ctrl-c again to force quit)");
            ctx.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

fn setup_tracing(verbose: bool, quiet: bool) {
    if quiet {
        return;
    }

    let default = if verbose { "hop=debug" } else { "hop=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(verbose)
        .with_level(true)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter))
        .init();
}
