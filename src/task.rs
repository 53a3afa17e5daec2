//! Task orchestrator: interpret multi-step task specifications.
//!
//! Steps run strictly in declared order; a ParallelGroup fans its children
//! out under a concurrency cap; `when` guards consult the task's variable
//! scope; `register` stores step results back into it; `on_failure`
//! decides between abort, tolerated failure, retries and fallbacks;
//! `always_run` steps execute even while the task is unwinding after an
//! abort or a cancellation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use hop_expr::{Expr, Template, Value};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::{Command, IoMode};
use crate::config::{
    BackoffKind, FailureMode, OnFailureSpec, ParamSpec, ParamType, StepSpec, TaskSpec,
};
use crate::engine::{Engine, ExecOptions};
use crate::error::{Error, ErrorKind};

/// Deadline for `always_run` cleanup once the task context is gone.
const CLEANUP_DEADLINE: Duration = Duration::from_secs(30);

/// Recursion guard for task-in-task references at runtime.
const MAX_TASK_DEPTH: usize = 16;

// --- compiled model -----------------------------------------------------

#[derive(Debug, Clone)]
pub enum OnFailure {
    Abort,
    Continue,
    Ignore,
    Retry {
        attempts: u32,
        delay: Duration,
        backoff: BackoffKind,
        fallback: Option<Box<Step>>,
    },
}

#[derive(Debug, Clone)]
pub struct CommandStep {
    /// Shell line, interpolated at run time.
    pub run: Option<Template>,
    /// Exec argv, each element interpolated.
    pub argv: Option<Vec<Template>>,
    pub env: HashMap<String, Template>,
    pub replace_env: bool,
    pub cwd: Option<Template>,
    pub user: Option<String>,
    pub timeout: Option<Duration>,
    pub nothrow: bool,
    /// Per-step target override.
    pub target: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StepKind {
    Command(CommandStep),
    Task {
        task: String,
        params: BTreeMap<String, Template>,
    },
    Script(Expr),
    Parallel {
        max_concurrency: usize,
        fail_fast: bool,
        steps: Vec<Step>,
    },
}

#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    pub register: Option<String>,
    pub when: Option<Expr>,
    pub on_failure: OnFailure,
    pub always_run: bool,
}

#[derive(Debug, Clone)]
pub struct CompiledTask {
    pub name: String,
    pub description: Option<String>,
    pub params: Vec<ParamSpec>,
    pub targets: Vec<String>,
    pub parallel: bool,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub before: Vec<Step>,
    pub after: Vec<Step>,
    pub on_error: Vec<Step>,
    pub steps: Vec<Step>,
}

// --- compilation --------------------------------------------------------

/// Compile a task spec: parse every expression and template, check step
/// shapes and cross-task references. Called for every task at config load,
/// so an invalid `when` is a ConfigError before anything executes.
pub fn compile(
    name: &str,
    spec: &TaskSpec,
    all: &BTreeMap<String, TaskSpec>,
) -> Result<CompiledTask, Error> {
    let mut stack = vec![name.to_string()];
    check_task_cycles(spec, all, &mut stack)?;

    let steps = compile_steps(&spec.steps, spec)?;
    let before = compile_steps(&spec.hooks.before, spec)?;
    let after = compile_steps(&spec.hooks.after, spec)?;
    let on_error = compile_steps(&spec.hooks.on_error, spec)?;

    for param in &spec.params {
        if param.kind == ParamType::Enum && param.values.is_empty() {
            return Err(Error::config(format!(
                "parameter '{}' is an enum with no values",
                param.name
            )));
        }
        if let Some(ref pattern) = param.pattern {
            let _ = regex::Regex::new(pattern).map_err(|e| {
                Error::config(format!("parameter '{}': bad pattern: {e}", param.name))
            })?;
        }
    }

    for step in steps.iter().chain(&before).chain(&after).chain(&on_error) {
        check_task_refs(step, all)?;
    }

    Ok(CompiledTask {
        name: name.to_string(),
        description: spec.description.clone(),
        params: spec.params.clone(),
        targets: spec.targets.clone(),
        parallel: spec.parallel,
        env: spec.env.clone(),
        timeout: spec.timeout,
        before,
        after,
        on_error,
        steps,
    })
}

fn check_task_cycles(
    spec: &TaskSpec,
    all: &BTreeMap<String, TaskSpec>,
    stack: &mut Vec<String>,
) -> Result<(), Error> {
    fn walk<'a>(steps: &'a [StepSpec], out: &mut Vec<&'a str>) {
        for step in steps {
            if let Some(ref task) = step.task {
                out.push(task);
            }
            if let Some(ref group) = step.parallel {
                walk(&group.steps, out);
            }
        }
    }

    let mut refs = Vec::new();
    walk(&spec.steps, &mut refs);
    walk(&spec.hooks.before, &mut refs);
    walk(&spec.hooks.after, &mut refs);
    walk(&spec.hooks.on_error, &mut refs);

    for reference in refs {
        if stack.iter().any(|s| s == reference) {
            return Err(Error::config(format!(
                "task reference cycle: {} -> {reference}",
                stack.join(" -> ")
            )));
        }
        if let Some(child) = all.get(reference) {
            stack.push(reference.to_string());
            check_task_cycles(child, all, stack)?;
            let _ = stack.pop();
        }
    }
    Ok(())
}

fn check_task_refs(step: &Step, all: &BTreeMap<String, TaskSpec>) -> Result<(), Error> {
    match &step.kind {
        StepKind::Task { task, params } => {
            let Some(spec) = all.get(task) else {
                return Err(Error::config(format!(
                    "step '{}' references unknown task '{task}'",
                    step.name
                )));
            };
            for bound in params.keys() {
                if !spec.params.iter().any(|p| &p.name == bound) {
                    return Err(Error::config(format!(
                        "step '{}' binds unknown parameter '{bound}' of task '{task}'",
                        step.name
                    )));
                }
            }
            Ok(())
        }
        StepKind::Parallel { steps, .. } => {
            for child in steps {
                check_task_refs(child, all)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn compile_steps(specs: &[StepSpec], task: &TaskSpec) -> Result<Vec<Step>, Error> {
    specs
        .iter()
        .enumerate()
        .map(|(index, spec)| compile_step(spec, index, task))
        .collect()
}

fn compile_step(spec: &StepSpec, index: usize, task: &TaskSpec) -> Result<Step, Error> {
    let shapes = [
        spec.run.is_some(),
        spec.argv.is_some(),
        spec.task.is_some(),
        spec.script.is_some(),
        spec.parallel.is_some(),
    ];
    let set = shapes.iter().filter(|s| **s).count();
    let name = spec
        .name
        .clone()
        .unwrap_or_else(|| format!("step-{}", index + 1));
    if set != 1 {
        return Err(Error::config(format!(
            "step '{name}' must set exactly one of run, argv, task, script, parallel"
        )));
    }

    let when = spec
        .when
        .as_deref()
        .map(Expr::parse)
        .transpose()
        .map_err(|e| Error::config(format!("step '{name}': when: {e}")))?;

    let on_failure = match &spec.on_failure {
        None => OnFailure::Abort,
        Some(OnFailureSpec::Mode(FailureMode::Abort)) => OnFailure::Abort,
        Some(OnFailureSpec::Mode(FailureMode::Continue)) => OnFailure::Continue,
        Some(OnFailureSpec::Mode(FailureMode::Ignore)) => OnFailure::Ignore,
        Some(OnFailureSpec::Retry(record)) => {
            let fallback = record
                .fallback
                .as_deref()
                .map(|target_name| {
                    let found = task
                        .steps
                        .iter()
                        .enumerate()
                        .find(|(_, s)| s.name.as_deref() == Some(target_name))
                        .ok_or_else(|| {
                            Error::config(format!(
                                "step '{name}': fallback '{target_name}' is not a named step"
                            ))
                        })?;
                    let mut fallback = compile_step(found.1, found.0, task)?;
                    // a fallback handles the failure; it does not chain
                    fallback.on_failure = OnFailure::Abort;
                    Ok::<_, Error>(Box::new(fallback))
                })
                .transpose()?;
            OnFailure::Retry {
                attempts: record.retry.max(1),
                delay: record.delay.unwrap_or(Duration::from_secs(1)),
                backoff: record.backoff,
                fallback,
            }
        }
    };

    let parse_template = |text: &str, what: &str| {
        Template::parse(text)
            .map_err(|e| Error::config(format!("step '{name}': {what}: {e}")))
    };

    let kind = if let Some(ref line) = spec.run {
        StepKind::Command(CommandStep {
            run: Some(parse_template(line, "run")?),
            argv: None,
            env: compile_env(&spec.env, &name)?,
            replace_env: spec.replace_env,
            cwd: spec
                .cwd
                .as_deref()
                .map(|c| parse_template(c, "cwd"))
                .transpose()?,
            user: spec.user.clone(),
            timeout: spec.timeout,
            nothrow: spec.nothrow,
            target: spec.target.clone(),
        })
    } else if let Some(ref argv) = spec.argv {
        let argv = argv
            .iter()
            .map(|a| parse_template(a, "argv"))
            .collect::<Result<Vec<_>, _>>()?;
        StepKind::Command(CommandStep {
            run: None,
            argv: Some(argv),
            env: compile_env(&spec.env, &name)?,
            replace_env: spec.replace_env,
            cwd: spec
                .cwd
                .as_deref()
                .map(|c| parse_template(c, "cwd"))
                .transpose()?,
            user: spec.user.clone(),
            timeout: spec.timeout,
            nothrow: spec.nothrow,
            target: spec.target.clone(),
        })
    } else if let Some(ref reference) = spec.task {
        let mut params = BTreeMap::new();
        for (key, value) in &spec.params {
            let text = yaml_to_string(value);
            let _ = params.insert(key.clone(), parse_template(&text, "params")?);
        }
        StepKind::Task {
            task: reference.clone(),
            params,
        }
    } else if let Some(ref script) = spec.script {
        StepKind::Script(
            Expr::parse(script)
                .map_err(|e| Error::config(format!("step '{name}': script: {e}")))?,
        )
    } else {
        let group = spec.parallel.as_ref().expect("checked above");
        StepKind::Parallel {
            max_concurrency: group.max_concurrency.unwrap_or(usize::MAX).max(1),
            fail_fast: group.fail_fast,
            steps: compile_steps(&group.steps, task)?,
        }
    };

    Ok(Step {
        name,
        kind,
        register: spec.register.clone(),
        when,
        on_failure,
        always_run: spec.always_run,
    })
}

fn compile_env(
    env: &HashMap<String, String>,
    step: &str,
) -> Result<HashMap<String, Template>, Error> {
    env.iter()
        .map(|(k, v)| {
            Template::parse(v)
                .map(|t| (k.clone(), t))
                .map_err(|e| Error::config(format!("step '{step}': env {k}: {e}")))
        })
        .collect()
}

fn yaml_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}

// --- parameter coercion -------------------------------------------------

/// Coerce CLI/task-step string bindings into typed scope values, applying
/// defaults and validation.
pub fn coerce_params(
    specs: &[ParamSpec],
    bindings: &HashMap<String, String>,
) -> Result<BTreeMap<String, Value>, Error> {
    for name in bindings.keys() {
        if !specs.iter().any(|p| &p.name == name) {
            return Err(Error::config(format!("unknown parameter '{name}'")));
        }
    }

    let mut out = BTreeMap::new();
    for spec in specs {
        let raw = match bindings.get(&spec.name) {
            Some(raw) => Some(raw.clone()),
            None => match &spec.default {
                Some(default) => Some(yaml_to_string(default)),
                None if spec.required => {
                    return Err(Error::config(format!(
                        "missing required parameter '{}'",
                        spec.name
                    )));
                }
                None => None,
            },
        };
        let Some(raw) = raw else { continue };

        if let Some(ref pattern) = spec.pattern {
            let re = regex::Regex::new(pattern)
                .map_err(|e| Error::config(format!("parameter '{}': {e}", spec.name)))?;
            if !re.is_match(&raw) {
                return Err(Error::config(format!(
                    "parameter '{}' value '{raw}' does not match {pattern}",
                    spec.name
                )));
            }
        }

        let value = match spec.kind {
            ParamType::String => Value::Str(raw),
            ParamType::Number => Value::Number(raw.parse::<f64>().map_err(|_| {
                Error::config(format!("parameter '{}' expects a number, got '{raw}'", spec.name))
            })?),
            ParamType::Bool => match raw.as_str() {
                "true" | "yes" | "1" => Value::Bool(true),
                "false" | "no" | "0" => Value::Bool(false),
                _ => {
                    return Err(Error::config(format!(
                        "parameter '{}' expects a bool, got '{raw}'",
                        spec.name
                    )));
                }
            },
            ParamType::Enum => {
                if !spec.values.iter().any(|v| v == &raw) {
                    return Err(Error::config(format!(
                        "parameter '{}' must be one of [{}], got '{raw}'",
                        spec.name,
                        spec.values.join(", ")
                    )));
                }
                Value::Str(raw)
            }
            ParamType::List => Value::List(
                raw.split(',')
                    .map(|item| Value::Str(item.trim().to_string()))
                    .collect(),
            ),
        };
        let _ = out.insert(spec.name.clone(), value);
    }
    Ok(out)
}

// --- execution ----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Succeeded,
    /// A step aborted the task; `always_run` steps were still attempted.
    Failed,
    /// The invocation context was cancelled mid-task.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: String,
    pub status: StepStatus,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct TaskOutcome {
    pub task: String,
    pub target: String,
    pub state: TaskState,
    pub steps: Vec<StepReport>,
    pub error: Option<Error>,
}

impl TaskOutcome {
    pub fn ok(&self) -> bool {
        self.state == TaskState::Succeeded
    }
}

type Scope = Arc<Mutex<BTreeMap<String, Value>>>;

struct ScopeSnapshot(BTreeMap<String, Value>);

impl hop_expr::Scope for ScopeSnapshot {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.0.get(name).cloned()
    }
}

pub struct TaskRunner<'a> {
    engine: &'a Engine,
    tasks: &'a BTreeMap<String, CompiledTask>,
}

impl<'a> TaskRunner<'a> {
    pub fn new(engine: &'a Engine, tasks: &'a BTreeMap<String, CompiledTask>) -> Self {
        TaskRunner { engine, tasks }
    }

    /// Run a task by name. Multi-target tasks dispatch one invocation per
    /// target, each with its own scope; the outcomes aggregate.
    pub async fn run(
        &self,
        ctx: &CancellationToken,
        task_name: &str,
        bindings: &HashMap<String, String>,
        target_override: Option<&str>,
    ) -> Result<Vec<TaskOutcome>, Error> {
        let task = self.tasks.get(task_name).ok_or_else(|| {
            Error::new(
                ErrorKind::TargetNotFound,
                format!("task '{task_name}' is not defined"),
            )
        })?;

        let params = coerce_params(&task.params, bindings)?;

        let patterns: Vec<String> = match target_override {
            Some(pattern) => vec![pattern.to_string()],
            None if task.targets.is_empty() => vec!["local".to_string()],
            None => task.targets.clone(),
        };
        let mut targets = Vec::new();
        for pattern in &patterns {
            for bound in self.engine.registry().resolve_pattern(pattern).await? {
                if !targets.contains(&bound.id) {
                    targets.push(bound.id.clone());
                }
            }
        }

        if task.parallel && targets.len() > 1 {
            let outcomes = join_all(targets.iter().map(|target| {
                self.run_invocation(ctx, task, target, params.clone(), 0)
            }))
            .await;
            Ok(outcomes)
        } else {
            let mut outcomes = Vec::with_capacity(targets.len());
            for target in &targets {
                outcomes.push(
                    self.run_invocation(ctx, task, target, params.clone(), 0)
                        .await,
                );
            }
            Ok(outcomes)
        }
    }

    /// One task invocation against one target, with its own scope.
    async fn run_invocation(
        &self,
        ctx: &CancellationToken,
        task: &CompiledTask,
        target: &str,
        params: BTreeMap<String, Value>,
        depth: usize,
    ) -> TaskOutcome {
        let mut initial = BTreeMap::new();
        let _ = initial.insert("params".to_string(), Value::Map(params.clone()));
        for (name, value) in params {
            let _ = initial.insert(name, value);
        }
        let _ = initial.insert(
            "env".to_string(),
            Value::Map(
                task.env
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::Str(v.clone())))
                    .collect(),
            ),
        );
        let _ = initial.insert("target".to_string(), Value::Str(target.to_string()));
        let scope: Scope = Arc::new(Mutex::new(initial));

        info!(task = %task.name, target = %target, "task started");

        let mut reports = Vec::new();
        let mut failed: Option<Error> = None;

        // before hook: a failure here aborts before any step runs
        for step in &task.before {
            if ctx.is_cancelled() {
                break;
            }
            let (report, error) = self
                .run_step_guarded(ctx, task, target, step, &scope, depth)
                .await;
            let aborted = error.is_some();
            reports.push(report);
            if aborted {
                failed = error;
                break;
            }
        }

        // main steps; once the task has aborted (step failure, before-hook
        // failure or cancellation) only always_run steps still execute
        for step in &task.steps {
            let unwinding = failed.is_some() || ctx.is_cancelled();
            if unwinding && !step.always_run {
                reports.push(StepReport {
                    name: step.name.clone(),
                    status: StepStatus::Skipped,
                    attempts: 0,
                });
                continue;
            }

            let (report, error) = if unwinding {
                // cleanup steps get a fresh, short-deadline context so
                // they can complete even after cancellation
                let cleanup = cleanup_context();
                let (report, error) = self
                    .run_step_guarded(&cleanup, task, target, step, &scope, depth)
                    .await;
                if let Some(ref e) = error {
                    warn!(step = %step.name, error = %e, "cleanup step failed");
                }
                // a cleanup failure never re-triggers unwinding
                (report, None)
            } else {
                self.run_step_guarded(ctx, task, target, step, &scope, depth)
                    .await
            };

            reports.push(report);
            if failed.is_none() {
                failed = error;
            }
        }

        let was_cancelled = ctx.is_cancelled();

        // onError hook in declared order, failures logged only
        if failed.is_some() || was_cancelled {
            for step in &task.on_error {
                let cleanup = cleanup_context();
                let (report, error) = self
                    .run_step_guarded(&cleanup, task, target, step, &scope, depth)
                    .await;
                if let Some(ref e) = error {
                    warn!(step = %step.name, error = %e, "onError hook failed");
                }
                reports.push(report);
            }
        }

        // after hook runs unconditionally
        for step in &task.after {
            let cleanup = cleanup_context();
            let (report, error) = self
                .run_step_guarded(&cleanup, task, target, step, &scope, depth)
                .await;
            if let Some(ref e) = error {
                warn!(step = %step.name, error = %e, "after hook failed");
            }
            reports.push(report);
        }

        let state = if was_cancelled {
            TaskState::Aborted
        } else if failed.is_some() {
            TaskState::Failed
        } else {
            TaskState::Succeeded
        };
        info!(task = %task.name, target = %target, state = ?state, "task finished");

        TaskOutcome {
            task: task.name.clone(),
            target: target.to_string(),
            state,
            steps: reports,
            error: failed,
        }
    }

    /// Run one step with `when` guard, retries, fallback and register.
    /// Returns the report plus the task-aborting error, if any.
    ///
    /// Boxed: fallbacks, task steps and parallel groups all recurse back
    /// through here.
    fn run_step_guarded<'s>(
        &'s self,
        ctx: &'s CancellationToken,
        task: &'s CompiledTask,
        target: &'s str,
        step: &'s Step,
        scope: &'s Scope,
        depth: usize,
    ) -> BoxFuture<'s, (StepReport, Option<Error>)> {
        Box::pin(self.step_guarded_inner(ctx, task, target, step, scope, depth))
    }

    async fn step_guarded_inner(
        &self,
        ctx: &CancellationToken,
        task: &CompiledTask,
        target: &str,
        step: &Step,
        scope: &Scope,
        depth: usize,
    ) -> (StepReport, Option<Error>) {
        // `when` over a snapshot: guards never see half-written siblings
        if let Some(ref when) = step.when {
            let snapshot = ScopeSnapshot(scope.lock().await.clone());
            if !when.eval_bool(&snapshot) {
                info!(step = %step.name, "skipped (when is false)");
                return (
                    StepReport {
                        name: step.name.clone(),
                        status: StepStatus::Skipped,
                        attempts: 0,
                    },
                    None,
                );
            }
        }

        let (max_attempts, delay, backoff) = match &step.on_failure {
            OnFailure::Retry {
                attempts,
                delay,
                backoff,
                ..
            } => (*attempts + 1, *delay, *backoff),
            _ => (1, Duration::ZERO, BackoffKind::None),
        };

        let mut attempt = 0u32;
        let mut last_error: Option<Error> = None;
        while attempt < max_attempts {
            attempt += 1;
            match self
                .run_step_once(ctx, task, target, step, scope, depth)
                .await
            {
                Ok(value) => {
                    if let Some(ref register) = step.register {
                        let _ = scope.lock().await.insert(register.clone(), value);
                    }
                    return (
                        StepReport {
                            name: step.name.clone(),
                            status: StepStatus::Succeeded,
                            attempts: attempt,
                        },
                        None,
                    );
                }
                Err(err) => {
                    // failed results still register so later `when` guards
                    // can inspect them
                    if let Some(ref register) = step.register {
                        let value = error_value(&err);
                        let _ = scope.lock().await.insert(register.clone(), value);
                    }

                    if err.kind == ErrorKind::Cancelled {
                        return (
                            StepReport {
                                name: step.name.clone(),
                                status: StepStatus::Cancelled,
                                attempts: attempt,
                            },
                            Some(err),
                        );
                    }

                    if attempt < max_attempts {
                        warn!(step = %step.name, attempt, error = %err, "step failed, retrying");
                        let wait = match backoff {
                            BackoffKind::None => delay,
                            BackoffKind::Linear => delay * attempt,
                            BackoffKind::Exponential => {
                                delay * 2u32.saturating_pow(attempt.saturating_sub(1))
                            }
                        };
                        tokio::time::sleep(wait).await;
                        last_error = Some(err);
                        continue;
                    }
                    last_error = Some(err);
                    break;
                }
            }
        }

        let err = last_error.expect("loop exits with an error");
        let report = StepReport {
            name: step.name.clone(),
            status: StepStatus::Failed,
            attempts: attempt,
        };

        match &step.on_failure {
            OnFailure::Ignore => {
                info!(step = %step.name, "failure ignored");
                (report, None)
            }
            OnFailure::Continue => {
                warn!(step = %step.name, error = %err, "step failed, continuing");
                (report, None)
            }
            OnFailure::Retry {
                fallback: Some(fallback),
                ..
            } => {
                info!(step = %step.name, fallback = %fallback.name, "running fallback");
                let (_, fallback_error) = self
                    .run_step_guarded(ctx, task, target, fallback, scope, depth)
                    .await;
                (report, fallback_error)
            }
            _ => {
                warn!(step = %step.name, error = %err, "step failed, aborting task");
                (report, Some(err))
            }
        }
    }

    /// Execute the step body once and produce the value to register.
    async fn run_step_once(
        &self,
        ctx: &CancellationToken,
        task: &CompiledTask,
        target: &str,
        step: &Step,
        scope: &Scope,
        depth: usize,
    ) -> Result<Value, Error> {
        if ctx.is_cancelled() {
            return Err(Error::cancelled());
        }

        match &step.kind {
            StepKind::Command(command_step) => {
                let snapshot = ScopeSnapshot(scope.lock().await.clone());
                let cmd = build_command(command_step, task, &snapshot);
                let effective_target = command_step.target.as_deref().unwrap_or(target);
                let opts = ExecOptions {
                    label: Some(step.name.clone()),
                    timeout_cap: task.timeout,
                    ..Default::default()
                };
                match self
                    .engine
                    .execute_with(ctx, effective_target, &cmd, &opts)
                    .await
                {
                    Ok(result) => Ok(result_value(&result)),
                    Err(err) => Err(err),
                }
            }
            StepKind::Task { task: reference, params } => {
                if depth >= MAX_TASK_DEPTH {
                    return Err(Error::config(format!(
                        "task nesting deeper than {MAX_TASK_DEPTH} levels"
                    )));
                }
                let child = self.tasks.get(reference).ok_or_else(|| {
                    Error::config(format!("unknown task '{reference}'"))
                })?;
                let snapshot = ScopeSnapshot(scope.lock().await.clone());
                let bindings: HashMap<String, String> = params
                    .iter()
                    .map(|(k, t)| (k.clone(), t.render(&snapshot)))
                    .collect();
                let coerced = coerce_params(&child.params, &bindings)?;

                // a task step inherits the parent's current target unless
                // the child declares its own
                let child_targets: Vec<String> = if child.targets.is_empty() {
                    vec![target.to_string()]
                } else {
                    let mut out = Vec::new();
                    for pattern in &child.targets {
                        for bound in self.engine.registry().resolve_pattern(pattern).await? {
                            out.push(bound.id.clone());
                        }
                    }
                    out
                };

                let mut all_ok = true;
                for child_target in &child_targets {
                    let outcome = self
                        .run_invocation(ctx, child, child_target, coerced.clone(), depth + 1)
                        .await;
                    if !outcome.ok() {
                        all_ok = false;
                    }
                }
                if all_ok {
                    let mut map = BTreeMap::new();
                    let _ = map.insert("ok".to_string(), Value::Bool(true));
                    Ok(Value::Map(map))
                } else {
                    Err(Error::new(
                        ErrorKind::NonZeroExit,
                        format!("task '{reference}' failed"),
                    ))
                }
            }
            StepKind::Script(expr) => {
                let snapshot = ScopeSnapshot(scope.lock().await.clone());
                Ok(expr.eval(&snapshot))
            }
            StepKind::Parallel {
                max_concurrency,
                fail_fast,
                steps,
            } => {
                self.run_parallel_group(
                    ctx,
                    task,
                    target,
                    steps,
                    *max_concurrency,
                    *fail_fast,
                    scope,
                    depth,
                )
                .await
            }
        }
    }

    /// Launch children under a concurrency cap. With failFast, the first
    /// failure cancels every sibling still in flight; without it, all
    /// children run to completion and the group fails iff any child did.
    #[allow(clippy::too_many_arguments)]
    async fn run_parallel_group(
        &self,
        ctx: &CancellationToken,
        task: &CompiledTask,
        target: &str,
        steps: &[Step],
        max_concurrency: usize,
        fail_fast: bool,
        scope: &Scope,
        depth: usize,
    ) -> Result<Value, Error> {
        let group_ctx = ctx.child_token();
        let semaphore = Arc::new(Semaphore::new(max_concurrency.min(steps.len().max(1))));

        let results = join_all(steps.iter().map(|step| {
            let group_ctx = group_ctx.clone();
            let semaphore = semaphore.clone();
            let scope = scope.clone();
            async move {
                // the semaphore is never closed, so acquire cannot fail
                let _permit = semaphore.acquire().await.ok();
                let (report, error) = self
                    .run_step_guarded(&group_ctx, task, target, step, &scope, depth)
                    .await;
                if error.is_some() && fail_fast {
                    group_ctx.cancel();
                }
                (report, error)
            }
        }))
        .await;

        // tolerated child failures (continue/ignore) come back without an
        // error and do not fail the group; the group error prefers the
        // real failure over the cancellations it caused
        let mut ok = true;
        let mut first_error: Option<Error> = None;
        for (_report, error) in results {
            if let Some(err) = error {
                ok = false;
                let prefer = match &first_error {
                    None => true,
                    Some(existing) => {
                        existing.kind == ErrorKind::Cancelled
                            && err.kind != ErrorKind::Cancelled
                    }
                };
                if prefer {
                    first_error = Some(err);
                }
            }
        }

        if ok {
            let mut map = BTreeMap::new();
            let _ = map.insert("ok".to_string(), Value::Bool(true));
            let _ = map.insert("count".to_string(), Value::Number(steps.len() as f64));
            Ok(Value::Map(map))
        } else {
            Err(first_error.unwrap_or_else(|| {
                Error::new(ErrorKind::NonZeroExit, "parallel group failed")
            }))
        }
    }
}

fn cleanup_context() -> CancellationToken {
    let token = CancellationToken::new();
    let timer = token.clone();
    let _ = tokio::spawn(async move {
        tokio::time::sleep(CLEANUP_DEADLINE).await;
        timer.cancel();
    });
    token
}

fn build_command(
    step: &CommandStep,
    task: &CompiledTask,
    scope: &ScopeSnapshot,
) -> Command {
    let mut cmd = match (&step.run, &step.argv) {
        (Some(line), _) => Command::shell(line.render(scope)),
        (None, Some(argv)) => {
            Command::new(argv.iter().map(|t| t.render(scope)).collect::<Vec<_>>())
        }
        (None, None) => Command::shell(""),
    };
    // stream live and capture for `register`
    cmd = cmd.with_io_mode(IoMode::Tee);

    // env precedence: step over task (target env underlays in the engine)
    let mut env: HashMap<String, String> = task.env.clone();
    env.extend(step.env.iter().map(|(k, t)| (k.clone(), t.render(scope))));
    cmd = cmd.with_env_map(env).with_env_replace(step.replace_env);

    if let Some(ref cwd) = step.cwd {
        cmd = cmd.with_cwd(cwd.render(scope));
    }
    if let Some(ref user) = step.user {
        cmd = cmd.with_user(user.clone());
    }
    if let Some(timeout) = step.timeout {
        cmd = cmd.with_timeout(timeout);
    }
    if step.nothrow {
        cmd = cmd.nothrow();
    }
    cmd
}

/// The value a registered command step stores in the scope.
fn result_value(result: &crate::command::ExecResult) -> Value {
    let mut map = BTreeMap::new();
    let _ = map.insert("stdout".to_string(), Value::Str(result.stdout_lossy()));
    let _ = map.insert("stderr".to_string(), Value::Str(result.stderr_lossy()));
    let _ = map.insert(
        "exitCode".to_string(),
        match result.exit_code {
            Some(code) => Value::Number(code as f64),
            None => Value::Null,
        },
    );
    let _ = map.insert("ok".to_string(), Value::Bool(result.ok()));
    Value::Map(map)
}

fn error_value(err: &Error) -> Value {
    if let Some(ref result) = err.result {
        return result_value(result);
    }
    let mut map = BTreeMap::new();
    let _ = map.insert("stdout".to_string(), Value::Str(String::new()));
    let _ = map.insert("stderr".to_string(), Value::Str(String::new()));
    let _ = map.insert(
        "exitCode".to_string(),
        match err.exit_code {
            Some(code) => Value::Number(code as f64),
            None => Value::Null,
        },
    );
    let _ = map.insert("ok".to_string(), Value::Bool(false));
    let _ = map.insert("error".to_string(), Value::Str(err.message.clone()));
    Value::Map(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigDoc, Defaults, TargetsSection};
    use crate::registry::TargetRegistry;
    use crate::secrets::StaticSecrets;

    fn setup(yaml: &str) -> (Engine, BTreeMap<String, CompiledTask>) {
        let doc = ConfigDoc::parse(yaml, None).unwrap();
        let mut compiled = BTreeMap::new();
        for (name, spec) in &doc.tasks {
            let _ = compiled.insert(name.clone(), compile(name, spec, &doc.tasks).unwrap());
        }
        let registry = TargetRegistry::new(
            TargetsSection::default(),
            Defaults::default(),
            Arc::new(StaticSecrets::default()),
        );
        (Engine::new(Arc::new(registry), None), compiled)
    }

    async fn run_one(yaml: &str, task: &str) -> TaskOutcome {
        let (engine, tasks) = setup(yaml);
        let runner = TaskRunner::new(&engine, &tasks);
        let ctx = CancellationToken::new();
        let mut outcomes = runner
            .run(&ctx, task, &HashMap::new(), None)
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        outcomes.remove(0)
    }

    #[tokio::test]
    async fn register_and_when() {
        // S5: a register feeds later `when` guards; absent names are falsy
        let outcome = run_one(
            r#"
tasks:
  t:
    steps:
      - name: probe
        run: printf staging
        register: env_probe
      - name: on-staging
        run: echo yes
        when: env_probe.stdout == 'staging'
      - name: on-prod
        run: echo no
        when: env_probe.stdout == 'prod'
"#,
            "t",
        )
        .await;
        assert_eq!(outcome.state, TaskState::Succeeded);
        assert_eq!(outcome.steps[0].status, StepStatus::Succeeded);
        assert_eq!(outcome.steps[1].status, StepStatus::Succeeded);
        assert_eq!(outcome.steps[2].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn always_run_cleanup_after_abort() {
        // S6: [A ok, B fails, C normal, D always_run] -> A, B, D execute
        let outcome = run_one(
            r#"
tasks:
  t:
    steps:
      - name: a
        run: "true"
      - name: b
        run: "false"
      - name: c
        run: echo never
      - name: d
        run: echo cleanup
        always_run: true
"#,
            "t",
        )
        .await;
        assert_eq!(outcome.state, TaskState::Failed);
        assert_eq!(outcome.steps[0].status, StepStatus::Succeeded);
        assert_eq!(outcome.steps[1].status, StepStatus::Failed);
        assert_eq!(outcome.steps[2].status, StepStatus::Skipped);
        // D ran even though the task had aborted, and its success does not
        // flip the outcome
        assert_eq!(outcome.steps[3].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn on_failure_continue_and_ignore() {
        let outcome = run_one(
            r#"
tasks:
  t:
    steps:
      - name: tolerated
        run: "false"
        on_failure: continue
      - name: ignored
        run: "false"
        on_failure: ignore
      - name: still-runs
        run: echo alive
        register: alive
"#,
            "t",
        )
        .await;
        assert_eq!(outcome.state, TaskState::Succeeded);
        assert_eq!(outcome.steps[0].status, StepStatus::Failed);
        assert_eq!(outcome.steps[1].status, StepStatus::Failed);
        assert_eq!(outcome.steps[2].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn retry_record_retries_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let yaml = format!(
            r#"
tasks:
  t:
    steps:
      - name: flaky
        run: "if [ -f {m} ]; then true; else touch {m}; false; fi"
        on_failure:
          retry: 2
          delay: 10ms
"#,
            m = marker.display()
        );
        let outcome = run_one(&yaml, "t").await;
        assert_eq!(outcome.state, TaskState::Succeeded);
        assert_eq!(outcome.steps[0].attempts, 2);
    }

    #[tokio::test]
    async fn fallback_step_handles_the_failure() {
        let outcome = run_one(
            r#"
tasks:
  t:
    steps:
      - name: primary
        run: "false"
        on_failure:
          retry: 1
          delay: 1ms
          fallback: recover
      - name: recover
        run: echo recovered
        register: recovery
        when: "false"
      - name: final
        run: echo done
"#,
            "t",
        )
        .await;
        // the named fallback runs as the failure handler; the task continues
        assert_eq!(outcome.state, TaskState::Succeeded);
    }

    #[tokio::test]
    async fn parallel_group_fail_fast_cancels_siblings() {
        // S4: B fails immediately; A and C (sleeping) are cancelled
        let start = std::time::Instant::now();
        let outcome = run_one(
            r#"
tasks:
  t:
    steps:
      - name: group
        parallel:
          fail_fast: true
          steps:
            - name: a
              run: sleep 1
            - name: b
              run: "false"
            - name: c
              run: sleep 1
"#,
            "t",
        )
        .await;
        assert_eq!(outcome.state, TaskState::Failed);
        // fail-fast: the group does not wait out both sleeps
        assert!(start.elapsed() < Duration::from_millis(3500));
    }

    #[tokio::test]
    async fn parallel_group_without_fail_fast_waits_for_all() {
        let outcome = run_one(
            r#"
tasks:
  t:
    steps:
      - name: group
        parallel:
          fail_fast: false
          steps:
            - name: a
              run: echo a > /dev/null
              register: ra
            - name: b
              run: "false"
            - name: c
              run: echo c > /dev/null
              register: rc
        on_failure: continue
      - name: check
        run: echo both
        when: ra.ok && rc.ok
        register: checked
"#,
            "t",
        )
        .await;
        assert_eq!(outcome.state, TaskState::Succeeded);
        // both siblings registered before the group completed
        let check = outcome
            .steps
            .iter()
            .find(|s| s.name == "check")
            .unwrap();
        assert_eq!(check.status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn script_steps_register_values() {
        let outcome = run_one(
            r#"
tasks:
  t:
    steps:
      - name: probe
        run: printf "  padded  "
        register: raw
      - name: trimmed
        script: trim(raw.stdout)
        register: cleaned
      - name: use
        run: echo ok
        when: cleaned == 'padded'
"#,
            "t",
        )
        .await;
        assert_eq!(outcome.state, TaskState::Succeeded);
        assert_eq!(outcome.steps[2].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn task_step_invokes_child_task() {
        let outcome = run_one(
            r#"
tasks:
  child:
    params:
      - name: word
        type: string
        required: true
    steps:
      - name: say
        run: echo ${word}
  parent:
    steps:
      - name: call
        task: child
        params:
          word: hello
        register: called
"#,
            "parent",
        )
        .await;
        assert_eq!(outcome.state, TaskState::Succeeded);
    }

    #[tokio::test]
    async fn params_coerce_and_validate() {
        let specs = vec![
            ParamSpec {
                name: "count".to_string(),
                kind: ParamType::Number,
                default: None,
                required: true,
                values: vec![],
                pattern: None,
            },
            ParamSpec {
                name: "env".to_string(),
                kind: ParamType::Enum,
                default: Some(serde_yaml::Value::String("staging".to_string())),
                required: false,
                values: vec!["staging".to_string(), "prod".to_string()],
                pattern: None,
            },
        ];

        let bound = coerce_params(
            &specs,
            &HashMap::from([("count".to_string(), "3".to_string())]),
        )
        .unwrap();
        assert_eq!(bound["count"], Value::Number(3.0));
        assert_eq!(bound["env"], Value::Str("staging".to_string()));

        assert!(coerce_params(&specs, &HashMap::new()).is_err());
        assert!(
            coerce_params(
                &specs,
                &HashMap::from([
                    ("count".to_string(), "3".to_string()),
                    ("env".to_string(), "qa".to_string())
                ]),
            )
            .is_err()
        );
        assert!(
            coerce_params(
                &specs,
                &HashMap::from([
                    ("count".to_string(), "3".to_string()),
                    ("bogus".to_string(), "x".to_string())
                ]),
            )
            .is_err()
        );
    }

    #[test]
    fn compile_rejects_ambiguous_steps() {
        let doc = ConfigDoc::parse(
            r#"
tasks:
  t:
    steps:
      - name: both
        run: echo hi
        script: "1 == 1"
"#,
            None,
        )
        .unwrap();
        let err = compile("t", &doc.tasks["t"], &doc.tasks).unwrap_err();
        assert!(err.message.contains("exactly one"));
    }

    #[test]
    fn compile_rejects_bad_when_expressions() {
        let doc = ConfigDoc::parse(
            r#"
tasks:
  t:
    steps:
      - run: echo hi
        when: "a &&"
"#,
            None,
        )
        .unwrap();
        let err = compile("t", &doc.tasks["t"], &doc.tasks).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[test]
    fn compile_rejects_task_cycles() {
        let doc = ConfigDoc::parse(
            r#"
tasks:
  a:
    steps:
      - task: b
  b:
    steps:
      - task: a
"#,
            None,
        )
        .unwrap();
        let err = compile("a", &doc.tasks["a"], &doc.tasks).unwrap_err();
        assert!(err.message.contains("cycle"));
    }

    #[tokio::test]
    async fn cancelled_context_aborts_and_reports() {
        let (engine, tasks) = setup(
            r#"
tasks:
  t:
    steps:
      - name: slow
        run: sleep 5
      - name: cleanup
        run: echo bye
        always_run: true
"#,
        );
        let runner = TaskRunner::new(&engine, &tasks);
        let ctx = CancellationToken::new();
        let canceller = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                ctx.cancel();
            })
        };
        let outcomes = runner.run(&ctx, "t", &HashMap::new(), None).await.unwrap();
        canceller.await.unwrap();
        let outcome = &outcomes[0];
        assert_eq!(outcome.state, TaskState::Aborted);
        assert_eq!(outcome.steps[0].status, StepStatus::Cancelled);
        // the cleanup step still ran, on its fresh context
        assert_eq!(outcome.steps[1].status, StepStatus::Succeeded);
    }
}
