//! CLI integration tests using local targets only.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

#[allow(deprecated)]
fn hop_cmd() -> Command {
    Command::cargo_bin("hop").unwrap()
}

fn write_hopfile(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("hopfile.yml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn in_local_echo() {
    hop_cmd()
        .args(["in", "local", "--", "echo", "hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello"));
}

#[test]
fn in_local_env_is_injected() {
    hop_cmd()
        .args(["in", "local", "--env", "GREETING=hi", "--", "echo", "$GREETING"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hi"));
}

#[test]
fn in_local_nonzero_exit_maps_to_one() {
    hop_cmd()
        .args(["in", "local", "--", "exit", "5"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("non-zero-exit"));
}

#[test]
fn in_local_timeout_maps_to_124() {
    hop_cmd()
        .args(["in", "local", "--timeout", "200ms", "--", "sleep", "10"])
        .assert()
        .code(124)
        .stderr(predicate::str::contains("timeout"));
}

#[test]
fn unknown_target_maps_to_three() {
    hop_cmd()
        .args(["in", "hosts.missing", "--", "true"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("target"));
}

#[test]
fn run_simple_task() {
    let dir = TempDir::new().unwrap();
    let config = write_hopfile(
        &dir,
        r#"
tasks:
  hello:
    steps:
      - name: say
        run: echo task says hello
"#,
    );

    hop_cmd()
        .arg("-c")
        .arg(&config)
        .args(["run", "hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("task says hello"));
}

#[test]
fn run_task_with_params_and_interpolation() {
    let dir = TempDir::new().unwrap();
    let config = write_hopfile(
        &dir,
        r#"
tasks:
  greet:
    params:
      - name: who
        type: string
        required: true
    steps:
      - name: say
        run: echo greetings ${who}
"#,
    );

    hop_cmd()
        .arg("-c")
        .arg(&config)
        .args(["run", "greet", "--param", "who=world"])
        .assert()
        .success()
        .stdout(predicate::str::contains("greetings world"));
}

#[test]
fn run_missing_required_param_is_config_error() {
    let dir = TempDir::new().unwrap();
    let config = write_hopfile(
        &dir,
        r#"
tasks:
  greet:
    params:
      - name: who
        type: string
        required: true
    steps:
      - run: echo ${who}
"#,
    );

    hop_cmd()
        .arg("-c")
        .arg(&config)
        .args(["run", "greet"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("who"));
}

#[test]
fn run_register_and_when_skips_steps() {
    let dir = TempDir::new().unwrap();
    let config = write_hopfile(
        &dir,
        r#"
tasks:
  cond:
    steps:
      - name: probe
        run: printf staging
        register: probe
      - name: on-staging
        run: echo picked staging
        when: probe.stdout == 'staging'
      - name: on-prod
        run: echo picked prod
        when: probe.stdout == 'prod'
"#,
    );

    hop_cmd()
        .arg("-c")
        .arg(&config)
        .args(["run", "cond"])
        .assert()
        .success()
        .stdout(predicate::str::contains("picked staging"))
        .stdout(predicate::str::contains("picked prod").not());
}

#[test]
fn run_failing_task_exits_one_and_runs_cleanup() {
    let dir = TempDir::new().unwrap();
    let config = write_hopfile(
        &dir,
        r#"
tasks:
  fragile:
    steps:
      - name: boom
        run: "false"
      - name: skipped
        run: echo never printed
      - name: cleanup
        run: echo cleaning up
        always_run: true
"#,
    );

    hop_cmd()
        .arg("-c")
        .arg(&config)
        .args(["run", "fragile"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("cleaning up"))
        .stdout(predicate::str::contains("never printed").not());
}

#[test]
fn run_unknown_task_maps_to_three() {
    let dir = TempDir::new().unwrap();
    let config = write_hopfile(&dir, "tasks: {}\n");

    hop_cmd()
        .arg("-c")
        .arg(&config)
        .args(["run", "nope"])
        .assert()
        .code(3);
}

#[test]
fn validate_accepts_a_good_config() {
    let dir = TempDir::new().unwrap();
    let config = write_hopfile(
        &dir,
        r#"
targets:
  hosts:
    web:
      host: web.example.com
tasks:
  noop:
    steps:
      - run: "true"
"#,
    );

    hop_cmd()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("valid"));
}

#[test]
fn validate_rejects_unknown_fields_with_exit_two() {
    let dir = TempDir::new().unwrap();
    let config = write_hopfile(&dir, "bogus_section: 1\n");

    hop_cmd()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("bogus_section"));
}

#[test]
fn validate_rejects_proxy_cycles_with_exit_two() {
    let dir = TempDir::new().unwrap();
    let config = write_hopfile(
        &dir,
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
    );

    hop_cmd()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn validate_rejects_bad_when_expressions_with_exit_two() {
    let dir = TempDir::new().unwrap();
    let config = write_hopfile(
        &dir,
        r#"
tasks:
  t:
    steps:
      - run: echo hi
        when: "probe.stdout =="
"#,
    );

    hop_cmd()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .code(2);
}

#[test]
fn list_shows_targets_and_tasks() {
    let dir = TempDir::new().unwrap();
    let config = write_hopfile(
        &dir,
        r#"
targets:
  hosts:
    web:
      host: web.example.com
tasks:
  deploy:
    description: ship it
    steps:
      - run: "true"
"#,
    );

    hop_cmd()
        .arg("-c")
        .arg(&config)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("hosts.web"))
        .stdout(predicate::str::contains("deploy"));
}

#[test]
fn list_json_is_machine_readable() {
    let dir = TempDir::new().unwrap();
    let config = write_hopfile(
        &dir,
        r#"
tasks:
  deploy:
    steps:
      - run: "true"
"#,
    );

    let output = hop_cmd()
        .arg("-c")
        .arg(&config)
        .args(["list", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed["tasks"][0]["name"], "deploy");
    assert!(
        parsed["targets"]
            .as_array()
            .unwrap()
            .contains(&serde_json::json!("local"))
    );
}

#[test]
fn copy_between_local_paths() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.txt");
    fs::write(&src, b"copy me").unwrap();
    let dst = dir.path().join("out/dst.txt");

    hop_cmd()
        .args([
            "copy",
            src.to_str().unwrap(),
            dst.to_str().unwrap(),
        ])
        .assert()
        .success();

    assert_eq!(fs::read(&dst).unwrap(), b"copy me");
}

#[test]
fn on_fans_out_over_matching_targets() {
    hop_cmd()
        .args(["on", "local", "--", "echo", "fanned"])
        .assert()
        .success()
        .stdout(predicate::str::contains("fanned"));
}

#[test]
fn profile_overlay_changes_behavior() {
    let dir = TempDir::new().unwrap();
    let config = write_hopfile(
        &dir,
        r#"
tasks:
  which:
    env:
      MODE: base
    steps:
      - name: say
        run: echo mode is $MODE

profiles:
  prod:
    tasks:
      which:
        env:
          MODE: prod
"#,
    );

    hop_cmd()
        .arg("-c")
        .arg(&config)
        .args(["run", "which"])
        .assert()
        .success()
        .stdout(predicate::str::contains("mode is base"));

    hop_cmd()
        .arg("-c")
        .arg(&config)
        .args(["--profile", "prod", "run", "which"])
        .assert()
        .success()
        .stdout(predicate::str::contains("mode is prod"));
}
