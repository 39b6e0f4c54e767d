//! CLI smoke tests for the sandbox-server binary: help output, config
//! printing, and the `check` command against a real spec and rules file.

use std::process::{Command, Stdio};

fn run_server(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_sandbox-server"))
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("failed to execute sandbox-server")
}

#[test]
fn help_lists_commands_and_flags() {
    let output = run_server(&["--help"]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("sandbox-server"));
    assert!(stdout.contains("Usage:") || stdout.contains("USAGE:"));
    assert!(stdout.contains("run"));
    assert!(stdout.contains("check"));
    assert!(stdout.contains("--oas"));
    assert!(stdout.contains("--seed"));
}

#[test]
fn print_config_emits_effective_yaml() {
    let output = run_server(&["--print-config", "--port", "9999", "--seed", "smoke"]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("port: 9999"));
    assert!(stdout.contains("seed: smoke"));
    assert!(stdout.contains("host:"));
}

#[test]
fn check_reports_operations_and_rules() {
    let dir = tempfile::tempdir().unwrap();
    let spec = dir.path().join("api.yaml");
    std::fs::write(
        &spec,
        r#"
openapi: 3.0.3
info: { title: smoke, version: "1" }
paths:
  /ping:
    get:
      operationId: ping
      responses:
        "200": { description: pong }
"#,
    )
    .unwrap();
    let rules = dir.path().join("rules.yaml");
    std::fs::write(
        &rules,
        r#"
scenarios:
  - when: { operationId: ping }
    do:
      - respond: { status: 200, body: { pong: true } }
"#,
    )
    .unwrap();

    let output = run_server(&[
        "--oas",
        spec.to_str().unwrap(),
        "--scenarios",
        rules.to_str().unwrap(),
        "check",
    ]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ok: 1 operations, 1 rules"));
}

#[test]
fn check_fails_on_dangling_ref() {
    let dir = tempfile::tempdir().unwrap();
    let spec = dir.path().join("bad.yaml");
    std::fs::write(
        &spec,
        r##"
openapi: 3.0.3
paths:
  /x:
    get:
      responses:
        "200":
          content:
            application/json:
              schema: { $ref: "#/components/schemas/Missing" }
"##,
    )
    .unwrap();

    let output = run_server(&["--oas", spec.to_str().unwrap(), "check"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("dangling"), "stderr: {stderr}");
}
