//! Integration tests for the scx CLI
//!
//! These tests invoke the actual scx-cli binary and verify:
//! - Exit codes (0 success, 1 validation, 2 usage, 3 sandbox unavailable,
//!   4 execution failure, 5 persistence, 6 artifact, 7 config)
//! - The result document on stdout
//! - Canonical state handling across invocations
//! - That the isolated backend (this binary as runner) and the direct backend
//!   agree on every logical result

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use scx_core::config::IsolatedConfig;
use scx_core::registry::ContractRegistry;
use scx_core::sandbox::{DirectBackend, IsolatedBackend, IsolationBackend};
use scx_core::store::StateStore;
use scx_core::{
    BackendKind, EngineConfig, ExecutionRecord, InvocationRequest, Invoker, Status, Value,
};
use tempfile::TempDir;

// ── Helpers ───────────────────────────────────────────────

fn scx_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_scx-cli"))
}

fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../tests/fixtures")
}

fn command(args: &[&str]) -> Command {
    let mut cmd = Command::new(scx_bin());
    cmd.args(args)
        .current_dir(env!("CARGO_MANIFEST_DIR"))
        .env_remove("SCX_SANDBOX")
        .env_remove("SCX_TIMEOUT_MS")
        .env_remove("SCX_STATE_DIR")
        .env_remove("SCX_LOG");
    cmd
}

fn run_scx(args: &[&str]) -> Output {
    command(args).output().expect("failed to execute scx-cli")
}

/// `scx invoke` against the fixture contract with a private state dir
fn invoke(state: &Path, endpoint: &str, extra: &[&str]) -> Output {
    let bin = fixtures().join("bin");
    let ifaces = fixtures().join("interfaces");
    let mut args = vec![
        "invoke",
        bin.to_str().unwrap(),
        ifaces.to_str().unwrap(),
        "rates",
        endpoint,
        "--state-dir",
        state.to_str().unwrap(),
    ];
    args.extend_from_slice(extra);
    run_scx(&args)
}

fn record(output: &Output) -> ExecutionRecord {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not a record ({}): {}",
            e,
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

fn write_config(dir: &Path, toml: &str) -> PathBuf {
    let path = dir.join("scx.toml");
    std::fs::write(&path, toml).unwrap();
    path
}

// ── Version ───────────────────────────────────────────────

#[test]
fn test_version_command() {
    let output = run_scx(&["version"]);
    assert!(output.status.success(), "version should exit 0");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("scx"));
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_no_args_is_usage_error() {
    let output = run_scx(&[]);
    assert_eq!(output.status.code(), Some(2));
}

// ── Invoke: success ───────────────────────────────────────

#[test]
fn test_compute_rate_direct() {
    let state = TempDir::new().unwrap();
    let output = invoke(
        state.path(),
        "compute_rate",
        &["--sandbox", "none", "--kwargs", "amount", "0.3"],
    );
    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["endpoint"], "compute_rate");
    assert_eq!(json["status"], "Succeeded");
    assert!(json["output"].is_f64());
    assert!(json["cost_metric"].as_u64().unwrap() > 0);
}

#[test]
fn test_compute_rate_isolated() {
    let state = TempDir::new().unwrap();
    let output = invoke(state.path(), "compute_rate", &["--kwargs", "amount", "0.3"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let rec = record(&output);
    assert_eq!(rec.status, Status::Succeeded);
    match rec.output {
        Value::Float(rate) => assert!((rate - 0.12).abs() < 1e-9),
        other => panic!("expected a float, got {:?}", other),
    }
}

#[test]
fn test_integer_argument_widens() {
    let state = TempDir::new().unwrap();
    let output = invoke(
        state.path(),
        "compute_rate",
        &["--sandbox", "direct", "--kwargs", "amount", "500"],
    );
    assert_eq!(output.status.code(), Some(0));
    let rec = record(&output);
    assert_eq!(rec.inputs["amount"], Value::Float(500.0));
    assert_eq!(rec.output, Value::Float(100.0));
}

#[test]
fn test_compact_output() {
    let state = TempDir::new().unwrap();
    let output = invoke(
        state.path(),
        "compute_rate",
        &["--sandbox", "none", "--indent", "0", "--kwargs", "amount", "1"],
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim_end().lines().count(), 1);
}

// ── Invoke: state ─────────────────────────────────────────

#[test]
fn test_commit_threads_state() {
    let state = TempDir::new().unwrap();
    let canonical = state.path().join("rates.json");
    let canonical_str = canonical.to_str().unwrap();

    let first = invoke(
        state.path(),
        "increment",
        &["--sandbox", "none", "--last-exec", canonical_str, "--commit"],
    );
    assert_eq!(first.status.code(), Some(0));
    assert_eq!(record(&first).output, Value::Integer(1));

    let second = invoke(
        state.path(),
        "increment",
        &["--sandbox", "none", "--last-exec", canonical_str, "--commit"],
    );
    let second = record(&second);
    assert_eq!(second.output, Value::Integer(2));
    assert_eq!(second.state_before, record(&first).state);

    let stored: ExecutionRecord =
        serde_json::from_slice(&std::fs::read(&canonical).unwrap()).unwrap();
    assert_eq!(stored.state["counter"], Value::Integer(2));
}

#[test]
fn test_without_commit_canonical_is_not_written() {
    let state = TempDir::new().unwrap();
    let output = invoke(state.path(), "increment", &["--sandbox", "none"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(!state.path().join("rates.json").exists());
}

#[test]
fn test_output_and_last_exec_chain() {
    let state = TempDir::new().unwrap();
    let first_path = state.path().join("history/1.json");
    let first = invoke(
        state.path(),
        "compute_rate",
        &["--sandbox", "none", "--output", first_path.to_str().unwrap(), "--kwargs", "amount", "0.5"],
    );
    assert_eq!(first.status.code(), Some(0));
    let written: ExecutionRecord =
        serde_json::from_slice(&std::fs::read(&first_path).unwrap()).unwrap();
    assert_eq!(written, record(&first));
    assert_eq!(written.state["last_rate"], Value::Float(0.2));

    let second = invoke(
        state.path(),
        "reset_last_rate",
        &["--sandbox", "none", "--last-exec", first_path.to_str().unwrap()],
    );
    let second = record(&second);
    assert_eq!(second.state_before, written.state);
    assert_eq!(second.state["last_rate"], Value::Null);
    assert_eq!(second.output, Value::Null);
}

// ── Invoke: failures ──────────────────────────────────────

#[test]
fn test_unknown_endpoint_exit_1() {
    let state = TempDir::new().unwrap();
    let out = state.path().join("out.json");
    let output = invoke(
        state.path(),
        "withdraw",
        &["--sandbox", "none", "--output", out.to_str().unwrap()],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("withdraw"));
    assert!(!out.exists());
}

#[test]
fn test_parameter_errors_exit_1() {
    let state = TempDir::new().unwrap();
    for extra in [
        vec!["--sandbox", "none"],
        vec!["--sandbox", "none", "--kwargs", "amount", "1", "tip", "2"],
        vec!["--sandbox", "none", "--kwargs", "amount", "lots"],
    ] {
        let output = invoke(state.path(), "compute_rate", &extra);
        assert_eq!(output.status.code(), Some(1), "args {:?}", extra);
    }
}

#[test]
fn test_unbalanced_kwargs_exit_2() {
    let state = TempDir::new().unwrap();
    let output = invoke(
        state.path(),
        "compute_rate",
        &["--sandbox", "none", "--kwargs", "amount"],
    );
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_unknown_sandbox_exit_2() {
    let state = TempDir::new().unwrap();
    let output = invoke(state.path(), "compute_rate", &["--sandbox", "vm"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_unavailable_sandbox_exit_3() {
    let state = TempDir::new().unwrap();
    let config = write_config(
        state.path(),
        "[isolated]\nrunner = [\"/nonexistent/scx-runner\"]\n",
    );
    let out = state.path().join("out.json");
    let output = invoke(
        state.path(),
        "compute_rate",
        &[
            "--config",
            config.to_str().unwrap(),
            "--output",
            out.to_str().unwrap(),
            "--kwargs",
            "amount",
            "0.3",
        ],
    );
    assert_eq!(output.status.code(), Some(3));
    assert!(!out.exists());
}

#[test]
fn test_runtime_failure_exit_4_prints_record() {
    let state = TempDir::new().unwrap();
    let output = invoke(state.path(), "explode", &["--sandbox", "none"]);
    assert_eq!(output.status.code(), Some(4));
    let rec = record(&output);
    assert_eq!(rec.status.to_string(), "Failed:RuntimeError");
    assert_eq!(rec.state, rec.state_before);
}

#[test]
fn test_mistyped_return_is_serialization_failure() {
    let state = TempDir::new().unwrap();
    let output = invoke(state.path(), "wrong_return", &[]);
    assert_eq!(output.status.code(), Some(4));
    assert_eq!(record(&output).status.to_string(), "Failed:Serialization");
}

#[test]
fn test_timeout_keeps_canonical_state() {
    let state = TempDir::new().unwrap();
    let canonical = state.path().join("rates.json");
    let config = write_config(
        state.path(),
        "[limits]\ntimeout_ms = 200\nmax_steps = 100000000000\n",
    );
    let config = config.to_str().unwrap();

    let seed = invoke(
        state.path(),
        "compute_rate",
        &["--config", config, "--commit", "--kwargs", "amount", "0.3"],
    );
    assert_eq!(seed.status.code(), Some(0));
    let before = std::fs::read(&canonical).unwrap();

    let out = state.path().join("failed/spin.json");
    let output = invoke(
        state.path(),
        "spin",
        &[
            "--config",
            config,
            "--last-exec",
            canonical.to_str().unwrap(),
            "--output",
            out.to_str().unwrap(),
            "--commit",
        ],
    );
    assert_eq!(output.status.code(), Some(4));
    let rec = record(&output);
    assert_eq!(rec.status.to_string(), "Failed:Timeout");
    assert_eq!(std::fs::read(&canonical).unwrap(), before);

    let written: ExecutionRecord = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
    assert_eq!(written, rec);
    let entries: Vec<_> = std::fs::read_dir(out.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries.len(), 1, "stray files next to the output: {:?}", entries);
}

#[test]
fn test_timeout_from_environment() {
    let state = TempDir::new().unwrap();
    let config = write_config(state.path(), "[limits]\nmax_steps = 100000000000\n");
    let bin = fixtures().join("bin");
    let ifaces = fixtures().join("interfaces");
    let output = command(&[
        "invoke",
        bin.to_str().unwrap(),
        ifaces.to_str().unwrap(),
        "rates",
        "spin",
        "--state-dir",
        state.path().to_str().unwrap(),
        "--config",
        config.to_str().unwrap(),
    ])
    .env("SCX_SANDBOX", "none")
    .env("SCX_TIMEOUT_MS", "100")
    .output()
    .unwrap();
    assert_eq!(output.status.code(), Some(4));
    assert_eq!(record(&output).status.to_string(), "Failed:Timeout");
}

#[test]
fn test_unwritable_output_exit_5() {
    let state = TempDir::new().unwrap();
    let blocker = state.path().join("blocker");
    std::fs::write(&blocker, "x").unwrap();
    let output = invoke(
        state.path(),
        "compute_rate",
        &[
            "--sandbox",
            "none",
            "--output",
            blocker.join("out.json").to_str().unwrap(),
            "--kwargs",
            "amount",
            "0.3",
        ],
    );
    assert_eq!(output.status.code(), Some(5));
}

#[test]
fn test_unknown_contract_exit_6() {
    let state = TempDir::new().unwrap();
    let bin = fixtures().join("bin");
    let ifaces = fixtures().join("interfaces");
    let output = run_scx(&[
        "invoke",
        bin.to_str().unwrap(),
        ifaces.to_str().unwrap(),
        "ghost",
        "compute_rate",
        "--state-dir",
        state.path().to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(6));
}

#[test]
fn test_bad_config_exit_7() {
    let state = TempDir::new().unwrap();
    let output = command(&[
        "invoke",
        fixtures().join("bin").to_str().unwrap(),
        fixtures().join("interfaces").to_str().unwrap(),
        "rates",
        "compute_rate",
        "--state-dir",
        state.path().to_str().unwrap(),
    ])
    .env("SCX_TIMEOUT_MS", "soon")
    .output()
    .unwrap();
    assert_eq!(output.status.code(), Some(7));

    let config = write_config(state.path(), "backend = \"vm\"\n");
    let output = invoke(
        state.path(),
        "compute_rate",
        &["--config", config.to_str().unwrap()],
    );
    assert_eq!(output.status.code(), Some(7));
}

// ── Endpoints ─────────────────────────────────────────────

#[test]
fn test_endpoints_listing() {
    let ifaces = fixtures().join("interfaces");
    let output = run_scx(&["endpoints", ifaces.to_str().unwrap(), "rates"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("compute_rate(float)->float"));
    assert!(stdout.contains("more_complex_endpoint(text,integer,list)->text"));
}

#[test]
fn test_endpoints_json() {
    let ifaces = fixtures().join("interfaces");
    let output = run_scx(&["endpoints", ifaces.to_str().unwrap(), "rates", "--json"]);
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json[0]["name"], "compute_rate");
    assert_eq!(json[0]["signature"], "compute_rate(float)->float");
    assert!(json[0]["doc"].is_string());
}

#[test]
fn test_endpoints_unknown_contract() {
    let ifaces = fixtures().join("interfaces");
    let output = run_scx(&["endpoints", ifaces.to_str().unwrap(), "ghost"]);
    assert_eq!(output.status.code(), Some(6));
}

// ── Shell ─────────────────────────────────────────────────

#[test]
fn test_shell_round_trip() {
    let artifact = fixtures().join("bin/rates.scb");
    let payload = r#"{"endpoint":"compute_rate","args":{"amount":0.3},"state":{},"limits":{}}"#;
    let mut child = command(&["shell", artifact.to_str().unwrap()])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(payload.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["outcome"]["kind"], "returned");
    assert!(report["outcome"]["value"].is_f64());
    assert!(report["steps"].as_u64().unwrap() > 0);
}

// ── Backend Parity ────────────────────────────────────────

fn invoker(backend: Box<dyn IsolationBackend>, state: &Path) -> Invoker {
    let config = EngineConfig {
        backend: BackendKind::Direct,
        state_dir: state.to_path_buf(),
        ..EngineConfig::default()
    };
    Invoker::new(
        config,
        backend,
        ContractRegistry::new(fixtures().join("bin"), fixtures().join("interfaces")),
        StateStore::new(state),
    )
}

#[test]
fn test_isolated_and_direct_agree() {
    let dir = TempDir::new().unwrap();
    let isolated = IsolatedBackend::from_config(&IsolatedConfig {
        runner: vec![scx_bin().to_string_lossy().into_owned(), "shell".into()],
        ..IsolatedConfig::default()
    })
    .unwrap();
    let isolated = invoker(Box::new(isolated), &dir.path().join("isolated"));
    let direct = invoker(Box::new(DirectBackend::new()), &dir.path().join("direct"));
    assert_eq!(isolated.backend_name(), "isolated");

    let requests = [
        InvocationRequest::new("rates", "compute_rate").arg("amount", Value::Float(0.3)),
        InvocationRequest::new("rates", "compute_rate").arg("amount", Value::Integer(250)),
        InvocationRequest::new("rates", "increment"),
        InvocationRequest::new("rates", "more_complex_endpoint")
            .arg("a", Value::Text("hi".into()))
            .arg("b", Value::Integer(2)),
        InvocationRequest::new("rates", "reset_last_rate"),
        InvocationRequest::new("rates", "explode"),
        InvocationRequest::new("rates", "wrong_return"),
    ];
    for request in &requests {
        let a = isolated.invoke(request).unwrap().record;
        let b = direct.invoke(request).unwrap().record;
        assert_eq!(a.output, b.output, "output differs for {}", request.endpoint);
        assert_eq!(a.state, b.state, "state differs for {}", request.endpoint);
        assert_eq!(a.status, b.status, "status differs for {}", request.endpoint);
        assert_eq!(a.cost_metric, b.cost_metric, "cost differs for {}", request.endpoint);
        assert_eq!(a.code_digest, b.code_digest);
    }
}
