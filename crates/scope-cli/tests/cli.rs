//! CLI command integration tests.
//! Peers are in-process simulators bound to ephemeral ports; tests that use
//! one run on a multi-thread runtime so the simulator keeps serving while the
//! test thread waits on the child process.

use assert_cmd::Command;
use predicates::prelude::*;
use scope_link::{SimHandle, SimOptions, SimServer};
use tempfile::TempDir;

fn scope_cmd() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("scope").unwrap();
    cmd.env_remove("SCOPE_CONFIG");
    cmd
}

async fn start_sim() -> SimHandle {
    SimServer::bind("127.0.0.1:0", SimOptions::default())
        .await
        .unwrap()
        .spawn()
        .unwrap()
}

#[test]
fn help_lists_subcommands() {
    scope_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("simulate"))
        .stdout(predicate::str::contains("probe"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn probe_reports_geometry() {
    let sim = start_sim().await;
    let output = scope_cmd()
        .args(["probe", "--address", &sim.address()])
        .args(["--dataset", "Compound_Dataset_1", "--kind", "afm"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["instrument_kind"], "AFM");
    assert_eq!(json["pitch"], 0.1);
    assert_eq!(json["columns"], 101);
    assert!(
        json["channels"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c == "HeightRetrace")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn probe_unknown_dataset_fails() {
    let sim = start_sim().await;
    scope_cmd()
        .args(["probe", "--address", &sim.address()])
        .args(["--dataset", "nope", "--kind", "STEM"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to open dataset 'nope'"));
}

#[test]
fn probe_unsupported_kind_fails() {
    scope_cmd()
        .args(["probe", "--address", "127.0.0.1:1", "--dataset", "x", "--kind", "SEM"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported instrument kind"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn probe_uses_configured_address() {
    let sim = start_sim().await;
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("scope.toml");
    std::fs::write(
        &config,
        format!("[peers]\nstem = \"{}\"\n\n[peer]\ntimeout_ms = 2000\n", sim.address()),
    )
    .unwrap();

    scope_cmd()
        .arg("--config")
        .arg(&config)
        .args(["probe", "--dataset", "test_stem", "--kind", "STEM"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Channel_001"));
}

#[test]
fn config_from_env_is_used() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("scope.toml");
    std::fs::write(&config, "[peer]\ntimeout_ms = 0\n").unwrap();

    scope_cmd()
        .env("SCOPE_CONFIG", &config)
        .args(["probe", "--dataset", "x", "--kind", "AFM"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load configuration"));
}

#[test]
fn missing_config_file_fails() {
    let dir = TempDir::new().unwrap();
    scope_cmd()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .args(["probe", "--dataset", "x", "--kind", "AFM"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load configuration"));
}

#[test]
fn simulate_rejects_bad_pitch() {
    scope_cmd()
        .args(["simulate", "--listen", "127.0.0.1:0", "--pitch", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to start simulator"));
}
