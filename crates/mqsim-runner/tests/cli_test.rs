//! Integration tests for the `mqsim` binary.
//!
//! These run the real executable and check the files it writes.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

use mqsim_runner::RunReport;
use serde::Deserialize;

// ============================================================================
// JSON Deserialization Types for Trace Output
// ============================================================================

/// A trace entry as written by `--trace`.
///
/// Only the fields common to every observation are checked; the rest of the
/// object depends on `kind`.
#[derive(Debug, Deserialize)]
struct TraceEntry {
    time_s: f64,
    #[serde(default)]
    node: Option<String>,
    kind: String,
}

// ============================================================================
// Test Helper Functions
// ============================================================================

fn mqsim(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_mqsim"))
        .args(args)
        .output()
        .expect("failed to execute mqsim")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "mqsim failed:\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn read_report(path: &Path) -> RunReport {
    let text = fs::read_to_string(path).expect("report written");
    serde_json::from_str(&text).expect("report is valid JSON")
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
}

const SMALL_SCENARIO: &str = r#"
label: cli-small
seed: 5
duration_s: 60
gateways:
  - id: gw
    position: [50, 50]
nodes:
  - id: thermo
    phy: zigbee
    position: [60, 50]
    publish:
      topic: home/temp
      qos: 1
      interval_s: 10
  - id: phone
    phy: ble
    position: [45, 55]
    subscriptions:
      - filter: "home/+"
        qos: 1
"#;

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_run_writes_report_and_trace() {
    let dir = TempDir::new().expect("temp dir");
    let scenario = dir.path().join("scenario.yaml");
    fs::write(&scenario, SMALL_SCENARIO).expect("scenario written");
    let report_path = dir.path().join("out/report.json");
    let trace_path = dir.path().join("trace.json");

    let output = mqsim(&[
        "run",
        path_str(&scenario),
        "--output",
        path_str(&report_path),
        "--trace",
        path_str(&trace_path),
    ]);
    assert_success(&output);

    let report = read_report(&report_path);
    assert_eq!(report.label, "cli-small");
    assert_eq!(report.seed, 5);
    assert_eq!(report.experiment, None);
    assert_eq!(report.snapshot.time_s, 60.0);
    assert!(report.snapshot.overall.published >= 5);
    assert!(report.snapshot.overall.delivered > 0);

    let text = fs::read_to_string(&trace_path).expect("trace written");
    let entries: Vec<TraceEntry> = serde_json::from_str(&text).expect("trace is a JSON array");
    assert!(!entries.is_empty());
    assert!(entries.windows(2).all(|w| w[0].time_s <= w[1].time_s));
    assert!(entries
        .iter()
        .any(|e| e.kind == "published" && e.node.as_deref() == Some("thermo")));
    assert!(entries
        .iter()
        .any(|e| e.kind == "delivered" && e.node.as_deref() == Some("phone")));
}

#[test]
fn test_run_overrides_seed_and_duration() {
    let dir = TempDir::new().expect("temp dir");
    let scenario = dir.path().join("scenario.yaml");
    fs::write(&scenario, SMALL_SCENARIO).expect("scenario written");
    let report_path = dir.path().join("report.json");

    let output = mqsim(&[
        "run",
        path_str(&scenario),
        "--seed",
        "11",
        "--duration",
        "30",
        "--output",
        path_str(&report_path),
    ]);
    assert_success(&output);

    let report = read_report(&report_path);
    assert_eq!(report.seed, 11);
    assert_eq!(report.duration_s, 30.0);
    assert_eq!(report.snapshot.time_s, 30.0);
}

#[test]
fn test_invalid_scenario_fails() {
    let dir = TempDir::new().expect("temp dir");
    let scenario = dir.path().join("bad.yaml");
    fs::write(&scenario, SMALL_SCENARIO.replace("zigbee", "lora")).expect("scenario written");

    let output = mqsim(&["run", path_str(&scenario)]);
    assert!(!output.status.success());

    let output = mqsim(&["run", path_str(&dir.path().join("missing.yaml"))]);
    assert!(!output.status.success());
}

#[test]
fn test_preset_with_prometheus_metrics() {
    let dir = TempDir::new().expect("temp dir");
    let report_path = dir.path().join("report.json");
    let metrics_path = dir.path().join("metrics.prom");

    let output = mqsim(&[
        "preset",
        "protocol-comparison",
        "--duration",
        "60",
        "--output",
        path_str(&report_path),
        "--metrics-output",
        path_str(&metrics_path),
        "--metrics-format",
        "prometheus",
    ]);
    assert_success(&output);

    let report = read_report(&report_path);
    assert_eq!(report.label, "protocol-comparison");
    assert_eq!(report.experiment.as_deref(), Some("protocol-comparison"));
    assert_eq!(report.seed, 42);

    let metrics = fs::read_to_string(&metrics_path).expect("metrics written");
    assert!(metrics.contains("# TYPE mqsim_mqtt_published counter"));
    assert!(metrics.contains("label=\"protocol-comparison\""));
}

#[test]
fn test_dumped_preset_runs_like_the_preset() {
    let dir = TempDir::new().expect("temp dir");
    let yaml_path = dir.path().join("duty.yaml");
    let preset_report = dir.path().join("preset.json");
    let file_report = dir.path().join("file.json");

    assert_success(&mqsim(&[
        "preset",
        "duty-cycle",
        "--seed",
        "3",
        "--dump-scenario",
        path_str(&yaml_path),
    ]));
    assert!(yaml_path.exists());

    assert_success(&mqsim(&[
        "preset",
        "duty-cycle",
        "--seed",
        "3",
        "--duration",
        "60",
        "--output",
        path_str(&preset_report),
    ]));
    assert_success(&mqsim(&[
        "run",
        path_str(&yaml_path),
        "--duration",
        "60",
        "--output",
        path_str(&file_report),
    ]));

    let from_preset = read_report(&preset_report);
    let from_file = read_report(&file_report);
    assert_eq!(from_preset.snapshot, from_file.snapshot);
}

#[test]
fn test_compare_writes_one_report_per_run() {
    let dir = TempDir::new().expect("temp dir");
    let out = dir.path().join("reports");

    let output = mqsim(&[
        "compare",
        "--experiments",
        "duty-cycle,protocol-comparison",
        "--seeds",
        "1,2",
        "--duration",
        "30",
        "--output-dir",
        path_str(&out),
    ]);
    assert_success(&output);

    for label in ["duty-cycle", "protocol-comparison"] {
        for seed in [1, 2] {
            let report = read_report(&out.join(format!("{}-seed{}.json", label, seed)));
            assert_eq!(report.label, label);
            assert_eq!(report.seed, seed);
        }
    }
}

#[test]
fn test_metrics_command_lists_definitions() {
    let output = mqsim(&["metrics"]);
    assert_success(&output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("mqsim.mqtt.published"));
    assert!(stdout.contains("mqsim.broker.queue_drops"));
    assert!(stdout.contains("mqsim.radio.mac_drops"));
}
