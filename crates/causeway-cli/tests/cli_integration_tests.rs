//! CLI integration tests for causeway
//!
//! Runs the binary end-to-end against an offline predication fixture.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

fn record(subject: (&str, &str), object: (&str, &str), pmid: &str) -> serde_json::Value {
    serde_json::json!({
        "subject_cui": subject.0,
        "subject_name": subject.1,
        "predicate": "CAUSES",
        "object_cui": object.0,
        "object_name": object.1,
        "pmid": pmid,
    })
}

/// Write a fixture, a config file and return their paths
fn setup(dir: &TempDir, consolidate: bool) -> (String, String) {
    let htn = ("C0020538", "Hypertension");
    let ad = ("C0002395", "Alzheimer's Disease");
    let inflammation = ("C0021368", "Inflammation");
    let mi = ("C0027051", "Myocardial Infarction");
    let heart_attack = ("C0155626", "Heart Attack");

    let records = vec![
        record(htn, inflammation, "10000001"),
        record(htn, inflammation, "10000002"),
        record(inflammation, ad, "10000003"),
        record(htn, mi, "10000004"),
        record(htn, heart_attack, "10000005"),
    ];
    let fixture = dir.path().join("predications.json");
    std::fs::write(&fixture, serde_json::to_string_pretty(&records).unwrap()).unwrap();

    let config = format!(
        r#"
[graph]
exposures = ["C0020538"]
outcomes = ["C0002395"]
max_hops = 2
degree_threshold = 50

[consolidation]
enabled = {consolidate}

[output]
directory = "{out}"
stem = "graph"
cache_dir = "{cache}"
"#,
        consolidate = consolidate,
        out = slash(&dir.path().join("out")),
        cache = slash(&dir.path().join("cache")),
    );
    let config_path = dir.path().join("causeway.toml");
    std::fs::write(&config_path, config).unwrap();

    (slash(&fixture), slash(&config_path))
}

fn slash(path: &Path) -> String {
    path.display().to_string().replace('\\', "/")
}

#[allow(deprecated)]
fn causeway_cmd() -> Command {
    let mut cmd = Command::cargo_bin("causeway").unwrap();
    cmd.env_remove("CAUSEWAY_CONFIG");
    cmd.env_remove("CAUSEWAY_API_KEY");
    cmd.env_remove("OPENROUTER_API_KEY");
    cmd.env("RUST_LOG", "off");
    cmd
}

#[test]
fn test_help_command() {
    causeway_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("inspect"));
}

#[test]
fn test_build_from_fixture_writes_artifacts() {
    let dir = TempDir::new().unwrap();
    let (fixture, config) = setup(&dir, false);

    causeway_cmd()
        .args(["--config", &config, "build", "--fixture", &fixture])
        .assert()
        .success()
        .stdout(predicate::str::contains("Causal graph built"))
        .stdout(predicate::str::contains("Cache: Miss"));

    let dag = std::fs::read_to_string(dir.path().join("out").join("graph.dag")).unwrap();
    assert!(dag.contains("Hypertension [exposure,cui=\"C0020538\"]"));
    assert!(dag.contains("Inflammation -> Alzheimer_s_Disease"));
    assert!(dir.path().join("out").join("graph.json").exists());
    assert!(dir.path().join("out").join("graph.metrics.json").exists());
}

#[test]
fn test_second_build_hits_cache() {
    let dir = TempDir::new().unwrap();
    let (fixture, config) = setup(&dir, false);

    causeway_cmd()
        .args(["--config", &config, "build", "--fixture", &fixture])
        .assert()
        .success();

    causeway_cmd()
        .args(["--config", &config, "build", "--fixture", &fixture])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cache: Hit"));
}

#[test]
fn test_build_json_output() {
    let dir = TempDir::new().unwrap();
    let (fixture, config) = setup(&dir, false);

    let output = causeway_cmd()
        .args(["--config", &config, "--format", "json", "build", "--fixture", &fixture, "--no-cache"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["cache"], "bypassed");
    assert_eq!(summary["graph"]["exposures"], 1);
    assert_eq!(summary["termination"], "empty_frontier");
}

#[test]
fn test_build_with_equivalences_consolidates() {
    let dir = TempDir::new().unwrap();
    let (fixture, config) = setup(&dir, true);
    let groups = dir.path().join("groups.json");
    std::fs::write(&groups, r#"[["Myocardial Infarction", "Heart Attack"]]"#).unwrap();

    causeway_cmd()
        .args([
            "--config",
            &config,
            "build",
            "--fixture",
            &fixture,
            "--equivalences",
            &slash(&groups),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 clusters merged"));

    let dag = std::fs::read_to_string(dir.path().join("out").join("graph.dag")).unwrap();
    assert!(!dag.contains("Heart_Attack"));
}

#[test]
fn test_consolidation_without_api_key_fails() {
    let dir = TempDir::new().unwrap();
    let (fixture, config) = setup(&dir, true);

    causeway_cmd()
        .args(["--config", &config, "build", "--fixture", &fixture])
        .assert()
        .failure()
        .stderr(predicate::str::contains("CAUSEWAY_API_KEY"));
}

#[test]
fn test_invalid_seed_fails_fast() {
    let dir = TempDir::new().unwrap();
    let (fixture, config) = setup(&dir, false);

    causeway_cmd()
        .args(["--config", &config, "config", "set", "graph.exposures", "hypertension"])
        .assert()
        .success();

    causeway_cmd()
        .args(["--config", &config, "build", "--fixture", &fixture])
        .assert()
        .failure()
        .stderr(predicate::str::contains("graph.exposures"));
}

#[test]
fn test_inspect_reports_counts() {
    let dir = TempDir::new().unwrap();
    let (fixture, config) = setup(&dir, false);

    causeway_cmd()
        .args(["--config", &config, "build", "--fixture", &fixture])
        .assert()
        .success();

    let dag = slash(&dir.path().join("out").join("graph.dag"));
    causeway_cmd()
        .args(["inspect", &dag])
        .assert()
        .success()
        .stdout(predicate::str::contains("exposures:    1"))
        .stdout(predicate::str::contains("outcomes:     1"));
}

#[test]
fn test_cache_key_is_stable() {
    let dir = TempDir::new().unwrap();
    let (_, config) = setup(&dir, false);

    let first = causeway_cmd().args(["--config", &config, "cache-key"]).output().unwrap();
    let second = causeway_cmd().args(["--config", &config, "cache-key"]).output().unwrap();
    assert!(first.status.success());
    assert_eq!(first.stdout, second.stdout);
    assert_eq!(String::from_utf8_lossy(&first.stdout).trim().len(), 64);
}

#[test]
fn test_cache_key_follows_the_predication_source() {
    let dir = TempDir::new().unwrap();
    let (fixture, config) = setup(&dir, false);

    let output = causeway_cmd()
        .args(["--config", &config, "--format", "json", "build", "--fixture", &fixture])
        .output()
        .unwrap();
    assert!(output.status.success());
    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();

    let fixture_key = causeway_cmd()
        .args(["--config", &config, "cache-key", "--fixture", &fixture])
        .output()
        .unwrap();
    let database_key = causeway_cmd().args(["--config", &config, "cache-key"]).output().unwrap();

    let fixture_key = String::from_utf8_lossy(&fixture_key.stdout).trim().to_string();
    let database_key = String::from_utf8_lossy(&database_key.stdout).trim().to_string();
    assert_eq!(summary["cache_key"], fixture_key.as_str());
    assert_ne!(fixture_key, database_key);
}

#[test]
fn test_config_get_and_set() {
    let dir = TempDir::new().unwrap();
    let (_, config) = setup(&dir, false);

    causeway_cmd()
        .args(["--config", &config, "config", "set", "graph.degree_threshold", "7"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set graph.degree_threshold = 7"));

    causeway_cmd()
        .args(["--config", &config, "config", "get", "graph.degree_threshold"])
        .assert()
        .success()
        .stdout(predicate::str::diff("7\n"));

    causeway_cmd()
        .args(["--config", &config, "config", "set", "llm.api_key", "sk-secret"])
        .assert()
        .failure();
}
