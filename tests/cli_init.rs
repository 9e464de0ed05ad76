mod common;

use common::TestProject;
use predicates::prelude::*;

#[test]
fn init_creates_fixforge_directory() {
    let project = TestProject::new();

    project
        .cmd()
        .args(["init", "--embedder", "hashing"])
        .arg(project.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("FixForge initialized"));

    assert!(project.path().join(".fixforge/config.toml").exists());
    assert!(project.path().join(".fixforge/fixforge.db").exists());
    assert!(project.path().join(".fixforge/vectors.db").exists());
}

#[test]
fn init_json_output() {
    let project = TestProject::new();

    project
        .cmd()
        .args(["--json", "init", "--embedder", "hashing"])
        .arg(project.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"initialized\""));
}

#[test]
fn init_twice_fails_without_force() {
    let project = TestProject::initialized();

    project
        .cmd()
        .arg("init")
        .arg(project.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("already initialized"));

    project
        .cmd()
        .args(["init", "--force", "--embedder", "hashing"])
        .arg(project.path())
        .assert()
        .success();
}

#[test]
fn init_writes_chosen_backends() {
    let project = TestProject::initialized();
    let config = std::fs::read_to_string(project.path().join(".fixforge/config.toml")).unwrap();
    let parsed: toml::Value = toml::from_str(&config).unwrap();
    assert_eq!(parsed["embedding"]["backend"].as_str(), Some("hashing"));
    assert_eq!(parsed["store"]["backend"].as_str(), Some("sqlite"));
    assert_eq!(parsed["index"]["backend"].as_str(), Some("local"));
    assert_eq!(parsed["index"]["name"].as_str(), Some("fixforge_bugs"));
}

#[test]
fn commands_require_init() {
    let project = TestProject::new();

    project
        .cmd()
        .args(["search", "crash"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not initialized"));
}

#[test]
fn status_reports_counts() {
    let project = TestProject::initialized();
    project.submit_new("Tooltip flickers", "Hovering the chart makes the tooltip flicker", "Low");

    let status = project.json(&["status"]);
    assert_eq!(status["status"], "ready");
    assert_eq!(status["store"]["bugs"], 1);
    assert_eq!(status["store"]["solutions"], 0);
    assert_eq!(status["index"]["total_vectors"], 1);
    assert_eq!(status["embedder"], "hashing");
}

#[test]
fn status_not_initialized() {
    let project = TestProject::new();
    let status = project.json(&["status"]);
    assert_eq!(status["status"], "not_initialized");
}
