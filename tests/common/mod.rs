use assert_cmd::Command;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A temporary fixforge project backed by SQLite, the local index and the
/// hashing embedder, so tests need no network or model files.
pub struct TestProject {
    pub dir: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        Self { dir }
    }

    /// A project with `fixforge init --embedder hashing` already run.
    pub fn initialized() -> Self {
        let project = Self::new();
        project
            .cmd()
            .args(["init", "--embedder", "hashing"])
            .arg(project.path())
            .assert()
            .success();
        project
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path to the fixforge binary built by cargo.
    pub fn fixforge_bin() -> PathBuf {
        PathBuf::from(env!("CARGO_BIN_EXE_fixforge"))
    }

    /// A command running in the project directory with no generation key.
    pub fn cmd(&self) -> Command {
        let mut cmd = Command::new(Self::fixforge_bin());
        cmd.current_dir(self.path()).env_remove("GEMINI_API_KEY");
        cmd
    }

    /// Replace the config file, keeping the hashing embedder.
    pub fn write_config(&self, extra: &str) {
        let content = format!("[embedding]\nbackend = \"hashing\"\n\n{extra}");
        std::fs::write(self.path().join(".fixforge/config.toml"), content)
            .expect("failed to write config");
    }

    /// Run a command with `--json` and parse its stdout.
    pub fn json(&self, args: &[&str]) -> serde_json::Value {
        let output = self
            .cmd()
            .arg("--json")
            .args(args)
            .output()
            .expect("failed to run fixforge");
        assert!(
            output.status.success(),
            "fixforge {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).expect("stdout is not JSON")
    }

    /// Submit a bug and return the JSON outcome.
    pub fn submit(&self, title: &str, description: &str) -> serde_json::Value {
        self.json(&["submit", "--title", title, "--description", description])
    }

    /// Submit a bug that must be new and return its id.
    pub fn submit_new(&self, title: &str, description: &str, severity: &str) -> String {
        let outcome = self.json(&[
            "submit",
            "--title",
            title,
            "--description",
            description,
            "--severity",
            severity,
        ]);
        assert_eq!(outcome["outcome"], "created", "unexpected outcome: {outcome}");
        outcome["bug_id"].as_str().expect("bug_id").to_string()
    }

    /// Record a solution for a bug.
    pub fn solve(&self, bug_id: &str, explanation: &str) {
        self.cmd()
            .args(["solve", bug_id, "--explanation", explanation])
            .assert()
            .success();
    }
}
