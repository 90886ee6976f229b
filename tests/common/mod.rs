//! Shared test utilities for integration tests

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use openui::config::Config;
use openui::core::SessionManager;
use openui::queue::StartQueue;
use openui::store::JsonStore;
use openui::worktrees::WorktreeRegistry;

/// Check if git is available on the system
#[must_use]
pub fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok()
}

/// Initialize a git repository in the given directory with an initial commit
///
/// # Panics
///
/// Panics if any git command fails.
pub fn init_git_repo(path: &Path) {
    run_git(path, &["init", "--initial-branch=main"]);
    run_git(path, &["config", "user.email", "test@example.com"]);
    run_git(path, &["config", "user.name", "Test User"]);
    std::fs::write(path.join("README.md"), "# test\n").unwrap();
    std::fs::create_dir_all(path.join("packages/app")).unwrap();
    std::fs::write(path.join("packages/app/main.txt"), "app\n").unwrap();
    run_git(path, &["add", "."]);
    run_git(path, &["commit", "-m", "initial"]);
}

fn run_git(path: &Path, args: &[&str]) {
    let output = Command::new("git")
        .current_dir(path)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {args:?}: {e}"));
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Build a manager whose store, registry and worktrees all live under `dir`.
#[must_use]
pub fn manager_in(dir: &Path) -> Arc<SessionManager> {
    let store = Arc::new(JsonStore::new(
        dir.join("state.json"),
        dir.join("buffers"),
    ));
    let registry = Arc::new(WorktreeRegistry::new(dir.join("worktrees.json")));
    let queue = StartQueue::new(Duration::from_secs(30), Duration::from_secs(2));
    Arc::new(SessionManager::new(
        store,
        registry,
        queue,
        Config::default(),
        dir.join("worktrees"),
    ))
}
