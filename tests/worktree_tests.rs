//! Worktree creation tests against a real git binary.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use openui::worktrees::create::{CreateFreshOptions, assign_branch, create_fresh, create_sparse};
use openui::worktrees::{ProgressFn, WorktreeRegistry};

#[tokio::test]
async fn test_create_fresh_reports_progress_and_checks_out() {
    if !common::git_available() {
        eprintln!("skipping: git not available");
        return;
    }

    let dir = tempfile::TempDir::new().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    common::init_git_repo(&repo);

    let worktree_path = dir.path().join("worktrees").join("wt-fresh");
    let max_progress = Arc::new(AtomicU8::new(0));
    let on_progress: ProgressFn = {
        let max_progress = Arc::clone(&max_progress);
        Arc::new(move |pct, _phase| {
            max_progress.fetch_max(pct, Ordering::SeqCst);
        })
    };

    let created = create_fresh(CreateFreshOptions {
        git_root: &repo,
        worktree_path: &worktree_path,
        session_id: "s1",
        on_progress,
    })
    .await
    .unwrap();

    assert_eq!(created, worktree_path);
    assert!(worktree_path.join("README.md").exists());
    assert!(worktree_path.join(".git").is_file());
    assert_eq!(max_progress.load(Ordering::SeqCst), 100);
}

#[tokio::test]
async fn test_assign_branch_on_claimed_worktree() {
    if !common::git_available() {
        eprintln!("skipping: git not available");
        return;
    }

    let dir = tempfile::TempDir::new().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    common::init_git_repo(&repo);

    let worktree_path = dir.path().join("worktrees").join("wt-branch");
    let on_progress: ProgressFn = Arc::new(|_, _| {});
    create_fresh(CreateFreshOptions {
        git_root: &repo,
        worktree_path: &worktree_path,
        session_id: "s1",
        on_progress,
    })
    .await
    .unwrap();

    // No remote: base resolution falls back to the bare local branch name
    let assignment = assign_branch(&worktree_path, "feature/new-thing", "main", &repo).await;
    assert!(assignment.success, "assignment failed: {:?}", assignment.error);

    let branch = openui::utils::git::current_branch(&worktree_path).await;
    assert_eq!(branch.as_deref(), Some("feature/new-thing"));

    // Reassigning the same branch name force-replaces the stale branch
    let again = assign_branch(&worktree_path, "feature/new-thing", "main", &repo).await;
    assert!(again.success);
}

#[tokio::test]
async fn test_sparse_checkout_materializes_only_subtree() {
    if !common::git_available() {
        eprintln!("skipping: git not available");
        return;
    }

    let dir = tempfile::TempDir::new().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    common::init_git_repo(&repo);

    let worktree_path = dir.path().join("worktrees").join("wt-sparse");
    let cwd = create_sparse(&repo, &worktree_path, "sparse-branch", "main", "packages/app")
        .await
        .unwrap();

    assert_eq!(cwd, worktree_path.join("packages/app"));
    assert!(cwd.join("main.txt").exists());
}

#[tokio::test]
async fn test_sparse_checkout_missing_dir_cleans_up() {
    if !common::git_available() {
        eprintln!("skipping: git not available");
        return;
    }

    let dir = tempfile::TempDir::new().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    common::init_git_repo(&repo);

    let worktree_path = dir.path().join("worktrees").join("wt-missing");
    let result = create_sparse(&repo, &worktree_path, "missing-branch", "main", "no/such/dir").await;

    assert!(result.is_err());
    assert!(!worktree_path.exists(), "failed sparse worktree not removed");
}

#[tokio::test]
async fn test_registry_claim_validates_real_worktree() {
    if !common::git_available() {
        eprintln!("skipping: git not available");
        return;
    }

    let dir = tempfile::TempDir::new().unwrap();
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    common::init_git_repo(&repo);

    let registry = WorktreeRegistry::new(dir.path().join("worktrees.json"));
    let worktree_path = dir.path().join("worktrees").join("wt-pool");
    let on_progress: ProgressFn = Arc::new(|_, _| {});
    create_fresh(CreateFreshOptions {
        git_root: &repo,
        worktree_path: &worktree_path,
        session_id: "s1",
        on_progress,
    })
    .await
    .unwrap();

    registry.register(&worktree_path, &repo, "s1", None).await;
    registry.release(&worktree_path).await;

    let claimed = registry.claim(&repo, "s2").await;
    assert_eq!(claimed, Some(worktree_path));
}
