//! Git subprocess primitives.
//!
//! This is a leaf module: both the session manager and the worktree registry
//! call into it, which keeps those two from depending on each other. Every
//! subprocess call carries an external timeout so a hung remote cannot stall
//! session creation.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Hard ceiling on any single git subprocess call.
pub const GIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Run a git command in `dir` and return trimmed stdout.
///
/// The child is killed if it outlives [`GIT_TIMEOUT`].
///
/// # Errors
///
/// Returns an error if the command cannot be spawned, times out, or exits
/// non-zero (stderr is included in the error).
pub async fn git(dir: &Path, args: &[&str]) -> anyhow::Result<String> {
    let output = tokio::time::timeout(
        GIT_TIMEOUT,
        Command::new("git")
            .current_dir(dir)
            .args(args)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .with_context(|| format!("git {} timed out after {:?}", args.join(" "), GIT_TIMEOUT))?
    .with_context(|| format!("failed to spawn git {}", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

/// Run a git command, reporting only whether it succeeded.
pub async fn git_ok(dir: &Path, args: &[&str]) -> bool {
    git(dir, args).await.is_ok()
}

/// Current branch of the checkout at `dir`, or `None` outside a repo /
/// on a detached HEAD reported as literal `HEAD`.
pub async fn current_branch(dir: &Path) -> Option<String> {
    let branch = git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await.ok()?;
    if branch.is_empty() || branch == "HEAD" {
        None
    } else {
        Some(branch)
    }
}

/// Find the repository root for `path` by walking up until a `.git` entry.
///
/// Works for regular clones (`.git` directory) and linked worktrees
/// (`.git` file); the returned root is the directory containing that entry,
/// not the mother repo. Use [`main_worktree_path`] for the mother repo.
///
/// # Errors
///
/// Returns an error if `path` does not exist or is not inside a repository.
pub fn find_git_root(path: &Path) -> anyhow::Result<PathBuf> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("path does not exist: {}", path.display()))?;

    let mut current = canonical.as_path();
    loop {
        if current.join(".git").exists() {
            return Ok(current.to_path_buf());
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => anyhow::bail!("not inside a git repository: {}", canonical.display()),
        }
    }
}

/// True when `path` sits inside a linked worktree (its root has a `.git` file
/// rather than a `.git` directory).
#[must_use]
pub fn is_inside_linked_worktree(path: &Path) -> bool {
    find_git_root(path).is_ok_and(|root| root.join(".git").is_file())
}

/// Path of the main worktree (the mother repo) for the repository containing
/// `dir`. The first `worktree ` line of `git worktree list --porcelain` is
/// always the main worktree.
pub async fn main_worktree_path(dir: &Path) -> Option<PathBuf> {
    let listing = git(dir, &["worktree", "list", "--porcelain"]).await.ok()?;
    listing
        .lines()
        .find_map(|line| line.strip_prefix("worktree "))
        .map(PathBuf::from)
}

/// Resolve the ref a new branch should start from.
///
/// Probes in order: `origin/<base>` after a fetch, the symbolic ref behind
/// `origin/HEAD`, then the bare local branch name.
pub async fn resolve_base_ref(git_root: &Path, base_branch: &str) -> String {
    // Refresh the remote ref first; failure (offline, no remote) is fine.
    let _ = git(git_root, &["fetch", "origin", base_branch]).await;

    let origin_ref = format!("origin/{base_branch}");
    if git_ok(git_root, &["rev-parse", "--verify", &origin_ref]).await {
        return origin_ref;
    }

    if let Ok(head_ref) = git(
        git_root,
        &["symbolic-ref", "refs/remotes/origin/HEAD", "--short"],
    )
    .await
    {
        if !head_ref.is_empty() {
            return head_ref;
        }
    }

    base_branch.to_owned()
}
