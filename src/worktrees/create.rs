//! Worktree creation paths: pooled branch reassignment, fresh creation with
//! streamed checkout progress, and cone-mode sparse checkouts.

use anyhow::Context;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::utils::git;

static CHECKOUT_PERCENT: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used, reason = "static pattern")]
    Regex::new(r"(\d{1,3})%").unwrap()
});

/// Progress callback: overall percentage (0-100) and a phase label.
pub type ProgressFn = Arc<dyn Fn(u8, &str) + Send + Sync>;

/// Outcome of pointing a claimed worktree at a new branch.
#[derive(Debug, Clone)]
pub struct BranchAssignment {
    pub success: bool,
    pub branch_name: String,
    pub error: Option<String>,
}

/// Parameters for [`create_fresh`].
pub struct CreateFreshOptions<'a> {
    pub git_root: &'a Path,
    pub worktree_path: &'a Path,
    pub session_id: &'a str,
    pub on_progress: ProgressFn,
}

/// Point a claimed worktree at a fresh branch off the resolved base.
///
/// The base ref is probed in order: `origin/<base>` after a fetch, the
/// symbolic ref behind `origin/HEAD`, then the bare local name. Any existing
/// local branch of the target name is force-deleted first so the checkout
/// starts from the base, not from leftovers.
pub async fn assign_branch(
    worktree_path: &Path,
    branch_name: &str,
    base_branch: &str,
    git_root: &Path,
) -> BranchAssignment {
    let base_ref = git::resolve_base_ref(git_root, base_branch).await;

    let result: anyhow::Result<()> = async {
        git::git(worktree_path, &["checkout", "--detach"])
            .await
            .context("failed to detach HEAD")?;
        // The branch may be checked out nowhere else now; stale copies go.
        let _ = git::git(worktree_path, &["branch", "-D", branch_name]).await;
        git::git(
            worktree_path,
            &["checkout", "-b", branch_name, &base_ref],
        )
        .await
        .with_context(|| format!("failed to create branch {branch_name} from {base_ref}"))?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            tracing::info!(
                worktree = %worktree_path.display(),
                branch = branch_name,
                base = %base_ref,
                "Assigned branch to pooled worktree"
            );
            BranchAssignment {
                success: true,
                branch_name: branch_name.to_owned(),
                error: None,
            }
        }
        Err(e) => {
            tracing::warn!(
                worktree = %worktree_path.display(),
                branch = branch_name,
                error = %e,
                "Branch assignment failed"
            );
            BranchAssignment {
                success: false,
                branch_name: branch_name.to_owned(),
                error: Some(format!("{e:#}")),
            }
        }
    }
}

/// Create a brand-new worktree with progress reporting.
///
/// Two phases: `worktree add --no-checkout --detach` registers the worktree
/// instantly, then a streamed `git checkout --progress` materializes the
/// files. Checkout percentages from stderr are remapped onto the 5-95 band
/// of overall progress.
///
/// # Errors
///
/// Returns an error if either git phase fails; the half-created directory is
/// removed and `git worktree prune` run before returning.
pub async fn create_fresh(options: CreateFreshOptions<'_>) -> anyhow::Result<PathBuf> {
    let CreateFreshOptions {
        git_root,
        worktree_path,
        session_id,
        on_progress,
    } = options;

    if let Some(parent) = worktree_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    on_progress(5, "registering");
    let path_str = worktree_path.to_string_lossy();
    git::git(
        git_root,
        &["worktree", "add", "--no-checkout", "--detach", &path_str, "HEAD"],
    )
    .await
    .with_context(|| format!("failed to add worktree at {path_str}"))?;

    tracing::info!(
        session_id,
        worktree = %worktree_path.display(),
        "Worktree registered, starting checkout"
    );

    if let Err(e) = streamed_checkout(worktree_path, &on_progress).await {
        tracing::error!(
            session_id,
            worktree = %worktree_path.display(),
            error = %e,
            "Checkout failed, removing half-created worktree"
        );
        let _ = tokio::fs::remove_dir_all(worktree_path).await;
        let _ = git::git(git_root, &["worktree", "prune"]).await;
        return Err(e);
    }

    on_progress(100, "done");
    Ok(worktree_path.to_path_buf())
}

/// Run `git checkout --progress HEAD`, parsing `NN%` tokens off stderr.
async fn streamed_checkout(worktree_path: &Path, on_progress: &ProgressFn) -> anyhow::Result<()> {
    let mut child = Command::new("git")
        .current_dir(worktree_path)
        .args(["checkout", "--progress", "HEAD"])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn git checkout")?;

    let mut stderr = child
        .stderr
        .take()
        .context("checkout stderr not captured")?;

    let mut buf = [0u8; 4096];
    let mut window = String::new();
    loop {
        let n = stderr.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        window.push_str(&String::from_utf8_lossy(&buf[..n]));

        if let Some(cap) = CHECKOUT_PERCENT
            .captures_iter(&window)
            .last()
            .and_then(|c| c.get(1))
        {
            if let Ok(pct) = cap.as_str().parse::<u32>() {
                let pct = pct.min(100);
                // Remap 0-100 checkout onto the 5-95 band
                let overall = 5 + (pct * 90 / 100);
                #[expect(clippy::cast_possible_truncation, reason = "bounded above by 95")]
                on_progress(overall as u8, "checkout");
            }
        }
        // Progress lines are \r-separated; only the tail matters
        if let Some(idx) = window.rfind(['\r', '\n']) {
            window.drain(..=idx);
        }
    }

    let status = child.wait().await.context("git checkout did not run")?;
    if !status.success() {
        anyhow::bail!("git checkout exited with {status}");
    }
    Ok(())
}

/// Create a cone-mode sparse worktree materializing only `rel_dir`.
///
/// Returns the session working directory (`<worktree>/<rel_dir>`). When the
/// directory does not exist on the target branch the worktree is removed and
/// an error returned so the caller can fall back to a full checkout.
///
/// # Errors
///
/// Returns an error on any git failure or when `rel_dir` is absent from the
/// checked-out tree.
pub async fn create_sparse(
    git_root: &Path,
    worktree_path: &Path,
    branch_name: &str,
    base_ref: &str,
    rel_dir: &str,
) -> anyhow::Result<PathBuf> {
    if let Some(parent) = worktree_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let path_str = worktree_path.to_string_lossy();
    git::git(
        git_root,
        &[
            "worktree",
            "add",
            "--no-checkout",
            "-b",
            branch_name,
            &path_str,
            base_ref,
        ],
    )
    .await
    .with_context(|| format!("failed to add sparse worktree at {path_str}"))?;

    let result: anyhow::Result<PathBuf> = async {
        git::git(
            worktree_path,
            &["sparse-checkout", "set", "--cone", rel_dir],
        )
        .await
        .context("failed to configure sparse checkout")?;
        git::git(worktree_path, &["checkout"])
            .await
            .context("sparse checkout failed")?;

        let cwd = worktree_path.join(rel_dir);
        if !cwd.is_dir() {
            anyhow::bail!("directory '{rel_dir}' does not exist on {base_ref}");
        }
        Ok(cwd)
    }
    .await;

    match result {
        Ok(cwd) => {
            tracing::info!(
                worktree = %worktree_path.display(),
                rel_dir,
                branch = branch_name,
                "Sparse worktree ready"
            );
            Ok(cwd)
        }
        Err(e) => {
            tracing::warn!(
                worktree = %worktree_path.display(),
                error = %e,
                "Sparse checkout failed, removing worktree"
            );
            let _ = git::git(
                git_root,
                &["worktree", "remove", "--force", &path_str],
            )
            .await;
            let _ = tokio::fs::remove_dir_all(worktree_path).await;
            let _ = git::git(git_root, &["worktree", "prune"]).await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_percent_parsing() {
        let caps: Vec<&str> = CHECKOUT_PERCENT
            .captures_iter("Updating files:  42% (123/290)\rUpdating files:  97% (280/290)")
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        assert_eq!(caps, vec!["42", "97"]);
    }

    #[test]
    fn test_progress_band_remap() {
        // 0% checkout -> 5 overall, 100% -> 95 overall
        assert_eq!(5 + (0 * 90 / 100), 5);
        assert_eq!(5 + (100 * 90 / 100), 95);
        assert_eq!(5 + (50 * 90 / 100), 50);
    }
}
