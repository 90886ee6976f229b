//! Process-wide pool of reusable git worktrees.
//!
//! Claiming a previously released worktree turns session startup from a full
//! checkout into a branch switch. The registry file is the source of truth:
//! every mutation is a read-modify-write cycle committed by atomic rename,
//! so claim/release are linearizable without any in-memory cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::store::json::{atomic_write_json, read_json_with_recovery};
use crate::utils::git;

/// Cap on `available` worktrees kept per mother repo.
pub const MAX_AVAILABLE_PER_REPO: usize = 5;

/// Pool state of a registered worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorktreeStatus {
    /// Held by a session.
    Claimed,
    /// Released and reusable.
    Available,
}

/// One registered worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub git_root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub status: WorktreeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    worktrees: Vec<WorktreeEntry>,
}

/// Aggregate pool counters.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub available: usize,
    pub claimed: usize,
    pub per_repo: HashMap<String, usize>,
}

/// The worktree pool.
pub struct WorktreeRegistry {
    file: PathBuf,
    /// Serializes read-modify-write cycles on the registry file.
    lock: Mutex<()>,
}

impl WorktreeRegistry {
    /// Create a registry backed by the given file.
    #[must_use]
    pub fn new(file: PathBuf) -> Self {
        Self {
            file,
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Vec<WorktreeEntry> {
        read_json_with_recovery::<RegistryFile>(&self.file)
            .await
            .unwrap_or_default()
            .worktrees
    }

    async fn save(&self, worktrees: Vec<WorktreeEntry>) {
        let file = RegistryFile { worktrees };
        if let Err(e) = atomic_write_json(&self.file, &file).await {
            tracing::warn!(path = %self.file.display(), error = %e, "Failed to persist worktree registry");
        }
    }

    /// Claim an available worktree for this repo, preferring the most
    /// recently released. Stale entries whose `.git` file is gone are
    /// dropped. Returns `None` on a pool miss.
    pub async fn claim(&self, git_root: &Path, session_id: &str) -> Option<PathBuf> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await;

        // Most recently released first
        let mut candidates: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.git_root == git_root && e.status == WorktreeStatus::Available)
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| std::cmp::Reverse(entries[i].released_at));

        let mut stale: Vec<PathBuf> = Vec::new();
        let mut claimed: Option<PathBuf> = None;

        for i in candidates {
            let path = entries[i].path.clone();
            if path.join(".git").is_file() {
                entries[i].status = WorktreeStatus::Claimed;
                entries[i].session_id = Some(session_id.to_owned());
                claimed = Some(path);
                break;
            }
            tracing::warn!(path = %path.display(), "Dropping stale worktree entry");
            stale.push(path);
        }

        if !stale.is_empty() {
            entries.retain(|e| !stale.contains(&e.path));
        }
        if claimed.is_some() || !stale.is_empty() {
            self.save(entries).await;
        }

        if let Some(path) = &claimed {
            tracing::info!(
                session_id,
                path = %path.display(),
                "Claimed pooled worktree"
            );
        }
        claimed
    }

    /// Record a freshly created worktree as claimed. No-op when the path is
    /// already registered.
    pub async fn register(
        &self,
        path: &Path,
        git_root: &Path,
        session_id: &str,
        branch: Option<String>,
    ) {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await;
        if entries.iter().any(|e| e.path == path) {
            return;
        }
        entries.push(WorktreeEntry {
            path: path.to_path_buf(),
            git_root: git_root.to_path_buf(),
            branch,
            status: WorktreeStatus::Claimed,
            session_id: Some(session_id.to_owned()),
            created_at: Utc::now(),
            released_at: None,
        });
        self.save(entries).await;
    }

    /// Return a worktree to the pool and prune the repo's surplus.
    pub async fn release(&self, path: &Path) {
        let git_root = {
            let _guard = self.lock.lock().await;
            let mut entries = self.load().await;
            let mut git_root = None;
            for entry in &mut entries {
                if entry.path == path {
                    entry.status = WorktreeStatus::Available;
                    entry.session_id = None;
                    entry.released_at = Some(Utc::now());
                    git_root = Some(entry.git_root.clone());
                }
            }
            if git_root.is_some() {
                self.save(entries).await;
            }
            git_root
        };

        if let Some(git_root) = git_root {
            tracing::info!(path = %path.display(), "Released worktree back to pool");
            self.prune(&git_root).await;
        }
    }

    /// Delete surplus available worktrees for a repo, oldest release first,
    /// until at most [`MAX_AVAILABLE_PER_REPO`] remain.
    pub async fn prune(&self, git_root: &Path) {
        let doomed = {
            let _guard = self.lock.lock().await;
            let mut entries = self.load().await;

            let mut available: Vec<usize> = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.git_root == git_root && e.status == WorktreeStatus::Available)
                .map(|(i, _)| i)
                .collect();
            if available.len() <= MAX_AVAILABLE_PER_REPO {
                return;
            }
            // Oldest release first
            available.sort_by_key(|&i| entries[i].released_at);
            let surplus = available.len() - MAX_AVAILABLE_PER_REPO;
            let doomed: Vec<PathBuf> = available[..surplus]
                .iter()
                .map(|&i| entries[i].path.clone())
                .collect();

            entries.retain(|e| !doomed.contains(&e.path));
            self.save(entries).await;
            doomed
        };

        for path in &doomed {
            tracing::info!(path = %path.display(), "Pruning surplus worktree");
            if let Err(e) = tokio::fs::remove_dir_all(path).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to delete pruned worktree");
            }
        }
        if !doomed.is_empty() {
            let _ = git::git(git_root, &["worktree", "prune"]).await;
        }
    }

    /// Drop an entry without touching the directory.
    pub async fn unregister(&self, path: &Path) {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await;
        let before = entries.len();
        entries.retain(|e| e.path != path);
        if entries.len() != before {
            self.save(entries).await;
        }
    }

    /// Pool counters, total and per repo.
    pub async fn stats(&self) -> RegistryStats {
        let entries = self.load().await;
        let mut stats = RegistryStats {
            total: entries.len(),
            ..Default::default()
        };
        for entry in &entries {
            match entry.status {
                WorktreeStatus::Available => stats.available += 1,
                WorktreeStatus::Claimed => stats.claimed += 1,
            }
            *stats
                .per_repo
                .entry(entry.git_root.to_string_lossy().into_owned())
                .or_default() += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry_in(dir: &TempDir) -> WorktreeRegistry {
        WorktreeRegistry::new(dir.path().join("worktrees.json"))
    }

    /// Create a directory that passes the `.git`-file staleness check.
    fn fake_worktree(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(".git"), "gitdir: /repo/.git/worktrees/x").unwrap();
        path
    }

    #[tokio::test]
    async fn test_claim_miss_on_empty_pool() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        assert!(registry.claim(Path::new("/repo"), "s1").await.is_none());
    }

    #[tokio::test]
    async fn test_register_release_claim_round_trip() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let wt = fake_worktree(&dir, "wt1");
        let repo = Path::new("/repo");

        registry.register(&wt, repo, "s1", None).await;
        // Claimed by s1: not claimable
        assert!(registry.claim(repo, "s2").await.is_none());

        registry.release(&wt).await;
        assert_eq!(registry.claim(repo, "s2").await, Some(wt));
    }

    #[tokio::test]
    async fn test_register_duplicate_is_noop() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let wt = fake_worktree(&dir, "wt1");

        registry.register(&wt, Path::new("/repo"), "s1", None).await;
        registry.register(&wt, Path::new("/repo"), "s2", None).await;

        assert_eq!(registry.stats().await.total, 1);
    }

    #[tokio::test]
    async fn test_claim_prefers_most_recently_released() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let repo = Path::new("/repo");
        let old = fake_worktree(&dir, "old");
        let recent = fake_worktree(&dir, "recent");

        registry.register(&old, repo, "s1", None).await;
        registry.register(&recent, repo, "s2", None).await;
        registry.release(&old).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        registry.release(&recent).await;

        assert_eq!(registry.claim(repo, "s3").await, Some(recent));
    }

    #[tokio::test]
    async fn test_claim_skips_and_drops_stale_entries() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let repo = Path::new("/repo");
        let stale = dir.path().join("stale");
        std::fs::create_dir_all(&stale).unwrap(); // no .git file
        let good = fake_worktree(&dir, "good");

        registry.register(&stale, repo, "s1", None).await;
        registry.register(&good, repo, "s2", None).await;
        registry.release(&stale).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        registry.release(&good).await;
        // Make the preferred (most recent) candidate stale on disk
        std::fs::remove_file(good.join(".git")).unwrap();

        assert_eq!(registry.claim(repo, "s3").await, None);
        // Both entries were dropped as stale
        assert_eq!(registry.stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_release_prunes_past_pool_cap() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let repo = Path::new("/repo");

        let mut paths = Vec::new();
        for i in 0..(MAX_AVAILABLE_PER_REPO + 2) {
            let wt = fake_worktree(&dir, &format!("wt{i}"));
            registry
                .register(&wt, repo, &format!("s{i}"), None)
                .await;
            paths.push(wt);
        }
        for path in &paths {
            registry.release(path).await;
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let stats = registry.stats().await;
        assert_eq!(stats.available, MAX_AVAILABLE_PER_REPO);
        // Oldest releases were deleted from disk
        assert!(!paths[0].exists());
        assert!(!paths[1].exists());
        assert!(paths[paths.len() - 1].exists());
    }

    #[tokio::test]
    async fn test_unregister_keeps_directory() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let wt = fake_worktree(&dir, "wt1");

        registry.register(&wt, Path::new("/repo"), "s1", None).await;
        registry.unregister(&wt).await;

        assert_eq!(registry.stats().await.total, 0);
        assert!(wt.exists());
    }

    #[tokio::test]
    async fn test_stats_counts_by_repo() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let a = fake_worktree(&dir, "a");
        let b = fake_worktree(&dir, "b");

        registry.register(&a, Path::new("/repo1"), "s1", None).await;
        registry.register(&b, Path::new("/repo2"), "s2", None).await;
        registry.release(&b).await;

        let stats = registry.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.claimed, 1);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.per_repo.get("/repo1"), Some(&1));
    }
}
