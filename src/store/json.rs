//! JSON snapshot store.
//!
//! One JSON file holds nodes and canvases; each session's output buffer is a
//! flat text file next to it. Every write goes through write-tmp-then-rename
//! so a crash mid-write never corrupts the previous snapshot.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{Canvas, PersistedNode, PersistedState, PositionUpdate, StateStore};

/// Id assigned to the default canvas created on first boot.
const DEFAULT_CANVAS_ID: &str = "canvas-default";

/// Serialize `data` to `path` atomically: write `path.tmp`, then rename.
///
/// # Errors
///
/// Returns an error if serialization or either filesystem step fails.
pub async fn atomic_write_json<T: Serialize + Sync>(path: &Path, data: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let bytes = serde_json::to_vec_pretty(data)?;
    let tmp_path = tmp_path_for(path);
    tokio::fs::write(&tmp_path, &bytes).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Read and parse a JSON file, falling back to its `.tmp` sibling when the
/// main file is missing or corrupt. Returns `None` when neither parses.
pub async fn read_json_with_recovery<T: DeserializeOwned>(path: &Path) -> Option<T> {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => return Some(value),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Corrupt state file, trying .tmp recovery");
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read state file, trying .tmp recovery");
        }
    }

    let tmp_path = tmp_path_for(path);
    let bytes = tokio::fs::read(&tmp_path).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => {
            tracing::info!(path = %tmp_path.display(), "Recovered state from .tmp file");
            Some(value)
        }
        Err(e) => {
            tracing::warn!(path = %tmp_path.display(), error = %e, "Recovery file also corrupt");
            None
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// JSON-file implementation of [`StateStore`].
pub struct JsonStore {
    state_path: PathBuf,
    buffers_dir: PathBuf,
    /// Serializes read-modify-write cycles on the snapshot file.
    lock: Mutex<()>,
}

impl JsonStore {
    /// Create a store rooted at the given paths. Directories are created
    /// lazily on first write.
    #[must_use]
    pub fn new(state_path: PathBuf, buffers_dir: PathBuf) -> Self {
        Self {
            state_path,
            buffers_dir,
            lock: Mutex::new(()),
        }
    }

    async fn read_snapshot(&self) -> PersistedState {
        read_json_with_recovery(&self.state_path)
            .await
            .unwrap_or_default()
    }

    async fn write_snapshot(&self, state: &PersistedState) {
        if let Err(e) = atomic_write_json(&self.state_path, state).await {
            tracing::warn!(path = %self.state_path.display(), error = %e, "Failed to persist state");
        }
    }

    fn buffer_path(&self, session_id: &str) -> PathBuf {
        self.buffers_dir.join(format!("{session_id}.txt"))
    }
}

/// Ensure a default canvas exists and point orphaned nodes at it.
/// Returns true when anything was repaired.
fn repair_canvases(state: &mut PersistedState) -> bool {
    let mut changed = false;

    if state.canvases.is_empty() {
        state.canvases.push(Canvas {
            id: DEFAULT_CANVAS_ID.to_owned(),
            name: "Canvas 1".to_owned(),
            color: None,
            order: 0,
            created_at: Utc::now(),
            is_default: true,
        });
        changed = true;
    }

    let default_id = state
        .canvases
        .iter()
        .find(|c| c.is_default)
        .unwrap_or(&state.canvases[0])
        .id
        .clone();

    let known: HashSet<&str> = state.canvases.iter().map(|c| c.id.as_str()).collect();
    let orphaned: Vec<usize> = state
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| {
            n.canvas_id
                .as_deref()
                .is_some_and(|id| !known.contains(id))
        })
        .map(|(i, _)| i)
        .collect();

    for i in orphaned {
        tracing::warn!(
            node_id = %state.nodes[i].node_id,
            canvas_id = ?state.nodes[i].canvas_id,
            "Node references missing canvas, reassigning to default"
        );
        state.nodes[i].canvas_id = Some(default_id.clone());
        changed = true;
    }

    changed
}

#[async_trait]
impl StateStore for JsonStore {
    async fn load_state(&self) -> PersistedState {
        let _guard = self.lock.lock().await;
        let mut state = self.read_snapshot().await;
        if repair_canvases(&mut state) {
            self.write_snapshot(&state).await;
        }
        state
    }

    async fn save_state(&self, live_nodes: Vec<PersistedNode>) {
        let _guard = self.lock.lock().await;
        let previous = self.read_snapshot().await;

        let live_ids: HashSet<&str> = live_nodes.iter().map(|n| n.session_id.as_str()).collect();

        // Archived nodes survive across saves; anything else absent from the
        // live set was deleted and must stay gone.
        let mut nodes = live_nodes.clone();
        nodes.extend(
            previous
                .nodes
                .into_iter()
                .filter(|n| n.archived && !live_ids.contains(n.session_id.as_str())),
        );

        let state = PersistedState {
            nodes,
            canvases: previous.canvases,
            categories: previous.categories,
        };
        self.write_snapshot(&state).await;
    }

    async fn save_positions(&self, positions: HashMap<String, PositionUpdate>) {
        let _guard = self.lock.lock().await;
        let mut state = self.read_snapshot().await;

        let mut changed = false;
        for node in &mut state.nodes {
            if let Some(update) = positions.get(&node.node_id) {
                node.position.x = update.x;
                node.position.y = update.y;
                if let Some(canvas_id) = &update.canvas_id {
                    node.canvas_id = Some(canvas_id.clone());
                }
                changed = true;
            }
        }

        if changed {
            self.write_snapshot(&state).await;
        }
    }

    async fn set_archived(&self, session_id: &str, archived: bool) {
        let _guard = self.lock.lock().await;
        let mut state = self.read_snapshot().await;

        let mut changed = false;
        for node in &mut state.nodes {
            if node.session_id == session_id && node.archived != archived {
                node.archived = archived;
                changed = true;
            }
        }

        if changed {
            self.write_snapshot(&state).await;
        }
    }

    async fn delete_node(&self, session_id: &str) {
        let _guard = self.lock.lock().await;
        let mut state = self.read_snapshot().await;
        let before = state.nodes.len();
        state.nodes.retain(|n| n.session_id != session_id);
        if state.nodes.len() != before {
            self.write_snapshot(&state).await;
        }
    }

    async fn save_buffer(&self, session_id: &str, chunks: &[String]) {
        if let Err(e) = tokio::fs::create_dir_all(&self.buffers_dir).await {
            tracing::warn!(error = %e, "Failed to create buffers directory");
            return;
        }
        let joined = chunks.concat();
        if let Err(e) = tokio::fs::write(self.buffer_path(session_id), joined).await {
            tracing::warn!(session_id, error = %e, "Failed to persist output buffer");
        }
    }

    async fn load_buffer(&self, session_id: &str) -> String {
        tokio::fs::read_to_string(self.buffer_path(session_id))
            .await
            .unwrap_or_default()
    }

    async fn remove_buffer(&self, session_id: &str) {
        let _ = tokio::fs::remove_file(self.buffer_path(session_id)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Position;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> JsonStore {
        JsonStore::new(
            dir.path().join("state.json"),
            dir.path().join("buffers"),
        )
    }

    fn node(session_id: &str, archived: bool) -> PersistedNode {
        PersistedNode {
            node_id: format!("node-{session_id}"),
            session_id: session_id.to_owned(),
            agent_id: "claude".to_owned(),
            agent_name: "Claude".to_owned(),
            canvas_id: None,
            command: "claude".to_owned(),
            cwd: PathBuf::from("/tmp"),
            original_cwd: None,
            worktree_path: None,
            sparse_checkout: false,
            git_branch: None,
            claude_session_id: None,
            custom_name: None,
            custom_color: None,
            icon: None,
            notes: None,
            position: Position::default(),
            ticket_id: None,
            ticket_title: None,
            ticket_url: None,
            pr_number: None,
            created_at: Utc::now(),
            archived,
        }
    }

    #[tokio::test]
    async fn test_atomic_write_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");
        let value = serde_json::json!({"a": 1, "b": ["x", "y"]});

        atomic_write_json(&path, &value).await.unwrap();

        let read: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(read, value);
    }

    #[tokio::test]
    async fn test_corrupt_main_file_recovers_from_tmp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let good = PersistedState {
            nodes: vec![node("s1", false)],
            ..Default::default()
        };
        tokio::fs::write(
            path.with_extension("json.tmp"),
            serde_json::to_vec(&good).unwrap(),
        )
        .await
        .unwrap();
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let recovered: Option<PersistedState> = read_json_with_recovery(&path).await;
        assert_eq!(recovered.unwrap().nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_everything_bootstraps_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        tokio::fs::write(dir.path().join("state.json"), b"garbage")
            .await
            .unwrap();

        let state = store.load_state().await;
        assert!(state.nodes.is_empty());
        // Bootstrap still provides a default canvas
        assert!(state.canvases.iter().any(|c| c.is_default));
    }

    #[tokio::test]
    async fn test_orphan_canvas_repair_rewrites_file() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut orphan = node("s1", false);
        orphan.canvas_id = Some("ghost".to_owned());
        let state = PersistedState {
            nodes: vec![orphan],
            ..Default::default()
        };
        atomic_write_json(&dir.path().join("state.json"), &state)
            .await
            .unwrap();

        let loaded = store.load_state().await;
        let default_id = loaded
            .canvases
            .iter()
            .find(|c| c.is_default)
            .map(|c| c.id.clone())
            .unwrap();
        assert_eq!(loaded.nodes[0].canvas_id.as_deref(), Some(default_id.as_str()));

        // The file on disk reflects the repair
        let on_disk: PersistedState =
            serde_json::from_slice(&tokio::fs::read(dir.path().join("state.json")).await.unwrap())
                .unwrap();
        assert_eq!(on_disk.nodes[0].canvas_id.as_deref(), Some(default_id.as_str()));
    }

    #[tokio::test]
    async fn test_save_state_preserves_archived_nodes() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        // First snapshot: one archived, one live, one soon-to-be-deleted
        store
            .save_state(vec![node("live", false), node("gone", false)])
            .await;
        store.set_archived("keep", true).await; // no-op, not present yet
        store
            .save_state(vec![node("live", false), node("keep", false)])
            .await;
        store.set_archived("keep", true).await;

        // "keep" is archived on disk, "gone" was deleted, "live" is live
        store.save_state(vec![node("live", false)]).await;

        let state = store.load_state().await;
        let ids: Vec<&str> = state.nodes.iter().map(|n| n.session_id.as_str()).collect();
        assert!(ids.contains(&"live"));
        assert!(ids.contains(&"keep"));
        assert!(!ids.contains(&"gone"));
        assert!(
            state
                .nodes
                .iter()
                .find(|n| n.session_id == "keep")
                .unwrap()
                .archived
        );
    }

    #[tokio::test]
    async fn test_save_positions_merges_without_clobbering() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut n = node("s1", false);
        n.custom_name = Some("my session".to_owned());
        store.save_state(vec![n]).await;

        let mut positions = HashMap::new();
        positions.insert(
            "node-s1".to_owned(),
            PositionUpdate {
                x: 10.0,
                y: 20.0,
                canvas_id: None,
            },
        );
        store.save_positions(positions).await;

        let state = store.load_state().await;
        let n = &state.nodes[0];
        assert!((n.position.x - 10.0).abs() < f64::EPSILON);
        assert!((n.position.y - 20.0).abs() < f64::EPSILON);
        assert_eq!(n.custom_name.as_deref(), Some("my session"));
    }

    #[tokio::test]
    async fn test_buffer_round_trip_and_missing() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        assert_eq!(store.load_buffer("nope").await, "");

        store
            .save_buffer("s1", &["hello ".to_owned(), "world".to_owned()])
            .await;
        assert_eq!(store.load_buffer("s1").await, "hello world");

        store.remove_buffer("s1").await;
        assert_eq!(store.load_buffer("s1").await, "");
    }

    #[tokio::test]
    async fn test_delete_node_removes_from_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save_state(vec![node("s1", false), node("s2", false)]).await;

        store.delete_node("s1").await;

        let state = store.load_state().await;
        assert_eq!(state.nodes.len(), 1);
        assert_eq!(state.nodes[0].session_id, "s2");
    }
}
