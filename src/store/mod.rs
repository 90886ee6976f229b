pub mod json;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

pub use json::{JsonStore, atomic_write_json};

/// Canvas position of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A canvas grouping sessions in the client UI. The core only cares that
/// sessions reference a valid canvas id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Canvas {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub order: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_default: bool,
}

/// Flat on-disk projection of a session.
///
/// Everything needed to rehydrate a session minus the PTY and subscribers.
/// Archived nodes exist only here, never in the live session map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedNode {
    pub node_id: String,
    pub session_id: String,
    pub agent_id: String,
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_id: Option<String>,
    pub command: String,
    pub cwd: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(default)]
    pub sparse_checkout: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
}

/// The single state snapshot file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub nodes: Vec<PersistedNode>,
    #[serde(default)]
    pub canvases: Vec<Canvas>,
    /// Legacy field carried through untouched for older snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<serde_json::Value>,
}

/// A position update merged into an existing node.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdate {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_id: Option<String>,
}

/// Persistence seam for the session manager.
///
/// All writes are best-effort: failures are logged, never propagated, so a
/// full disk cannot take down live sessions.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the snapshot, repairing orphaned canvas references in place.
    async fn load_state(&self) -> PersistedState;

    /// Persist the live sessions. Archived nodes from the previous snapshot
    /// that are not in the live set are preserved; non-archived nodes absent
    /// from the live set are dropped (they were deleted).
    async fn save_state(&self, live_nodes: Vec<PersistedNode>);

    /// Merge position updates into existing nodes without touching other
    /// fields.
    async fn save_positions(&self, positions: HashMap<String, PositionUpdate>);

    /// Flip the archived flag on a persisted node.
    async fn set_archived(&self, session_id: &str, archived: bool);

    /// Remove a node from the snapshot entirely.
    async fn delete_node(&self, session_id: &str);

    /// Write a session's output buffer (chunks concatenated, no framing).
    async fn save_buffer(&self, session_id: &str, chunks: &[String]);

    /// Read a session's output buffer; missing file reads as empty.
    async fn load_buffer(&self, session_id: &str) -> String;

    /// Delete a session's buffer file.
    async fn remove_buffer(&self, session_id: &str);
}
