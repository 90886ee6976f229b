//! Wire types for the HTTP API and WebSocket streams.
//!
//! Everything here is camelCase on the wire; the same projections are used
//! by the persisted snapshot, so a node on disk and a session over the API
//! read identically.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::core::session::{Session, SessionStatus};
use crate::store::{PersistedNode, Position, PositionUpdate};

/// Server → client WebSocket messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A raw PTY output chunk.
    #[serde(rename_all = "camelCase")]
    Output { data: String },

    /// Canonical status decided by the state machine.
    #[serde(rename_all = "camelCase")]
    Status {
        status: SessionStatus,
        is_restored: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_tool: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hook_event: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        git_branch: Option<String>,
        long_running_tool: bool,
    },

    /// Worktree setup progress for a `setting_up` session.
    #[serde(rename_all = "camelCase")]
    SetupProgress { progress: u8, phase: String },

    /// Worktree setup finished (with an error message on failure).
    #[serde(rename_all = "camelCase")]
    SetupComplete {
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The start queue is blocked on interactive OAuth for this session.
    #[serde(rename_all = "camelCase")]
    AuthRequired {
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },

    /// OAuth completed; the queue is moving again.
    AuthComplete,
}

/// Client → server WebSocket messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keystrokes forwarded to the PTY.
    Input { data: String },
    /// Terminal resize.
    Resize { cols: u16, rows: u16 },
}

/// Session projection returned by the session endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDto {
    pub session_id: String,
    pub node_id: String,
    pub agent_id: String,
    pub agent_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canvas_id: Option<String>,
    pub command: String,
    pub cwd: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_cwd: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    pub sparse_checkout: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub position: Position,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    pub status: SessionStatus,
    pub is_restored: bool,
    pub auto_resumed: bool,
    pub archived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_tool: Option<String>,
    pub long_running_tool: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<&Session> for SessionDto {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            node_id: session.node_id.clone(),
            agent_id: session.agent_id.clone(),
            agent_name: session.agent_name.clone(),
            canvas_id: session.canvas_id.clone(),
            command: session.command.clone(),
            cwd: session.cwd.clone(),
            original_cwd: session.original_cwd.clone(),
            worktree_path: session.worktree_path.clone(),
            sparse_checkout: session.sparse_checkout,
            git_branch: session.git_branch.clone(),
            claude_session_id: session.claude_session_id.clone(),
            custom_name: session.custom_name.clone(),
            custom_color: session.custom_color.clone(),
            icon: session.icon.clone(),
            notes: session.notes.clone(),
            position: session.position,
            ticket_id: session.ticket_id.clone(),
            ticket_title: session.ticket_title.clone(),
            ticket_url: session.ticket_url.clone(),
            pr_number: session.pr_number,
            status: session.status,
            is_restored: session.is_restored,
            auto_resumed: session.auto_resumed,
            archived: false,
            current_tool: session.current_tool.clone(),
            long_running_tool: session.long_running_tool,
            created_at: session.created_at,
        }
    }
}

impl From<&PersistedNode> for SessionDto {
    fn from(node: &PersistedNode) -> Self {
        Self {
            session_id: node.session_id.clone(),
            node_id: node.node_id.clone(),
            agent_id: node.agent_id.clone(),
            agent_name: node.agent_name.clone(),
            canvas_id: node.canvas_id.clone(),
            command: node.command.clone(),
            cwd: node.cwd.clone(),
            original_cwd: node.original_cwd.clone(),
            worktree_path: node.worktree_path.clone(),
            sparse_checkout: node.sparse_checkout,
            git_branch: node.git_branch.clone(),
            claude_session_id: node.claude_session_id.clone(),
            custom_name: node.custom_name.clone(),
            custom_color: node.custom_color.clone(),
            icon: node.icon.clone(),
            notes: node.notes.clone(),
            position: node.position,
            ticket_id: node.ticket_id.clone(),
            ticket_title: node.ticket_title.clone(),
            ticket_url: node.ticket_url.clone(),
            pr_number: node.pr_number,
            status: SessionStatus::Disconnected,
            is_restored: false,
            auto_resumed: false,
            archived: node.archived,
            current_tool: None,
            long_running_tool: false,
            created_at: node.created_at,
        }
    }
}

/// Body of `POST /api/sessions`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub agent_id: String,
    #[serde(default)]
    pub agent_name: Option<String>,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub canvas_id: Option<String>,
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub custom_color: Option<String>,
    #[serde(default)]
    pub ticket_id: Option<String>,
    #[serde(default)]
    pub ticket_title: Option<String>,
    #[serde(default)]
    pub ticket_url: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub create_worktree_flag: bool,
    #[serde(default)]
    pub sparse_checkout: bool,
    #[serde(default)]
    pub pr_number: Option<u64>,
}

/// Response of `POST /api/sessions`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub node_id: String,
    pub cwd: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
}

/// Body of `POST /api/sessions/:id/fork`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkSessionRequest {
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub create_worktree_flag: bool,
    #[serde(default)]
    pub pr_number: Option<u64>,
}

/// Body of `PATCH /api/sessions/:id`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSessionRequest {
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub custom_color: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Body of `PATCH /api/sessions/:id/archive`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ArchiveRequest {
    pub archived: bool,
}

/// Body of `POST /api/sessions/:id/input`.
#[derive(Debug, Clone, Deserialize)]
pub struct InputRequest {
    pub data: String,
}

/// Query of `GET /api/sessions/:id/tail`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TailQuery {
    #[serde(default)]
    pub bytes: Option<usize>,
    #[serde(default)]
    pub strip: Option<u8>,
}

/// Response of `GET /api/sessions/:id/tail`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TailResponse {
    pub tail: String,
    pub tail_hash: u32,
    pub bytes: usize,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,
}

/// Body of `POST /api/state/positions`.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionsRequest {
    pub positions: HashMap<String, PositionUpdate>,
}

/// Response of `GET /api/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub sessions: usize,
    pub queue: crate::queue::QueueProgress,
    pub worktrees: crate::worktrees::RegistryStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_output_wire_format() {
        let msg = ServerMessage::Output {
            data: "hi".to_owned(),
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"output","data":"hi"}"#
        );
    }

    #[test]
    fn test_server_message_status_wire_format() {
        let msg = ServerMessage::Status {
            status: SessionStatus::WaitingInput,
            is_restored: false,
            current_tool: Some("Read".to_owned()),
            hook_event: None,
            git_branch: Some("main".to_owned()),
            long_running_tool: false,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains(r#""status":"waiting_input""#));
        assert!(json.contains(r#""currentTool":"Read""#));
        assert!(json.contains(r#""gitBranch":"main""#));
        assert!(!json.contains("hookEvent"));
    }

    #[test]
    fn test_setup_progress_wire_format() {
        let msg = ServerMessage::SetupProgress {
            progress: 42,
            phase: "checkout".to_owned(),
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"setup_progress","progress":42,"phase":"checkout"}"#
        );
    }

    #[test]
    fn test_client_message_parsing() {
        let input: ClientMessage =
            serde_json::from_str(r#"{"type":"input","data":"ls\r"}"#).unwrap();
        assert!(matches!(input, ClientMessage::Input { data } if data == "ls\r"));

        let resize: ClientMessage =
            serde_json::from_str(r#"{"type":"resize","cols":80,"rows":24}"#).unwrap();
        assert!(matches!(resize, ClientMessage::Resize { cols: 80, rows: 24 }));
    }

    #[test]
    fn test_create_request_accepts_minimal_body() {
        let req: CreateSessionRequest = serde_json::from_str(
            r#"{"agentId":"claude","command":"claude"}"#,
        )
        .unwrap();
        assert_eq!(req.agent_id, "claude");
        assert!(!req.create_worktree_flag);
        assert!(!req.sparse_checkout);
    }
}
