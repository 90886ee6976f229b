use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::core::pty::PtyHandle;
use crate::store::{PersistedNode, Position};

/// Maximum number of output chunks retained per session. Oldest drop first.
pub const MAX_BUFFER_SIZE: usize = 1000;

/// Capacity of the per-session broadcast channel feeding subscribers.
pub const EVENT_CHANNEL_SIZE: usize = 256;

/// Observable status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Agent is waiting at its prompt.
    Idle,

    /// Agent is actively working.
    Running,

    /// Agent is blocked on the user (permission prompt or question).
    WaitingInput,

    /// Agent is inside a tool call.
    ToolCalling,

    /// No PTY attached (restored after a server restart, or exited).
    Disconnected,

    /// Something went wrong; see the session's notes/output.
    Error,

    /// Worktree setup still running; PTY not spawned yet.
    SettingUp,
}

/// A single hosted agent session.
///
/// This is the mutable record guarded by [`SessionHandle::state`]; runtime
/// handles (PTY channel, timers) live alongside the persisted fields and are
/// dropped on serialization. The lock is never held across an await point.
#[derive(Debug)]
pub struct Session {
    // Identity
    pub session_id: String,
    pub node_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub canvas_id: Option<String>,

    // Process
    pub pty: Option<PtyHandle>,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub is_restored: bool,
    pub auto_resumed: bool,

    // Command / working state
    pub command: String,
    pub cwd: PathBuf,
    /// Mother repo when `cwd` is inside a linked worktree.
    pub original_cwd: Option<PathBuf>,
    pub worktree_path: Option<PathBuf>,
    pub sparse_checkout: bool,
    pub setup_pending: bool,

    // Git
    pub git_branch: Option<String>,
    pub last_branch_check: Option<Instant>,

    /// The agent's own session UUID, learned from plugin hooks.
    /// Write-once: never overwritten after first sight.
    pub claude_session_id: Option<String>,

    // UI metadata
    pub custom_name: Option<String>,
    pub custom_color: Option<String>,
    pub icon: Option<String>,
    pub notes: Option<String>,
    pub position: Position,

    // Ticket metadata
    pub ticket_id: Option<String>,
    pub ticket_title: Option<String>,
    pub ticket_url: Option<String>,
    pub pr_number: Option<u64>,

    // Output
    pub output_buffer: VecDeque<String>,

    // Telemetry
    pub last_output_time: Option<DateTime<Utc>>,
    pub last_input_time: Option<DateTime<Utc>>,
    /// Decayed every 500 ms; a lossy backpressure metric.
    pub recent_output_size: u64,

    // Status-machine fields
    pub current_tool: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub pre_tool_time: Option<DateTime<Utc>>,
    pub permission_timeout: Option<JoinHandle<()>>,
    pub long_running_timeout: Option<JoinHandle<()>>,
    pub long_running_tool: bool,
    /// Waiting-input guard: once set, concurrent `running` events from
    /// parallel subagents cannot downgrade the visible status.
    pub needs_input_since: Option<DateTime<Utc>>,
    pub plugin_reported_status: bool,
    pub last_plugin_status_time: Option<DateTime<Utc>>,
    pub last_hook_event: Option<String>,
}

/// Identity and command parameters for constructing a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionSeed {
    pub session_id: String,
    pub node_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub canvas_id: Option<String>,
    pub command: String,
    pub cwd: PathBuf,
}

impl Session {
    /// Create a fresh session record with default runtime state.
    #[must_use]
    pub fn new(seed: SessionSeed, status: SessionStatus) -> Self {
        Self {
            session_id: seed.session_id,
            node_id: seed.node_id,
            agent_id: seed.agent_id,
            agent_name: seed.agent_name,
            canvas_id: seed.canvas_id,
            pty: None,
            created_at: Utc::now(),
            status,
            is_restored: false,
            auto_resumed: false,
            command: seed.command,
            cwd: seed.cwd,
            original_cwd: None,
            worktree_path: None,
            sparse_checkout: false,
            setup_pending: false,
            git_branch: None,
            last_branch_check: None,
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
            output_buffer: VecDeque::new(),
            last_output_time: None,
            last_input_time: None,
            recent_output_size: 0,
            current_tool: None,
            tool_input: None,
            pre_tool_time: None,
            permission_timeout: None,
            long_running_timeout: None,
            long_running_tool: false,
            needs_input_since: None,
            plugin_reported_status: false,
            last_plugin_status_time: None,
            last_hook_event: None,
        }
    }

    /// Append an output chunk, dropping the oldest past [`MAX_BUFFER_SIZE`].
    pub fn push_output(&mut self, chunk: String) {
        self.recent_output_size += chunk.len() as u64;
        self.last_output_time = Some(Utc::now());
        self.output_buffer.push_back(chunk);
        while self.output_buffer.len() > MAX_BUFFER_SIZE {
            self.output_buffer.pop_front();
        }
    }

    /// The whole buffered output as one string.
    #[must_use]
    pub fn buffer_text(&self) -> String {
        self.output_buffer.iter().map(String::as_str).collect()
    }

    /// Record the agent-native session id on first sight only.
    pub fn learn_claude_session_id(&mut self, id: &str) {
        if self.claude_session_id.is_none() {
            self.claude_session_id = Some(id.to_owned());
        }
    }

    /// Cancel the pending permission timeout, if any.
    pub fn clear_permission_timeout(&mut self) {
        if let Some(handle) = self.permission_timeout.take() {
            handle.abort();
        }
    }

    /// Cancel the pending long-running timeout, if any.
    pub fn clear_long_running_timeout(&mut self) {
        if let Some(handle) = self.long_running_timeout.take() {
            handle.abort();
        }
    }

    /// Project to the on-disk node form.
    #[must_use]
    pub fn to_persisted_node(&self) -> PersistedNode {
        PersistedNode {
            node_id: self.node_id.clone(),
            session_id: self.session_id.clone(),
            agent_id: self.agent_id.clone(),
            agent_name: self.agent_name.clone(),
            canvas_id: self.canvas_id.clone(),
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            original_cwd: self.original_cwd.clone(),
            worktree_path: self.worktree_path.clone(),
            sparse_checkout: self.sparse_checkout,
            git_branch: self.git_branch.clone(),
            claude_session_id: self.claude_session_id.clone(),
            custom_name: self.custom_name.clone(),
            custom_color: self.custom_color.clone(),
            icon: self.icon.clone(),
            notes: self.notes.clone(),
            position: self.position,
            ticket_id: self.ticket_id.clone(),
            ticket_title: self.ticket_title.clone(),
            ticket_url: self.ticket_url.clone(),
            pr_number: self.pr_number,
            created_at: self.created_at,
            archived: false,
        }
    }

    /// Rehydrate a session from a persisted node. No PTY is attached; the
    /// caller decides whether to spawn one.
    #[must_use]
    pub fn from_persisted_node(node: &PersistedNode, buffer: String) -> Self {
        let mut session = Self::new(
            SessionSeed {
                session_id: node.session_id.clone(),
                node_id: node.node_id.clone(),
                agent_id: node.agent_id.clone(),
                agent_name: node.agent_name.clone(),
                canvas_id: node.canvas_id.clone(),
                command: node.command.clone(),
                cwd: node.cwd.clone(),
            },
            SessionStatus::Disconnected,
        );
        session.created_at = node.created_at;
        session.original_cwd = node.original_cwd.clone();
        session.worktree_path = node.worktree_path.clone();
        session.sparse_checkout = node.sparse_checkout;
        session.git_branch = node.git_branch.clone();
        session.claude_session_id = node.claude_session_id.clone();
        session.custom_name = node.custom_name.clone();
        session.custom_color = node.custom_color.clone();
        session.icon = node.icon.clone();
        session.notes = node.notes.clone();
        session.position = node.position;
        session.ticket_id = node.ticket_id.clone();
        session.ticket_title = node.ticket_title.clone();
        session.ticket_url = node.ticket_url.clone();
        session.pr_number = node.pr_number;
        session.is_restored = true;
        if !buffer.is_empty() {
            session.output_buffer.push_back(buffer);
        }
        session
    }
}

/// Shared handle to a live session: the guarded record plus its subscriber
/// fan-out channel. Broadcast payloads are pre-serialized JSON so each
/// message is encoded once regardless of subscriber count.
#[derive(Debug)]
pub struct SessionHandle {
    pub state: parking_lot::Mutex<Session>,
    pub events: broadcast::Sender<String>,
}

impl SessionHandle {
    /// Wrap a session record in a handle with a fresh event channel.
    #[must_use]
    pub fn new(session: Session) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            state: parking_lot::Mutex::new(session),
            events,
        }
    }

    /// Subscribe to this session's event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(id: &str) -> SessionSeed {
        SessionSeed {
            session_id: id.to_owned(),
            node_id: format!("node-{id}"),
            agent_id: "claude".to_owned(),
            agent_name: "Claude Code".to_owned(),
            canvas_id: None,
            command: "claude".to_owned(),
            cwd: PathBuf::from("/tmp"),
        }
    }

    #[test]
    fn test_buffer_caps_at_limit() {
        let mut session = Session::new(seed("s1"), SessionStatus::Idle);
        for i in 0..(MAX_BUFFER_SIZE + 50) {
            session.push_output(format!("chunk-{i}\n"));
        }
        assert_eq!(session.output_buffer.len(), MAX_BUFFER_SIZE);
        // Oldest chunks dropped first
        assert!(session.output_buffer.front().unwrap().contains("chunk-50"));
    }

    #[test]
    fn test_claude_session_id_write_once() {
        let mut session = Session::new(seed("s1"), SessionStatus::Idle);
        session.learn_claude_session_id("first");
        session.learn_claude_session_id("second");
        assert_eq!(session.claude_session_id.as_deref(), Some("first"));
    }

    #[test]
    fn test_persisted_round_trip() {
        let mut session = Session::new(seed("s1"), SessionStatus::Running);
        session.custom_name = Some("work".to_owned());
        session.git_branch = Some("main".to_owned());

        let node = session.to_persisted_node();
        assert!(!node.archived);

        let restored = Session::from_persisted_node(&node, "tail".to_owned());
        assert_eq!(restored.session_id, session.session_id);
        assert_eq!(restored.status, SessionStatus::Disconnected);
        assert!(restored.is_restored);
        assert_eq!(restored.buffer_text(), "tail");
        assert_eq!(restored.custom_name.as_deref(), Some("work"));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::WaitingInput).unwrap(),
            "\"waiting_input\""
        );
        assert_eq!(
            serde_json::to_string(&SessionStatus::SettingUp).unwrap(),
            "\"setting_up\""
        );
    }
}
