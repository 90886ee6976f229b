//! Core error types with rich context for debugging.

use std::path::PathBuf;
use thiserror::Error;

/// Errors related to session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Session not found in the live map or on disk.
    #[error("Session {session_id} not found")]
    NotFound {
        /// The session ID that was not found.
        session_id: String,
    },

    /// Restart requested while the PTY is still running.
    #[error("Session {session_id} already has a running terminal")]
    PtyAlreadyRunning {
        /// The session ID.
        session_id: String,
    },

    /// Input or tail requested but no PTY is attached.
    #[error("Session {session_id} has no attached terminal")]
    NoPty {
        /// The session ID.
        session_id: String,
    },

    /// Input payload exceeded the per-write limit.
    #[error("Input of {length} bytes exceeds the {limit} byte limit")]
    InputTooLarge {
        /// Bytes submitted.
        length: usize,
        /// The enforced limit.
        limit: usize,
    },

    /// Fork requested on a session that is not a Claude session.
    #[error("Session {session_id} is not a Claude session")]
    NotAClaudeSession {
        /// The session ID.
        session_id: String,
    },

    /// Fork requested before the parent learned its agent-native session id.
    #[error("Session {session_id} has no valid Claude session id to resume from")]
    MissingClaudeSessionId {
        /// The session ID.
        session_id: String,
    },

    /// A worktree was requested for a path outside any git repository.
    #[error("Invalid repository path '{path}': {reason}")]
    InvalidRepoPath {
        /// The offending path.
        path: String,
        /// Why the path is invalid.
        reason: String,
    },

    /// Worktree setup failed.
    #[error("Worktree setup failed for session {session_id}: {source}")]
    WorktreeSetupFailed {
        /// The session ID.
        session_id: String,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// The PTY could not be spawned.
    #[error("Failed to spawn terminal for session {session_id} in {cwd}: {source}")]
    SpawnFailed {
        /// The session ID.
        session_id: String,
        /// Working directory of the attempted spawn.
        cwd: PathBuf,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// A status update arrived without a status field.
    #[error("Status update is missing the status field")]
    MissingStatus,
}
