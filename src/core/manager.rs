//! Session lifecycle manager.
//!
//! Owns the live session map and every "change this session's shape"
//! operation: create (with worktree establishment), restart, fork, archive,
//! delete, input, tail, restoration after a server restart, and auto-resume
//! through the start queue.
//!
//! Locking: the map is behind one `RwLock`, each session behind its own
//! `Mutex`. Neither lock is ever held across an await point; PTY writes go
//! through a channel precisely so callers never block under a lock.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::agents;
use crate::agents::claude;
use crate::api::protocol::{CreateSessionResponse, ServerMessage, SessionDto, TailResponse};
use crate::config::Config;
use crate::core::errors::SessionError;
use crate::core::pty::{self, PtyEvent, PtyHandle, SpawnOptions};
use crate::core::session::{Session, SessionHandle, SessionSeed, SessionStatus};
use crate::core::status::{
    self, BRANCH_CHECK_INTERVAL, LONG_RUNNING_TIMEOUT, PERMISSION_TIMEOUT, StatusUpdate,
};
use crate::queue::{BufferFn, StartFn, StartQueue};
use crate::store::{PositionUpdate, StateStore};
use crate::utils::git;
use crate::utils::text;
use crate::worktrees::{self, WorktreeRegistry, create};

/// Per-write input size limit (bytes).
pub const INPUT_LIMIT: usize = 4096;

/// Tail responses are clamped to this many bytes.
pub const TAIL_LIMIT: usize = 65536;

/// Delay before the agent command is typed into a fresh shell.
const COMMAND_WRITE_DELAY: Duration = Duration::from_millis(300);

/// Delay after the command write before the sparse hint / ticket prompt.
const FOLLOW_UP_DELAY: Duration = Duration::from_millis(1700);

/// Cadence and amount of the recent-output-size decay.
const DECAY_INTERVAL: Duration = Duration::from_millis(500);
const DECAY_AMOUNT: u64 = 50;

/// Parameters for [`SessionManager::create_session`].
#[derive(Debug, Clone, Default)]
pub struct CreateSessionParams {
    pub agent_id: String,
    pub agent_name: Option<String>,
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub node_id: Option<String>,
    pub canvas_id: Option<String>,
    pub custom_name: Option<String>,
    pub custom_color: Option<String>,
    pub ticket_id: Option<String>,
    pub ticket_title: Option<String>,
    pub ticket_url: Option<String>,
    pub branch_name: Option<String>,
    pub base_branch: Option<String>,
    pub create_worktree: bool,
    pub sparse_checkout: bool,
    pub pr_number: Option<u64>,
}

/// Parameters for [`SessionManager::fork_session`].
#[derive(Debug, Clone, Default)]
pub struct ForkParams {
    pub branch_name: Option<String>,
    pub base_branch: Option<String>,
    pub create_worktree: bool,
    pub pr_number: Option<u64>,
}

/// Fields applied by `PATCH /api/sessions/:id`.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub custom_name: Option<String>,
    pub custom_color: Option<String>,
    pub icon: Option<String>,
    pub notes: Option<String>,
}

/// Where a new session's working directory ends up after the worktree
/// decision tree.
struct WorktreePlan {
    cwd: PathBuf,
    worktree_path: Option<PathBuf>,
    sparse_checkout: bool,
    setup_pending: bool,
    git_root: Option<PathBuf>,
}

/// Manages session lifecycle and state.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    store: Arc<dyn StateStore>,
    registry: Arc<WorktreeRegistry>,
    queue: StartQueue,
    config: Config,
    worktrees_dir: PathBuf,
}

impl SessionManager {
    /// Create a manager with its collaborators injected.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<WorktreeRegistry>,
        queue: StartQueue,
        config: Config,
        worktrees_dir: PathBuf,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            registry,
            queue,
            config,
            worktrees_dir,
        }
    }

    /// The start queue, for progress endpoints and auth wiring.
    #[must_use]
    pub fn queue(&self) -> &StartQueue {
        &self.queue
    }

    /// The worktree registry, for stats endpoints.
    #[must_use]
    pub fn registry(&self) -> &Arc<WorktreeRegistry> {
        &self.registry
    }

    fn handle(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Look up a live session handle by id.
    #[must_use]
    pub fn live_handle(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.handle(session_id)
    }

    // ========== projections ==========

    /// Live session projections, or archived nodes when `archived` is set.
    pub async fn list_sessions(&self, archived: bool) -> Vec<SessionDto> {
        if archived {
            let state = self.store.load_state().await;
            return state
                .nodes
                .iter()
                .filter(|n| n.archived)
                .map(SessionDto::from)
                .collect();
        }

        let handles: Vec<Arc<SessionHandle>> = self.sessions.read().values().cloned().collect();
        handles
            .iter()
            .map(|h| SessionDto::from(&*h.state.lock()))
            .collect()
    }

    /// One session projection; falls back to the persisted node for
    /// archived sessions.
    pub async fn get_session(&self, session_id: &str) -> Option<SessionDto> {
        if let Some(handle) = self.handle(session_id) {
            return Some(SessionDto::from(&*handle.state.lock()));
        }
        let state = self.store.load_state().await;
        state
            .nodes
            .iter()
            .find(|n| n.session_id == session_id)
            .map(SessionDto::from)
    }

    // ========== creation ==========

    /// Create a session: establish its working directory (possibly a pooled
    /// or freshly created worktree), register it, and start the agent.
    ///
    /// # Errors
    ///
    /// Returns an error when a worktree was requested outside a git
    /// repository, or when the PTY cannot be spawned.
    pub async fn create_session(
        self: &Arc<Self>,
        params: CreateSessionParams,
    ) -> Result<CreateSessionResponse, SessionError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let node_id = params
            .node_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", uuid::Uuid::new_v4()));
        let agent_name = params
            .agent_name
            .clone()
            .or_else(|| agents::agent_by_id(&params.agent_id).map(|a| a.name.to_owned()))
            .unwrap_or_else(|| params.agent_id.clone());

        let requested_cwd = params
            .cwd
            .clone()
            .or_else(|| self.config.launch_cwd.clone())
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"));

        let plan = self
            .establish_worktree(
                &session_id,
                &requested_cwd,
                params.create_worktree,
                params.sparse_checkout,
                params.branch_name.as_deref(),
                params.base_branch.as_deref(),
            )
            .await?;

        let original_cwd = detect_mother_repo(&plan.cwd).await;
        let git_branch = git::current_branch(&plan.cwd).await;

        let mut session = Session::new(
            SessionSeed {
                session_id: session_id.clone(),
                node_id: node_id.clone(),
                agent_id: params.agent_id.clone(),
                agent_name,
                canvas_id: params.canvas_id.clone(),
                command: params.command.clone(),
                cwd: plan.cwd.clone(),
            },
            if plan.setup_pending {
                SessionStatus::SettingUp
            } else {
                SessionStatus::Idle
            },
        );
        session.worktree_path = plan.worktree_path.clone();
        session.sparse_checkout = plan.sparse_checkout;
        session.setup_pending = plan.setup_pending;
        session.original_cwd = original_cwd;
        session.git_branch = if plan.setup_pending {
            params.branch_name.clone()
        } else {
            git_branch.clone().or_else(|| params.branch_name.clone())
        };
        session.custom_name = params.custom_name.clone();
        session.custom_color = params.custom_color.clone();
        session.ticket_id = params.ticket_id.clone();
        session.ticket_title = params.ticket_title.clone();
        session.ticket_url = params.ticket_url.clone();
        session.pr_number = params.pr_number;

        let handle = Arc::new(SessionHandle::new(session));
        self.sessions
            .write()
            .insert(session_id.clone(), Arc::clone(&handle));
        self.persist().await;

        let command = self.rewrite_for_start(&params.command, &params.agent_id);

        if plan.setup_pending {
            let git_root = plan.git_root.clone().ok_or_else(|| {
                SessionError::InvalidRepoPath {
                    path: requested_cwd.display().to_string(),
                    reason: "worktree setup requested outside a git repository".to_owned(),
                }
            })?;
            let manager = Arc::clone(self);
            let setup_handle = Arc::clone(&handle);
            let branch_name = params.branch_name.clone();
            let base_branch = params.base_branch.clone();
            tokio::spawn(async move {
                manager
                    .run_background_setup(setup_handle, git_root, branch_name, base_branch, command)
                    .await;
            });
        } else {
            self.launch_agent(Arc::clone(&handle), command).await?;
        }

        let (cwd, git_branch) = {
            let state = handle.state.lock();
            (state.cwd.clone(), state.git_branch.clone())
        };
        tracing::info!(%session_id, %node_id, agent_id = %params.agent_id, "Session created");

        Ok(CreateSessionResponse {
            session_id,
            node_id,
            cwd,
            git_branch,
        })
    }

    /// Worktree decision tree for new sessions.
    ///
    /// Sparse fast path first when requested, then pooled claim with branch
    /// reassignment, then background fresh creation.
    async fn establish_worktree(
        &self,
        session_id: &str,
        requested_cwd: &Path,
        create_worktree: bool,
        sparse_checkout: bool,
        branch_name: Option<&str>,
        base_branch: Option<&str>,
    ) -> Result<WorktreePlan, SessionError> {
        let mut plan = WorktreePlan {
            cwd: requested_cwd.to_path_buf(),
            worktree_path: None,
            sparse_checkout: false,
            setup_pending: false,
            git_root: None,
        };

        if !create_worktree && !sparse_checkout {
            return Ok(plan);
        }

        let git_root =
            git::find_git_root(requested_cwd).map_err(|e| SessionError::InvalidRepoPath {
                path: requested_cwd.display().to_string(),
                reason: format!("{e:#}"),
            })?;
        plan.git_root = Some(git_root.clone());
        let base = base_branch.unwrap_or("main");

        if sparse_checkout {
            if let Some(branch) = branch_name {
                let rel_dir = requested_cwd
                    .canonicalize()
                    .ok()
                    .and_then(|c| c.strip_prefix(&git_root).ok().map(Path::to_path_buf))
                    .filter(|p| !p.as_os_str().is_empty());

                if let Some(rel_dir) = rel_dir {
                    let worktree_path = self.fresh_worktree_path();
                    let base_ref = git::resolve_base_ref(&git_root, base).await;
                    match create::create_sparse(
                        &git_root,
                        &worktree_path,
                        branch,
                        &base_ref,
                        &rel_dir.to_string_lossy(),
                    )
                    .await
                    {
                        Ok(sparse_cwd) => {
                            self.registry
                                .register(
                                    &worktree_path,
                                    &git_root,
                                    session_id,
                                    Some(branch.to_owned()),
                                )
                                .await;
                            plan.cwd = sparse_cwd;
                            plan.worktree_path = Some(worktree_path);
                            plan.sparse_checkout = true;
                            return Ok(plan);
                        }
                        Err(e) => {
                            tracing::warn!(
                                %session_id,
                                error = %e,
                                "Sparse checkout failed, falling back to full worktree"
                            );
                        }
                    }
                }
            }
        }

        // Full checkout: pooled claim is the sub-second path.
        if let Some(claimed) = self.registry.claim(&git_root, session_id).await {
            let assigned = match branch_name {
                Some(branch) => {
                    create::assign_branch(&claimed, branch, base, &git_root)
                        .await
                        .success
                }
                None => true,
            };
            if assigned {
                plan.cwd = claimed.clone();
                plan.worktree_path = Some(claimed);
                return Ok(plan);
            }
            // The claimed tree is in an unknown state; return it and build
            // fresh instead.
            self.registry.release(&claimed).await;
        }

        plan.setup_pending = true;
        Ok(plan)
    }

    fn fresh_worktree_path(&self) -> PathBuf {
        self.worktrees_dir
            .join(format!("wt-{:08x}", rand::random::<u32>()))
    }

    /// Create the worktree in the background, broadcasting progress, then
    /// flip the session to idle and start the agent.
    async fn run_background_setup(
        self: Arc<Self>,
        handle: Arc<SessionHandle>,
        git_root: PathBuf,
        branch_name: Option<String>,
        base_branch: Option<String>,
        command: String,
    ) {
        let session_id = handle.state.lock().session_id.clone();
        let worktree_path = self.fresh_worktree_path();

        let progress_handle = Arc::clone(&handle);
        let on_progress: worktrees::ProgressFn = Arc::new(move |progress, phase| {
            broadcast(
                &progress_handle,
                &ServerMessage::SetupProgress {
                    progress,
                    phase: phase.to_owned(),
                },
            );
        });

        let created = create::create_fresh(create::CreateFreshOptions {
            git_root: &git_root,
            worktree_path: &worktree_path,
            session_id: &session_id,
            on_progress,
        })
        .await;

        match created {
            Ok(path) => {
                let mut branch = None;
                if let Some(name) = &branch_name {
                    let base = base_branch.as_deref().unwrap_or("main");
                    let assignment = create::assign_branch(&path, name, base, &git_root).await;
                    if assignment.success {
                        branch = Some(name.clone());
                    } else {
                        tracing::warn!(
                            %session_id,
                            branch = %name,
                            error = ?assignment.error,
                            "Branch assignment on fresh worktree failed, staying detached"
                        );
                    }
                }
                self.registry
                    .register(&path, &git_root, &session_id, branch.clone())
                    .await;

                {
                    let mut state = handle.state.lock();
                    state.cwd = path.clone();
                    state.worktree_path = Some(path);
                    state.setup_pending = false;
                    state.status = SessionStatus::Idle;
                    if branch.is_some() {
                        state.git_branch = branch;
                    }
                }
                broadcast(&handle, &ServerMessage::SetupComplete { error: None });

                if let Err(e) = self.launch_agent(Arc::clone(&handle), command).await {
                    tracing::error!(%session_id, error = %e, "Agent start after setup failed");
                }
                self.persist().await;
            }
            Err(e) => {
                tracing::error!(%session_id, error = %e, "Worktree setup failed");
                {
                    let mut state = handle.state.lock();
                    state.setup_pending = false;
                    state.status = SessionStatus::Error;
                }
                broadcast(
                    &handle,
                    &ServerMessage::SetupComplete {
                        error: Some(format!("{e:#}")),
                    },
                );
                self.broadcast_status(&handle);
            }
        }
    }

    fn rewrite_for_start(&self, command: &str, agent_id: &str) -> String {
        let normalized = claude::normalize_agent_command(command, agent_id, agents::has_isaac());
        claude::inject_plugin_dir(&normalized, agent_id)
    }

    /// Start the agent process. Claude sessions go through the start queue
    /// (one OAuth-binding startup at a time); everything else spawns
    /// directly.
    async fn launch_agent(
        self: &Arc<Self>,
        handle: Arc<SessionHandle>,
        command: String,
    ) -> Result<(), SessionError> {
        let (session_id, agent_id) = {
            let state = handle.state.lock();
            (state.session_id.clone(), state.agent_id.clone())
        };

        if agent_id == "claude" {
            let manager = Arc::clone(self);
            let start_handle = Arc::clone(&handle);
            let start_fn: StartFn = Box::new(move || {
                Box::pin(async move {
                    manager
                        .spawn_session_pty(start_handle, command)
                        .await
                        .map_err(anyhow::Error::from)
                })
            });

            let buffer_handle = Arc::clone(&handle);
            let get_output: BufferFn = Arc::new(move || {
                buffer_handle
                    .state
                    .lock()
                    .output_buffer
                    .iter()
                    .cloned()
                    .collect()
            });

            self.queue
                .enqueue_session_start(session_id, start_fn, Some(get_output));
            Ok(())
        } else {
            self.spawn_session_pty(handle, command).await
        }
    }

    /// Spawn the PTY, wire its pumps, and schedule the delayed writes
    /// (command, sparse hint, ticket prompt).
    async fn spawn_session_pty(
        self: &Arc<Self>,
        handle: Arc<SessionHandle>,
        command: String,
    ) -> Result<(), SessionError> {
        let (session_id, cwd, sparse) = {
            let state = handle.state.lock();
            (
                state.session_id.clone(),
                state.cwd.clone(),
                state.sparse_checkout,
            )
        };

        let mut env = vec![("OPENUI_SESSION_ID".to_owned(), session_id.clone())];
        if sparse {
            env.push(("OPENUI_SPARSE_CHECKOUT".to_owned(), "1".to_owned()));
        }
        let options = SpawnOptions {
            cwd: &cwd,
            env,
            remove_env: &["CLAUDECODE", "CLAUDE_CODE_ENTRYPOINT"],
        };

        let (pty_handle, events) = match pty::spawn(&options) {
            Ok(spawned) => spawned,
            Err(e) => {
                {
                    let mut state = handle.state.lock();
                    state.status = SessionStatus::Error;
                }
                self.broadcast_status(&handle);
                return Err(SessionError::SpawnFailed {
                    session_id,
                    cwd,
                    source: e,
                });
            }
        };

        {
            let mut state = handle.state.lock();
            state.pty = Some(pty_handle.clone());
            if matches!(
                state.status,
                SessionStatus::Disconnected | SessionStatus::SettingUp
            ) {
                state.status = SessionStatus::Idle;
            }
        }
        self.broadcast_status(&handle);

        // Output pump
        {
            let manager = Arc::clone(self);
            let pump_handle = Arc::clone(&handle);
            tokio::spawn(async move {
                manager.pump_pty_events(pump_handle, events).await;
            });
        }

        // Delayed writes
        {
            let write_handle = Arc::clone(&handle);
            let ticket_template = self.config.ticket_template.clone();
            tokio::spawn(async move {
                delayed_writes(&write_handle, &pty_handle, &command, &ticket_template).await;
            });
        }

        Ok(())
    }

    async fn pump_pty_events(
        self: Arc<Self>,
        handle: Arc<SessionHandle>,
        mut events: tokio::sync::mpsc::Receiver<PtyEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                PtyEvent::Output(bytes) => {
                    let chunk = String::from_utf8_lossy(&bytes).into_owned();
                    {
                        let mut state = handle.state.lock();
                        state.push_output(chunk.clone());
                    }
                    broadcast(&handle, &ServerMessage::Output { data: chunk });
                }
                PtyEvent::Exited => {
                    {
                        let mut state = handle.state.lock();
                        state.pty = None;
                        if state.status != SessionStatus::Error {
                            state.status = SessionStatus::Disconnected;
                        }
                    }
                    self.broadcast_status(&handle);
                    break;
                }
            }
        }
    }

    // ========== restart / fork ==========

    /// Restart a session: rehydrate it if needed, rebuild the command with a
    /// fresh `--resume`, and start the agent.
    ///
    /// # Errors
    ///
    /// [`SessionError::PtyAlreadyRunning`] when the PTY is live;
    /// [`SessionError::NotFound`] when the id is neither live nor persisted.
    pub async fn restart_session(self: &Arc<Self>, session_id: &str) -> Result<(), SessionError> {
        let live = self.handle(session_id);
        if let Some(handle) = &live {
            if handle.state.lock().pty.is_some() {
                return Err(SessionError::PtyAlreadyRunning {
                    session_id: session_id.to_owned(),
                });
            }
        }

        let handle = match live {
            Some(handle) => handle,
            None => self.rehydrate_from_disk(session_id).await?,
        };

        let (stored_command, agent_id, claude_session_id) = {
            let state = handle.state.lock();
            (
                state.command.clone(),
                state.agent_id.clone(),
                state.claude_session_id.clone(),
            )
        };

        let has_isaac = agents::has_isaac();
        let command = claude::build_restart_command(
            &stored_command,
            &agent_id,
            claude_session_id.as_deref(),
            has_isaac,
        );
        let command = claude::inject_plugin_dir(&command, &agent_id);

        tracing::info!(session_id, %agent_id, "Restarting session");
        self.launch_agent(handle, command).await
    }

    async fn rehydrate_from_disk(
        &self,
        session_id: &str,
    ) -> Result<Arc<SessionHandle>, SessionError> {
        let state = self.store.load_state().await;
        let node = state
            .nodes
            .into_iter()
            .find(|n| n.session_id == session_id)
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_owned(),
            })?;

        let buffer = self.store.load_buffer(session_id).await;
        let session = Session::from_persisted_node(&node, buffer);
        let handle = Arc::new(SessionHandle::new(session));
        self.sessions
            .write()
            .insert(session_id.to_owned(), Arc::clone(&handle));
        self.store.set_archived(session_id, false).await;
        self.persist().await;
        Ok(handle)
    }

    /// Fork a Claude session into an independent conversation branch.
    ///
    /// # Errors
    ///
    /// 400-class errors when the parent is missing, is not a Claude session,
    /// or has not yet learned a valid agent-native session id.
    pub async fn fork_session(
        self: &Arc<Self>,
        parent_id: &str,
        params: ForkParams,
    ) -> Result<CreateSessionResponse, SessionError> {
        let parent = self.handle(parent_id).ok_or_else(|| SessionError::NotFound {
            session_id: parent_id.to_owned(),
        })?;

        let (agent_id, agent_name, claude_session_id, parent_command, parent_cwd, canvas_id, position) = {
            let state = parent.state.lock();
            (
                state.agent_id.clone(),
                state.agent_name.clone(),
                state.claude_session_id.clone(),
                state.command.clone(),
                state.original_cwd.clone().unwrap_or_else(|| state.cwd.clone()),
                state.canvas_id.clone(),
                state.position,
            )
        };

        if agent_id != "claude" {
            return Err(SessionError::NotAClaudeSession {
                session_id: parent_id.to_owned(),
            });
        }
        let claude_id = claude_session_id
            .filter(|id| claude::is_valid_claude_session_id(id))
            .ok_or_else(|| SessionError::MissingClaudeSessionId {
                session_id: parent_id.to_owned(),
            })?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let node_id = format!("node-{}", uuid::Uuid::new_v4());

        let plan = self
            .establish_worktree(
                &session_id,
                &parent_cwd,
                params.create_worktree,
                false,
                params.branch_name.as_deref(),
                params.base_branch.as_deref(),
            )
            .await?;

        let has_isaac = agents::has_isaac();
        let fork_command =
            claude::build_fork_command(&parent_command, &agent_id, &claude_id, has_isaac);
        let fork_command = claude::inject_plugin_dir(&fork_command, &agent_id);

        let original_cwd = detect_mother_repo(&plan.cwd).await;
        let git_branch = git::current_branch(&plan.cwd).await;

        let mut session = Session::new(
            SessionSeed {
                session_id: session_id.clone(),
                node_id: node_id.clone(),
                agent_id,
                agent_name,
                canvas_id,
                command: fork_command.clone(),
                cwd: plan.cwd.clone(),
            },
            if plan.setup_pending {
                SessionStatus::SettingUp
            } else {
                SessionStatus::Idle
            },
        );
        session.worktree_path = plan.worktree_path.clone();
        session.setup_pending = plan.setup_pending;
        session.original_cwd = original_cwd;
        session.git_branch = git_branch.or_else(|| params.branch_name.clone());
        session.pr_number = params.pr_number;
        session.position.x = position.x + 40.0;
        session.position.y = position.y + 40.0;

        let handle = Arc::new(SessionHandle::new(session));
        self.sessions
            .write()
            .insert(session_id.clone(), Arc::clone(&handle));
        self.persist().await;

        if plan.setup_pending {
            let git_root = plan.git_root.clone().ok_or_else(|| {
                SessionError::InvalidRepoPath {
                    path: parent_cwd.display().to_string(),
                    reason: "worktree setup requested outside a git repository".to_owned(),
                }
            })?;
            let manager = Arc::clone(self);
            let setup_handle = Arc::clone(&handle);
            let branch_name = params.branch_name.clone();
            let base_branch = params.base_branch.clone();
            tokio::spawn(async move {
                manager
                    .run_background_setup(
                        setup_handle,
                        git_root,
                        branch_name,
                        base_branch,
                        fork_command,
                    )
                    .await;
            });
        } else {
            self.launch_agent(Arc::clone(&handle), fork_command).await?;
        }

        let (cwd, git_branch) = {
            let state = handle.state.lock();
            (state.cwd.clone(), state.git_branch.clone())
        };
        tracing::info!(parent_id, %session_id, "Forked session");

        Ok(CreateSessionResponse {
            session_id,
            node_id,
            cwd,
            git_branch,
        })
    }

    // ========== archive / delete / patch ==========

    /// Archive or unarchive a session.
    ///
    /// Archiving kills the PTY, drops the session from the live map, marks
    /// the persisted node, and returns its worktree to the pool.
    /// Unarchiving is a restart.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] when the session does not exist.
    pub async fn set_archived(
        self: &Arc<Self>,
        session_id: &str,
        archived: bool,
    ) -> Result<(), SessionError> {
        if !archived {
            return self.restart_session(session_id).await;
        }

        let handle = self.sessions.write().remove(session_id).ok_or_else(|| {
            SessionError::NotFound {
                session_id: session_id.to_owned(),
            }
        })?;

        let (pty, worktree_path, node, chunks) = {
            let mut state = handle.state.lock();
            let pty = state.pty.take();
            state.status = SessionStatus::Disconnected;
            (
                pty,
                state.worktree_path.clone(),
                state.to_persisted_node(),
                state.output_buffer.iter().cloned().collect::<Vec<_>>(),
            )
        };

        if let Some(pty) = pty {
            pty.shutdown();
        }

        // The node must be in the snapshot before the archived flag flips,
        // and must not be in the live set passed to save_state.
        self.store.save_buffer(session_id, &chunks).await;
        let mut live = self.live_nodes();
        live.push(node);
        self.store.save_state(live).await;
        self.store.set_archived(session_id, true).await;

        if let Some(worktree_path) = worktree_path {
            self.registry.release(&worktree_path).await;
        }

        tracing::info!(session_id, "Session archived");
        Ok(())
    }

    /// Delete a session from the live map and the persisted snapshot.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] when the id is neither live nor persisted.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), SessionError> {
        let live = self.sessions.write().remove(session_id);

        if let Some(handle) = &live {
            let (pty, worktree_path) = {
                let mut state = handle.state.lock();
                state.clear_permission_timeout();
                state.clear_long_running_timeout();
                (state.pty.take(), state.worktree_path.clone())
            };
            if let Some(pty) = pty {
                pty.shutdown();
            }
            if let Some(worktree_path) = worktree_path {
                self.registry.release(&worktree_path).await;
            }
        } else {
            let state = self.store.load_state().await;
            if !state.nodes.iter().any(|n| n.session_id == session_id) {
                return Err(SessionError::NotFound {
                    session_id: session_id.to_owned(),
                });
            }
        }

        self.store.delete_node(session_id).await;
        self.store.remove_buffer(session_id).await;
        self.persist().await;
        tracing::info!(session_id, "Session deleted");
        Ok(())
    }

    /// Apply UI metadata updates.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] when the session is not live.
    pub async fn patch_session(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<SessionDto, SessionError> {
        let handle = self.handle(session_id).ok_or_else(|| SessionError::NotFound {
            session_id: session_id.to_owned(),
        })?;

        let dto = {
            let mut state = handle.state.lock();
            if let Some(custom_name) = patch.custom_name {
                state.custom_name = Some(custom_name);
            }
            if let Some(custom_color) = patch.custom_color {
                state.custom_color = Some(custom_color);
            }
            if let Some(icon) = patch.icon {
                state.icon = Some(icon);
            }
            if let Some(notes) = patch.notes {
                state.notes = Some(notes);
            }
            SessionDto::from(&*state)
        };
        self.persist().await;
        Ok(dto)
    }

    /// Merge node position updates into memory and disk.
    pub async fn save_positions(&self, positions: HashMap<String, PositionUpdate>) {
        {
            let sessions = self.sessions.read();
            for handle in sessions.values() {
                let mut state = handle.state.lock();
                if let Some(update) = positions.get(&state.node_id) {
                    state.position.x = update.x;
                    state.position.y = update.y;
                    if let Some(canvas_id) = &update.canvas_id {
                        state.canvas_id = Some(canvas_id.clone());
                    }
                }
            }
        }
        self.store.save_positions(positions).await;
    }

    // ========== terminal I/O ==========

    /// Write client input to the session's PTY.
    ///
    /// # Errors
    ///
    /// [`SessionError::InputTooLarge`] past the 4096-byte limit,
    /// [`SessionError::NoPty`] when disconnected.
    pub async fn write_input(&self, session_id: &str, data: &str) -> Result<(), SessionError> {
        if data.len() > INPUT_LIMIT {
            return Err(SessionError::InputTooLarge {
                length: data.len(),
                limit: INPUT_LIMIT,
            });
        }

        let handle = self.handle(session_id).ok_or_else(|| SessionError::NotFound {
            session_id: session_id.to_owned(),
        })?;

        let pty = {
            let mut state = handle.state.lock();
            let Some(pty) = state.pty.clone() else {
                return Err(SessionError::NoPty {
                    session_id: session_id.to_owned(),
                });
            };
            state.last_input_time = Some(Utc::now());
            pty
        };

        pty.write(data.as_bytes().to_vec())
            .await
            .map_err(|_| SessionError::NoPty {
                session_id: session_id.to_owned(),
            })
    }

    /// Resize the session's terminal.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        let pty = self
            .handle(session_id)
            .and_then(|handle| handle.state.lock().pty.clone());
        if let Some(pty) = pty {
            pty.resize(rows, cols).await;
        }
    }

    /// Return the last `bytes` of buffered output (clamped to
    /// [`TAIL_LIMIT`]), optionally ANSI-stripped, with a djb2 fingerprint.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] when the session is not live.
    pub fn tail(
        &self,
        session_id: &str,
        bytes: Option<usize>,
        strip: bool,
    ) -> Result<TailResponse, SessionError> {
        let handle = self.handle(session_id).ok_or_else(|| SessionError::NotFound {
            session_id: session_id.to_owned(),
        })?;

        let (text, status, current_tool, tool_input) = {
            let state = handle.state.lock();
            (
                state.buffer_text(),
                state.status,
                state.current_tool.clone(),
                state.tool_input.clone(),
            )
        };

        let requested = bytes.unwrap_or(TAIL_LIMIT).min(TAIL_LIMIT);
        let mut tail = tail_bytes(&text, requested).to_owned();
        if strip {
            tail = text::strip_ansi(&tail);
        }

        Ok(TailResponse {
            tail_hash: text::djb2(&tail),
            bytes: tail.len(),
            tail,
            status,
            current_tool,
            tool_input,
        })
    }

    // ========== status updates ==========

    /// Fold a plugin hook message into its session.
    ///
    /// Returns `Ok(false)` for an unknown session: hooks are fire-and-forget
    /// from the plugin's perspective, so that is a warning, not an error.
    ///
    /// # Errors
    ///
    /// [`SessionError::MissingStatus`] when the message has no status.
    pub fn apply_status_update(
        self: &Arc<Self>,
        update: &StatusUpdate,
    ) -> Result<bool, SessionError> {
        if update.status.is_none() {
            return Err(SessionError::MissingStatus);
        }

        let handle = update
            .openui_session_id
            .as_ref()
            .and_then(|id| self.handle(id))
            .or_else(|| {
                let claude_id = update.claude_session_id.as_ref()?;
                self.sessions
                    .read()
                    .values()
                    .find(|h| h.state.lock().claude_session_id.as_ref() == Some(claude_id))
                    .cloned()
            });

        let Some(handle) = handle else {
            tracing::warn!(
                openui_session_id = ?update.openui_session_id,
                claude_session_id = ?update.claude_session_id,
                "Status update for unknown session"
            );
            return Ok(false);
        };

        if update.hook_event.as_deref() == Some("SessionStart") {
            if let Some(id) = &update.openui_session_id {
                self.queue.signal_session_ready(id);
            }
        }

        let now = Utc::now();
        let (outcome, poll_branch, cwd) = {
            let mut state = handle.state.lock();
            if let Some(claude_id) = &update.claude_session_id {
                state.learn_claude_session_id(claude_id);
            }
            if let Some(new_cwd) = &update.cwd {
                let new_cwd = PathBuf::from(new_cwd);
                if new_cwd != state.cwd {
                    state.cwd = new_cwd;
                }
            }

            let outcome = status::apply_hook_event(&mut state, update, now);

            let poll_branch = state
                .last_branch_check
                .is_none_or(|t| t.elapsed() >= BRANCH_CHECK_INTERVAL);
            if poll_branch {
                state.last_branch_check = Some(Instant::now());
            }
            (outcome, poll_branch, state.cwd.clone())
        };

        if outcome.schedule_permission_timeout {
            self.schedule_permission_timeout(&handle, now);
        }
        if outcome.schedule_long_running_timeout {
            self.schedule_long_running_timeout(&handle, now);
        }

        if poll_branch {
            let branch_handle = Arc::clone(&handle);
            tokio::spawn(async move {
                if let Some(branch) = git::current_branch(&cwd).await {
                    let mut state = branch_handle.state.lock();
                    if state.git_branch.as_deref() != Some(branch.as_str()) {
                        state.git_branch = Some(branch);
                    }
                }
            });
        }

        self.broadcast_status(&handle);
        Ok(true)
    }

    fn schedule_permission_timeout(
        self: &Arc<Self>,
        handle: &Arc<SessionHandle>,
        armed_at: chrono::DateTime<Utc>,
    ) {
        let manager = Arc::clone(self);
        let timer_handle = Arc::clone(handle);
        let task = tokio::spawn(async move {
            tokio::time::sleep(PERMISSION_TIMEOUT).await;
            let flipped = {
                let mut state = timer_handle.state.lock();
                // Only if this exact pre-tool window is still open
                if state.pre_tool_time == Some(armed_at) {
                    state.status = SessionStatus::WaitingInput;
                    state.needs_input_since = Some(Utc::now());
                    true
                } else {
                    false
                }
            };
            if flipped {
                manager.broadcast_status(&timer_handle);
            }
        });

        let mut state = handle.state.lock();
        state.clear_permission_timeout();
        state.permission_timeout = Some(task);
    }

    fn schedule_long_running_timeout(
        self: &Arc<Self>,
        handle: &Arc<SessionHandle>,
        armed_at: chrono::DateTime<Utc>,
    ) {
        let manager = Arc::clone(self);
        let timer_handle = Arc::clone(handle);
        let task = tokio::spawn(async move {
            tokio::time::sleep(LONG_RUNNING_TIMEOUT).await;
            let flipped = {
                let mut state = timer_handle.state.lock();
                if state.pre_tool_time == Some(armed_at) {
                    state.long_running_tool = true;
                    true
                } else {
                    false
                }
            };
            if flipped {
                manager.broadcast_status(&timer_handle);
            }
        });

        let mut state = handle.state.lock();
        state.clear_long_running_timeout();
        state.long_running_timeout = Some(task);
    }

    // ========== broadcasting ==========

    /// Broadcast the session's current status to its subscribers.
    pub fn broadcast_status(&self, handle: &Arc<SessionHandle>) {
        let message = {
            let state = handle.state.lock();
            ServerMessage::Status {
                status: state.status,
                is_restored: state.is_restored,
                current_tool: state.current_tool.clone(),
                hook_event: state.last_hook_event.clone(),
                git_branch: state.git_branch.clone(),
                long_running_tool: state.long_running_tool,
            }
        };
        broadcast(handle, &message);
    }

    /// Broadcast an OAuth-required notice to a session's subscribers.
    pub fn broadcast_auth_required(&self, session_id: &str, url: Option<String>) {
        if let Some(handle) = self.handle(session_id) {
            broadcast(&handle, &ServerMessage::AuthRequired { url });
        }
    }

    /// Broadcast an OAuth-complete notice to a session's subscribers.
    pub fn broadcast_auth_complete(&self, session_id: &str) {
        if let Some(handle) = self.handle(session_id) {
            broadcast(&handle, &ServerMessage::AuthComplete);
        }
    }

    // ========== restoration ==========

    /// Materialize disconnected sessions from the persisted snapshot.
    pub async fn restore_sessions(&self) {
        let state = self.store.load_state().await;
        let has_isaac = agents::has_isaac();
        let mut restored = 0usize;

        for mut node in state.nodes {
            if node.archived {
                continue;
            }

            if let Some(worktree_path) = &node.worktree_path {
                if !worktree_path.exists() {
                    tracing::warn!(
                        session_id = %node.session_id,
                        worktree = %worktree_path.display(),
                        "Worktree gone, falling back to original cwd"
                    );
                    node.cwd = node.original_cwd.clone().unwrap_or(node.cwd);
                    node.worktree_path = None;
                }
            }

            let buffer = self.store.load_buffer(&node.session_id).await;
            let mut session = Session::from_persisted_node(&node, buffer);

            if has_isaac && session.command.contains("llm agent claude") {
                let migrated = session.command.replace("llm agent claude", "isaac claude");
                tracing::info!(
                    session_id = %session.session_id,
                    from = %session.command,
                    to = %migrated,
                    "Migrated legacy agent command"
                );
                session.command = migrated;
            }

            let session_id = session.session_id.clone();
            self.sessions
                .write()
                .insert(session_id, Arc::new(SessionHandle::new(session)));
            restored += 1;
        }

        tracing::info!(count = restored, "Restored sessions from disk");
    }

    /// Start restored sessions: Claude sessions drain serially through the
    /// start queue with `--resume`, everything else spawns immediately.
    pub async fn auto_resume_sessions(self: &Arc<Self>) {
        let handles: Vec<Arc<SessionHandle>> = self.sessions.read().values().cloned().collect();
        let has_isaac = agents::has_isaac();

        for handle in handles {
            let (session_id, agent_id, stored_command, claude_session_id, has_pty) = {
                let state = handle.state.lock();
                (
                    state.session_id.clone(),
                    state.agent_id.clone(),
                    state.command.clone(),
                    state.claude_session_id.clone(),
                    state.pty.is_some(),
                )
            };
            if has_pty {
                continue;
            }

            let command = claude::build_restart_command(
                &stored_command,
                &agent_id,
                claude_session_id.as_deref(),
                has_isaac,
            );
            let command = claude::inject_plugin_dir(&command, &agent_id);

            {
                let mut state = handle.state.lock();
                state.auto_resumed = true;
            }

            tracing::info!(%session_id, %agent_id, "Auto-resuming session");
            if let Err(e) = self.launch_agent(handle, command).await {
                tracing::warn!(%session_id, error = %e, "Auto-resume failed");
            }
        }
    }

    // ========== persistence & shutdown ==========

    fn live_nodes(&self) -> Vec<crate::store::PersistedNode> {
        self.sessions
            .read()
            .values()
            .map(|h| h.state.lock().to_persisted_node())
            .collect()
    }

    /// Persist every live session and its output buffer. Best-effort.
    pub async fn persist(&self) {
        let (nodes, buffers) = {
            let sessions = self.sessions.read();
            let mut nodes = Vec::with_capacity(sessions.len());
            let mut buffers = Vec::with_capacity(sessions.len());
            for handle in sessions.values() {
                let state = handle.state.lock();
                nodes.push(state.to_persisted_node());
                buffers.push((
                    state.session_id.clone(),
                    state.output_buffer.iter().cloned().collect::<Vec<_>>(),
                ));
            }
            (nodes, buffers)
        };

        self.store.save_state(nodes).await;
        for (session_id, chunks) in buffers {
            self.store.save_buffer(&session_id, &chunks).await;
        }
    }

    /// Kill every PTY and persist. Used on daemon shutdown.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<SessionHandle>> = self.sessions.read().values().cloned().collect();
        for handle in &handles {
            let pty = handle.state.lock().pty.take();
            if let Some(pty) = pty {
                pty.shutdown();
            }
        }
        self.persist().await;
    }

    /// Periodically decay each session's recent-output pressure metric.
    pub fn spawn_decay_task(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DECAY_INTERVAL);
            loop {
                interval.tick().await;
                let handles: Vec<Arc<SessionHandle>> =
                    manager.sessions.read().values().cloned().collect();
                for handle in handles {
                    let mut state = handle.state.lock();
                    if state.pty.is_some() {
                        state.recent_output_size =
                            state.recent_output_size.saturating_sub(DECAY_AMOUNT);
                    }
                }
            }
        });
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Insert a pre-built session handle. Test seam.
    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, session: Session) -> Arc<SessionHandle> {
        let session_id = session.session_id.clone();
        let handle = Arc::new(SessionHandle::new(session));
        self.sessions.write().insert(session_id, Arc::clone(&handle));
        handle
    }
}

/// Serialize once, fan out to every subscriber. Dead receivers just drop.
fn broadcast(handle: &Arc<SessionHandle>, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(payload) => {
            let _ = handle.events.send(payload);
        }
        Err(e) => tracing::warn!(error = %e, "Failed to serialize broadcast message"),
    }
}

/// When `cwd` sits inside a linked worktree, resolve the mother repo.
async fn detect_mother_repo(cwd: &Path) -> Option<PathBuf> {
    if git::is_inside_linked_worktree(cwd) {
        git::main_worktree_path(cwd).await
    } else {
        None
    }
}

/// Suffix of `text` at most `n` bytes long, respecting char boundaries.
fn tail_bytes(text: &str, n: usize) -> &str {
    if n >= text.len() {
        return text;
    }
    let mut start = text.len() - n;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Type the agent command into the fresh shell, then the sparse hint and
/// ticket prompt on their delays.
async fn delayed_writes(
    handle: &Arc<SessionHandle>,
    pty: &PtyHandle,
    command: &str,
    ticket_template: &str,
) {
    tokio::time::sleep(COMMAND_WRITE_DELAY).await;
    if !command.trim().is_empty() {
        let _ = pty.write(format!("{command}\r").into_bytes()).await;
    }

    let (sparse, ticket_id, ticket_title, ticket_url) = {
        let state = handle.state.lock();
        (
            state.sparse_checkout,
            state.ticket_id.clone(),
            state.ticket_title.clone(),
            state.ticket_url.clone(),
        )
    };

    if sparse {
        tokio::time::sleep(FOLLOW_UP_DELAY + COMMAND_WRITE_DELAY).await;
        let rel_hint = {
            let state = handle.state.lock();
            state.cwd.display().to_string()
        };
        let _ = pty
            .write(format!("# sparse checkout active: {rel_hint}\r").into_bytes())
            .await;
    }

    if let Some(url) = ticket_url {
        // Ticket prompt lands at ~2s after spawn, 4s when a sparse hint
        // preceded it.
        tokio::time::sleep(FOLLOW_UP_DELAY).await;
        let prompt = ticket_template
            .replace("{{url}}", &url)
            .replace("{{id}}", ticket_id.as_deref().unwrap_or(""))
            .replace("{{title}}", ticket_title.as_deref().unwrap_or(""));
        let _ = pty.write(format!("{prompt}\r").into_bytes()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonStore;
    use tempfile::TempDir;

    fn manager_in(dir: &TempDir) -> Arc<SessionManager> {
        let store = Arc::new(JsonStore::new(
            dir.path().join("state.json"),
            dir.path().join("buffers"),
        ));
        let registry = Arc::new(WorktreeRegistry::new(dir.path().join("worktrees.json")));
        let queue = StartQueue::new(Duration::from_secs(30), Duration::from_secs(2));
        Arc::new(SessionManager::new(
            store,
            registry,
            queue,
            Config::default(),
            dir.path().join("worktrees"),
        ))
    }

    fn bare_session(id: &str, agent_id: &str) -> Session {
        Session::new(
            SessionSeed {
                session_id: id.to_owned(),
                node_id: format!("node-{id}"),
                agent_id: agent_id.to_owned(),
                agent_name: agent_id.to_owned(),
                canvas_id: None,
                command: agent_id.to_owned(),
                cwd: std::env::temp_dir(),
            },
            SessionStatus::Disconnected,
        )
    }

    #[test]
    fn test_tail_bytes_respects_char_boundaries() {
        let text = "héllo";
        // Cutting into the middle of the two-byte é moves forward
        let tail = tail_bytes(text, 5);
        assert!(tail.is_char_boundary(0));
        assert!(text.ends_with(tail));
    }

    #[tokio::test]
    async fn test_restart_live_pty_conflicts() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        let mut session = bare_session("s1", "shell");
        session.pty = Some(PtyHandle::stub());
        manager.insert_for_test(session);

        let err = manager.restart_session("s1").await.unwrap_err();
        assert!(matches!(err, SessionError::PtyAlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn test_restart_unknown_session_not_found() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        let err = manager.restart_session("ghost").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_fork_non_claude_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        manager.insert_for_test(bare_session("s1", "codex"));

        let err = manager
            .fork_session("s1", ForkParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotAClaudeSession { .. }));
    }

    #[tokio::test]
    async fn test_fork_without_claude_session_id_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        manager.insert_for_test(bare_session("s1", "claude"));

        let err = manager
            .fork_session("s1", ForkParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::MissingClaudeSessionId { .. }));
    }

    #[tokio::test]
    async fn test_input_too_large_rejected_before_lookup() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        let big = "x".repeat(INPUT_LIMIT + 1);
        let err = manager.write_input("whatever", &big).await.unwrap_err();
        assert!(matches!(err, SessionError::InputTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_input_without_pty_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        manager.insert_for_test(bare_session("s1", "claude"));

        let err = manager.write_input("s1", "ls\r").await.unwrap_err();
        assert!(matches!(err, SessionError::NoPty { .. }));
    }

    #[tokio::test]
    async fn test_tail_zero_bytes_is_empty() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        let handle = manager.insert_for_test(bare_session("s1", "claude"));
        handle.state.lock().push_output("some output".to_owned());

        let tail = manager.tail("s1", Some(0), false).unwrap();
        assert_eq!(tail.tail, "");
        assert_eq!(tail.bytes, 0);
    }

    #[tokio::test]
    async fn test_tail_clamps_and_hashes() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        let handle = manager.insert_for_test(bare_session("s1", "claude"));
        handle
            .state
            .lock()
            .push_output("x".repeat(TAIL_LIMIT * 2));

        let tail = manager.tail("s1", Some(usize::MAX), false).unwrap();
        assert_eq!(tail.bytes, TAIL_LIMIT);
        assert_eq!(tail.tail_hash, text::djb2(&tail.tail));
    }

    #[tokio::test]
    async fn test_tail_strip_resolves_carriage_returns() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        let handle = manager.insert_for_test(bare_session("s1", "claude"));
        handle
            .state
            .lock()
            .push_output("loading...\rdone      ".to_owned());

        let tail = manager.tail("s1", None, true).unwrap();
        assert_eq!(tail.tail, "done");
    }

    #[tokio::test]
    async fn test_status_update_unknown_session_is_ok_false() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        let update = StatusUpdate {
            status: Some("running".to_owned()),
            openui_session_id: Some("ghost".to_owned()),
            ..Default::default()
        };
        assert_eq!(manager.apply_status_update(&update).unwrap(), false);
    }

    #[tokio::test]
    async fn test_status_update_missing_status_is_error() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        let update = StatusUpdate::default();
        assert!(matches!(
            manager.apply_status_update(&update).unwrap_err(),
            SessionError::MissingStatus
        ));
    }

    #[tokio::test]
    async fn test_status_update_lookup_by_claude_session_id() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        let handle = manager.insert_for_test(bare_session("s1", "claude"));
        handle
            .state
            .lock()
            .learn_claude_session_id("d25d76b4-db0b-47c2-a783-4a15ac95d561");

        let update = StatusUpdate {
            status: Some("running".to_owned()),
            claude_session_id: Some("d25d76b4-db0b-47c2-a783-4a15ac95d561".to_owned()),
            hook_event: Some("UserPromptSubmit".to_owned()),
            ..Default::default()
        };
        assert!(manager.apply_status_update(&update).unwrap());
        assert_eq!(handle.state.lock().status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn test_archive_then_delete_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        manager.insert_for_test(bare_session("s1", "claude"));

        manager.set_archived("s1", true).await.unwrap();
        assert_eq!(manager.session_count(), 0);
        let archived = manager.list_sessions(true).await;
        assert_eq!(archived.len(), 1);
        assert!(archived[0].archived);

        manager.delete_session("s1").await.unwrap();
        assert!(manager.list_sessions(true).await.is_empty());
        assert!(matches!(
            manager.delete_session("s1").await.unwrap_err(),
            SessionError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_restore_skips_archived_nodes() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        manager.insert_for_test(bare_session("live", "claude"));
        manager.insert_for_test(bare_session("archived", "claude"));
        manager.set_archived("archived", true).await.unwrap();
        manager.persist().await;

        let manager2 = manager_in(&dir);
        manager2.restore_sessions().await;
        assert_eq!(manager2.session_count(), 1);
        let restored = manager2.list_sessions(false).await;
        assert_eq!(restored[0].session_id, "live");
        assert_eq!(restored[0].status, SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_permission_timeout_flips_to_waiting_input() {
        tokio::time::pause();
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        let handle = manager.insert_for_test(bare_session("s1", "claude"));
        handle.state.lock().status = SessionStatus::Running;

        let update = StatusUpdate {
            status: Some("pre_tool".to_owned()),
            openui_session_id: Some("s1".to_owned()),
            tool_name: Some("Read".to_owned()),
            ..Default::default()
        };
        manager.apply_status_update(&update).unwrap();
        assert_eq!(handle.state.lock().status, SessionStatus::Running);

        tokio::time::sleep(PERMISSION_TIMEOUT + Duration::from_millis(100)).await;
        assert_eq!(handle.state.lock().status, SessionStatus::WaitingInput);
    }

    #[tokio::test]
    async fn test_post_tool_cancels_permission_timeout() {
        tokio::time::pause();
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        let handle = manager.insert_for_test(bare_session("s1", "claude"));
        handle.state.lock().status = SessionStatus::Running;

        let pre = StatusUpdate {
            status: Some("pre_tool".to_owned()),
            openui_session_id: Some("s1".to_owned()),
            tool_name: Some("Read".to_owned()),
            ..Default::default()
        };
        manager.apply_status_update(&pre).unwrap();

        let post = StatusUpdate {
            status: Some("post_tool".to_owned()),
            openui_session_id: Some("s1".to_owned()),
            tool_name: Some("Read".to_owned()),
            ..Default::default()
        };
        manager.apply_status_update(&post).unwrap();

        tokio::time::sleep(PERMISSION_TIMEOUT * 2).await;
        assert_eq!(handle.state.lock().status, SessionStatus::Running);
    }
}
