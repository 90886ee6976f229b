//! Plugin status state machine.
//!
//! The Claude Code plugin POSTs one message per hook firing. Parallel
//! subagents fire hooks concurrently and the transport may reorder them, so
//! raw events cannot drive the visible status directly. This module folds an
//! event into the session record and decides the canonical status, guarded
//! by two protection rules:
//!
//! - **Idle lock**: once a session is idle, stray `running` events (late
//!   `SubagentStop`, missing post-tool) don't unstick it; only a fresh
//!   `UserPromptSubmit` does.
//! - **Waiting-input lock**: once `needs_input_since` is set, `running`
//!   events from parallel subagents can't downgrade the status until the
//!   user has actually typed into the terminal.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

use super::session::{Session, SessionStatus};

/// If a tool is still pre-tool after this long, assume it's actually blocked
/// on a permission prompt the plugin never reported.
pub const PERMISSION_TIMEOUT: Duration = Duration::from_millis(2500);

/// After this long inside one tool call, flag the session as running a
/// long-lived tool so clients can render it differently.
pub const LONG_RUNNING_TIMEOUT: Duration = Duration::from_secs(300);

/// Minimum interval between git branch re-polls.
pub const BRANCH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Tools that legitimately sit in pre-tool for a long time without being
/// permission prompts.
pub const NO_PERMISSION_TIMEOUT_TOOLS: &[&str] = &["Bash", "Task", "TaskOutput"];

/// One message from the plugin webhook.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: Option<String>,
    pub openui_session_id: Option<String>,
    pub claude_session_id: Option<String>,
    pub cwd: Option<String>,
    pub hook_event: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub stop_reason: Option<String>,
}

/// What the caller must do after folding an event: the decided status plus
/// which timers to (re)arm. Timer cancellation happens inside the fold; only
/// arming needs the caller, since it owns the spawn context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookOutcome {
    pub status: SessionStatus,
    pub schedule_permission_timeout: bool,
    pub schedule_long_running_timeout: bool,
}

fn map_reported_status(status: &str, current: SessionStatus) -> SessionStatus {
    match status {
        "idle" => SessionStatus::Idle,
        "running" => SessionStatus::Running,
        "tool_calling" => SessionStatus::ToolCalling,
        "waiting_input" => SessionStatus::WaitingInput,
        "error" => SessionStatus::Error,
        _ => current,
    }
}

/// Fold one hook event into the session and decide the canonical status.
///
/// Pure given (`session`, `update`, `now`): the decided status depends on
/// the event sequence applied, not on transport arrival timing.
pub fn apply_hook_event(
    session: &mut Session,
    update: &StatusUpdate,
    now: DateTime<Utc>,
) -> HookOutcome {
    let status = update.status.as_deref().unwrap_or("");
    let hook_event = update.hook_event.as_deref();
    let tool_name = update.tool_name.as_deref();

    let mut schedule_permission_timeout = false;
    let mut schedule_long_running_timeout = false;

    let mut effective = match status {
        "permission_request" => {
            session.needs_input_since = Some(now);
            session.pre_tool_time = None;
            session.clear_permission_timeout();
            SessionStatus::WaitingInput
        }
        "pre_tool" if tool_name == Some("AskUserQuestion") => {
            session.needs_input_since = Some(now);
            session.current_tool = tool_name.map(str::to_owned);
            session.tool_input = update.tool_input.clone();
            session.clear_permission_timeout();
            SessionStatus::WaitingInput
        }
        "pre_tool" => {
            session.current_tool = tool_name.map(str::to_owned);
            session.tool_input = update.tool_input.clone();
            session.pre_tool_time = Some(now);
            session.clear_permission_timeout();
            session.clear_long_running_timeout();
            if !tool_name.is_some_and(|t| NO_PERMISSION_TIMEOUT_TOOLS.contains(&t)) {
                schedule_permission_timeout = true;
            }
            schedule_long_running_timeout = true;
            SessionStatus::Running
        }
        "post_tool" => {
            // current_tool is retained so clients can show what just ran
            session.tool_input = None;
            session.pre_tool_time = None;
            session.clear_permission_timeout();
            session.clear_long_running_timeout();
            session.long_running_tool = false;
            if tool_name == Some("AskUserQuestion") {
                session.needs_input_since = None;
            }
            SessionStatus::Running
        }
        other => {
            if matches!(hook_event, Some("UserPromptSubmit" | "Stop")) {
                session.needs_input_since = None;
                if !matches!(other, "tool_calling" | "running") {
                    session.current_tool = None;
                }
                session.pre_tool_time = None;
                session.clear_permission_timeout();
                session.clear_long_running_timeout();
                session.long_running_tool = false;
            }
            map_reported_status(other, session.status)
        }
    };

    // Idle lock: a late SubagentStop or missing post-tool must not unstick
    // an idle session.
    if session.status == SessionStatus::Idle
        && effective == SessionStatus::Running
        && hook_event != Some("UserPromptSubmit")
    {
        effective = SessionStatus::Idle;
    }

    // Waiting-input lock, unless the user already responded via the terminal.
    if effective == SessionStatus::Running {
        if let Some(needs_since) = session.needs_input_since {
            if session.last_input_time.is_some_and(|t| t > needs_since) {
                session.needs_input_since = None;
            } else {
                effective = SessionStatus::WaitingInput;
            }
        }
    }

    session.status = effective;
    session.plugin_reported_status = true;
    session.last_plugin_status_time = Some(now);
    session.last_hook_event = hook_event.map(str::to_owned);

    HookOutcome {
        status: effective,
        schedule_permission_timeout,
        schedule_long_running_timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::SessionSeed;
    use std::path::PathBuf;

    fn session(status: SessionStatus) -> Session {
        Session::new(
            SessionSeed {
                session_id: "s1".to_owned(),
                node_id: "node-s1".to_owned(),
                agent_id: "claude".to_owned(),
                agent_name: "Claude Code".to_owned(),
                canvas_id: None,
                command: "claude".to_owned(),
                cwd: PathBuf::from("/tmp"),
            },
            status,
        )
    }

    fn update(status: &str) -> StatusUpdate {
        StatusUpdate {
            status: Some(status.to_owned()),
            ..Default::default()
        }
    }

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn test_permission_request_sets_waiting_input() {
        let mut s = session(SessionStatus::Running);
        let outcome = apply_hook_event(&mut s, &update("permission_request"), at(1000));

        assert_eq!(outcome.status, SessionStatus::WaitingInput);
        assert_eq!(s.needs_input_since, Some(at(1000)));
        assert!(s.pre_tool_time.is_none());
    }

    #[test]
    fn test_pre_tool_ask_user_question_waits() {
        let mut s = session(SessionStatus::Running);
        let mut u = update("pre_tool");
        u.tool_name = Some("AskUserQuestion".to_owned());
        u.tool_input = Some(serde_json::json!({"question": "which?"}));

        let outcome = apply_hook_event(&mut s, &u, at(1000));
        assert_eq!(outcome.status, SessionStatus::WaitingInput);
        assert_eq!(s.current_tool.as_deref(), Some("AskUserQuestion"));
        assert!(s.tool_input.is_some());
        assert!(!outcome.schedule_permission_timeout);
    }

    #[test]
    fn test_pre_tool_schedules_both_timers() {
        let mut s = session(SessionStatus::Idle);
        let mut u = update("pre_tool");
        u.tool_name = Some("Read".to_owned());
        u.hook_event = Some("PreToolUse".to_owned());

        let outcome = apply_hook_event(&mut s, &u, at(1000));
        assert!(outcome.schedule_permission_timeout);
        assert!(outcome.schedule_long_running_timeout);
        assert_eq!(s.pre_tool_time, Some(at(1000)));
        assert_eq!(s.current_tool.as_deref(), Some("Read"));
    }

    #[test]
    fn test_pre_tool_bash_skips_permission_timer() {
        let mut s = session(SessionStatus::Running);
        let mut u = update("pre_tool");
        u.tool_name = Some("Bash".to_owned());

        let outcome = apply_hook_event(&mut s, &u, at(1000));
        assert!(!outcome.schedule_permission_timeout);
        assert!(outcome.schedule_long_running_timeout);
    }

    #[test]
    fn test_post_tool_clears_tool_state_retains_name() {
        let mut s = session(SessionStatus::Running);
        let mut pre = update("pre_tool");
        pre.tool_name = Some("Read".to_owned());
        apply_hook_event(&mut s, &pre, at(1000));

        let mut post = update("post_tool");
        post.tool_name = Some("Read".to_owned());
        let outcome = apply_hook_event(&mut s, &post, at(2000));

        assert_eq!(outcome.status, SessionStatus::Running);
        assert!(s.tool_input.is_none());
        assert!(s.pre_tool_time.is_none());
        assert!(!s.long_running_tool);
        assert_eq!(s.current_tool.as_deref(), Some("Read"));
    }

    #[test]
    fn test_post_tool_ask_user_question_clears_guard() {
        let mut s = session(SessionStatus::WaitingInput);
        s.needs_input_since = Some(at(100));

        let mut post = update("post_tool");
        post.tool_name = Some("AskUserQuestion".to_owned());
        apply_hook_event(&mut s, &post, at(2000));

        assert!(s.needs_input_since.is_none());
    }

    #[test]
    fn test_waiting_input_lock_holds() {
        // User has NOT typed since the input request: lock holds
        let mut s = session(SessionStatus::Running);
        s.needs_input_since = Some(at(100));
        s.last_input_time = Some(at(50));

        let mut u = update("pre_tool");
        u.tool_name = Some("Read".to_owned());
        let outcome = apply_hook_event(&mut s, &u, at(1000));

        assert_eq!(outcome.status, SessionStatus::WaitingInput);
        assert_eq!(s.needs_input_since, Some(at(100)));
    }

    #[test]
    fn test_waiting_input_lock_released_by_terminal_input() {
        let mut s = session(SessionStatus::WaitingInput);
        s.needs_input_since = Some(at(100));
        s.last_input_time = Some(at(200));

        let mut u = update("pre_tool");
        u.tool_name = Some("Read".to_owned());
        let outcome = apply_hook_event(&mut s, &u, at(1000));

        assert_eq!(outcome.status, SessionStatus::Running);
        assert!(s.needs_input_since.is_none());
    }

    #[test]
    fn test_idle_lock_blocks_subagent_stop() {
        let mut s = session(SessionStatus::Idle);
        let mut u = update("running");
        u.hook_event = Some("SubagentStop".to_owned());

        let outcome = apply_hook_event(&mut s, &u, at(1000));
        assert_eq!(outcome.status, SessionStatus::Idle);
    }

    #[test]
    fn test_idle_lock_released_by_user_prompt() {
        let mut s = session(SessionStatus::Idle);
        let mut stray = update("running");
        stray.hook_event = Some("SubagentStop".to_owned());
        apply_hook_event(&mut s, &stray, at(1000));
        assert_eq!(s.status, SessionStatus::Idle);

        let mut prompt = update("running");
        prompt.hook_event = Some("UserPromptSubmit".to_owned());
        let outcome = apply_hook_event(&mut s, &prompt, at(2000));
        assert_eq!(outcome.status, SessionStatus::Running);
    }

    #[test]
    fn test_stop_clears_current_tool_for_idle() {
        let mut s = session(SessionStatus::Running);
        s.current_tool = Some("Read".to_owned());
        s.needs_input_since = Some(at(100));

        let mut u = update("idle");
        u.hook_event = Some("Stop".to_owned());
        let outcome = apply_hook_event(&mut s, &u, at(1000));

        assert_eq!(outcome.status, SessionStatus::Idle);
        assert!(s.current_tool.is_none());
        assert!(s.needs_input_since.is_none());
    }

    #[test]
    fn test_stop_retains_tool_for_running_status() {
        let mut s = session(SessionStatus::Running);
        s.current_tool = Some("Task".to_owned());

        let mut u = update("running");
        u.hook_event = Some("UserPromptSubmit".to_owned());
        apply_hook_event(&mut s, &u, at(1000));

        assert_eq!(s.current_tool.as_deref(), Some("Task"));
    }

    #[test]
    fn test_unknown_status_keeps_current() {
        let mut s = session(SessionStatus::ToolCalling);
        let outcome = apply_hook_event(&mut s, &update("mystery"), at(1000));
        assert_eq!(outcome.status, SessionStatus::ToolCalling);
    }

    #[test]
    fn test_fold_is_function_of_sequence() {
        // Applying the same sequence to two fresh sessions gives the same
        // final status regardless of wall-clock between applications.
        let events: Vec<StatusUpdate> = vec![
            {
                let mut u = update("pre_tool");
                u.tool_name = Some("Read".to_owned());
                u
            },
            {
                let mut u = update("post_tool");
                u.tool_name = Some("Read".to_owned());
                u
            },
            {
                let mut u = update("idle");
                u.hook_event = Some("Stop".to_owned());
                u
            },
            {
                let mut u = update("running");
                u.hook_event = Some("SubagentStop".to_owned());
                u
            },
        ];

        let mut a = session(SessionStatus::Idle);
        let mut b = session(SessionStatus::Idle);
        for (i, event) in events.iter().enumerate() {
            apply_hook_event(&mut a, event, at(1000 + i as i64));
        }
        for (i, event) in events.iter().enumerate() {
            apply_hook_event(&mut b, event, at(50_000 + i as i64 * 777));
        }
        assert_eq!(a.status, b.status);
        assert_eq!(a.status, SessionStatus::Idle);
    }
}
