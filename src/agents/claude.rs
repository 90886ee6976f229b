//! Command rewriting for Claude sessions.
//!
//! Stored commands may carry a legacy wrapper prefix (`isaac claude`,
//! `llm agent claude`) and stale `--resume` flags from a previous run. These
//! helpers normalize a stored command into what actually gets written to the
//! PTY. All of them are pure given `has_isaac` and idempotent.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static ISAAC_CLAUDE: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used, reason = "static pattern")]
    Regex::new(r"\bisaac\s+claude\b").unwrap()
});

static LLM_AGENT_CLAUDE: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used, reason = "static pattern")]
    Regex::new(r"\bllm\s+agent\s+claude\b").unwrap()
});

static RESUME_FLAG: LazyLock<Regex> = LazyLock::new(|| {
    // The argument never starts with a dash, so a bare `--resume` followed by
    // another flag loses only the flag itself.
    #[expect(clippy::unwrap_used, reason = "static pattern")]
    Regex::new(r"\s*--resume\b(?:[=\s]+[^\s-]\S*)?").unwrap()
});

static CLAUDE_VERB: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used, reason = "static pattern")]
    Regex::new(r"\bclaude\b").unwrap()
});

static UUID: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used, reason = "static pattern")]
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .unwrap()
});

/// Whether `id` looks like an agent-native session UUID.
#[must_use]
pub fn is_valid_claude_session_id(id: &str) -> bool {
    UUID.is_match(id)
}

/// Rewrite wrapper-prefixed Claude invocations to bare `claude`.
///
/// Only applies to `agent_id == "claude"` when the `isaac` wrapper is not
/// installed; flags after the command are preserved.
#[must_use]
pub fn normalize_agent_command(command: &str, agent_id: &str, has_isaac: bool) -> String {
    if agent_id != "claude" || has_isaac {
        return command.to_owned();
    }

    let command = ISAAC_CLAUDE.replace_all(command, "claude");
    LLM_AGENT_CLAUDE.replace_all(&command, "claude").into_owned()
}

/// Build the command used to restart a session.
///
/// Normalizes the wrapper prefix, strips every pre-existing `--resume`
/// (stale flags must go even when no fresh UUID is available), then injects
/// exactly one `--resume <id>` after the command verb when
/// `claude_session_id` is a valid UUID. The result never contains more than
/// one `--resume`.
#[must_use]
pub fn build_restart_command(
    command: &str,
    agent_id: &str,
    claude_session_id: Option<&str>,
    has_isaac: bool,
) -> String {
    let normalized = normalize_agent_command(command, agent_id, has_isaac);
    if agent_id != "claude" {
        return normalized;
    }

    let stripped = RESUME_FLAG.replace_all(&normalized, "");
    let cleaned = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    match claude_session_id {
        Some(id) if is_valid_claude_session_id(id) => {
            insert_after_verb(&cleaned, &format!(" --resume {id}"))
        }
        _ => cleaned,
    }
}

/// Build the command for a session forked from `parent_claude_session_id`.
///
/// Same shape as a restart, with `--fork-session` riding along so the agent
/// branches the conversation instead of continuing it.
#[must_use]
pub fn build_fork_command(
    command: &str,
    agent_id: &str,
    parent_claude_session_id: &str,
    has_isaac: bool,
) -> String {
    let restarted =
        build_restart_command(command, agent_id, Some(parent_claude_session_id), has_isaac);
    let resume = format!("--resume {parent_claude_session_id}");
    restarted.replacen(&resume, &format!("{resume} --fork-session"), 1)
}

/// Inject `--plugin-dir <path>` for Claude sessions when the bundled plugin
/// is installed. No-op when the command already carries the flag.
#[must_use]
pub fn inject_plugin_dir(command: &str, agent_id: &str) -> String {
    match crate::utils::paths::claude_plugin_dir() {
        Some(dir) => inject_plugin_dir_at(command, agent_id, &dir),
        None => command.to_owned(),
    }
}

/// [`inject_plugin_dir`] with an explicit plugin location.
#[must_use]
pub fn inject_plugin_dir_at(command: &str, agent_id: &str, plugin_dir: &Path) -> String {
    if agent_id != "claude" || command.contains("--plugin-dir") {
        return command.to_owned();
    }
    insert_after_verb(
        command,
        &format!(" --plugin-dir {}", plugin_dir.display()),
    )
}

fn insert_after_verb(command: &str, insertion: &str) -> String {
    match CLAUDE_VERB.find(command) {
        Some(m) => {
            let mut out = String::with_capacity(command.len() + insertion.len());
            out.push_str(&command[..m.end()]);
            out.push_str(insertion);
            out.push_str(&command[m.end()..]);
            out
        }
        None => command.to_owned(),
    }
}
