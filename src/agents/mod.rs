/// Claude-specific command rewriting.
pub mod claude;

use serde::Serialize;

/// Catalog entry for a hosted agent. Immutable.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub id: &'static str,
    pub name: &'static str,
    pub command: &'static str,
    pub description: &'static str,
    pub color: &'static str,
    pub icon: &'static str,
}

/// The built-in agent catalog.
pub const AGENTS: &[AgentSpec] = &[
    AgentSpec {
        id: "claude",
        name: "Claude Code",
        command: "claude",
        description: "Anthropic's agentic coding assistant",
        color: "#d97757",
        icon: "sparkles",
    },
    AgentSpec {
        id: "codex",
        name: "Codex",
        command: "codex",
        description: "OpenAI's coding agent",
        color: "#10a37f",
        icon: "terminal",
    },
    AgentSpec {
        id: "gemini",
        name: "Gemini CLI",
        command: "gemini",
        description: "Google's coding agent",
        color: "#4285f4",
        icon: "gem",
    },
    AgentSpec {
        id: "shell",
        name: "Shell",
        command: "",
        description: "Plain interactive shell",
        color: "#6b7280",
        icon: "chevron-right",
    },
];

/// Look up a catalog entry by id.
#[must_use]
pub fn agent_by_id(id: &str) -> Option<&'static AgentSpec> {
    AGENTS.iter().find(|a| a.id == id)
}

/// Whether the `isaac` wrapper binary is installed on this host.
///
/// When it is absent, stored commands using the `isaac claude` prefix are
/// normalized down to bare `claude` before being written to a PTY.
#[must_use]
pub fn has_isaac() -> bool {
    which::which("isaac").is_ok()
}
