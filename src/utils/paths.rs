use std::path::PathBuf;

/// Get the base directory for openui data
///
/// # Panics
///
/// Panics if the home directory cannot be determined.
#[must_use]
pub fn base_dir() -> PathBuf {
    #[expect(clippy::expect_used, reason = "home directory is required for operation")]
    dirs::home_dir()
        .expect("Could not find home directory")
        .join(".openui")
}

/// Get the path to the persisted state snapshot
#[must_use]
pub fn state_path() -> PathBuf {
    base_dir().join("state.json")
}

/// Get the directory for per-session output buffer files
#[must_use]
pub fn buffers_dir() -> PathBuf {
    base_dir().join("buffers")
}

/// Get the path to the worktree registry file
#[must_use]
pub fn worktree_registry_path() -> PathBuf {
    base_dir().join("worktrees.json")
}

/// Get the directory where fresh pool worktrees are created
#[must_use]
pub fn worktrees_dir() -> PathBuf {
    base_dir().join("worktrees")
}

/// Get the directory for log files
#[must_use]
pub fn logs_dir() -> PathBuf {
    base_dir().join("logs")
}

/// Get the path to the bundled Claude Code plugin, if installed
///
/// The plugin is probed at `~/.openui/claude-code-plugin` first, then at a
/// path relative to the server's working directory.
#[must_use]
pub fn claude_plugin_dir() -> Option<PathBuf> {
    let home_plugin = base_dir().join("claude-code-plugin");
    if home_plugin
        .join(".claude-plugin")
        .join("plugin.json")
        .exists()
    {
        return Some(home_plugin);
    }

    let local_plugin = PathBuf::from("claude-code-plugin");
    if local_plugin
        .join(".claude-plugin")
        .join("plugin.json")
        .exists()
    {
        return Some(local_plugin);
    }

    None
}
