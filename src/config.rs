//! Runtime configuration loaded from the environment.

use std::path::PathBuf;
use std::time::Duration;

/// Default startup timeout for a queued Claude session (ms).
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 30_000;

/// Default delay between a ready signal and the next queued start (ms).
pub const DEFAULT_POST_SIGNAL_DELAY_MS: u64 = 2_000;

/// Default prompt written into a session created from a ticket.
/// `{{id}}`, `{{title}}` and `{{url}}` are substituted.
pub const DEFAULT_TICKET_TEMPLATE: &str = "Work on ticket {{id}} ({{title}}): {{url}}";

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Optional shared bearer token (`OPENUI_TOKEN`). Absent token disables
    /// auth for localhost development.
    pub token: Option<String>,

    /// Suppress console output below warnings (`OPENUI_QUIET`).
    pub quiet: bool,

    /// Startup timeout for queued Claude starts
    /// (`OPENUI_STARTUP_TIMEOUT_MS`).
    pub startup_timeout: Duration,

    /// Delay after a ready signal before the next queued start
    /// (`OPENUI_POST_SIGNAL_DELAY_MS`).
    pub post_signal_delay: Duration,

    /// Working directory for sessions that don't specify one (`LAUNCH_CWD`).
    pub launch_cwd: Option<PathBuf>,

    /// Prompt template for ticket-driven sessions (`OPENUI_TICKET_TEMPLATE`).
    pub ticket_template: String,
}

impl Config {
    /// Load configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            token: std::env::var("OPENUI_TOKEN").ok().filter(|t| !t.is_empty()),
            quiet: env_flag("OPENUI_QUIET"),
            startup_timeout: Duration::from_millis(env_ms(
                "OPENUI_STARTUP_TIMEOUT_MS",
                DEFAULT_STARTUP_TIMEOUT_MS,
            )),
            post_signal_delay: Duration::from_millis(env_ms(
                "OPENUI_POST_SIGNAL_DELAY_MS",
                DEFAULT_POST_SIGNAL_DELAY_MS,
            )),
            launch_cwd: std::env::var("LAUNCH_CWD").ok().map(PathBuf::from),
            ticket_template: std::env::var("OPENUI_TICKET_TEMPLATE")
                .unwrap_or_else(|_| DEFAULT_TICKET_TEMPLATE.to_owned()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: None,
            quiet: false,
            startup_timeout: Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS),
            post_signal_delay: Duration::from_millis(DEFAULT_POST_SIGNAL_DELAY_MS),
            launch_cwd: None,
            ticket_template: DEFAULT_TICKET_TEMPLATE.to_owned(),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_ms(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
