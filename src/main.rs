use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use openui::api::http::{AppState, create_router};
use openui::config::Config;
use openui::core::SessionManager;
use openui::queue::StartQueue;
use openui::store::JsonStore;
use openui::utils::paths;
use openui::worktrees::WorktreeRegistry;

/// How often live sessions and buffers are flushed to disk.
const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(30);

/// Log files older than this are removed at daemon startup.
const LOG_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Parser)]
#[command(name = "openui")]
#[command(version)]
#[command(about = "Multi-agent terminal orchestrator for AI coding sessions")]
#[command(long_about = "\
openui hosts concurrent PTY sessions running interactive coding agents
(Claude Code and friends), streams each one over HTTP and WebSockets, and
coordinates the full lifecycle: spawn, restart, fork, archive, auto-resume.

Sessions can run in pooled git worktrees for sub-second isolated startup.
Claude starts are serialized so OAuth port contention cannot wedge two
sessions at once.")]
#[command(after_long_help = "\
ENVIRONMENT VARIABLES:
    RUST_LOG                     Log level filter (default: openui=info)
    OPENUI_TOKEN                 Shared bearer token; unset disables auth
    OPENUI_QUIET                 Console output at warn level only
    OPENUI_STARTUP_TIMEOUT_MS    Queued start timeout (default: 30000)
    OPENUI_POST_SIGNAL_DELAY_MS  Delay after ready signal (default: 2000)
    OPENUI_TICKET_TEMPLATE       Prompt template for ticket sessions
    OPENUI_LOG_FORMAT            'json' for structured file logs
    LAUNCH_CWD                   Default working directory for sessions

FILE LOCATIONS:
    ~/.openui/                   Base directory for all data
    ~/.openui/state.json         Session/canvas snapshot
    ~/.openui/buffers/           Per-session output buffers
    ~/.openui/worktrees.json     Worktree pool registry
    ~/.openui/worktrees/         Pooled git worktrees
    ~/.openui/logs/              Log files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the openui daemon
    Daemon {
        /// HTTP server port for the API and WebSocket streams
        #[arg(long, default_value = "3000")]
        http_port: u16,

        /// HTTP server bind address
        #[arg(long, env = "OPENUI_BIND_ADDR", default_value = "127.0.0.1")]
        bind_addr: String,
    },
    /// Print resolved configuration and data paths
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            http_port,
            bind_addr,
        } => {
            let config = Config::from_env();
            initialize_daemon_logging(&config)?;
            run_daemon(config, http_port, &bind_addr).await
        }
        Commands::Config => {
            initialize_cli_logging();
            print_config();
            Ok(())
        }
    }
}

async fn run_daemon(config: Config, http_port: u16, bind_addr: &str) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(paths::base_dir()).await?;
    tokio::fs::create_dir_all(paths::buffers_dir()).await?;
    tokio::fs::create_dir_all(paths::worktrees_dir()).await?;

    let store = Arc::new(JsonStore::new(paths::state_path(), paths::buffers_dir()));
    let registry = Arc::new(WorktreeRegistry::new(paths::worktree_registry_path()));
    let queue = StartQueue::new(config.startup_timeout, config.post_signal_delay);

    let manager = Arc::new(SessionManager::new(
        store,
        registry,
        queue,
        config.clone(),
        paths::worktrees_dir(),
    ));

    // Route queue auth notices to the affected session's subscribers
    {
        let on_required_manager = Arc::clone(&manager);
        let on_complete_manager = Arc::clone(&manager);
        manager.queue().set_auth_broadcast(
            Arc::new(move |session_id, url| {
                on_required_manager.broadcast_auth_required(session_id, url);
            }),
            Arc::new(move |session_id| {
                on_complete_manager.broadcast_auth_complete(session_id);
            }),
        );
    }

    manager.restore_sessions().await;
    manager.auto_resume_sessions().await;
    manager.spawn_decay_task();

    // Periodic snapshot so buffers survive a hard kill
    {
        let autosave_manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(AUTOSAVE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                autosave_manager.persist().await;
            }
        });
    }

    let auth_required = config.token.is_some();
    let state = AppState {
        manager: Arc::clone(&manager),
        config: Arc::new(config),
    };
    let app = create_router(state);

    let addr: std::net::SocketAddr = format!("{bind_addr}:{http_port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        "HTTP server listening on {addr} (authentication {})",
        if auth_required { "REQUIRED" } else { "not required" }
    );

    tokio::select! {
        result = axum::serve(listener, app) => {
            tracing::error!("HTTP server exited: {result:?}");
            result.map_err(Into::into)
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down, persisting sessions");
            manager.shutdown().await;
            Ok(())
        }
    }
}

fn print_config() {
    let config = Config::from_env();
    tracing::warn!(
        base_dir = %paths::base_dir().display(),
        state = %paths::state_path().display(),
        worktrees = %paths::worktrees_dir().display(),
        logs = %paths::logs_dir().display(),
        startup_timeout_ms = config.startup_timeout.as_millis() as u64,
        post_signal_delay_ms = config.post_signal_delay.as_millis() as u64,
        auth = config.token.is_some(),
        "Resolved configuration"
    );
}

/// Console-only logging for non-daemon commands.
fn initialize_cli_logging() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "openui=warn".into()),
    );

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(env_filter),
        )
        .init();
}

/// Full daemon logging: console plus a timestamped file under
/// `~/.openui/logs/` with a `latest.log` symlink. `OPENUI_LOG_FORMAT=json`
/// switches the file layer to JSON; `OPENUI_QUIET` caps the console at
/// warnings.
fn initialize_daemon_logging(config: &Config) -> anyhow::Result<()> {
    let logs_dir = paths::logs_dir();
    std::fs::create_dir_all(&logs_dir)?;
    cleanup_old_logs(&logs_dir);

    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
    let log_filename = format!("openui.{timestamp}.log");
    let file_appender = tracing_appender::rolling::never(&logs_dir, &log_filename);

    #[cfg(unix)]
    {
        use std::os::unix::fs::symlink;
        let _ = std::fs::remove_file(logs_dir.join("latest.log"));
        let _ = symlink(&log_filename, logs_dir.join("latest.log"));
    }

    let default_filter = if config.quiet {
        "openui=warn"
    } else {
        "openui=info"
    };
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into());
    let console_filter = tracing_subscriber::EnvFilter::new(&rust_log);
    let file_filter = tracing_subscriber::EnvFilter::new(&rust_log);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(cfg!(debug_assertions));

    let json_format = std::env::var("OPENUI_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json_format {
        tracing_subscriber::registry()
            .with(console_layer.with_filter(console_filter))
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(file_appender)
                    .with_filter(file_filter),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(console_layer.with_filter(console_filter))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_filter(file_filter),
            )
            .init();
    }

    tracing::info!("openui daemon v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("PID: {}", std::process::id());
    tracing::info!("Log file: {}", logs_dir.join(&log_filename).display());
    Ok(())
}

/// Remove log files older than the retention window. Best-effort.
fn cleanup_old_logs(logs_dir: &std::path::Path) {
    let Ok(entries) = std::fs::read_dir(logs_dir) else {
        return;
    };
    let now = std::time::SystemTime::now();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "log") {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if now
            .duration_since(modified)
            .is_ok_and(|age| age > LOG_RETENTION)
        {
            let _ = std::fs::remove_file(&path);
        }
    }
}
