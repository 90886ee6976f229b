//! Session start queue.
//!
//! Claude's startup binds a local OAuth callback port, so only one Claude
//! session may run its startup window at a time. The queue drains starts in
//! FIFO order, waiting for each session to signal ready (via its
//! `SessionStart` hook) or time out. When live output mentions the OAuth
//! port, the timeout is cancelled and the queue blocks indefinitely until
//! the user completes authentication.

use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// How often the OAuth detector scans fresh output.
const OAUTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long the detector keeps scanning before giving up.
const OAUTH_DETECTOR_LIFETIME: Duration = Duration::from_secs(10);

static OAUTH_PORT: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used, reason = "static pattern")]
    Regex::new(r"(?i)localhost[:\s]*8020|port 8020").unwrap()
});

static URL: LazyLock<Regex> = LazyLock::new(|| {
    #[expect(clippy::unwrap_used, reason = "static pattern")]
    Regex::new(r"https?://\S+").unwrap()
});

/// Future produced by a queued start function.
pub type StartFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Deferred start of a session's agent process.
pub type StartFn = Box<dyn FnOnce() -> StartFuture + Send>;

/// Snapshot accessor for a session's output buffer, polled by the OAuth
/// detector.
pub type BufferFn = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// Called when a session is blocked on interactive OAuth. Receives the
/// session id and the detected auth URL, if one was found near the match.
pub type AuthRequiredFn = Arc<dyn Fn(&str, Option<String>) + Send + Sync>;

/// Called when a previously blocked session completes authentication.
pub type AuthCompleteFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Progress of the current drain run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueProgress {
    pub total: usize,
    pub completed: usize,
    pub current: Option<String>,
    pub is_active: bool,
}

struct Entry {
    session_id: String,
    start_fn: StartFn,
    get_output: Option<BufferFn>,
}

struct Current {
    session_id: String,
    ready_tx: Option<oneshot::Sender<()>>,
    auth_latch: watch::Sender<bool>,
    waiting_for_auth: bool,
    signaled: bool,
    detector: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<Entry>,
    current: Option<Current>,
    processing: bool,
    total: usize,
    completed: usize,
    on_auth_required: Option<AuthRequiredFn>,
    on_auth_complete: Option<AuthCompleteFn>,
}

/// Serializes Claude session starts. Cheap to clone.
#[derive(Clone)]
pub struct StartQueue {
    inner: Arc<Mutex<Inner>>,
    startup_timeout: Duration,
    post_signal_delay: Duration,
}

impl StartQueue {
    /// Create a queue with the given timing parameters.
    #[must_use]
    pub fn new(startup_timeout: Duration, post_signal_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            startup_timeout,
            post_signal_delay,
        }
    }

    /// Wire the auth broadcast callbacks.
    pub fn set_auth_broadcast(&self, on_required: AuthRequiredFn, on_complete: AuthCompleteFn) {
        let mut inner = self.inner.lock();
        inner.on_auth_required = Some(on_required);
        inner.on_auth_complete = Some(on_complete);
    }

    /// Append a session start. Begins draining if not already doing so.
    pub fn enqueue_session_start(
        &self,
        session_id: impl Into<String>,
        start_fn: StartFn,
        get_output: Option<BufferFn>,
    ) {
        let session_id = session_id.into();
        let should_spawn = {
            let mut inner = self.inner.lock();
            inner.queue.push_back(Entry {
                session_id,
                start_fn,
                get_output,
            });
            inner.total += 1;
            if inner.processing {
                false
            } else {
                inner.processing = true;
                true
            }
        };

        if should_spawn {
            let queue = self.clone();
            tokio::spawn(async move { queue.drain().await });
        }
    }

    /// Mark the currently pending session ready.
    ///
    /// The queue advances after the post-signal delay. Calls for a session
    /// that is not current, or repeat calls for the same session, are no-ops.
    pub fn signal_session_ready(&self, session_id: &str) {
        let mut inner = self.inner.lock();
        let Some(current) = inner.current.as_mut() else {
            return;
        };
        if current.session_id != session_id || current.signaled {
            return;
        }
        current.signaled = true;

        if let Some(detector) = current.detector.take() {
            detector.abort();
        }

        let was_waiting = current.waiting_for_auth;
        let Some(ready_tx) = current.ready_tx.take() else {
            return;
        };

        let on_complete = inner.on_auth_complete.clone();
        drop(inner);

        if was_waiting {
            if let Some(on_complete) = on_complete {
                on_complete(session_id);
            }
        }

        let delay = self.post_signal_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = ready_tx.send(());
        });
    }

    /// Progress counters for the auto-resume endpoint.
    #[must_use]
    pub fn progress(&self) -> QueueProgress {
        let inner = self.inner.lock();
        QueueProgress {
            total: inner.total,
            completed: inner.completed,
            current: inner.current.as_ref().map(|c| c.session_id.clone()),
            is_active: inner.processing,
        }
    }

    /// Zero the counters. Does not interrupt in-flight processing.
    pub fn reset_progress(&self) {
        let mut inner = self.inner.lock();
        inner.total = 0;
        inner.completed = 0;
    }

    async fn drain(self) {
        loop {
            let entry = {
                let mut inner = self.inner.lock();
                match inner.queue.pop_front() {
                    Some(entry) => Some(entry),
                    None => {
                        inner.processing = false;
                        inner.current = None;
                        None
                    }
                }
            };
            let Some(entry) = entry else { break };

            let session_id = entry.session_id.clone();
            let (ready_tx, mut ready_rx) = oneshot::channel();
            let (auth_latch, mut auth_rx) = watch::channel(false);
            {
                let mut inner = self.inner.lock();
                inner.current = Some(Current {
                    session_id: session_id.clone(),
                    ready_tx: Some(ready_tx),
                    auth_latch,
                    waiting_for_auth: false,
                    signaled: false,
                    detector: None,
                });
            }

            tracing::info!(%session_id, "Starting queued session");
            if let Err(e) = (entry.start_fn)().await {
                tracing::warn!(%session_id, error = %e, "Queued session failed to start, releasing queue");
                self.finish_current();
                continue;
            }

            if let Some(get_output) = entry.get_output {
                let detector = tokio::spawn(oauth_detector(
                    self.clone(),
                    session_id.clone(),
                    get_output,
                ));
                let mut inner = self.inner.lock();
                if let Some(current) = inner.current.as_mut() {
                    current.detector = Some(detector);
                } else {
                    detector.abort();
                }
            }

            let timeout = tokio::time::sleep(self.startup_timeout);
            tokio::pin!(timeout);
            let mut timeout_armed = true;
            let mut latch_alive = true;

            loop {
                tokio::select! {
                    _ = &mut ready_rx => break,
                    () = &mut timeout, if timeout_armed => {
                        tracing::warn!(
                            %session_id,
                            timeout_ms = self.startup_timeout.as_millis() as u64,
                            "Session never signaled ready, advancing queue"
                        );
                        break;
                    }
                    changed = auth_rx.changed(), if latch_alive => {
                        match changed {
                            Ok(()) => {
                                if *auth_rx.borrow() {
                                    tracing::info!(%session_id, "OAuth detected, waiting indefinitely for auth");
                                    timeout_armed = false;
                                }
                            }
                            Err(_) => latch_alive = false,
                        }
                    }
                }
            }

            self.finish_current();
        }
    }

    fn finish_current(&self) {
        let mut inner = self.inner.lock();
        if let Some(current) = inner.current.take() {
            if let Some(detector) = current.detector {
                detector.abort();
            }
        }
        inner.completed += 1;
    }
}

/// Scan freshly appended output lines for the OAuth callback port.
///
/// On a match: latch `waiting_for_auth` (cancelling the startup timeout),
/// pull the first URL from a ±2-line window around the match, and invoke the
/// auth-required callback. Gives up after [`OAUTH_DETECTOR_LIFETIME`] with no
/// match; an external `signal_session_ready` aborts it earlier.
async fn oauth_detector(queue: StartQueue, session_id: String, get_output: BufferFn) {
    let started = tokio::time::Instant::now();
    let mut scanned_lines = 0usize;

    loop {
        tokio::time::sleep(OAUTH_POLL_INTERVAL).await;

        let lines: Vec<String> = get_output()
            .iter()
            .flat_map(|chunk| chunk.lines().map(str::to_owned).collect::<Vec<_>>())
            .collect();

        let fresh_match = lines
            .iter()
            .enumerate()
            .skip(scanned_lines)
            .find(|(_, line)| OAUTH_PORT.is_match(line))
            .map(|(i, _)| i);

        if let Some(match_index) = fresh_match {
            let window_start = match_index.saturating_sub(2);
            let window_end = (match_index + 3).min(lines.len());
            let url = lines[window_start..window_end]
                .iter()
                .find_map(|line| URL.find(line).map(|m| m.as_str().to_owned()));

            let on_required = {
                let mut guard = queue.inner.lock();
                let inner = &mut *guard;
                match inner.current.as_mut() {
                    Some(current) if current.session_id == session_id => {
                        current.waiting_for_auth = true;
                        let _ = current.auth_latch.send(true);
                        inner.on_auth_required.clone()
                    }
                    _ => return,
                }
            };

            tracing::info!(%session_id, url = ?url, "OAuth URL detected in session output");
            if let Some(on_required) = on_required {
                on_required(&session_id, url);
            }
            return;
        }

        scanned_lines = lines.len();

        if started.elapsed() >= OAUTH_DETECTOR_LIFETIME {
            return;
        }
    }
}
