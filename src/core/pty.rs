//! PTY plumbing for a single session.
//!
//! Each spawned session gets a bash shell on a pseudo-terminal. A writer
//! task owns the write half and services input/resize requests from a
//! channel; a reader task owns the read half and forwards raw chunks to the
//! session manager, which buffers and fans them out to subscribers.

use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Channel buffer size for write requests.
const WRITE_CHANNEL_SIZE: usize = 256;

/// Channel buffer size for output events.
const OUTPUT_CHANNEL_SIZE: usize = 256;

/// Buffer size for PTY reads.
const READ_BUFFER_SIZE: usize = 4096;

/// Terminal geometry for new sessions.
pub const DEFAULT_ROWS: u16 = 30;
pub const DEFAULT_COLS: u16 = 120;

/// Requests sent to the PTY writer task.
#[derive(Debug)]
enum WriteRequest {
    Bytes(Vec<u8>),
    Resize { rows: u16, cols: u16 },
}

/// Events emitted by the PTY reader task.
#[derive(Debug)]
pub enum PtyEvent {
    /// A raw output chunk.
    Output(Vec<u8>),
    /// The child exited or the PTY closed.
    Exited,
}

/// Spawn parameters for a session PTY.
#[derive(Debug)]
pub struct SpawnOptions<'a> {
    pub cwd: &'a Path,
    /// Extra environment for the shell (session id, sparse marker).
    pub env: Vec<(String, String)>,
    /// Variables stripped so nested agent runs are permitted.
    pub remove_env: &'a [&'a str],
}

/// Handle to a live PTY. Cloneable; all writes go through the writer task.
#[derive(Debug, Clone)]
pub struct PtyHandle {
    write_tx: mpsc::Sender<WriteRequest>,
    cancel: CancellationToken,
}

impl PtyHandle {
    /// Queue bytes for the PTY.
    ///
    /// # Errors
    ///
    /// Returns an error when the writer task has shut down.
    pub async fn write(&self, data: Vec<u8>) -> anyhow::Result<()> {
        self.write_tx
            .send(WriteRequest::Bytes(data))
            .await
            .map_err(|_| anyhow::anyhow!("PTY write channel closed"))
    }

    /// Resize the terminal.
    pub async fn resize(&self, rows: u16, cols: u16) {
        let _ = self
            .write_tx
            .send(WriteRequest::Resize { rows, cols })
            .await;
    }

    /// Tear down the reader/writer tasks and kill the child.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// A handle with no backing tasks, for exercising PTY-present code paths
    /// in tests.
    #[cfg(test)]
    pub(crate) fn stub() -> Self {
        let (write_tx, mut write_rx) = mpsc::channel::<WriteRequest>(1);
        tokio::spawn(async move { while write_rx.recv().await.is_some() {} });
        Self {
            write_tx,
            cancel: CancellationToken::new(),
        }
    }
}

/// Spawn a bash shell on a fresh PTY.
///
/// Returns the handle and the event stream the caller must drain.
///
/// # Errors
///
/// Returns an error if the PTY cannot be opened or the shell fails to spawn.
pub fn spawn(options: &SpawnOptions<'_>) -> anyhow::Result<(PtyHandle, mpsc::Receiver<PtyEvent>)> {
    let (pty, pts) = pty_process::open()?;
    pty.resize(pty_process::Size::new(DEFAULT_ROWS, DEFAULT_COLS))?;

    let mut cmd = pty_process::Command::new("bash").env("TERM", "xterm-256color");
    for (key, value) in &options.env {
        cmd = cmd.env(key, value);
    }
    for key in options.remove_env {
        cmd = cmd.env_remove(key);
    }
    let child = cmd.current_dir(options.cwd).spawn(pts)?;

    let (pty_reader, pty_writer) = pty.into_split();
    let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_SIZE);
    let (event_tx, event_rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);
    let cancel = CancellationToken::new();

    // Reader task: forward chunks until EOF or shutdown, then reap the child.
    {
        let cancel = cancel.clone();
        let mut reader = pty_reader;
        let mut child = child;
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                tokio::select! {
                    result = reader.read(&mut buf) => {
                        match result {
                            Ok(0) => break,
                            Ok(n) => {
                                if event_tx.send(PtyEvent::Output(buf[..n].to_vec())).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::debug!(error = %err, "PTY read ended");
                                break;
                            }
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }

            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = event_tx.send(PtyEvent::Exited).await;
        });
    }

    tokio::spawn(writer_loop(pty_writer, write_rx, cancel.clone()));

    Ok((PtyHandle { write_tx, cancel }, event_rx))
}

async fn writer_loop(
    mut writer: pty_process::OwnedWritePty,
    mut write_rx: mpsc::Receiver<WriteRequest>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            request = write_rx.recv() => {
                match request {
                    Some(WriteRequest::Bytes(bytes)) => {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(WriteRequest::Resize { rows, cols }) => {
                        if writer.resize(pty_process::Size::new(rows, cols)).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}
