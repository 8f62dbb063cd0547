//! PTY session lifecycle + output buffering.
//!
//! A `UnifiedExecSession` owns the channel ends of one spawned PTY process:
//! a bounded ring of output chunks fed by a pump task, a `Notify` that wakes
//! collectors when new output lands, a cancellation token that fires when
//! the process exits, and the stdin writer.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use tandem_utils_pty::SpawnedPty;

use crate::sandboxing::SandboxType;
use crate::sandboxing::is_likely_sandbox_denied;
use crate::unified_exec::UNIFIED_EXEC_OUTPUT_MAX_BYTES;
use crate::unified_exec::UnifiedExecError;

/// How long after spawn a sandboxed process gets to fail fast before we stop
/// watching for a denial-shaped exit.
const SANDBOX_DENIAL_EXIT_WINDOW: Duration = Duration::from_millis(100);

#[derive(Default)]
pub(crate) struct OutputBufferState {
    chunks: VecDeque<Vec<u8>>,
    pub(crate) total_bytes: usize,
    truncated_prefix: bool,
}

impl OutputBufferState {
    pub(crate) fn push_chunk(&mut self, chunk: Vec<u8>) {
        self.total_bytes = self.total_bytes.saturating_add(chunk.len());
        self.chunks.push_back(chunk);

        let mut excess = self
            .total_bytes
            .saturating_sub(UNIFIED_EXEC_OUTPUT_MAX_BYTES);

        while excess > 0 {
            match self.chunks.front_mut() {
                Some(front) if excess >= front.len() => {
                    excess -= front.len();
                    self.total_bytes = self.total_bytes.saturating_sub(front.len());
                    self.chunks.pop_front();
                    self.truncated_prefix = true;
                }
                Some(front) => {
                    front.drain(..excess);
                    self.total_bytes = self.total_bytes.saturating_sub(excess);
                    self.truncated_prefix = true;
                    break;
                }
                None => break,
            }
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<Vec<u8>> {
        let drained: Vec<Vec<u8>> = self.chunks.drain(..).collect();
        self.total_bytes = 0;
        drained
    }

    pub(crate) fn snapshot(&self) -> Vec<Vec<u8>> {
        self.chunks.iter().cloned().collect()
    }

    pub(crate) fn was_truncated(&self) -> bool {
        self.truncated_prefix
    }
}

pub(crate) type OutputBuffer = Arc<Mutex<OutputBufferState>>;
pub(crate) type OutputHandles = (OutputBuffer, Arc<Notify>);

pub(crate) struct UnifiedExecSession {
    writer_tx: mpsc::Sender<Vec<u8>>,
    output_buffer: OutputBuffer,
    output_notify: Arc<Notify>,
    exit_token: CancellationToken,
    exit_rx: watch::Receiver<Option<i32>>,
    output_task: JoinHandle<()>,
    exit_task: JoinHandle<()>,
}

impl UnifiedExecSession {
    /// Wire up buffering and exit tracking for a freshly spawned PTY. When
    /// running under a sandbox, a process that dies almost immediately with
    /// a denial-shaped exit code is reported as `SandboxDenied`.
    pub(crate) async fn from_spawned(
        spawned: SpawnedPty,
        sandbox: SandboxType,
    ) -> Result<Self, UnifiedExecError> {
        let SpawnedPty {
            writer_tx,
            mut output_rx,
            exit_rx,
        } = spawned;

        let output_buffer: OutputBuffer = Arc::new(Mutex::new(OutputBufferState::default()));
        let output_notify = Arc::new(Notify::new());
        let exit_token = CancellationToken::new();

        let buffer_clone = Arc::clone(&output_buffer);
        let notify_clone = Arc::clone(&output_notify);
        let output_task = tokio::spawn(async move {
            loop {
                match output_rx.recv().await {
                    Ok(chunk) => {
                        {
                            let mut guard = buffer_clone.lock().await;
                            guard.push_chunk(chunk);
                        }
                        notify_clone.notify_waiters();
                    }
                    // If we lag behind the broadcast buffer, skip missed
                    // messages but keep the task alive to continue streaming.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut exit_watch = exit_rx.clone();
        let token_clone = exit_token.clone();
        let exit_notify = Arc::clone(&output_notify);
        let exit_task = tokio::spawn(async move {
            if exit_watch.borrow().is_none() {
                let _ = exit_watch.wait_for(Option::is_some).await;
            }
            token_clone.cancel();
            // Wake any collector blocked on the output notify so it can
            // observe the exit and switch to the grace window.
            exit_notify.notify_waiters();
        });

        let session = Self {
            writer_tx,
            output_buffer,
            output_notify,
            exit_token,
            exit_rx,
            output_task,
            exit_task,
        };
        session.check_for_sandbox_denial(sandbox).await?;
        Ok(session)
    }

    async fn check_for_sandbox_denial(
        &self,
        sandbox: SandboxType,
    ) -> Result<(), UnifiedExecError> {
        if sandbox == SandboxType::None {
            return Ok(());
        }

        let mut exit_rx = self.exit_rx.clone();
        let exit_code = {
            let exited = tokio::time::timeout(
                SANDBOX_DENIAL_EXIT_WINDOW,
                exit_rx.wait_for(Option::is_some),
            )
            .await;
            match exited {
                Ok(Ok(code)) => (*code).unwrap_or(-1),
                // Still running after the window, or the watch went away: the
                // spawn itself succeeded, so there is nothing to report.
                _ => return Ok(()),
            }
        };

        if is_likely_sandbox_denied(sandbox, exit_code) {
            let chunks = {
                let guard = self.output_buffer.lock().await;
                guard.snapshot()
            };
            let mut output = Vec::new();
            for chunk in chunks {
                output.extend_from_slice(&chunk);
            }
            let text = String::from_utf8_lossy(&output);
            let reason = if text.trim().is_empty() {
                format!("process exited with code {exit_code} under an active sandbox")
            } else {
                text.trim().to_string()
            };
            return Err(UnifiedExecError::SandboxDenied { reason });
        }
        Ok(())
    }

    pub(crate) fn output_handles(&self) -> OutputHandles {
        (
            Arc::clone(&self.output_buffer),
            Arc::clone(&self.output_notify),
        )
    }

    pub(crate) fn exit_token(&self) -> CancellationToken {
        self.exit_token.clone()
    }

    pub(crate) fn writer_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.writer_tx.clone()
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }
}

impl Drop for UnifiedExecSession {
    fn drop(&mut self) {
        // Detach bookkeeping only. The child process (if still running) is
        // left alone; the PTY stays open until it exits.
        self.output_task.abort();
        self.exit_task.abort();
    }
}
