//! Thin wrapper around `portable-pty` that spawns a process on a fresh PTY
//! and exposes it through async channels: an mpsc sender for stdin, a
//! broadcast stream of output chunks, and a watch channel that resolves to
//! the exit code.
//!
//! The PTY is plumbed by three plain OS threads (read pump, write pump,
//! child wait). Threads rather than blocking tasks keep runtime shutdown
//! independent of child lifetime: dropping every handle detaches the caller
//! from the process without terminating it.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;

const PTY_ROWS: u16 = 24;
const PTY_COLS: u16 = 80;
const READ_BUFFER_BYTES: usize = 8192;
const WRITER_CHANNEL_CAPACITY: usize = 128;
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Handles for a process spawned on a PTY.
///
/// Dropping this struct does not terminate the child; the pump threads keep
/// running until the process exits on its own.
pub struct SpawnedPty {
    /// Bytes sent here are written to the PTY master (the child's stdin).
    pub writer_tx: mpsc::Sender<Vec<u8>>,
    /// Output chunks as read from the PTY master.
    pub output_rx: broadcast::Receiver<Vec<u8>>,
    /// `None` while the child is running; `Some(code)` once it has exited.
    pub exit_rx: watch::Receiver<Option<i32>>,
}

/// Spawn `program` with `args` on a new PTY rooted at `cwd`.
///
/// The child's environment is exactly `env`; nothing is inherited from this
/// process.
pub async fn spawn_pty_process(
    program: &str,
    args: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
) -> anyhow::Result<SpawnedPty> {
    let pty_system = native_pty_system();
    let pair = pty_system.openpty(PtySize {
        rows: PTY_ROWS,
        cols: PTY_COLS,
        pixel_width: 0,
        pixel_height: 0,
    })?;

    let mut command_builder = CommandBuilder::new(program);
    command_builder.cwd(cwd);
    command_builder.env_clear();
    for (key, value) in env {
        command_builder.env(key, value);
    }
    for arg in args {
        command_builder.arg(arg);
    }

    let mut child = pair.slave.spawn_command(command_builder)?;
    // The slave end is owned by the child now; keeping our copy open would
    // hold the PTY line discipline alive after the child exits.
    drop(pair.slave);

    let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);
    let (output_tx, output_rx) = broadcast::channel::<Vec<u8>>(OUTPUT_CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = watch::channel::<Option<i32>>(None);

    let mut reader = pair.master.try_clone_reader()?;
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_BUFFER_BYTES];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
                Err(_) => break,
            }
        }
    });

    let mut writer = pair.master.take_writer()?;
    std::thread::spawn(move || {
        while let Some(bytes) = writer_rx.blocking_recv() {
            if let Err(err) = writer.write_all(&bytes).and_then(|()| writer.flush()) {
                tracing::debug!("pty stdin write failed: {err}");
                break;
            }
        }
    });

    std::thread::spawn(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(err) => {
                tracing::debug!("pty child wait failed: {err}");
                -1
            }
        };
        let _ = exit_tx.send(Some(code));
    });

    Ok(SpawnedPty {
        writer_tx,
        output_rx,
        exit_rx,
    })
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    async fn collect_until_exit(spawned: &mut SpawnedPty) -> Vec<u8> {
        let mut collected = Vec::new();
        loop {
            tokio::select! {
                chunk = spawned.output_rx.recv() => match chunk {
                    Ok(chunk) => collected.extend_from_slice(&chunk),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = spawned.exit_rx.changed() => {
                    // Drain whatever is already buffered, then stop.
                    while let Ok(chunk) = spawned.output_rx.try_recv() {
                        collected.extend_from_slice(&chunk);
                    }
                    break;
                }
            }
        }
        collected
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn captures_output_and_exit_code() -> anyhow::Result<()> {
        let mut spawned = spawn_pty_process(
            "/bin/sh",
            &["-c".to_string(), "echo pty-hello".to_string()],
            Path::new("/"),
            &HashMap::new(),
        )
        .await?;

        let output = collect_until_exit(&mut spawned).await;
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("pty-hello"), "unexpected output: {text}");

        // The exit notification can race the final output flush.
        let _ = spawned.exit_rx.wait_for(Option::is_some).await;
        assert_eq!(*spawned.exit_rx.borrow(), Some(0));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reports_nonzero_exit() -> anyhow::Result<()> {
        let mut spawned = spawn_pty_process(
            "/bin/sh",
            &["-c".to_string(), "exit 7".to_string()],
            Path::new("/"),
            &HashMap::new(),
        )
        .await?;

        collect_until_exit(&mut spawned).await;
        // The exit notification can race the final output flush.
        let _ = spawned.exit_rx.wait_for(Option::is_some).await;
        assert_eq!(*spawned.exit_rx.borrow(), Some(7));
        Ok(())
    }
}
