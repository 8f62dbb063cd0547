use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::SandboxErr;
use crate::error::TandemErr;
use crate::exec_env::create_env;
use crate::sandboxing::ExecEnv;
use crate::sandboxing::assessment::assess_command;
use crate::sandboxing::is_denial_shaped_error;
use crate::tools::orchestrator::ToolOrchestrator;
use crate::tools::runtimes::unified_exec::UnifiedExecRequest as UnifiedExecToolRequest;
use crate::tools::runtimes::unified_exec::UnifiedExecRuntime;
use crate::tools::sandboxing::ToolCtx;
use crate::tools::sandboxing::ToolError;
use crate::tools::sandboxing::create_approval_requirement;
use crate::truncate::approx_token_count;
use crate::truncate::truncate_text_to_tokens;

use super::ExecCommandRequest;
use super::MAX_UNIFIED_EXEC_SESSIONS;
use super::POST_EXIT_OUTPUT_GRACE;
use super::PRUNE_PROTECTED_RECENT_SESSIONS;
use super::SessionEntry;
use super::UnifiedExecContext;
use super::UnifiedExecError;
use super::UnifiedExecResponse;
use super::UnifiedExecSessionManager;
use super::clamp_yield_time;
use super::generate_chunk_id;
use super::resolve_max_tokens;
use super::session::OutputBuffer;
use super::session::UnifiedExecSession;

enum SessionStatus {
    Alive,
    Exited { exit_code: Option<i32> },
    Unknown,
}

impl UnifiedExecSessionManager {
    /// Start a new command or continue an existing session, draining output
    /// until the caller's deadline.
    pub async fn exec_command(
        &self,
        request: ExecCommandRequest<'_>,
        context: &UnifiedExecContext,
    ) -> Result<UnifiedExecResponse, UnifiedExecError> {
        match request.process_id {
            Some(process_id) => self.continue_command(process_id, &request, context).await,
            None => self.start_command(&request, context).await,
        }
    }

    async fn start_command(
        &self,
        request: &ExecCommandRequest<'_>,
        context: &UnifiedExecContext,
    ) -> Result<UnifiedExecResponse, UnifiedExecError> {
        let cwd = request
            .workdir
            .map_or_else(|| context.turn.cwd.clone(), Path::to_path_buf);

        let session = self
            .open_session_with_sandbox(
                request.command,
                &cwd,
                request.with_escalated_permissions,
                request.justification,
                context,
            )
            .await?;

        let max_tokens = resolve_max_tokens(request.max_output_tokens);
        let yield_time_ms = clamp_yield_time(request.yield_time_ms);

        let start = Instant::now();
        let (output_buffer, output_notify) = session.output_handles();
        let exit_token = session.exit_token();
        let deadline = start + Duration::from_millis(yield_time_ms);
        let collected = Self::collect_output_until_deadline(
            &output_buffer,
            &output_notify,
            &exit_token,
            deadline,
        )
        .await;
        let wall_time = Instant::now().saturating_duration_since(start);

        let text = String::from_utf8_lossy(&collected).to_string();
        let original_token_count = approx_token_count(&text);
        let output = truncate_text_to_tokens(&text, max_tokens);
        let exit_code = session.exit_code();
        let process_id = if session.has_exited() {
            None
        } else {
            Some(
                self.store_session(session, context, request.command, cwd, start)
                    .await,
            )
        };

        Ok(UnifiedExecResponse {
            event_call_id: context.call_id.clone(),
            chunk_id: generate_chunk_id(),
            wall_time,
            output,
            process_id,
            exit_code,
            original_token_count,
        })
    }

    async fn continue_command(
        &self,
        process_id: &str,
        request: &ExecCommandRequest<'_>,
        context: &UnifiedExecContext,
    ) -> Result<UnifiedExecResponse, UnifiedExecError> {
        let (output_buffer, output_notify, exit_token) = {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(process_id) else {
                return Err(UnifiedExecError::unknown_session_id(process_id));
            };
            entry.last_used = Instant::now();
            let (buffer, notify) = entry.session.output_handles();
            (buffer, notify, entry.session.exit_token())
        };

        let max_tokens = resolve_max_tokens(request.max_output_tokens);
        let yield_time_ms = clamp_yield_time(request.yield_time_ms);
        let start = Instant::now();
        let deadline = start + Duration::from_millis(yield_time_ms);
        let collected = Self::collect_output_until_deadline(
            &output_buffer,
            &output_notify,
            &exit_token,
            deadline,
        )
        .await;
        let wall_time = Instant::now().saturating_duration_since(start);

        let text = String::from_utf8_lossy(&collected).to_string();
        let original_token_count = approx_token_count(&text);
        let output = truncate_text_to_tokens(&text, max_tokens);

        let (process_id, exit_code) = match self.refresh_session_state(process_id).await {
            SessionStatus::Alive => (Some(process_id.to_string()), None),
            SessionStatus::Exited { exit_code } => (None, exit_code),
            // Evicted while we were collecting; nothing left to continue.
            SessionStatus::Unknown => (None, None),
        };

        Ok(UnifiedExecResponse {
            event_call_id: context.call_id.clone(),
            chunk_id: generate_chunk_id(),
            wall_time,
            output,
            process_id,
            exit_code,
            original_token_count,
        })
    }

    async fn refresh_session_state(&self, process_id: &str) -> SessionStatus {
        let mut sessions = self.sessions.lock().await;
        let exited = match sessions.get(process_id) {
            Some(entry) => entry.session.has_exited(),
            None => return SessionStatus::Unknown,
        };

        if exited {
            match sessions.remove(process_id) {
                Some(entry) => {
                    tracing::debug!(
                        process_id,
                        call_id = %entry.call_id,
                        sub_id = %entry.sub_id,
                        "unified exec session exited"
                    );
                    SessionStatus::Exited {
                        exit_code: entry.session.exit_code(),
                    }
                }
                None => SessionStatus::Unknown,
            }
        } else {
            if let Some(entry) = sessions.get_mut(process_id) {
                entry.last_used = Instant::now();
            }
            SessionStatus::Alive
        }
    }

    /// Forward `data` to a live session's stdin. The table lock covers only
    /// the lookup; the write itself happens on the session's own channel.
    pub async fn write_stdin(&self, process_id: &str, data: &str) -> Result<(), UnifiedExecError> {
        let writer_tx = {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(process_id) else {
                return Err(UnifiedExecError::unknown_session_id(process_id));
            };
            if entry.session.has_exited() {
                // A session with a recorded exit code is never written to
                // again.
                sessions.remove(process_id);
                return Err(UnifiedExecError::unknown_session_id(process_id));
            }
            entry.last_used = Instant::now();
            entry.session.writer_sender()
        };

        if !data.is_empty() {
            writer_tx
                .send(data.as_bytes().to_vec())
                .await
                .map_err(|_| UnifiedExecError::WriteToStdin)?;
        }
        Ok(())
    }

    pub(crate) async fn open_session_with_exec_env(
        &self,
        env: &ExecEnv,
    ) -> Result<UnifiedExecSession, UnifiedExecError> {
        let (program, args) = env
            .command
            .split_first()
            .ok_or(UnifiedExecError::MissingCommandLine)?;
        let spawned =
            tandem_utils_pty::spawn_pty_process(program, args, env.cwd.as_path(), &env.env)
                .await
                .map_err(|err| {
                    let message = err.to_string();
                    if is_denial_shaped_error(env.sandbox, &message) {
                        UnifiedExecError::SandboxDenied { reason: message }
                    } else {
                        UnifiedExecError::create_session(message)
                    }
                })?;
        UnifiedExecSession::from_spawned(spawned, env.sandbox).await
    }

    pub(super) async fn open_session_with_sandbox(
        &self,
        command: &[String],
        cwd: &Path,
        with_escalated_permissions: Option<bool>,
        justification: Option<&str>,
        context: &UnifiedExecContext,
    ) -> Result<UnifiedExecSession, UnifiedExecError> {
        if command.is_empty() {
            return Err(UnifiedExecError::MissingCommandLine);
        }

        let assessment = assess_command(command);
        let requirement = create_approval_requirement(
            context.turn.approval_policy,
            assessment.risk,
            with_escalated_permissions,
        );

        let mut orchestrator = ToolOrchestrator::new();
        let mut runtime = UnifiedExecRuntime::new(self);
        let req = UnifiedExecToolRequest::new(
            command.to_vec(),
            cwd.to_path_buf(),
            create_env(&context.turn.shell_environment_policy),
            with_escalated_permissions,
            justification.map(str::to_string),
            requirement,
        );
        let tool_ctx = ToolCtx {
            session: context.session.as_ref(),
            turn: context.turn.as_ref(),
            call_id: context.call_id.clone(),
            tool_name: "exec_command".to_string(),
        };
        orchestrator
            .run(
                &mut runtime,
                &req,
                &tool_ctx,
                context.turn.as_ref(),
                context.turn.approval_policy,
                Some(assessment.risk),
            )
            .await
            .map_err(|err| match err {
                ToolError::Tandem(TandemErr::Sandbox(SandboxErr::Denied { reason })) => {
                    UnifiedExecError::SandboxDenied { reason }
                }
                ToolError::Tandem(TandemErr::Sandbox(SandboxErr::Transform(message)))
                | ToolError::Tandem(TandemErr::Sandbox(SandboxErr::Application(message))) => {
                    UnifiedExecError::SandboxTransform { message }
                }
                other => UnifiedExecError::create_session(other.to_string()),
            })
    }

    async fn store_session(
        &self,
        session: UnifiedExecSession,
        context: &UnifiedExecContext,
        command: &[String],
        cwd: PathBuf,
        started_at: Instant,
    ) -> String {
        // The id-set lock inside allocate_process_id is released before the
        // table lock is taken; the two are never held together.
        let process_id = self.allocate_process_id();
        let entry = SessionEntry {
            session,
            call_id: context.call_id.clone(),
            sub_id: context.turn.sub_id.clone(),
            command: command.to_vec(),
            cwd,
            started_at,
            last_used: started_at,
        };
        let mut sessions = self.sessions.lock().await;
        prune_sessions_if_needed(&mut sessions);
        sessions.insert(process_id.clone(), entry);
        process_id
    }

    /// Drain buffered output until `deadline`. Event-driven: when the buffer
    /// is empty we wait for new output or process exit, whichever fires
    /// first, bounded by the time remaining. Once the exit signal has fired,
    /// waits are capped by a short grace so a final flush is still caught
    /// without burning the whole deadline.
    pub(super) async fn collect_output_until_deadline(
        output_buffer: &OutputBuffer,
        output_notify: &Arc<Notify>,
        exit_token: &CancellationToken,
        deadline: Instant,
    ) -> Vec<u8> {
        let mut collected: Vec<u8> = Vec::with_capacity(4096);
        let mut exit_signalled = exit_token.is_cancelled();

        loop {
            let drained_chunks;
            let mut wait_for_output = None;
            {
                let mut guard = output_buffer.lock().await;
                drained_chunks = guard.drain();
                if drained_chunks.is_empty() {
                    // Register interest while still holding the lock so a
                    // chunk pushed right after the drain is not missed.
                    wait_for_output = Some(output_notify.notified());
                }
            }

            if drained_chunks.is_empty() {
                exit_signalled = exit_signalled || exit_token.is_cancelled();
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining == Duration::ZERO {
                    break;
                }

                let notified = wait_for_output.unwrap_or_else(|| output_notify.notified());
                tokio::pin!(notified);

                if exit_signalled {
                    let grace = remaining.min(POST_EXIT_OUTPUT_GRACE);
                    match tokio::time::timeout(grace, &mut notified).await {
                        Ok(()) => continue,
                        Err(_) => break,
                    }
                }

                tokio::select! {
                    _ = &mut notified => {}
                    _ = exit_token.cancelled() => {
                        exit_signalled = true;
                    }
                    _ = tokio::time::sleep(remaining) => break,
                }
                continue;
            }

            for chunk in drained_chunks {
                collected.extend_from_slice(&chunk);
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        collected
    }
}

/// Make room for one more entry when the table has hit its ceiling.
fn prune_sessions_if_needed(sessions: &mut HashMap<String, SessionEntry>) {
    if sessions.len() < MAX_UNIFIED_EXEC_SESSIONS {
        return;
    }

    let meta: Vec<(String, Instant, bool)> = sessions
        .iter()
        .map(|(id, entry)| (id.clone(), entry.last_used, entry.session.has_exited()))
        .collect();

    if let Some(process_id) = session_id_to_prune(&meta) {
        if let Some(entry) = sessions.remove(&process_id) {
            // Bookkeeping only; a still-running process is left alone.
            tracing::info!(
                process_id = %process_id,
                command = ?entry.command,
                cwd = %entry.cwd.display(),
                age = ?entry.started_at.elapsed(),
                "evicted unified exec session entry"
            );
        }
    }
}

/// Pick the entry to evict: the most recently used entries are protected
/// outright; among the rest, prefer the least-recently-used exited session,
/// falling back to the least-recently-used entry of any status.
fn session_id_to_prune(meta: &[(String, Instant, bool)]) -> Option<String> {
    if meta.is_empty() {
        return None;
    }

    let mut by_recency: Vec<&(String, Instant, bool)> = meta.iter().collect();
    by_recency.sort_by(|a, b| b.1.cmp(&a.1));

    let unprotected = by_recency
        .get(PRUNE_PROTECTED_RECENT_SESSIONS..)
        .unwrap_or_default();

    if let Some((id, _, _)) = unprotected.iter().rev().find(|(_, _, exited)| *exited) {
        return Some(id.clone());
    }
    unprotected.last().map(|(id, _, _)| id.clone())
}
