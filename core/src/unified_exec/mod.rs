//! Unified Exec: interactive PTY execution orchestrated with approvals +
//! sandboxing.
//!
//! Responsibilities
//! - Manages interactive PTY sessions (create, reuse, buffer output with
//!   caps, evict under capacity pressure).
//! - Uses the shared ToolOrchestrator to handle approval, sandbox selection,
//!   and retry semantics in a single, descriptive flow.
//! - Spawns the PTY from a sandbox-transformed `ExecEnv`; on sandbox denial,
//!   retries without sandbox when policy allows (no re-prompt thanks to
//!   caching).
//!
//! Flow at a glance (open session)
//! 1) Build a small request `{ command, cwd, env }`.
//! 2) Orchestrator: approval (bypass/cache/prompt) → select sandbox → run.
//! 3) Runtime: transform `CommandSpec` → `ExecEnv` → spawn PTY.
//! 4) If denial, orchestrator retries with `SandboxType::None`.
//! 5) Session is returned with streaming output + metadata.
//!
//! This keeps policy logic and user interaction centralized while the
//! PTY/session concerns remain isolated here. The implementation is split
//! between:
//! - `session.rs`: PTY session lifecycle + output buffering.
//! - `session_manager.rs`: orchestration (approvals, sandboxing, reuse,
//!   pruning) and request handling.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::tandem::Session;
use crate::tandem::TurnContext;

mod errors;
pub(crate) mod session;
mod session_manager;

pub use errors::UnifiedExecError;

pub(crate) const DEFAULT_YIELD_TIME_MS: u64 = 10_000;
pub(crate) const MIN_YIELD_TIME_MS: u64 = 250;
pub(crate) const MAX_YIELD_TIME_MS: u64 = 30_000;
pub(crate) const DEFAULT_MAX_OUTPUT_TOKENS: usize = 10_000;
pub(crate) const UNIFIED_EXEC_OUTPUT_MAX_BYTES: usize = 1024 * 1024; // 1 MiB
pub(crate) const MAX_UNIFIED_EXEC_SESSIONS: usize = 32;
pub(crate) const PRUNE_PROTECTED_RECENT_SESSIONS: usize = 8;
pub(crate) const POST_EXIT_OUTPUT_GRACE: Duration = Duration::from_millis(25);

/// Binds a tool call to its owning session and turn.
pub struct UnifiedExecContext {
    pub session: Arc<Session>,
    pub turn: Arc<TurnContext>,
    pub call_id: String,
}

#[derive(Debug)]
pub struct ExecCommandRequest<'a> {
    /// Full argv of the command to run (for a new session) or of the session
    /// being continued.
    pub command: &'a [String],
    /// `Some` resumes an existing session; `None` starts a new one.
    pub process_id: Option<&'a str>,
    /// Overrides the turn's working directory.
    pub workdir: Option<&'a Path>,
    pub yield_time_ms: Option<u64>,
    pub max_output_tokens: Option<usize>,
    pub with_escalated_permissions: Option<bool>,
    pub justification: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedExecResponse {
    /// The call this chunk of output belongs to.
    pub event_call_id: String,
    /// Correlates this drained chunk back to its originating call.
    pub chunk_id: String,
    pub wall_time: Duration,
    pub output: String,
    /// Present while the process is still running; continue with this id.
    pub process_id: Option<String>,
    /// Present once the process has exited.
    pub exit_code: Option<i32>,
    /// Token count of the drained output before truncation.
    pub original_token_count: usize,
}

/// How process ids are generated. `Deterministic` assigns the smallest
/// unused integer >= 1000 and exists so tests and recorded sessions are
/// reproducible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessIdPolicy {
    #[default]
    Random,
    Deterministic,
}

pub struct UnifiedExecSessionManager {
    id_policy: ProcessIdPolicy,
    /// Guards the session table. Held only for lookup/insert/remove, never
    /// across I/O; and never together with `used_process_ids`.
    sessions: Mutex<HashMap<String, SessionEntry>>,
    used_process_ids: StdMutex<HashSet<String>>,
}

impl Default for UnifiedExecSessionManager {
    fn default() -> Self {
        Self::new(ProcessIdPolicy::default())
    }
}

impl UnifiedExecSessionManager {
    pub fn new(id_policy: ProcessIdPolicy) -> Self {
        Self {
            id_policy,
            sessions: Mutex::new(HashMap::new()),
            used_process_ids: StdMutex::new(HashSet::new()),
        }
    }

    pub fn with_deterministic_ids() -> Self {
        Self::new(ProcessIdPolicy::Deterministic)
    }

    /// Allocate a process id that has never been handed out by this manager.
    /// Synchronous by design: holds only the id-set lock and performs no I/O.
    pub fn allocate_process_id(&self) -> String {
        let mut used = match self.used_process_ids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            let candidate = match self.id_policy {
                ProcessIdPolicy::Random => rand::rng().random_range(1_000..100_000).to_string(),
                ProcessIdPolicy::Deterministic => {
                    let next = used
                        .iter()
                        .filter_map(|id| id.parse::<u64>().ok())
                        .max()
                        .map_or(1_000, |max| max.max(999) + 1);
                    next.to_string()
                }
            };
            if used.insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}

pub(crate) struct SessionEntry {
    pub(crate) session: session::UnifiedExecSession,
    pub(crate) call_id: String,
    pub(crate) sub_id: String,
    pub(crate) command: Vec<String>,
    pub(crate) cwd: PathBuf,
    pub(crate) started_at: Instant,
    /// Monotonically non-decreasing; bumped on every continuation and
    /// `write_stdin`.
    pub(crate) last_used: Instant,
}

pub(crate) fn clamp_yield_time(yield_time_ms: Option<u64>) -> u64 {
    match yield_time_ms {
        Some(value) => value.clamp(MIN_YIELD_TIME_MS, MAX_YIELD_TIME_MS),
        None => DEFAULT_YIELD_TIME_MS,
    }
}

pub(crate) fn resolve_max_tokens(max_tokens: Option<usize>) -> usize {
    max_tokens.unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS)
}

pub(crate) fn generate_chunk_id() -> String {
    let mut rng = rand::rng();
    (0..6)
        .map(|_| format!("{:x}", rng.random_range(0..16)))
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use super::session::OutputBufferState;

    #[test]
    fn push_chunk_trims_only_excess_bytes() {
        let mut buffer = OutputBufferState::default();
        buffer.push_chunk(vec![b'a'; UNIFIED_EXEC_OUTPUT_MAX_BYTES]);
        buffer.push_chunk(vec![b'b']);
        buffer.push_chunk(vec![b'c']);

        assert_eq!(buffer.total_bytes, UNIFIED_EXEC_OUTPUT_MAX_BYTES);
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(
            snapshot.first().map(Vec::len),
            Some(UNIFIED_EXEC_OUTPUT_MAX_BYTES - 2)
        );
        assert_eq!(snapshot.get(1), Some(&vec![b'b']));
        assert_eq!(snapshot.get(2), Some(&vec![b'c']));
        assert!(buffer.was_truncated());
    }

    #[test]
    fn yield_time_is_clamped_to_sane_bounds() {
        assert_eq!(clamp_yield_time(None), DEFAULT_YIELD_TIME_MS);
        assert_eq!(clamp_yield_time(Some(0)), MIN_YIELD_TIME_MS);
        assert_eq!(clamp_yield_time(Some(100)), MIN_YIELD_TIME_MS);
        assert_eq!(clamp_yield_time(Some(5_000)), 5_000);
        assert_eq!(clamp_yield_time(Some(u64::MAX)), MAX_YIELD_TIME_MS);
    }

    #[test]
    fn deterministic_ids_count_up_from_1000() {
        let manager = UnifiedExecSessionManager::with_deterministic_ids();
        assert_eq!(manager.allocate_process_id(), "1000");
        assert_eq!(manager.allocate_process_id(), "1001");
        assert_eq!(manager.allocate_process_id(), "1002");
    }

    #[test]
    fn random_ids_are_unique_and_short_numeric() {
        let manager = UnifiedExecSessionManager::default();
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let id = manager.allocate_process_id();
            let numeric: u64 = id.parse().expect("numeric id");
            assert!((1_000..100_000).contains(&numeric));
            assert!(seen.insert(id), "allocator repeated an id");
        }
    }
}
