//! Ambient context for a running agent: the `Session` (long-lived services,
//! one per conversation) and the `TurnContext` (per-turn policies and working
//! directory). The approval channel is injected as a trait object; the core
//! never talks to a UI directly.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;

use tandem_protocol::AskForApproval;
use tandem_protocol::ReviewDecision;
use tandem_protocol::SandboxPolicy;
use tandem_protocol::SandboxRiskLevel;

use crate::exec_env::ShellEnvironmentPolicy;
use crate::tools::sandboxing::ApprovalCache;
use crate::unified_exec::ProcessIdPolicy;
use crate::unified_exec::UnifiedExecSessionManager;

/// Human-in-the-loop channel for command approval. Implementations decide how
/// to present the request (TUI, IDE, headless auto-deny) and return the
/// user's decision.
#[async_trait]
pub trait ApprovalRequester: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn request_command_approval(
        &self,
        turn: &TurnContext,
        call_id: &str,
        command: &[String],
        cwd: &Path,
        reason: Option<String>,
        risk: Option<SandboxRiskLevel>,
    ) -> ReviewDecision;
}

/// Services shared by every turn of a conversation.
pub struct SessionServices {
    pub unified_exec_manager: UnifiedExecSessionManager,
    pub approval_cache: ApprovalCache,
    pub approver: Arc<dyn ApprovalRequester>,
}

pub struct Session {
    pub services: SessionServices,
    conversation_id: String,
}

impl Session {
    pub fn new(approver: Arc<dyn ApprovalRequester>, id_policy: ProcessIdPolicy) -> Self {
        let mut rng = rand::rng();
        let conversation_id: String = (0..12)
            .map(|_| format!("{:x}", rng.random_range(0..16)))
            .collect();
        Self {
            services: SessionServices {
                unified_exec_manager: UnifiedExecSessionManager::new(id_policy),
                approval_cache: ApprovalCache::default(),
                approver: Arc::clone(&approver),
            },
            conversation_id,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub(crate) async fn request_command_approval(
        &self,
        turn: &TurnContext,
        call_id: &str,
        command: &[String],
        cwd: &Path,
        reason: Option<String>,
        risk: Option<SandboxRiskLevel>,
    ) -> ReviewDecision {
        self.services
            .approver
            .request_command_approval(turn, call_id, command, cwd, reason, risk)
            .await
    }
}

/// Per-turn execution context.
pub struct TurnContext {
    pub cwd: PathBuf,
    pub approval_policy: AskForApproval,
    pub sandbox_policy: SandboxPolicy,
    pub shell_environment_policy: ShellEnvironmentPolicy,
    pub sub_id: String,
}

/// Approves every request; the default for non-interactive embedding and for
/// tests that only exercise policies which never prompt.
#[derive(Default)]
pub struct AutoApprover;

#[async_trait]
impl ApprovalRequester for AutoApprover {
    async fn request_command_approval(
        &self,
        _turn: &TurnContext,
        _call_id: &str,
        command: &[String],
        _cwd: &Path,
        _reason: Option<String>,
        _risk: Option<SandboxRiskLevel>,
    ) -> ReviewDecision {
        tracing::debug!(
            "auto-approving command: {}",
            shlex::try_join(command.iter().map(String::as_str)).unwrap_or_default()
        );
        ReviewDecision::Approved
    }
}

#[cfg(any(test, feature = "test-support"))]
pub fn make_session_and_context() -> (Session, TurnContext) {
    let session = Session::new(Arc::new(AutoApprover), ProcessIdPolicy::Deterministic);
    let turn = TurnContext {
        cwd: std::env::temp_dir(),
        approval_policy: AskForApproval::OnFailure,
        sandbox_policy: SandboxPolicy::new_workspace_write_policy(),
        shell_environment_policy: ShellEnvironmentPolicy::default(),
        sub_id: "sub".to_string(),
    };
    (session, turn)
}
