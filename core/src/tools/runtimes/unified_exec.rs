/*
Runtime: unified exec

Handles approval + sandbox orchestration for unified exec requests,
delegating to the session manager to spawn PTYs once an ExecEnv is prepared.
*/

use std::collections::HashMap;
use std::path::PathBuf;

use futures::future::BoxFuture;

use tandem_protocol::ReviewDecision;

use crate::error::SandboxErr;
use crate::error::TandemErr;
use crate::sandboxing::ExecExpiration;
use crate::tools::runtimes::build_command_spec;
use crate::tools::sandboxing::Approvable;
use crate::tools::sandboxing::ApprovalCacheOptions;
use crate::tools::sandboxing::ApprovalCtx;
use crate::tools::sandboxing::ExecApprovalRequirement;
use crate::tools::sandboxing::ProvidesSandboxRetryData;
use crate::tools::sandboxing::SandboxAttempt;
use crate::tools::sandboxing::SandboxOverride;
use crate::tools::sandboxing::SandboxRetryData;
use crate::tools::sandboxing::Sandboxable;
use crate::tools::sandboxing::SandboxablePreference;
use crate::tools::sandboxing::ToolCtx;
use crate::tools::sandboxing::ToolError;
use crate::tools::sandboxing::ToolRuntime;
use crate::tools::sandboxing::with_cached_approval;
use crate::unified_exec::UnifiedExecError;
use crate::unified_exec::UnifiedExecSessionManager;
use crate::unified_exec::session::UnifiedExecSession;

#[derive(Clone, Debug)]
pub(crate) struct UnifiedExecRequest {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub with_escalated_permissions: Option<bool>,
    pub justification: Option<String>,
    pub approval_requirement: ExecApprovalRequirement,
}

impl UnifiedExecRequest {
    pub fn new(
        command: Vec<String>,
        cwd: PathBuf,
        env: HashMap<String, String>,
        with_escalated_permissions: Option<bool>,
        justification: Option<String>,
        approval_requirement: ExecApprovalRequirement,
    ) -> Self {
        Self {
            command,
            cwd,
            env,
            with_escalated_permissions,
            justification,
            approval_requirement,
        }
    }
}

impl ProvidesSandboxRetryData for UnifiedExecRequest {
    fn sandbox_retry_data(&self) -> Option<SandboxRetryData> {
        Some(SandboxRetryData {
            command: self.command.clone(),
            cwd: self.cwd.clone(),
        })
    }
}

#[derive(serde::Serialize, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct ApprovalKey {
    command: Vec<String>,
    cwd: PathBuf,
    escalated: bool,
}

pub(crate) struct UnifiedExecRuntime<'a> {
    manager: &'a UnifiedExecSessionManager,
}

impl<'a> UnifiedExecRuntime<'a> {
    pub fn new(manager: &'a UnifiedExecSessionManager) -> Self {
        Self { manager }
    }
}

impl Sandboxable for UnifiedExecRuntime<'_> {
    fn sandbox_preference(&self) -> SandboxablePreference {
        SandboxablePreference::Auto
    }

    fn escalate_on_failure(&self) -> bool {
        true
    }
}

impl Approvable<UnifiedExecRequest> for UnifiedExecRuntime<'_> {
    type ApprovalKey = ApprovalKey;

    fn approval_key(&self, req: &UnifiedExecRequest) -> Self::ApprovalKey {
        ApprovalKey {
            command: req.command.clone(),
            cwd: req.cwd.clone(),
            escalated: req.with_escalated_permissions.unwrap_or(false),
        }
    }

    fn start_approval_async<'b>(
        &'b mut self,
        req: &'b UnifiedExecRequest,
        ctx: ApprovalCtx<'b>,
    ) -> BoxFuture<'b, ReviewDecision> {
        let key = self.approval_key(req);
        let options = ApprovalCacheOptions {
            reuse_approved: matches!(
                req.approval_requirement,
                ExecApprovalRequirement::AskUnlessCached
            ),
            has_new_justification: ctx.retry_reason.is_some(),
        };
        let command = req.command.clone();
        let cwd = req.cwd.clone();
        let reason = ctx
            .retry_reason
            .clone()
            .or_else(|| req.justification.clone());
        let risk = ctx.risk;
        let session = ctx.session;
        let turn = ctx.turn;
        let call_id = ctx.call_id.to_string();
        Box::pin(async move {
            with_cached_approval(&session.services, key, options, move || async move {
                session
                    .request_command_approval(turn, &call_id, &command, &cwd, reason, risk)
                    .await
            })
            .await
        })
    }

    fn exec_approval_requirement(&self, req: &UnifiedExecRequest) -> Option<ExecApprovalRequirement> {
        Some(req.approval_requirement.clone())
    }

    fn sandbox_mode_for_first_attempt(&self, req: &UnifiedExecRequest) -> SandboxOverride {
        if req.with_escalated_permissions.unwrap_or(false)
            || matches!(
                req.approval_requirement,
                ExecApprovalRequirement::Skip {
                    bypass_sandbox: true,
                }
            )
        {
            SandboxOverride::BypassSandboxFirstAttempt
        } else {
            SandboxOverride::NoOverride
        }
    }
}

impl ToolRuntime<UnifiedExecRequest, UnifiedExecSession> for UnifiedExecRuntime<'_> {
    async fn run(
        &mut self,
        req: &UnifiedExecRequest,
        attempt: &SandboxAttempt<'_>,
        _ctx: &ToolCtx<'_>,
    ) -> Result<UnifiedExecSession, ToolError> {
        let spec = build_command_spec(
            &req.command,
            &req.cwd,
            &req.env,
            ExecExpiration::DefaultTimeout,
            req.with_escalated_permissions,
            req.justification.clone(),
        )
        .map_err(|_| ToolError::Rejected("missing command line for PTY".to_string()))?;
        let exec_env = attempt.env_for(spec).map_err(ToolError::Tandem)?;
        self.manager
            .open_session_with_exec_env(&exec_env)
            .await
            .map_err(|err| match err {
                UnifiedExecError::SandboxDenied { reason } => {
                    ToolError::Tandem(TandemErr::Sandbox(SandboxErr::Denied { reason }))
                }
                UnifiedExecError::SandboxTransform { message } => {
                    ToolError::Tandem(TandemErr::Sandbox(SandboxErr::Application(message)))
                }
                other => ToolError::Rejected(other.to_string()),
            })
    }
}
