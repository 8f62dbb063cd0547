/*
Module: orchestrator

Runs a tool request through approval, sandbox selection, and execution in one
descriptive flow. Sandbox denial is the only failure with automatic recovery:
a single retry with the sandbox bypassed, gated by a fresh approval request
that carries the denial reason. Everything else surfaces immediately.
*/

use tandem_protocol::AskForApproval;
use tandem_protocol::ReviewDecision;
use tandem_protocol::SandboxPolicy;
use tandem_protocol::SandboxRiskLevel;

use crate::error::SandboxErr;
use crate::error::TandemErr;
use crate::sandboxing::SandboxType;
use crate::sandboxing::get_platform_sandbox;
use crate::tandem::TurnContext;
use crate::tools::sandboxing::Approvable;
use crate::tools::sandboxing::ApprovalCtx;
use crate::tools::sandboxing::ExecApprovalRequirement;
use crate::tools::sandboxing::ProvidesSandboxRetryData;
use crate::tools::sandboxing::SandboxAttempt;
use crate::tools::sandboxing::SandboxOverride;
use crate::tools::sandboxing::Sandboxable;
use crate::tools::sandboxing::SandboxablePreference;
use crate::tools::sandboxing::ToolCtx;
use crate::tools::sandboxing::ToolError;
use crate::tools::sandboxing::ToolRuntime;

pub(crate) struct ToolOrchestrator;

impl ToolOrchestrator {
    pub(crate) fn new() -> Self {
        Self
    }

    pub(crate) async fn run<Rt, Req, Out>(
        &mut self,
        tool: &mut Rt,
        req: &Req,
        tool_ctx: &ToolCtx<'_>,
        turn: &TurnContext,
        approval_policy: AskForApproval,
        risk: Option<SandboxRiskLevel>,
    ) -> Result<Out, ToolError>
    where
        Rt: ToolRuntime<Req, Out> + Sandboxable + Approvable<Req>,
        Req: ProvidesSandboxRetryData,
    {
        let requirement = tool
            .exec_approval_requirement(req)
            .unwrap_or(ExecApprovalRequirement::AskUnlessCached);

        if matches!(
            requirement,
            ExecApprovalRequirement::AlwaysAsk | ExecApprovalRequirement::AskUnlessCached
        ) {
            let ctx = ApprovalCtx {
                session: tool_ctx.session,
                turn,
                call_id: &tool_ctx.call_id,
                retry_reason: None,
                risk,
            };
            match tool.start_approval_async(req, ctx).await {
                ReviewDecision::Approved | ReviewDecision::ApprovedForSession => {}
                ReviewDecision::Denied | ReviewDecision::Abort => {
                    return Err(ToolError::Rejected(
                        "exec command rejected by user".to_string(),
                    ));
                }
            }
        }

        let first_sandbox = match tool.sandbox_mode_for_first_attempt(req) {
            SandboxOverride::BypassSandboxFirstAttempt => SandboxType::None,
            SandboxOverride::NoOverride => match tool.sandbox_preference() {
                SandboxablePreference::Forbidden => SandboxType::None,
                SandboxablePreference::Auto => select_sandbox(&turn.sandbox_policy),
            },
        };

        let attempt = SandboxAttempt {
            sandbox: first_sandbox,
            policy: &turn.sandbox_policy,
        };
        let first_error = match tool.run(req, &attempt, tool_ctx).await {
            Ok(out) => return Ok(out),
            Err(err) => err,
        };

        let denial_reason = match &first_error {
            ToolError::Tandem(TandemErr::Sandbox(SandboxErr::Denied { reason })) => reason.clone(),
            _ => return Err(first_error),
        };
        if first_sandbox == SandboxType::None
            || !tool.escalate_on_failure()
            || approval_policy == AskForApproval::Never
            || req.sandbox_retry_data().is_none()
        {
            return Err(first_error);
        }

        tracing::info!(
            tool = %tool_ctx.tool_name,
            "command failed under the sandbox; requesting approval to retry without it"
        );
        let retry_ctx = ApprovalCtx {
            session: tool_ctx.session,
            turn,
            call_id: &tool_ctx.call_id,
            retry_reason: Some(denial_reason),
            risk,
        };
        match tool.start_approval_async(req, retry_ctx).await {
            ReviewDecision::Approved | ReviewDecision::ApprovedForSession => {}
            ReviewDecision::Denied | ReviewDecision::Abort => {
                return Err(ToolError::Rejected(
                    "retry without sandbox rejected by user".to_string(),
                ));
            }
        }

        let retry_attempt = SandboxAttempt {
            sandbox: SandboxType::None,
            policy: &turn.sandbox_policy,
        };
        tool.run(req, &retry_attempt, tool_ctx).await
    }
}

fn select_sandbox(policy: &SandboxPolicy) -> SandboxType {
    if policy.has_full_disk_write_access() {
        SandboxType::None
    } else {
        get_platform_sandbox().unwrap_or(SandboxType::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tandem::Session;
    use crate::tandem::make_session_and_context;
    use crate::tools::sandboxing::SandboxRetryData;
    use futures::future::BoxFuture;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    struct FakeReq;

    impl ProvidesSandboxRetryData for FakeReq {
        fn sandbox_retry_data(&self) -> Option<SandboxRetryData> {
            Some(SandboxRetryData {
                command: vec!["fake".to_string()],
                cwd: std::env::temp_dir(),
            })
        }
    }

    struct ScriptedRuntime {
        requirement: ExecApprovalRequirement,
        preference: SandboxablePreference,
        results: VecDeque<Result<&'static str, ToolError>>,
        decisions: VecDeque<ReviewDecision>,
        attempts: Vec<SandboxType>,
        approval_reasons: Vec<Option<String>>,
    }

    impl ScriptedRuntime {
        fn new(
            requirement: ExecApprovalRequirement,
            results: Vec<Result<&'static str, ToolError>>,
            decisions: Vec<ReviewDecision>,
        ) -> Self {
            Self {
                requirement,
                preference: SandboxablePreference::Auto,
                results: results.into(),
                decisions: decisions.into(),
                attempts: Vec::new(),
                approval_reasons: Vec::new(),
            }
        }
    }

    fn denied() -> ToolError {
        ToolError::Tandem(TandemErr::Sandbox(SandboxErr::Denied {
            reason: "blocked write to /etc".to_string(),
        }))
    }

    impl Sandboxable for ScriptedRuntime {
        fn sandbox_preference(&self) -> SandboxablePreference {
            self.preference
        }
        fn escalate_on_failure(&self) -> bool {
            true
        }
    }

    impl Approvable<FakeReq> for ScriptedRuntime {
        type ApprovalKey = &'static str;

        fn approval_key(&self, _req: &FakeReq) -> Self::ApprovalKey {
            "fake"
        }

        fn start_approval_async<'a>(
            &'a mut self,
            _req: &'a FakeReq,
            ctx: ApprovalCtx<'a>,
        ) -> BoxFuture<'a, ReviewDecision> {
            self.approval_reasons.push(ctx.retry_reason.clone());
            let decision = self.decisions.pop_front().unwrap_or_default();
            Box::pin(async move { decision })
        }

        fn exec_approval_requirement(&self, _req: &FakeReq) -> Option<ExecApprovalRequirement> {
            Some(self.requirement.clone())
        }

        fn sandbox_mode_for_first_attempt(&self, _req: &FakeReq) -> SandboxOverride {
            SandboxOverride::NoOverride
        }
    }

    impl ToolRuntime<FakeReq, &'static str> for ScriptedRuntime {
        async fn run(
            &mut self,
            _req: &FakeReq,
            attempt: &SandboxAttempt<'_>,
            _ctx: &ToolCtx<'_>,
        ) -> Result<&'static str, ToolError> {
            self.attempts.push(attempt.sandbox);
            self.results
                .pop_front()
                .unwrap_or(Err(ToolError::Rejected("script exhausted".to_string())))
        }
    }

    fn tool_ctx<'a>(session: &'a Session, turn: &'a TurnContext) -> ToolCtx<'a> {
        ToolCtx {
            session,
            turn,
            call_id: "call".to_string(),
            tool_name: "exec_command".to_string(),
        }
    }

    fn skip() -> ExecApprovalRequirement {
        ExecApprovalRequirement::Skip {
            bypass_sandbox: false,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn denial_triggers_exactly_one_bypassed_retry() {
        let (session, turn) = make_session_and_context();
        let mut runtime = ScriptedRuntime::new(skip(), vec![Err(denied()), Ok("done")], vec![]);

        let out = ToolOrchestrator::new()
            .run(
                &mut runtime,
                &FakeReq,
                &tool_ctx(&session, &turn),
                &turn,
                AskForApproval::OnFailure,
                None,
            )
            .await
            .expect("retry should succeed");

        assert_eq!(out, "done");
        assert_eq!(
            runtime.attempts,
            vec![get_platform_sandbox().unwrap_or(SandboxType::None), SandboxType::None]
        );
        // The single approval request belongs to the retry and carries the
        // denial reason.
        assert_eq!(runtime.approval_reasons.len(), 1);
        assert_eq!(
            runtime.approval_reasons[0].as_deref(),
            Some("blocked write to /etc")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_denial_is_fatal() {
        let (session, turn) = make_session_and_context();
        let mut runtime = ScriptedRuntime::new(skip(), vec![Err(denied()), Err(denied())], vec![]);

        let err = ToolOrchestrator::new()
            .run(
                &mut runtime,
                &FakeReq,
                &tool_ctx(&session, &turn),
                &turn,
                AskForApproval::OnFailure,
                None,
            )
            .await
            .expect_err("second denial must not retry again");

        assert!(matches!(
            err,
            ToolError::Tandem(TandemErr::Sandbox(SandboxErr::Denied { .. }))
        ));
        assert_eq!(runtime.attempts.len(), 2);
    }

    #[tokio::test]
    async fn non_denial_failures_are_not_retried() {
        let (session, turn) = make_session_and_context();
        let mut runtime = ScriptedRuntime::new(
            skip(),
            vec![Err(ToolError::Rejected("spawn failed".to_string()))],
            vec![],
        );

        let err = ToolOrchestrator::new()
            .run(
                &mut runtime,
                &FakeReq,
                &tool_ctx(&session, &turn),
                &turn,
                AskForApproval::OnFailure,
                None,
            )
            .await
            .expect_err("generic failure surfaces");

        assert!(matches!(err, ToolError::Rejected(_)));
        assert_eq!(runtime.attempts.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn never_policy_disables_the_retry() {
        let (session, turn) = make_session_and_context();
        let mut runtime = ScriptedRuntime::new(skip(), vec![Err(denied())], vec![]);

        let err = ToolOrchestrator::new()
            .run(
                &mut runtime,
                &FakeReq,
                &tool_ctx(&session, &turn),
                &turn,
                AskForApproval::Never,
                None,
            )
            .await
            .expect_err("denial with Never policy is fatal");

        assert!(matches!(
            err,
            ToolError::Tandem(TandemErr::Sandbox(SandboxErr::Denied { .. }))
        ));
        assert_eq!(runtime.attempts.len(), 1);
        assert!(runtime.approval_reasons.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rejected_retry_approval_stops_the_attempt() {
        let (session, turn) = make_session_and_context();
        let mut runtime =
            ScriptedRuntime::new(skip(), vec![Err(denied())], vec![ReviewDecision::Denied]);

        let err = ToolOrchestrator::new()
            .run(
                &mut runtime,
                &FakeReq,
                &tool_ctx(&session, &turn),
                &turn,
                AskForApproval::OnFailure,
                None,
            )
            .await
            .expect_err("user said no");

        assert!(matches!(err, ToolError::Rejected(_)));
        assert_eq!(runtime.attempts.len(), 1, "no second run after rejection");
    }

    #[tokio::test]
    async fn upfront_denial_never_runs_the_tool() {
        let (session, turn) = make_session_and_context();
        let mut runtime = ScriptedRuntime::new(
            ExecApprovalRequirement::AlwaysAsk,
            vec![Ok("unreachable")],
            vec![ReviewDecision::Denied],
        );

        let err = ToolOrchestrator::new()
            .run(
                &mut runtime,
                &FakeReq,
                &tool_ctx(&session, &turn),
                &turn,
                AskForApproval::OnRequest,
                None,
            )
            .await
            .expect_err("denied up front");

        assert!(matches!(err, ToolError::Rejected(_)));
        assert!(runtime.attempts.is_empty());
    }

    #[tokio::test]
    async fn forbidden_preference_runs_without_a_sandbox() {
        let (session, turn) = make_session_and_context();
        let mut runtime = ScriptedRuntime::new(skip(), vec![Ok("done")], vec![]);
        runtime.preference = SandboxablePreference::Forbidden;

        ToolOrchestrator::new()
            .run(
                &mut runtime,
                &FakeReq,
                &tool_ctx(&session, &turn),
                &turn,
                AskForApproval::OnFailure,
                None,
            )
            .await
            .expect("run succeeds");

        assert_eq!(runtime.attempts, vec![SandboxType::None]);
    }

    #[tokio::test]
    async fn bypass_override_skips_the_sandbox_on_first_attempt() {
        struct BypassRuntime(ScriptedRuntime);
        impl Sandboxable for BypassRuntime {
            fn sandbox_preference(&self) -> SandboxablePreference {
                SandboxablePreference::Auto
            }
            fn escalate_on_failure(&self) -> bool {
                true
            }
        }
        impl Approvable<FakeReq> for BypassRuntime {
            type ApprovalKey = &'static str;
            fn approval_key(&self, req: &FakeReq) -> Self::ApprovalKey {
                self.0.approval_key(req)
            }
            fn start_approval_async<'a>(
                &'a mut self,
                req: &'a FakeReq,
                ctx: ApprovalCtx<'a>,
            ) -> BoxFuture<'a, ReviewDecision> {
                self.0.start_approval_async(req, ctx)
            }
            fn exec_approval_requirement(&self, req: &FakeReq) -> Option<ExecApprovalRequirement> {
                self.0.exec_approval_requirement(req)
            }
            fn sandbox_mode_for_first_attempt(&self, _req: &FakeReq) -> SandboxOverride {
                SandboxOverride::BypassSandboxFirstAttempt
            }
        }
        impl ToolRuntime<FakeReq, &'static str> for BypassRuntime {
            async fn run(
                &mut self,
                req: &FakeReq,
                attempt: &SandboxAttempt<'_>,
                ctx: &ToolCtx<'_>,
            ) -> Result<&'static str, ToolError> {
                self.0.run(req, attempt, ctx).await
            }
        }

        let (session, turn) = make_session_and_context();
        let mut runtime = BypassRuntime(ScriptedRuntime::new(skip(), vec![Ok("done")], vec![]));

        ToolOrchestrator::new()
            .run(
                &mut runtime,
                &FakeReq,
                &tool_ctx(&session, &turn),
                &turn,
                AskForApproval::OnFailure,
                None,
            )
            .await
            .expect("bypassed run succeeds");

        assert_eq!(runtime.0.attempts, vec![SandboxType::None]);
    }
}
