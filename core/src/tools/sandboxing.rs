/*
Module: sandboxing

Capability traits composed by the orchestrator. A tool runtime implements
whichever of these apply to it:
- `Sandboxable`: can run under an OS sandbox and says how to react to denial.
- `Approvable`: can describe and request user approval, with caching.
- `ProvidesSandboxRetryData`: carries enough context to re-request approval
  after a sandbox denial.

Also hosts the keyed approval cache shared by all runtimes of a session.
*/

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use tandem_protocol::AskForApproval;
use tandem_protocol::ReviewDecision;
use tandem_protocol::SandboxRiskLevel;

use crate::error::TandemErr;
use crate::sandboxing::CommandSpec;
use crate::sandboxing::ExecEnv;
use crate::sandboxing::SandboxType;
use crate::sandboxing::transform;
use crate::tandem::Session;
use crate::tandem::SessionServices;
use crate::tandem::TurnContext;
use tandem_protocol::SandboxPolicy;

/// Identity of the tool call being executed, for approval prompts and logs.
pub struct ToolCtx<'a> {
    pub session: &'a Session,
    pub turn: &'a TurnContext,
    pub call_id: String,
    pub tool_name: String,
}

/// Context handed to `Approvable::start_approval_async`. `retry_reason` is
/// set only on the post-denial retry and carries the denial message.
pub struct ApprovalCtx<'a> {
    pub session: &'a Session,
    pub turn: &'a TurnContext,
    pub call_id: &'a str,
    pub retry_reason: Option<String>,
    pub risk: Option<SandboxRiskLevel>,
}

/// Whether (and how) a command needs user approval before running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecApprovalRequirement {
    /// Prompt every time, regardless of cached approvals.
    AlwaysAsk,
    /// Prompt unless an identical request was already resolved this session.
    AskUnlessCached,
    /// No prompt. `bypass_sandbox` additionally lifts isolation for the
    /// first attempt.
    Skip { bypass_sandbox: bool },
}

/// Derive the approval requirement from policy, assessed risk, and the
/// caller's escalation request.
pub(crate) fn create_approval_requirement(
    policy: AskForApproval,
    risk: SandboxRiskLevel,
    with_escalated_permissions: Option<bool>,
) -> ExecApprovalRequirement {
    match policy {
        AskForApproval::Never | AskForApproval::OnFailure => ExecApprovalRequirement::Skip {
            bypass_sandbox: false,
        },
        AskForApproval::UnlessTrusted => ExecApprovalRequirement::AskUnlessCached,
        AskForApproval::OnRequest => {
            if with_escalated_permissions.unwrap_or(false) || risk == SandboxRiskLevel::High {
                ExecApprovalRequirement::AlwaysAsk
            } else if risk == SandboxRiskLevel::Medium {
                ExecApprovalRequirement::AskUnlessCached
            } else {
                ExecApprovalRequirement::Skip {
                    bypass_sandbox: false,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxOverride {
    NoOverride,
    BypassSandboxFirstAttempt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxablePreference {
    /// Use whatever the platform and policy select.
    Auto,
    /// Never sandbox this runtime.
    Forbidden,
}

/// One attempt's isolation level plus the policy it was derived from.
pub struct SandboxAttempt<'a> {
    pub sandbox: SandboxType,
    pub policy: &'a SandboxPolicy,
}

impl SandboxAttempt<'_> {
    pub fn env_for(&self, spec: CommandSpec) -> Result<ExecEnv, TandemErr> {
        transform(spec, self.policy, self.sandbox).map_err(TandemErr::from)
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Tandem(#[from] TandemErr),

    #[error("{0}")]
    Rejected(String),
}

/// The minimum information needed to re-request approval after a denial.
#[derive(Debug, Clone)]
pub struct SandboxRetryData {
    pub command: Vec<String>,
    pub cwd: PathBuf,
}

pub trait ProvidesSandboxRetryData {
    fn sandbox_retry_data(&self) -> Option<SandboxRetryData>;
}

pub trait Sandboxable {
    fn sandbox_preference(&self) -> SandboxablePreference;

    /// Whether a sandbox denial should trigger the single unsandboxed retry.
    fn escalate_on_failure(&self) -> bool;
}

pub trait Approvable<Req> {
    type ApprovalKey: Serialize;

    fn approval_key(&self, req: &Req) -> Self::ApprovalKey;

    fn start_approval_async<'a>(
        &'a mut self,
        req: &'a Req,
        ctx: ApprovalCtx<'a>,
    ) -> BoxFuture<'a, ReviewDecision>;

    fn exec_approval_requirement(&self, req: &Req) -> Option<ExecApprovalRequirement>;

    fn sandbox_mode_for_first_attempt(&self, req: &Req) -> SandboxOverride;
}

pub trait ToolRuntime<Req, Out> {
    async fn run(
        &mut self,
        req: &Req,
        attempt: &SandboxAttempt<'_>,
        ctx: &ToolCtx<'_>,
    ) -> Result<Out, ToolError>;
}

/// Keyed cache of approval decisions. Pending entries let identical
/// concurrent requests coalesce onto a single prompt; resolved entries stop
/// session-scoped approvals and explicit denials from re-prompting.
#[derive(Default)]
pub struct ApprovalCache {
    entries: StdMutex<HashMap<String, ApprovalCacheEntry>>,
}

enum ApprovalCacheEntry {
    Pending(watch::Receiver<Option<ReviewDecision>>),
    Resolved(ReviewDecision),
}

pub struct ApprovalCacheOptions {
    /// Serve a cached plain `Approved` (ask-unless-cached semantics).
    pub reuse_approved: bool,
    /// A fresh justification (retry reason) may override a cached denial.
    pub has_new_justification: bool,
}

enum CacheLookup {
    Hit(ReviewDecision),
    Wait(watch::Receiver<Option<ReviewDecision>>),
    Ask(watch::Sender<Option<ReviewDecision>>),
}

/// Run `ask` at most once per cache key, serving repeats from the cache.
pub async fn with_cached_approval<K, F, Fut>(
    services: &SessionServices,
    key: K,
    options: ApprovalCacheOptions,
    ask: F,
) -> ReviewDecision
where
    K: Serialize,
    F: FnOnce() -> Fut,
    Fut: Future<Output = ReviewDecision>,
{
    let Ok(key) = serde_json::to_string(&key) else {
        return ask().await;
    };

    let cache = &services.approval_cache;
    loop {
        let lookup = {
            let mut entries = match cache.entries.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match entries.get(&key) {
                Some(ApprovalCacheEntry::Resolved(ReviewDecision::ApprovedForSession)) => {
                    CacheLookup::Hit(ReviewDecision::ApprovedForSession)
                }
                Some(ApprovalCacheEntry::Resolved(ReviewDecision::Denied))
                    if !options.has_new_justification =>
                {
                    CacheLookup::Hit(ReviewDecision::Denied)
                }
                Some(ApprovalCacheEntry::Resolved(ReviewDecision::Approved))
                    if options.reuse_approved =>
                {
                    CacheLookup::Hit(ReviewDecision::Approved)
                }
                Some(ApprovalCacheEntry::Pending(rx))
                    if rx.has_changed().is_ok() || rx.borrow().is_some() =>
                {
                    CacheLookup::Wait(rx.clone())
                }
                _ => {
                    let (tx, rx) = watch::channel(None);
                    entries.insert(key.clone(), ApprovalCacheEntry::Pending(rx));
                    CacheLookup::Ask(tx)
                }
            }
        };

        match lookup {
            CacheLookup::Hit(decision) => return decision,
            CacheLookup::Wait(mut rx) => match rx.wait_for(Option::is_some).await {
                Ok(guard) => {
                    if let Some(decision) = *guard {
                        return decision;
                    }
                }
                // The asking task went away without resolving; take over.
                Err(_) => continue,
            },
            CacheLookup::Ask(tx) => {
                let decision = ask().await;
                {
                    let mut entries = match cache.entries.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    match decision {
                        ReviewDecision::ApprovedForSession
                        | ReviewDecision::Denied
                        | ReviewDecision::Approved => {
                            entries.insert(key, ApprovalCacheEntry::Resolved(decision));
                        }
                        // Aborts are about the turn, not the command.
                        ReviewDecision::Abort => {
                            entries.remove(&key);
                        }
                    }
                }
                let _ = tx.send(Some(decision));
                return decision;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tandem::Session;
    use crate::unified_exec::ProcessIdPolicy;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    fn test_services() -> Session {
        Session::new(Arc::new(crate::tandem::AutoApprover), ProcessIdPolicy::Random)
    }

    fn options(reuse_approved: bool, has_new_justification: bool) -> ApprovalCacheOptions {
        ApprovalCacheOptions {
            reuse_approved,
            has_new_justification,
        }
    }

    #[tokio::test]
    async fn denial_is_served_from_cache_without_reprompting() {
        let session = test_services();
        let prompts = AtomicUsize::new(0);

        for expected_prompts in [1, 1] {
            let decision = with_cached_approval(
                &session.services,
                ("rm", "-rf"),
                options(false, false),
                || async {
                    prompts.fetch_add(1, Ordering::SeqCst);
                    ReviewDecision::Denied
                },
            )
            .await;
            assert_eq!(decision, ReviewDecision::Denied);
            assert_eq!(prompts.load(Ordering::SeqCst), expected_prompts);
        }
    }

    #[tokio::test]
    async fn new_justification_overrides_cached_denial() {
        let session = test_services();
        let prompts = AtomicUsize::new(0);

        let first = with_cached_approval(&session.services, "key", options(false, false), || async {
            prompts.fetch_add(1, Ordering::SeqCst);
            ReviewDecision::Denied
        })
        .await;
        assert_eq!(first, ReviewDecision::Denied);

        let second = with_cached_approval(&session.services, "key", options(false, true), || async {
            prompts.fetch_add(1, Ordering::SeqCst);
            ReviewDecision::Approved
        })
        .await;
        assert_eq!(second, ReviewDecision::Approved);
        assert_eq!(prompts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn session_approval_is_reused() {
        let session = test_services();
        let prompts = AtomicUsize::new(0);

        for _ in 0..3 {
            let decision = with_cached_approval(
                &session.services,
                "session-key",
                options(false, false),
                || async {
                    prompts.fetch_add(1, Ordering::SeqCst);
                    ReviewDecision::ApprovedForSession
                },
            )
            .await;
            assert_eq!(decision, ReviewDecision::ApprovedForSession);
        }
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn plain_approval_reprompts_unless_reuse_requested() {
        let session = test_services();
        let prompts = AtomicUsize::new(0);

        for _ in 0..2 {
            with_cached_approval(&session.services, "k", options(false, false), || async {
                prompts.fetch_add(1, Ordering::SeqCst);
                ReviewDecision::Approved
            })
            .await;
        }
        assert_eq!(prompts.load(Ordering::SeqCst), 2);

        with_cached_approval(&session.services, "k", options(true, false), || async {
            prompts.fetch_add(1, Ordering::SeqCst);
            ReviewDecision::Approved
        })
        .await;
        assert_eq!(prompts.load(Ordering::SeqCst), 2, "cached approval reused");
    }

    #[test]
    fn requirement_derivation_follows_policy_and_risk() {
        use SandboxRiskLevel::*;
        assert_eq!(
            create_approval_requirement(AskForApproval::Never, High, None),
            ExecApprovalRequirement::Skip {
                bypass_sandbox: false
            }
        );
        assert_eq!(
            create_approval_requirement(AskForApproval::OnFailure, Medium, None),
            ExecApprovalRequirement::Skip {
                bypass_sandbox: false
            }
        );
        assert_eq!(
            create_approval_requirement(AskForApproval::UnlessTrusted, Low, None),
            ExecApprovalRequirement::AskUnlessCached
        );
        assert_eq!(
            create_approval_requirement(AskForApproval::OnRequest, High, None),
            ExecApprovalRequirement::AlwaysAsk
        );
        assert_eq!(
            create_approval_requirement(AskForApproval::OnRequest, Low, Some(true)),
            ExecApprovalRequirement::AlwaysAsk
        );
        assert_eq!(
            create_approval_requirement(AskForApproval::OnRequest, Medium, None),
            ExecApprovalRequirement::AskUnlessCached
        );
        assert_eq!(
            create_approval_requirement(AskForApproval::OnRequest, Low, None),
            ExecApprovalRequirement::Skip {
                bypass_sandbox: false
            }
        );
    }
}
