//! Execution core of the tandem coding agent: runs shell commands on behalf
//! of the model under a sandbox policy and an approval gate, and keeps
//! PTY-backed interactive sessions alive across tool calls so the model can
//! start a command, read partial output, feed it stdin, and come back for
//! more.
//!
//! The layering, outermost first:
//! - `tools::handlers`: the two wire-facing operations (`exec_command`,
//!   `write_stdin`) and their argument decoding / error translation.
//! - `tools::orchestrator` + `tools::sandboxing`: approval and sandbox
//!   selection around each command attempt, including the single unsandboxed
//!   retry after a sandbox denial.
//! - `unified_exec`: the session table, output collection, and pruning.
//! - `sandboxing`: command risk assessment and the sandbox transform that
//!   prepares an `ExecEnv` for spawning.

mod error;
mod exec_env;
mod function_tool;
mod sandboxing;
mod tandem;
mod tools;
mod truncate;
mod unified_exec;

pub use error::SandboxErr;
pub use error::TandemErr;
pub use exec_env::ShellEnvironmentPolicy;
pub use exec_env::ShellEnvironmentPolicyInherit;
pub use exec_env::create_env;
pub use function_tool::FunctionCallError;
pub use sandboxing::CommandSpec;
pub use sandboxing::ExecEnv;
pub use sandboxing::ExecExpiration;
pub use sandboxing::SandboxType;
pub use sandboxing::assessment::assess_command;
pub use sandboxing::get_platform_sandbox;
pub use sandboxing::is_likely_sandbox_denied;
pub use tandem::ApprovalRequester;
pub use tandem::AutoApprover;
pub use tandem::Session;
pub use tandem::SessionServices;
pub use tandem::TurnContext;
pub use tools::context::ToolInvocation;
pub use tools::context::ToolOutput;
pub use tools::context::ToolPayload;
pub use tools::handlers::unified_exec::UnifiedExecHandler;
pub use tools::registry::ToolHandler;
pub use tools::registry::ToolKind;
pub use tools::sandboxing::Approvable;
pub use tools::sandboxing::ApprovalCache;
pub use tools::sandboxing::ApprovalCacheOptions;
pub use tools::sandboxing::ApprovalCtx;
pub use tools::sandboxing::ExecApprovalRequirement;
pub use tools::sandboxing::ProvidesSandboxRetryData;
pub use tools::sandboxing::SandboxAttempt;
pub use tools::sandboxing::SandboxOverride;
pub use tools::sandboxing::SandboxRetryData;
pub use tools::sandboxing::Sandboxable;
pub use tools::sandboxing::SandboxablePreference;
pub use tools::sandboxing::ToolCtx;
pub use tools::sandboxing::ToolError;
pub use tools::sandboxing::with_cached_approval;
pub use truncate::approx_token_count;
pub use truncate::truncate_text_to_tokens;
pub use unified_exec::ExecCommandRequest;
pub use unified_exec::ProcessIdPolicy;
pub use unified_exec::UnifiedExecContext;
pub use unified_exec::UnifiedExecError;
pub use unified_exec::UnifiedExecResponse;
pub use unified_exec::UnifiedExecSessionManager;

#[cfg(any(test, feature = "test-support"))]
pub use tandem::make_session_and_context;
