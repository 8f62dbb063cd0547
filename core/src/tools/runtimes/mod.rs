/*
Module: runtimes

Concrete ToolRuntime implementations. Each runtime stays small and focused
and reuses the orchestrator for approvals + sandbox + retry.
*/

use std::collections::HashMap;
use std::path::Path;

use crate::sandboxing::CommandSpec;
use crate::sandboxing::ExecExpiration;
use crate::tools::sandboxing::ToolError;

pub mod unified_exec;

/// Shared helper to construct a CommandSpec from a tokenized command line.
/// Validates that at least a program is present.
pub(crate) fn build_command_spec(
    command: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
    expiration: ExecExpiration,
    with_escalated_permissions: Option<bool>,
    justification: Option<String>,
) -> Result<CommandSpec, ToolError> {
    if command.is_empty() {
        return Err(ToolError::Rejected("missing command line".to_string()));
    }
    Ok(CommandSpec {
        command: command.to_vec(),
        cwd: cwd.to_path_buf(),
        env: env.clone(),
        expiration,
        with_escalated_permissions,
        justification,
    })
}
