use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;

use crate::function_tool::FunctionCallError;
use crate::tools::context::ToolInvocation;
use crate::tools::context::ToolOutput;
use crate::tools::context::ToolPayload;
use crate::tools::registry::ToolHandler;
use crate::tools::registry::ToolKind;
use crate::unified_exec::ExecCommandRequest;
use crate::unified_exec::UnifiedExecContext;
use crate::unified_exec::UnifiedExecResponse;
use crate::unified_exec::UnifiedExecSessionManager;

/// Handler for the `exec_command` / `write_stdin` tool pair.
pub struct UnifiedExecHandler {
    /// Commands treated as non-mutating for the framework's mutation-safety
    /// checks. Deliberately empty by default: every command is conservatively
    /// assumed to mutate until an operator opts specific ones in.
    safe_commands: Vec<Vec<String>>,
}

impl Default for UnifiedExecHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl UnifiedExecHandler {
    pub fn new() -> Self {
        Self {
            safe_commands: Vec::new(),
        }
    }

    pub fn with_safe_commands(safe_commands: Vec<Vec<String>>) -> Self {
        Self { safe_commands }
    }

    fn is_known_safe_command(&self, command: &[String]) -> bool {
        self.safe_commands.iter().any(|safe| safe == command)
    }
}

#[derive(Debug, Deserialize)]
struct ExecCommandArgs {
    cmd: String,
    #[serde(default)]
    workdir: Option<PathBuf>,
    #[serde(default = "default_shell")]
    shell: String,
    #[serde(default = "default_login")]
    login: bool,
    #[serde(default)]
    process_id: Option<String>,
    #[serde(default)]
    yield_time_ms: Option<u64>,
    #[serde(default)]
    max_output_tokens: Option<usize>,
    #[serde(default)]
    with_escalated_permissions: Option<bool>,
    #[serde(default)]
    justification: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WriteStdinArgs {
    process_id: String,
    #[serde(default)]
    input: String,
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

fn default_login() -> bool {
    true
}

#[async_trait]
impl ToolHandler for UnifiedExecHandler {
    fn kind(&self) -> ToolKind {
        ToolKind::Function
    }

    fn matches_kind(&self, payload: &ToolPayload) -> bool {
        matches!(
            payload,
            ToolPayload::Function { .. } | ToolPayload::UnifiedExec { .. }
        )
    }

    fn is_mutating(&self, invocation: &ToolInvocation) -> bool {
        let Ok(args) = serde_json::from_str::<ExecCommandArgs>(invocation.payload.arguments())
        else {
            return true;
        };
        let command = vec![args.shell, "-c".to_string(), args.cmd];
        !self.is_known_safe_command(&command)
    }

    async fn handle(&self, invocation: ToolInvocation) -> Result<ToolOutput, FunctionCallError> {
        let ToolInvocation {
            session,
            turn,
            call_id,
            tool_name,
            payload,
        } = invocation;

        let arguments = match payload {
            ToolPayload::Function { arguments } => arguments,
            ToolPayload::UnifiedExec { arguments } => arguments,
        };

        let manager: &UnifiedExecSessionManager = &session.services.unified_exec_manager;
        let context = UnifiedExecContext {
            session: session.clone(),
            turn: turn.clone(),
            call_id: call_id.clone(),
        };

        let content = match tool_name.as_str() {
            "exec_command" => {
                let args: ExecCommandArgs = serde_json::from_str(&arguments).map_err(|err| {
                    FunctionCallError::RespondToModel(format!(
                        "failed to parse exec_command arguments: {err:?}"
                    ))
                })?;

                let shell_flag = if args.login { "-lc" } else { "-c" };
                let command = vec![args.shell, shell_flag.to_string(), args.cmd];

                let response = manager
                    .exec_command(
                        ExecCommandRequest {
                            command: &command,
                            process_id: args.process_id.as_deref(),
                            workdir: args.workdir.as_deref(),
                            yield_time_ms: args.yield_time_ms,
                            max_output_tokens: args.max_output_tokens,
                            with_escalated_permissions: args.with_escalated_permissions,
                            justification: args.justification.as_deref(),
                        },
                        &context,
                    )
                    .await
                    .map_err(|err| {
                        FunctionCallError::RespondToModel(format!("exec_command failed: {err}"))
                    })?;

                format_response(&response)
            }
            "write_stdin" => {
                let args: WriteStdinArgs = serde_json::from_str(&arguments).map_err(|err| {
                    FunctionCallError::RespondToModel(format!(
                        "failed to parse write_stdin arguments: {err:?}"
                    ))
                })?;

                manager
                    .write_stdin(&args.process_id, &args.input)
                    .await
                    .map_err(|err| {
                        FunctionCallError::RespondToModel(format!("write_stdin failed: {err}"))
                    })?;

                format!("Input written to process {}", args.process_id)
            }
            other => {
                return Err(FunctionCallError::RespondToModel(format!(
                    "unified exec handler received unsupported tool: {other}"
                )));
            }
        };

        Ok(ToolOutput::Function {
            content,
            success: Some(true),
        })
    }
}

fn format_response(response: &UnifiedExecResponse) -> String {
    let mut sections = Vec::new();

    if !response.chunk_id.is_empty() {
        sections.push(format!("Chunk ID: {}", response.chunk_id));
    }

    let wall_time_seconds = response.wall_time.as_secs_f64();
    sections.push(format!("Wall time: {wall_time_seconds:.4} seconds"));

    if let Some(exit_code) = response.exit_code {
        sections.push(format!("Process exited with code {exit_code}"));
    }

    if let Some(process_id) = &response.process_id {
        sections.push(format!("Process running with process ID {process_id}"));
    }

    sections.push(format!(
        "Original token count: {}",
        response.original_token_count
    ));

    sections.push("Output:".to_string());
    sections.push(response.output.clone());

    sections.join("\n")
}
