//! Sandbox plumbing: the command/environment types handed to the spawn
//! service and the transform that applies an isolation level to them.
//!
//! The OS-level isolation primitive itself is a collaborator, not something
//! implemented here. The transform's job is to rewrite a `CommandSpec` into
//! the `ExecEnv` the spawn service needs: wrapping the command for seatbelt
//! on macOS, marking the environment, and recording which sandbox is in
//! effect so denial heuristics downstream know what they are looking at.

pub mod assessment;

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use tandem_protocol::SandboxPolicy;

use crate::error::SandboxErr;

/// Name of the marker variable injected into sandboxed child environments.
pub const SANDBOX_ENV_VAR: &str = "TANDEM_SANDBOX";

const MACOS_PATH_TO_SEATBELT_EXECUTABLE: &str = "/usr/bin/sandbox-exec";

pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SandboxType {
    #[default]
    None,
    MacosSeatbelt,
    LinuxSeccomp,
}

/// Advisory lifetime for a spawned command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecExpiration {
    DefaultTimeout,
    Millis(u64),
}

impl ExecExpiration {
    pub fn duration(self) -> Duration {
        match self {
            ExecExpiration::DefaultTimeout => DEFAULT_EXEC_TIMEOUT,
            ExecExpiration::Millis(ms) => Duration::from_millis(ms),
        }
    }
}

impl From<Option<u64>> for ExecExpiration {
    fn from(timeout_ms: Option<u64>) -> Self {
        match timeout_ms {
            Some(ms) => ExecExpiration::Millis(ms),
            None => ExecExpiration::DefaultTimeout,
        }
    }
}

/// A command as requested by a tool, before any sandbox is applied.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub expiration: ExecExpiration,
    pub with_escalated_permissions: Option<bool>,
    pub justification: Option<String>,
}

/// The fully prepared execution environment handed to the spawn service.
#[derive(Debug, Clone)]
pub struct ExecEnv {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub expiration: ExecExpiration,
    pub sandbox: SandboxType,
}

/// The sandbox available on this platform, if any.
pub fn get_platform_sandbox() -> Option<SandboxType> {
    if cfg!(target_os = "macos") {
        Some(SandboxType::MacosSeatbelt)
    } else if cfg!(target_os = "linux") {
        Some(SandboxType::LinuxSeccomp)
    } else {
        None
    }
}

/// Apply `sandbox` to `spec`, producing the environment to spawn.
pub fn transform(
    spec: CommandSpec,
    policy: &SandboxPolicy,
    sandbox: SandboxType,
) -> Result<ExecEnv, SandboxErr> {
    let CommandSpec {
        command,
        cwd,
        mut env,
        expiration,
        with_escalated_permissions: _,
        justification: _,
    } = spec;

    if command.is_empty() {
        return Err(SandboxErr::Transform("empty command".to_string()));
    }

    let command = match sandbox {
        SandboxType::None => command,
        SandboxType::MacosSeatbelt => {
            env.insert(SANDBOX_ENV_VAR.to_string(), "seatbelt".to_string());
            let profile = seatbelt_profile(policy, &cwd);
            let mut wrapped = vec![
                MACOS_PATH_TO_SEATBELT_EXECUTABLE.to_string(),
                "-p".to_string(),
                profile,
                "--".to_string(),
            ];
            wrapped.extend(command);
            wrapped
        }
        SandboxType::LinuxSeccomp => {
            // The landlock/seccomp rules are installed by the spawn service
            // pre-exec; here we only mark the environment.
            env.insert(SANDBOX_ENV_VAR.to_string(), "seccomp".to_string());
            command
        }
    };

    Ok(ExecEnv {
        command,
        cwd,
        env,
        expiration,
        sandbox,
    })
}

fn seatbelt_profile(policy: &SandboxPolicy, cwd: &Path) -> String {
    let mut profile = String::from(
        "(version 1)\n(deny default)\n(allow process-fork)\n(allow process-exec)\n(allow file-read*)\n(allow sysctl-read)\n(allow mach-lookup)\n",
    );
    match policy {
        SandboxPolicy::DangerFullAccess => {
            profile.push_str("(allow file-write*)\n(allow network*)\n");
        }
        SandboxPolicy::ReadOnly => {}
        SandboxPolicy::WorkspaceWrite {
            writable_roots,
            network_access,
        } => {
            let mut roots = vec![cwd.to_path_buf()];
            roots.extend(writable_roots.iter().cloned());
            for root in roots {
                profile.push_str(&format!(
                    "(allow file-write* (subpath \"{}\"))\n",
                    root.to_string_lossy()
                ));
            }
            if *network_access {
                profile.push_str("(allow network*)\n");
            }
        }
    }
    profile
}

/// Whether a nonzero exit from a sandboxed process should be read as the
/// sandbox rejecting it. Exit 127 is the shell's command-not-found and says
/// nothing about the sandbox.
pub fn is_likely_sandbox_denied(sandbox: SandboxType, exit_code: i32) -> bool {
    if sandbox == SandboxType::None {
        return false;
    }
    exit_code != 0 && exit_code != 127
}

/// Whether a spawn-time error message looks like the sandbox refusing the
/// operation rather than a generic failure.
pub fn is_denial_shaped_error(sandbox: SandboxType, message: &str) -> bool {
    if sandbox == SandboxType::None {
        return false;
    }
    message.contains("Operation not permitted") || message.contains("Permission denied")
}
