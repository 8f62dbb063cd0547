use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;
use strum_macros::Display;

/// When the agent must pause and ask the user before running a command.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AskForApproval {
    /// Ask before any command that is not on the trusted allowlist.
    UnlessTrusted,

    /// Run everything sandboxed without asking; only surface an approval
    /// request when the sandbox rejects the command.
    #[default]
    OnFailure,

    /// Ask when the model requests escalation or the command looks risky.
    OnRequest,

    /// Never ask. Commands that would require approval fail instead.
    Never,
}

/// The user's answer to an approval request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReviewDecision {
    /// Approved for this single attempt.
    #[default]
    Approved,

    /// Approved, and identical requests in this session should not re-prompt.
    ApprovedForSession,

    /// Rejected; the attempt must not run.
    Denied,

    /// Rejected, and the whole turn should stop.
    Abort,
}

/// Isolation level requested for spawned processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode")]
pub enum SandboxPolicy {
    /// No isolation at all. Used by tests and by explicitly trusting users.
    DangerFullAccess,

    /// Filesystem reads only.
    ReadOnly,

    /// Writes restricted to the workspace (and any extra roots).
    WorkspaceWrite {
        #[serde(default)]
        writable_roots: Vec<PathBuf>,
        #[serde(default)]
        network_access: bool,
    },
}

impl SandboxPolicy {
    pub fn new_read_only_policy() -> Self {
        SandboxPolicy::ReadOnly
    }

    pub fn new_workspace_write_policy() -> Self {
        SandboxPolicy::WorkspaceWrite {
            writable_roots: Vec::new(),
            network_access: false,
        }
    }

    pub fn has_full_disk_write_access(&self) -> bool {
        matches!(self, SandboxPolicy::DangerFullAccess)
    }
}

/// Coarse risk classification for a command about to be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SandboxRiskLevel {
    Low,
    Medium,
    High,
}

/// Risk level plus a human-readable rationale, shown alongside approval
/// prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxCommandAssessment {
    pub description: String,
    pub risk: SandboxRiskLevel,
}

impl SandboxCommandAssessment {
    pub fn new(description: impl Into<String>, risk: SandboxRiskLevel) -> Self {
        Self {
            description: description.into(),
            risk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn approval_policy_serializes_kebab_case() {
        let json = serde_json::to_string(&AskForApproval::UnlessTrusted).expect("serialize");
        assert_eq!(json, "\"unless-trusted\"");
    }

    #[test]
    fn sandbox_policy_roundtrips() {
        let policy = SandboxPolicy::WorkspaceWrite {
            writable_roots: vec![PathBuf::from("/tmp/scratch")],
            network_access: true,
        };
        let json = serde_json::to_string(&policy).expect("serialize");
        let back: SandboxPolicy = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, policy);
    }

    #[test]
    fn risk_levels_are_ordered() {
        assert!(SandboxRiskLevel::Low < SandboxRiskLevel::Medium);
        assert!(SandboxRiskLevel::Medium < SandboxRiskLevel::High);
    }
}
