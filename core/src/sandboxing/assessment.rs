//! Risk classification for commands about to be executed. Pure and
//! deterministic: the program name (and a couple of well-known argument
//! patterns) map to a risk level plus a rationale for the approval prompt.

use tandem_protocol::SandboxCommandAssessment;
use tandem_protocol::SandboxRiskLevel;

/// Programs that can destroy data or change system state wholesale.
const HIGH_RISK_PROGRAMS: [&str; 10] = [
    "rm", "dd", "mkfs", "fdisk", "mount", "umount", "chown", "chmod", "sudo", "su",
];

/// Programs that move, replace, or stop things but are usually recoverable.
const MEDIUM_RISK_PROGRAMS: [&str; 8] = [
    "mv", "cp", "ln", "kill", "pkill", "killall", "shutdown", "reboot",
];

/// Assess the risk of running `command`.
pub fn assess_command(command: &[String]) -> SandboxCommandAssessment {
    let Some(first) = command.first() else {
        return SandboxCommandAssessment::new("Empty command", SandboxRiskLevel::Low);
    };

    let lowered = first.to_lowercase();
    let program = lowered.rsplit('/').next().unwrap_or(lowered.as_str());

    if HIGH_RISK_PROGRAMS.contains(&program) {
        return SandboxCommandAssessment::new(
            format!("High risk program: {program}"),
            SandboxRiskLevel::High,
        );
    }

    if MEDIUM_RISK_PROGRAMS.contains(&program) {
        return SandboxCommandAssessment::new(
            format!("Medium risk program: {program}"),
            SandboxRiskLevel::Medium,
        );
    }

    if program == "git" && command.iter().any(|arg| arg == "clean") {
        return SandboxCommandAssessment::new(
            "Suspicious git clean command",
            SandboxRiskLevel::Medium,
        );
    }

    SandboxCommandAssessment::new("Generic command", SandboxRiskLevel::Low)
}
