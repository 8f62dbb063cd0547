use thiserror::Error;

/// Sandbox-related failures, split by how the orchestrator reacts to them:
/// `Denied` is the only variant that may trigger the single unsandboxed
/// retry; the others are fatal for the attempt.
#[derive(Debug, Error)]
pub enum SandboxErr {
    #[error("sandbox denied exec: {reason}")]
    Denied { reason: String },

    #[error("sandbox transform failed: {0}")]
    Transform(String),

    #[error("error applying sandbox: {0}")]
    Application(String),
}

#[derive(Debug, Error)]
pub enum TandemErr {
    #[error(transparent)]
    Sandbox(#[from] SandboxErr),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}
