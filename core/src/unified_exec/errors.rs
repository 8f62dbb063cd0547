use thiserror::Error;

#[derive(Debug, Error)]
pub enum UnifiedExecError {
    #[error("missing command line")]
    MissingCommandLine,

    #[error("unknown session id: {process_id}")]
    UnknownSessionId { process_id: String },

    #[error("failed to create session: {message}")]
    CreateSession { message: String },

    #[error("failed to write to stdin")]
    WriteToStdin,

    #[error("sandbox denied session: {reason}")]
    SandboxDenied { reason: String },

    #[error("sandbox transform failed: {message}")]
    SandboxTransform { message: String },
}

impl UnifiedExecError {
    pub fn create_session(message: impl std::fmt::Display) -> Self {
        UnifiedExecError::CreateSession {
            message: message.to_string(),
        }
    }

    pub fn unknown_session_id(process_id: impl Into<String>) -> Self {
        UnifiedExecError::UnknownSessionId {
            process_id: process_id.into(),
        }
    }
}
