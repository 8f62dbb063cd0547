use thiserror::Error;

/// Error shape surfaced to the tool caller. `RespondToModel` carries text the
/// model is expected to read and react to; `Fatal` aborts the turn.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FunctionCallError {
    #[error("{0}")]
    RespondToModel(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}
