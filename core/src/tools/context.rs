use std::sync::Arc;

use crate::tandem::Session;
use crate::tandem::TurnContext;

/// Raw payload of a tool call as it arrived from the wire.
#[derive(Debug, Clone)]
pub enum ToolPayload {
    Function { arguments: String },
    UnifiedExec { arguments: String },
}

impl ToolPayload {
    pub fn arguments(&self) -> &str {
        match self {
            ToolPayload::Function { arguments } => arguments,
            ToolPayload::UnifiedExec { arguments } => arguments,
        }
    }
}

/// One tool call, bound to the session and turn it belongs to.
pub struct ToolInvocation {
    pub session: Arc<Session>,
    pub turn: Arc<TurnContext>,
    pub call_id: String,
    pub tool_name: String,
    pub payload: ToolPayload,
}

/// What a handler returns to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutput {
    Function {
        content: String,
        success: Option<bool>,
    },
}
