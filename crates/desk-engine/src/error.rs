use desk_core::ResponderError;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

impl ToolError {
    pub fn into_responder_error(self, tool: &str) -> ResponderError {
        ResponderError::ToolFailed {
            tool: tool.to_string(),
            detail: self.to_string(),
        }
    }
}
