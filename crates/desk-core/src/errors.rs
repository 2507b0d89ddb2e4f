use std::time::Duration;

/// Failures from a `Responder` call.
/// The orchestrator recovers from all of these; none is fatal to a session.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ResponderError {
    #[error("responder unavailable: {0}")]
    Unavailable(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("tool {tool} failed: {detail}")]
    ToolFailed { tool: String, detail: String },
    #[error("invalid responder output: {0}")]
    InvalidOutput(String),
    #[error("responder error: {0}")]
    Internal(String),
}

impl ResponderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
            Self::ToolFailed { .. } => "tool_failed",
            Self::InvalidOutput(_) => "invalid_output",
            Self::Internal(_) => "internal",
        }
    }
}

/// An inbound WebSocket frame that could not be accepted.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("message is empty")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ResponderError::Unavailable("503".into()).is_retryable());
        assert!(ResponderError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!ResponderError::InvalidOutput("bad".into()).is_retryable());
        assert!(!ResponderError::Internal("boom".into()).is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(ResponderError::Timeout(Duration::ZERO).error_kind(), "timeout");
        assert_eq!(
            ResponderError::ToolFailed { tool: "t".into(), detail: "d".into() }.error_kind(),
            "tool_failed"
        );
        assert_eq!(ResponderError::InvalidOutput("x".into()).error_kind(), "invalid_output");
    }

    #[test]
    fn display_includes_detail() {
        let err = ResponderError::ToolFailed {
            tool: "check_transcript_exists".into(),
            detail: "lookup failed".into(),
        };
        assert_eq!(err.to_string(), "tool check_transcript_exists failed: lookup failed");
    }
}
