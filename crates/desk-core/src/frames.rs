//! JSON frames exchanged over the end-user and operator sockets.

use serde::{Deserialize, Serialize};

use crate::errors::FrameError;
use crate::events::{ConversationEvent, EventBody, Role};

/// Inbound frame on either channel: `{ "message": "..." }`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct InboundMessage {
    pub message: String,
}

impl InboundMessage {
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let parsed: Self =
            serde_json::from_str(raw).map_err(|e| FrameError::Malformed(e.to_string()))?;
        if parsed.message.trim().is_empty() {
            return Err(FrameError::Empty);
        }
        Ok(parsed)
    }
}

/// Outbound frame on the end-user channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserFrame {
    Message { agent: String, content: String },
    Handoff { source: String, target: String },
    System { content: String },
}

impl UserFrame {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System { content: content.into() }
    }

    /// The user-visible projection of an event, if it has one.
    /// Agent messages and handoffs reach the user; the user's own messages,
    /// tool traffic and system notes do not.
    pub fn from_event(event: &ConversationEvent) -> Option<Self> {
        match &event.body {
            EventBody::Message { content } if event.role == Role::Agent => Some(Self::Message {
                agent: event.agent_name.clone().unwrap_or_default(),
                content: content.clone(),
            }),
            EventBody::Handoff { handoff } => Some(Self::Handoff {
                source: handoff.from.to_string(),
                target: handoff.to.to_string(),
            }),
            EventBody::Message { .. }
            | EventBody::ToolCall { .. }
            | EventBody::ToolResult { .. }
            | EventBody::System { .. } => None,
        }
    }
}

/// Outbound frame on the operator channel. Every event is mirrored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorFrame {
    TraceEvent { trace: ConversationEvent },
}

impl From<ConversationEvent> for OperatorFrame {
    fn from(trace: ConversationEvent) -> Self {
        Self::TraceEvent { trace }
    }
}
