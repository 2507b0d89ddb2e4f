//! Conversation events: one immutable record per turn.
//!
//! Every turn-advancing occurrence in a session (user message, agent reply,
//! tool call, tool result, handoff, system notice) is a `ConversationEvent`
//! with a unique, gapless `turn_id`. The body is a closed sum type so the
//! fan-out step can match exhaustively.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::AgentId;
use crate::ids::SessionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
            Self::System => write!(f, "system"),
        }
    }
}

impl FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handoff {
    pub from: AgentId,
    pub to: AgentId,
}

/// What happened in a turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventBody {
    Message { content: String },
    ToolCall { tool_call: ToolCall },
    ToolResult { content: String },
    Handoff { handoff: Handoff },
    System { content: String },
}

impl EventBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Handoff { .. } => "handoff",
            Self::System { .. } => "system",
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Message { content } | Self::ToolResult { content } | Self::System { content } => {
                Some(content)
            }
            Self::ToolCall { .. } | Self::Handoff { .. } => None,
        }
    }
}

/// Snapshot of the session's routing mode when the event was written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFlags {
    pub ai_active: bool,
    pub human_override: bool,
}

impl EventFlags {
    pub fn for_override(human_override: bool) -> Self {
        Self {
            ai_active: !human_override,
            human_override,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub session_id: SessionId,
    pub turn_id: u64,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(flatten)]
    pub body: EventBody,
    pub flags: EventFlags,
    /// Operator-settable marker; the only field that changes after write.
    #[serde(default)]
    pub flagged: bool,
}

impl ConversationEvent {
    pub fn handoff(&self) -> Option<Handoff> {
        match &self.body {
            EventBody::Handoff { handoff } => Some(*handoff),
            _ => None,
        }
    }
}
