//! The boundary to the reply-generation engine.
//!
//! A `Responder` receives the active agent, the full transcript and the
//! session's shared context, and answers with an ordered list of output
//! items plus the agent that should own the next turn.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agents::AgentId;
use crate::errors::ResponderError;
use crate::events::{ConversationEvent, Role};
use crate::ids::SessionId;

/// Opaque key/value state the responder carries across turns.
pub type SharedContext = serde_json::Map<String, serde_json::Value>;

#[derive(Clone, Debug)]
pub struct ResponderRequest {
    pub session_id: SessionId,
    pub active_agent: AgentId,
    pub transcript: Vec<ConversationEvent>,
    pub context: SharedContext,
}

impl ResponderRequest {
    /// Text of the most recent user message in the transcript.
    pub fn latest_user_message(&self) -> Option<&str> {
        self.transcript
            .iter()
            .rev()
            .find(|e| e.role == Role::User)
            .and_then(|e| e.body.content())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputItem {
    Message { agent: AgentId, content: String },
    ToolCall { agent: AgentId, name: String, args: serde_json::Value },
    ToolResult { agent: AgentId, output: String },
    Handoff { from: AgentId, to: AgentId },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResponderOutput {
    pub items: Vec<OutputItem>,
    pub next_agent: AgentId,
    pub context: SharedContext,
    /// The responder considers the user's issue settled.
    pub resolved: bool,
}

impl ResponderOutput {
    /// Check that the items form a consistent chain starting at `active`:
    /// each handoff leaves the agent currently speaking for one it may hand
    /// off to, every other item is attributed to the agent currently
    /// speaking, and `next_agent` is whoever was left speaking.
    pub fn validate(&self, active: AgentId) -> Result<(), ResponderError> {
        let mut current = active;
        for (idx, item) in self.items.iter().enumerate() {
            match item {
                OutputItem::Handoff { from, to } => {
                    if *from != current {
                        return Err(ResponderError::InvalidOutput(format!(
                            "item {idx}: handoff from {from} while {current} is active"
                        )));
                    }
                    if !from.can_hand_off_to(*to) {
                        return Err(ResponderError::InvalidOutput(format!(
                            "item {idx}: {from} cannot hand off to {to}"
                        )));
                    }
                    current = *to;
                }
                OutputItem::Message { agent, .. }
                | OutputItem::ToolCall { agent, .. }
                | OutputItem::ToolResult { agent, .. } => {
                    if *agent != current {
                        return Err(ResponderError::InvalidOutput(format!(
                            "item {idx}: attributed to {agent} while {current} is active"
                        )));
                    }
                }
            }
        }
        if self.next_agent != current {
            return Err(ResponderError::InvalidOutput(format!(
                "next agent {} does not match final agent {current}",
                self.next_agent
            )));
        }
        Ok(())
    }
}

#[async_trait]
pub trait Responder: Send + Sync {
    fn name(&self) -> &str;

    async fn respond(&self, request: ResponderRequest) -> Result<ResponderOutput, ResponderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBody, EventFlags};
    use chrono::Utc;

    fn output(items: Vec<OutputItem>, next_agent: AgentId) -> ResponderOutput {
        ResponderOutput { items, next_agent, context: SharedContext::new(), resolved: false }
    }

    #[test]
    fn handoff_chain_validates() {
        let out = output(
            vec![
                OutputItem::Handoff { from: AgentId::Triage, to: AgentId::Technical },
                OutputItem::Message { agent: AgentId::Technical, content: "hi".into() },
            ],
            AgentId::Technical,
        );
        assert!(out.validate(AgentId::Triage).is_ok());
    }

    #[test]
    fn empty_output_keeps_agent() {
        assert!(output(vec![], AgentId::Marketing).validate(AgentId::Marketing).is_ok());
        assert!(output(vec![], AgentId::Triage).validate(AgentId::Marketing).is_err());
    }

    #[test]
    fn handoff_from_wrong_agent_rejected() {
        let out = output(
            vec![OutputItem::Handoff { from: AgentId::Marketing, to: AgentId::Triage }],
            AgentId::Triage,
        );
        assert!(matches!(out.validate(AgentId::Technical), Err(ResponderError::InvalidOutput(_))));
    }

    #[test]
    fn handoff_outside_profile_rejected() {
        let out = output(
            vec![OutputItem::Handoff { from: AgentId::Technical, to: AgentId::Marketing }],
            AgentId::Marketing,
        );
        assert!(out.validate(AgentId::Technical).is_err());
    }

    #[test]
    fn message_after_handoff_must_come_from_target() {
        let out = output(
            vec![
                OutputItem::Handoff { from: AgentId::Triage, to: AgentId::Marketing },
                OutputItem::Message { agent: AgentId::Triage, content: "oops".into() },
            ],
            AgentId::Marketing,
        );
        assert!(out.validate(AgentId::Triage).is_err());
    }

    #[test]
    fn next_agent_must_match_chain() {
        let out = output(
            vec![OutputItem::Handoff { from: AgentId::Triage, to: AgentId::Technical }],
            AgentId::Triage,
        );
        assert!(out.validate(AgentId::Triage).is_err());
    }

    #[test]
    fn latest_user_message_skips_agent_turns() {
        let mk = |turn_id, role, content: &str| ConversationEvent {
            session_id: SessionId::from_raw("s"),
            turn_id,
            timestamp: Utc::now(),
            role,
            agent_name: None,
            body: EventBody::Message { content: content.into() },
            flags: EventFlags::for_override(false),
            flagged: false,
        };
        let req = ResponderRequest {
            session_id: SessionId::from_raw("s"),
            active_agent: AgentId::Triage,
            transcript: vec![mk(1, Role::User, "first"), mk(2, Role::User, "second"), mk(3, Role::Agent, "reply")],
            context: SharedContext::new(),
        };
        assert_eq!(req.latest_user_message(), Some("second"));
    }
}
