//! Per-session conversation state.
//!
//! `SessionState` is owned by exactly one session actor, so nothing here is
//! synchronized. Every event it creates takes the next turn id; turn ids
//! start at 1 and never skip.

use chrono::Utc;

use desk_core::{
    AgentId, ConversationEvent, EventBody, EventFlags, Handoff, OutputItem, ResponderError,
    ResponderOutput, ResponderRequest, Role, SessionId, SharedContext, ToolCall, HUMAN_SUPPORT,
};
use desk_store::SessionRow;

#[derive(Clone, Debug)]
pub struct SessionState {
    id: SessionId,
    active_agent: AgentId,
    transcript: Vec<ConversationEvent>,
    next_turn: u64,
    human_override: bool,
    resolved: bool,
    context: SharedContext,
}

impl SessionState {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            active_agent: AgentId::default(),
            transcript: Vec::new(),
            next_turn: 1,
            human_override: false,
            resolved: false,
            context: SharedContext::new(),
        }
    }

    /// Rebuild from a stored row and its events (ascending by turn).
    pub fn restore(row: &SessionRow, transcript: Vec<ConversationEvent>) -> Self {
        let next_turn = transcript.last().map_or(1, |e| e.turn_id + 1);
        Self {
            id: row.id.clone(),
            active_agent: row.active_agent,
            transcript,
            next_turn,
            human_override: row.human_override,
            resolved: row.resolved,
            context: row.shared_context.clone(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn active_agent(&self) -> AgentId {
        self.active_agent
    }

    pub fn transcript(&self) -> &[ConversationEvent] {
        &self.transcript
    }

    pub fn next_turn(&self) -> u64 {
        self.next_turn
    }

    pub fn human_override(&self) -> bool {
        self.human_override
    }

    pub fn resolved(&self) -> bool {
        self.resolved
    }

    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    fn push(&mut self, role: Role, agent_name: Option<String>, body: EventBody) -> ConversationEvent {
        let event = ConversationEvent {
            session_id: self.id.clone(),
            turn_id: self.next_turn,
            timestamp: Utc::now(),
            role,
            agent_name,
            body,
            flags: EventFlags::for_override(self.human_override),
            flagged: false,
        };
        self.next_turn += 1;
        self.transcript.push(event.clone());
        event
    }

    /// Log the user's message. Returns the event and whether the responder
    /// should be asked for a reply.
    pub fn record_user_message(&mut self, text: &str) -> (ConversationEvent, bool) {
        let event = self.push(Role::User, None, EventBody::Message { content: text.to_string() });
        (event, !self.human_override)
    }

    /// Log a message typed by the human operator.
    pub fn record_operator_message(&mut self, text: &str) -> ConversationEvent {
        self.push(
            Role::Agent,
            Some(HUMAN_SUPPORT.to_string()),
            EventBody::Message { content: text.to_string() },
        )
    }

    pub fn record_system(&mut self, content: impl Into<String>) -> ConversationEvent {
        self.push(Role::System, None, EventBody::System { content: content.into() })
    }

    /// `None` when override was already on.
    pub fn enable_override(&mut self) -> Option<ConversationEvent> {
        if self.human_override {
            return None;
        }
        self.human_override = true;
        Some(self.record_system("Human override enabled; automated replies paused"))
    }

    /// `None` when override was already off.
    pub fn release_override(&mut self) -> Option<ConversationEvent> {
        if !self.human_override {
            return None;
        }
        self.human_override = false;
        Some(self.record_system(format!(
            "Human override released; {} resumed",
            self.active_agent.display_name()
        )))
    }

    /// Returns whether the value changed.
    pub fn set_resolved(&mut self, resolved: bool) -> bool {
        std::mem::replace(&mut self.resolved, resolved) != resolved
    }

    /// Flip `flagged` on an in-memory event. `None` if the turn is unknown.
    pub fn toggle_flag(&mut self, turn_id: u64) -> Option<bool> {
        let event = self.transcript.iter_mut().find(|e| e.turn_id == turn_id)?;
        event.flagged = !event.flagged;
        Some(event.flagged)
    }

    /// Overwrite `flagged` on an in-memory event, e.g. after the store toggled it.
    pub fn set_flag(&mut self, turn_id: u64, flagged: bool) {
        if let Some(event) = self.transcript.iter_mut().find(|e| e.turn_id == turn_id) {
            event.flagged = flagged;
        }
    }

    pub fn responder_request(&self) -> ResponderRequest {
        ResponderRequest {
            session_id: self.id.clone(),
            active_agent: self.active_agent,
            transcript: self.transcript.clone(),
            context: self.context.clone(),
        }
    }

    /// Turn each output item into one event, in order, then adopt the
    /// responder's next agent and context. An inconsistent output is
    /// rejected before anything changes.
    pub fn apply_responder_output(
        &mut self,
        output: ResponderOutput,
    ) -> Result<Vec<ConversationEvent>, ResponderError> {
        output.validate(self.active_agent)?;

        let mut events = Vec::with_capacity(output.items.len());
        for item in output.items {
            let event = match item {
                OutputItem::Message { agent, content } => self.push(
                    Role::Agent,
                    Some(agent.display_name().to_string()),
                    EventBody::Message { content },
                ),
                OutputItem::ToolCall { agent, name, args } => self.push(
                    Role::Agent,
                    Some(agent.display_name().to_string()),
                    EventBody::ToolCall { tool_call: ToolCall { name, args } },
                ),
                OutputItem::ToolResult { agent, output } => self.push(
                    Role::Agent,
                    Some(agent.display_name().to_string()),
                    EventBody::ToolResult { content: output },
                ),
                OutputItem::Handoff { from, to } => self.push(
                    Role::Agent,
                    Some(from.display_name().to_string()),
                    EventBody::Handoff { handoff: Handoff { from, to } },
                ),
            };
            events.push(event);
        }

        self.active_agent = output.next_agent;
        self.context = output.context;
        if output.resolved {
            self.resolved = true;
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> SessionState {
        SessionState::new(SessionId::from_raw("abc123"))
    }

    fn output(items: Vec<OutputItem>, next_agent: AgentId) -> ResponderOutput {
        ResponderOutput { items, next_agent, context: SharedContext::new(), resolved: false }
    }

    fn turn_ids(state: &SessionState) -> Vec<u64> {
        state.transcript().iter().map(|e| e.turn_id).collect()
    }

    #[test]
    fn new_session_starts_at_triage_turn_one() {
        let s = state();
        assert_eq!(s.active_agent(), AgentId::Triage);
        assert_eq!(s.next_turn(), 1);
        assert!(!s.human_override());
        assert!(s.transcript().is_empty());
    }

    #[test]
    fn mic_scenario_produces_three_gapless_turns() {
        let mut s = state();
        let (user, forward) = s.record_user_message("my mic isn't working");
        assert!(forward);
        assert_eq!(user.turn_id, 1);
        assert_eq!(user.role, Role::User);

        let events = s
            .apply_responder_output(output(
                vec![
                    OutputItem::Handoff { from: AgentId::Triage, to: AgentId::Technical },
                    OutputItem::Message { agent: AgentId::Technical, content: "Hello".into() },
                ],
                AgentId::Technical,
            ))
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].turn_id, 2);
        assert_eq!(
            events[0].handoff(),
            Some(Handoff { from: AgentId::Triage, to: AgentId::Technical })
        );
        assert_eq!(events[1].turn_id, 3);
        assert_eq!(events[1].agent_name.as_deref(), Some("TechnicalSupportAgent"));
        assert_eq!(s.active_agent(), AgentId::Technical);
        assert_eq!(turn_ids(&s), vec![1, 2, 3]);
        assert!(events.iter().all(|e| e.flags.ai_active));
    }

    #[test]
    fn tool_items_become_events_and_context_is_adopted() {
        let mut s = state();
        s.record_user_message("hi");
        let mut ctx = SharedContext::new();
        ctx.insert("interview_id".into(), json!("42"));
        let events = s
            .apply_responder_output(ResponderOutput {
                items: vec![
                    OutputItem::ToolCall {
                        agent: AgentId::Triage,
                        name: "lookup".into(),
                        args: json!({"id": "42"}),
                    },
                    OutputItem::ToolResult { agent: AgentId::Triage, output: "ok".into() },
                ],
                next_agent: AgentId::Triage,
                context: ctx,
                resolved: true,
            })
            .unwrap();
        assert_eq!(events[0].body.kind(), "tool_call");
        assert_eq!(events[1].body.kind(), "tool_result");
        assert_eq!(s.context()["interview_id"], "42");
        assert!(s.resolved());
    }

    #[test]
    fn inconsistent_output_leaves_state_untouched() {
        let mut s = state();
        s.record_user_message("hello");
        let before = s.clone();

        let err = s
            .apply_responder_output(output(
                vec![OutputItem::Message { agent: AgentId::Marketing, content: "hi".into() }],
                AgentId::Marketing,
            ))
            .unwrap_err();

        assert!(matches!(err, ResponderError::InvalidOutput(_)));
        assert_eq!(s.next_turn(), before.next_turn());
        assert_eq!(s.active_agent(), AgentId::Triage);
        assert_eq!(s.transcript().len(), 1);
    }

    #[test]
    fn override_stops_forwarding_and_clears_ai_active() {
        let mut s = state();
        let enabled = s.enable_override().unwrap();
        assert_eq!(enabled.role, Role::System);
        assert!(!enabled.flags.ai_active);
        assert!(enabled.flags.human_override);

        let (user, forward) = s.record_user_message("still broken");
        assert!(!forward);
        assert!(!user.flags.ai_active);

        let reply = s.record_operator_message("Let me look");
        assert_eq!(reply.agent_name.as_deref(), Some(HUMAN_SUPPORT));
        assert_eq!(reply.role, Role::Agent);
        assert_eq!(turn_ids(&s), vec![1, 2, 3]);
    }

    #[test]
    fn override_toggles_are_idempotent() {
        let mut s = state();
        assert!(s.release_override().is_none());
        assert!(s.enable_override().is_some());
        assert!(s.enable_override().is_none());
        let released = s.release_override().unwrap();
        assert!(released.flags.ai_active);
        assert!(s.release_override().is_none());
        assert_eq!(s.next_turn(), 3);
    }

    #[test]
    fn resolved_changes_nothing_else() {
        let mut s = state();
        assert!(s.set_resolved(true));
        assert!(!s.set_resolved(true));
        assert_eq!(s.active_agent(), AgentId::Triage);
        assert!(!s.human_override());
        assert_eq!(s.next_turn(), 1);
    }

    #[test]
    fn toggle_flag_on_known_turn_only() {
        let mut s = state();
        s.record_user_message("hello");
        assert_eq!(s.toggle_flag(1), Some(true));
        assert_eq!(s.toggle_flag(1), Some(false));
        assert_eq!(s.toggle_flag(7), None);
    }

    #[test]
    fn restore_continues_turn_numbering() {
        let mut original = state();
        original.record_user_message("one");
        original.record_system("two");

        let row = SessionRow {
            id: original.id().clone(),
            started_at: Utc::now().to_rfc3339(),
            ended_at: None,
            resolved: false,
            human_override: true,
            active_agent: AgentId::Marketing,
            shared_context: SharedContext::new(),
            operator: None,
            updated_at: Utc::now().to_rfc3339(),
        };
        let mut restored = SessionState::restore(&row, original.transcript().to_vec());
        assert_eq!(restored.next_turn(), 3);
        assert_eq!(restored.active_agent(), AgentId::Marketing);
        assert!(restored.human_override());

        let (event, forward) = restored.record_user_message("three");
        assert_eq!(event.turn_id, 3);
        assert!(!forward);
    }

    #[test]
    fn responder_request_carries_full_transcript() {
        let mut s = state();
        s.record_user_message("my mic isn't working");
        let request = s.responder_request();
        assert_eq!(request.active_agent, AgentId::Triage);
        assert_eq!(request.latest_user_message(), Some("my mic isn't working"));
        assert_eq!(request.transcript.len(), 1);
    }
}
