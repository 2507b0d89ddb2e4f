//! The durable-storage seam used by the orchestrator.
//!
//! `EventStore` is shared by every live session and must tolerate arbitrary
//! concurrent callers. Only per-session ordering matters; writes from
//! different sessions may interleave freely.

use desk_core::{AgentId, ConversationEvent, SessionId, SharedContext};

use crate::database::Database;
use crate::error::StoreError;
use crate::events::EventRepo;
use crate::sessions::{SessionFilter, SessionRepo, SessionRow};

pub trait EventStore: Send + Sync {
    /// Create the session row on first sight; returns the current row.
    fn ensure_session(&self, id: &SessionId) -> Result<SessionRow, StoreError>;
    fn get_session(&self, id: &SessionId) -> Result<SessionRow, StoreError>;
    fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionRow>, StoreError>;

    fn append_event(&self, event: &ConversationEvent) -> Result<(), StoreError>;
    fn list_events(&self, id: &SessionId) -> Result<Vec<ConversationEvent>, StoreError>;
    /// One stored turn; `NotFound` if it was never written.
    fn get_event(&self, id: &SessionId, turn_id: u64) -> Result<ConversationEvent, StoreError>;
    fn toggle_flag(&self, id: &SessionId, turn_id: u64) -> Result<bool, StoreError>;

    fn set_resolved(&self, id: &SessionId, resolved: bool) -> Result<(), StoreError>;
    fn set_override(&self, id: &SessionId, human_override: bool) -> Result<(), StoreError>;
    fn record_agent_state(
        &self,
        id: &SessionId,
        agent: AgentId,
        context: &SharedContext,
    ) -> Result<(), StoreError>;
    fn assign_operator(&self, id: &SessionId, operator: &str) -> Result<(), StoreError>;
    fn mark_ended(&self, id: &SessionId) -> Result<(), StoreError>;
    fn reopen(&self, id: &SessionId) -> Result<(), StoreError>;
}

/// SQLite-backed store over the session and event repositories.
pub struct SqliteEventStore {
    sessions: SessionRepo,
    events: EventRepo,
}

impl SqliteEventStore {
    pub fn new(db: Database) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            events: EventRepo::new(db),
        }
    }
}

impl EventStore for SqliteEventStore {
    fn ensure_session(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        let (row, created) = self.sessions.ensure(id)?;
        if created {
            tracing::info!(session_id = %id, "session created");
        }
        Ok(row)
    }

    fn get_session(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.sessions.get(id)
    }

    fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionRow>, StoreError> {
        self.sessions.list(filter)
    }

    fn append_event(&self, event: &ConversationEvent) -> Result<(), StoreError> {
        self.events.append(event)
    }

    fn list_events(&self, id: &SessionId) -> Result<Vec<ConversationEvent>, StoreError> {
        self.events.list(id)
    }

    fn get_event(&self, id: &SessionId, turn_id: u64) -> Result<ConversationEvent, StoreError> {
        self.events.get(id, turn_id)
    }

    fn toggle_flag(&self, id: &SessionId, turn_id: u64) -> Result<bool, StoreError> {
        self.events.toggle_flag(id, turn_id)
    }

    fn set_resolved(&self, id: &SessionId, resolved: bool) -> Result<(), StoreError> {
        self.sessions.set_resolved(id, resolved)
    }

    fn set_override(&self, id: &SessionId, human_override: bool) -> Result<(), StoreError> {
        self.sessions.set_override(id, human_override)
    }

    fn record_agent_state(
        &self,
        id: &SessionId,
        agent: AgentId,
        context: &SharedContext,
    ) -> Result<(), StoreError> {
        self.sessions.update_agent_state(id, agent, context)
    }

    fn assign_operator(&self, id: &SessionId, operator: &str) -> Result<(), StoreError> {
        self.sessions.assign_operator(id, operator)
    }

    fn mark_ended(&self, id: &SessionId) -> Result<(), StoreError> {
        self.sessions.mark_ended(id)
    }

    fn reopen(&self, id: &SessionId) -> Result<(), StoreError> {
        self.sessions.reopen(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use desk_core::{EventBody, EventFlags, Role};

    #[test]
    fn store_round_trip_through_trait_object() {
        let store: Box<dyn EventStore> = Box::new(SqliteEventStore::new(Database::in_memory().unwrap()));
        let id = SessionId::from_raw("abc123");
        let row = store.ensure_session(&id).unwrap();
        assert_eq!(row.active_agent, AgentId::Triage);

        store
            .append_event(&ConversationEvent {
                session_id: id.clone(),
                turn_id: 1,
                timestamp: Utc::now(),
                role: Role::User,
                agent_name: None,
                body: EventBody::Message { content: "hello".into() },
                flags: EventFlags::for_override(false),
                flagged: false,
            })
            .unwrap();

        assert!(store.toggle_flag(&id, 1).unwrap());
        let events = store.list_events(&id).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].flagged);
        assert_eq!(store.get_event(&id, 1).unwrap(), events[0]);

        store.set_override(&id, true).unwrap();
        store.assign_operator(&id, "sam").unwrap();
        let listed = store.list_sessions(&SessionFilter::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].human_override);
        assert_eq!(listed[0].operator.as_deref(), Some("sam"));
    }
}
