use chrono::Utc;
use rusqlite::params;
use tracing::instrument;

use desk_core::{ConversationEvent, EventBody, EventFlags, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const EVENT_COLUMNS: &str =
    "session_id, turn_id, timestamp, role, agent_name, body, ai_active, human_override, flagged";

/// Append-only conversation log. `(session_id, turn_id)` is the primary key,
/// so a turn can be written at most once.
pub struct EventRepo {
    db: Database,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert one event and bump the owning session's `updated_at`.
    /// A second write of the same turn returns `Conflict`.
    #[instrument(skip(self, event), fields(session_id = %event.session_id, turn_id = event.turn_id, kind = event.body.kind()))]
    pub fn append(&self, event: &ConversationEvent) -> Result<(), StoreError> {
        let body = serde_json::to_string(&event.body)?;
        let turn_id = i64::try_from(event.turn_id)
            .map_err(|_| StoreError::Conflict(format!("turn id {} out of range", event.turn_id)))?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events (session_id, turn_id, timestamp, role, agent_name, kind, body,
                                     ai_active, human_override, flagged)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    event.session_id.as_str(),
                    turn_id,
                    event.timestamp.to_rfc3339(),
                    event.role.to_string(),
                    event.agent_name,
                    event.body.kind(),
                    body,
                    event.flags.ai_active,
                    event.flags.human_override,
                    event.flagged,
                ],
            )?;
            conn.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), event.session_id.as_str()],
            )?;
            Ok(())
        })
    }

    /// All events of a session in turn order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<ConversationEvent>, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE session_id = ?1 ORDER BY turn_id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn get(&self, session_id: &SessionId, turn_id: u64) -> Result<ConversationEvent, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE session_id = ?1 AND turn_id = ?2");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![session_id.as_str(), turn_id as i64])?;
            match rows.next()? {
                Some(row) => row_to_event(row),
                None => Err(StoreError::NotFound(format!("turn {turn_id} of session {session_id}"))),
            }
        })
    }

    /// Flip the `flagged` marker on one turn; returns the new value.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn toggle_flag(&self, session_id: &SessionId, turn_id: u64) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE events SET flagged = NOT flagged WHERE session_id = ?1 AND turn_id = ?2",
                params![session_id.as_str(), turn_id as i64],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("turn {turn_id} of session {session_id}")));
            }
            Ok(conn.query_row(
                "SELECT flagged FROM events WHERE session_id = ?1 AND turn_id = ?2",
                params![session_id.as_str(), turn_id as i64],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<ConversationEvent, StoreError> {
    let turn_id: i64 = row_helpers::get(row, 1, "events", "turn_id")?;
    let timestamp: String = row_helpers::get(row, 2, "events", "timestamp")?;
    let role: String = row_helpers::get(row, 3, "events", "role")?;
    let body: String = row_helpers::get(row, 5, "events", "body")?;

    Ok(ConversationEvent {
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "events", "session_id")?),
        turn_id: u64::try_from(turn_id).map_err(|_| StoreError::CorruptRow {
            table: "events",
            column: "turn_id",
            detail: format!("negative turn id {turn_id}"),
        })?,
        timestamp: row_helpers::parse_timestamp(&timestamp, "events", "timestamp")?,
        role: row_helpers::parse_enum(&role, "events", "role")?,
        agent_name: row_helpers::get_opt(row, 4, "events", "agent_name")?,
        body: row_helpers::parse_json::<EventBody>(&body, "events", "body")?,
        flags: EventFlags {
            ai_active: row_helpers::get(row, 6, "events", "ai_active")?,
            human_override: row_helpers::get(row, 7, "events", "human_override")?,
        },
        flagged: row_helpers::get(row, 8, "events", "flagged")?,
    })
}
