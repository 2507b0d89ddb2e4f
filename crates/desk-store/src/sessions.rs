use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use tracing::instrument;

use desk_core::{AgentId, SessionId, SharedContext};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const SESSION_COLUMNS: &str = "id, started_at, ended_at, resolved, human_override, active_agent,
                               shared_context, operator, updated_at";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub resolved: bool,
    pub human_override: bool,
    pub active_agent: AgentId,
    pub shared_context: SharedContext,
    pub operator: Option<String>,
    pub updated_at: String,
}

/// Filter for listing sessions; newest first.
#[derive(Clone, Debug)]
pub struct SessionFilter {
    pub resolved: Option<bool>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for SessionFilter {
    fn default() -> Self {
        Self {
            resolved: None,
            limit: 100,
            offset: 0,
        }
    }
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the session if it does not exist yet. Returns the row and
    /// whether it was created by this call.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn ensure(&self, id: &SessionId) -> Result<(SessionRow, bool), StoreError> {
        let now = Utc::now().to_rfc3339();
        let inserted = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT OR IGNORE INTO sessions (id, started_at, active_agent, updated_at)
                 VALUES (?1, ?2, ?3, ?2)",
                params![id.as_str(), now, AgentId::default().to_string()],
            )?)
        })?;
        Ok((self.get(id)?, inserted == 1))
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    #[instrument(skip(self))]
    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut sql = format!("SELECT {SESSION_COLUMNS} FROM sessions");
            let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
            if let Some(resolved) = filter.resolved {
                sql.push_str(" WHERE resolved = ?1");
                values.push(Box::new(resolved));
            }
            sql.push_str(&format!(
                " ORDER BY started_at DESC, id LIMIT {} OFFSET {}",
                filter.limit, filter.offset
            ));

            let refs: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(refs.as_slice())?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn set_resolved(&self, id: &SessionId, resolved: bool) -> Result<(), StoreError> {
        self.update(id, "resolved = ?1", resolved)
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn set_override(&self, id: &SessionId, human_override: bool) -> Result<(), StoreError> {
        self.update(id, "human_override = ?1", human_override)
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn assign_operator(&self, id: &SessionId, operator: &str) -> Result<(), StoreError> {
        self.update(id, "operator = ?1", operator)
    }

    /// Persist routing state carried across turns.
    #[instrument(skip(self, context), fields(session_id = %id, agent = %agent))]
    pub fn update_agent_state(
        &self,
        id: &SessionId,
        agent: AgentId,
        context: &SharedContext,
    ) -> Result<(), StoreError> {
        let context_json = serde_json::to_string(context)?;
        let now = Utc::now().to_rfc3339();
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE sessions SET active_agent = ?1, shared_context = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![agent.to_string(), context_json, now, id.as_str()],
            )?)
        })?;
        require_one(changed, id)
    }

    /// Record the end-user disconnect time.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn mark_ended(&self, id: &SessionId) -> Result<(), StoreError> {
        self.update(id, "ended_at = ?1", Utc::now().to_rfc3339())
    }

    /// Clear `ended_at` when the end user comes back.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn reopen(&self, id: &SessionId) -> Result<(), StoreError> {
        self.update(id, "ended_at = ?1", Option::<String>::None)
    }

    fn update<V: rusqlite::types::ToSql>(
        &self,
        id: &SessionId,
        assignment: &str,
        value: V,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let sql = format!("UPDATE sessions SET {assignment}, updated_at = ?2 WHERE id = ?3");
        let changed = self
            .db
            .with_conn(|conn| Ok(conn.execute(&sql, params![value, now, id.as_str()])?))?;
        require_one(changed, id)
    }
}

fn require_one(changed: usize, id: &SessionId) -> Result<(), StoreError> {
    if changed == 0 {
        Err(StoreError::NotFound(format!("session {id}")))
    } else {
        Ok(())
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let agent_raw: String = row_helpers::get(row, 5, "sessions", "active_agent")?;
    let context_raw: String = row_helpers::get(row, 6, "sessions", "shared_context")?;

    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        started_at: row_helpers::get(row, 1, "sessions", "started_at")?,
        ended_at: row_helpers::get_opt(row, 2, "sessions", "ended_at")?,
        resolved: row_helpers::get(row, 3, "sessions", "resolved")?,
        human_override: row_helpers::get(row, 4, "sessions", "human_override")?,
        active_agent: row_helpers::parse_enum(&agent_raw, "sessions", "active_agent")?,
        shared_context: row_helpers::parse_json(&context_raw, "sessions", "shared_context")?,
        operator: row_helpers::get_opt(row, 7, "sessions", "operator")?,
        updated_at: row_helpers::get(row, 8, "sessions", "updated_at")?,
    })
}
