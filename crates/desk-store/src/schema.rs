/// SQL DDL for the desk-store database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    resolved INTEGER NOT NULL DEFAULT 0,
    human_override INTEGER NOT NULL DEFAULT 0,
    active_agent TEXT NOT NULL DEFAULT 'TriageAgent',
    shared_context TEXT NOT NULL DEFAULT '{}',
    operator TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    session_id TEXT NOT NULL REFERENCES sessions(id),
    turn_id INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    role TEXT NOT NULL,
    agent_name TEXT,
    kind TEXT NOT NULL,
    body TEXT NOT NULL,
    ai_active INTEGER NOT NULL,
    human_override INTEGER NOT NULL,
    flagged INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (session_id, turn_id)
);

CREATE INDEX IF NOT EXISTS idx_sessions_started ON sessions(started_at);
CREATE INDEX IF NOT EXISTS idx_sessions_resolved ON sessions(resolved);
CREATE INDEX IF NOT EXISTS idx_events_flagged ON events(session_id, flagged);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
