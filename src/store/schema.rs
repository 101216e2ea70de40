//! SQLite schema bootstrap.

use rusqlite::Connection;

pub(super) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agents (
    name             TEXT PRIMARY KEY,
    token            TEXT NOT NULL UNIQUE,
    description      TEXT,
    workspace        TEXT NOT NULL,
    provider         TEXT NOT NULL,
    model            TEXT,
    reasoning_effort TEXT,
    permission_level TEXT NOT NULL,
    session_policy   TEXT,
    metadata         TEXT,
    created_at       INTEGER NOT NULL,
    last_seen_at     INTEGER
);

CREATE TABLE IF NOT EXISTS agent_bindings (
    agent_name    TEXT NOT NULL REFERENCES agents(name) ON DELETE CASCADE,
    adapter_type  TEXT NOT NULL,
    adapter_token TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    UNIQUE(adapter_type, adapter_token),
    UNIQUE(agent_name, adapter_type)
);

CREATE TABLE IF NOT EXISTS envelopes (
    id         TEXT PRIMARY KEY,
    from_addr  TEXT NOT NULL,
    to_addr    TEXT NOT NULL,
    from_boss  INTEGER NOT NULL DEFAULT 0,
    content    TEXT NOT NULL,
    deliver_at INTEGER,
    status     TEXT NOT NULL DEFAULT 'pending',
    created_at INTEGER NOT NULL,
    metadata   TEXT
);

CREATE INDEX IF NOT EXISTS idx_envelopes_due
    ON envelopes(status, deliver_at, created_at);
CREATE INDEX IF NOT EXISTS idx_envelopes_to
    ON envelopes(to_addr, status);

CREATE TABLE IF NOT EXISTS cron_schedules (
    id                  TEXT PRIMARY KEY,
    agent_name          TEXT NOT NULL,
    cron                TEXT NOT NULL,
    timezone            TEXT,
    enabled             INTEGER NOT NULL DEFAULT 1,
    to_addr             TEXT NOT NULL,
    content             TEXT NOT NULL,
    metadata            TEXT,
    pending_envelope_id TEXT,
    created_at          INTEGER NOT NULL,
    updated_at          INTEGER
);

CREATE TABLE IF NOT EXISTS agent_runs (
    id             TEXT PRIMARY KEY,
    agent_name     TEXT NOT NULL,
    started_at     INTEGER NOT NULL,
    completed_at   INTEGER,
    envelope_ids   TEXT NOT NULL,
    final_response TEXT,
    context_length INTEGER,
    status         TEXT NOT NULL,
    error          TEXT
);

CREATE INDEX IF NOT EXISTS idx_agent_runs_agent
    ON agent_runs(agent_name, started_at);

CREATE TABLE IF NOT EXISTS config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

pub(super) fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.execute_batch(SCHEMA)
}
