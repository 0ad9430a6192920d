//! v001 -- Initial schema creation.
//!
//! Creates `users`, `blocked_anon_ids`, `sessions`, `monetize_tokens` and
//! `reports`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    user_id           INTEGER PRIMARY KEY NOT NULL,  -- platform identity
    anon_id           TEXT NOT NULL UNIQUE,          -- peer-visible id
    gender            TEXT NOT NULL,
    preference        TEXT NOT NULL,
    allow_files       INTEGER NOT NULL DEFAULT 0,    -- boolean 0/1
    is_banned         INTEGER NOT NULL DEFAULT 0,    -- boolean 0/1
    warning_count     INTEGER NOT NULL DEFAULT 0,
    monetize_enabled  INTEGER,                       -- NULL = global default
    last_completed_at TEXT,                          -- RFC-3339
    next_due_at       TEXT,                          -- RFC-3339
    created_at        TEXT NOT NULL,
    last_active_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_is_banned ON users(is_banned);

CREATE TABLE IF NOT EXISTS blocked_anon_ids (
    user_id INTEGER NOT NULL,                        -- FK -> users(user_id)
    anon_id TEXT NOT NULL,

    PRIMARY KEY (user_id, anon_id),
    FOREIGN KEY (user_id) REFERENCES users(user_id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Sessions
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sessions (
    session_id       TEXT PRIMARY KEY NOT NULL,
    a_user_id        INTEGER NOT NULL,
    a_anon_id        TEXT NOT NULL,
    b_user_id        INTEGER NOT NULL,
    b_anon_id        TEXT NOT NULL,
    started_at       TEXT NOT NULL,
    status           TEXT NOT NULL,                  -- active | ended
    end_reason       TEXT,
    ended_at         TEXT,
    ended_by         INTEGER,
    message_count    INTEGER NOT NULL DEFAULT 0,
    last_activity_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_a_user ON sessions(a_user_id);
CREATE INDEX IF NOT EXISTS idx_sessions_b_user ON sessions(b_user_id);

-- ----------------------------------------------------------------
-- Monetization tokens
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS monetize_tokens (
    token      TEXT PRIMARY KEY NOT NULL,            -- UUID v4
    user_id    INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    status     TEXT NOT NULL,                        -- pending | completed | expired
    link       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tokens_user ON monetize_tokens(user_id);
CREATE INDEX IF NOT EXISTS idx_tokens_status ON monetize_tokens(status);

-- ----------------------------------------------------------------
-- Reports
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS reports (
    report_id        TEXT PRIMARY KEY NOT NULL,
    reporter_anon_id TEXT NOT NULL,
    reported_anon_id TEXT NOT NULL,
    session_id       TEXT NOT NULL,
    reason           TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    status           TEXT NOT NULL,                  -- pending | reviewed
    admin_notes      TEXT
);

CREATE INDEX IF NOT EXISTS idx_reports_status ON reports(status, created_at);
CREATE INDEX IF NOT EXISTS idx_reports_reported ON reports(reported_anon_id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
