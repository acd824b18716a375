//! SQLite schema for the dispatch store
//!
//! Timestamps are epoch milliseconds (INTEGER), phones are stored E.164,
//! and the recipient list rides along as a JSON document column. The retry
//! queue shares `outbound_messages` via the `(status, next_retry_at)` index
//! instead of a second table, so message state has one source of truth.
//! `claimed_until` is the retry-claim lease: a drained row stays
//! `PENDING_RETRY` but is skipped by further drains until the claim expires,
//! so a crash mid-attempt makes the row drainable again instead of lost.

use rusqlite::Connection;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id            TEXT PRIMARY KEY,
    file_name             TEXT NOT NULL,
    campaign_name         TEXT NOT NULL,
    campaign_type         TEXT NOT NULL,
    recipients            TEXT NOT NULL,
    template              TEXT NOT NULL,
    send_speed            INTEGER NOT NULL,
    sim_slot              INTEGER NOT NULL,
    last_processed_index  INTEGER NOT NULL,
    sent_count            INTEGER NOT NULL,
    failed_count          INTEGER NOT NULL,
    skipped_count         INTEGER NOT NULL,
    processing_status     TEXT NOT NULL,
    scheduled_at          INTEGER,
    scheduled_tz          TEXT,
    created_at            INTEGER NOT NULL,
    updated_at            INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS outbound_messages (
    msg_id           TEXT PRIMARY KEY,
    session_id       TEXT NOT NULL,
    recipient_index  INTEGER NOT NULL,
    phone            TEXT NOT NULL,
    body             TEXT NOT NULL,
    sim_slot         INTEGER NOT NULL,
    status           TEXT NOT NULL,
    retry_count      INTEGER NOT NULL,
    next_retry_at    INTEGER,
    claimed_until    INTEGER,
    error_code       TEXT,
    error_message    TEXT,
    created_at       INTEGER NOT NULL,
    sent_at          INTEGER,
    delivered_at     INTEGER
);

CREATE INDEX IF NOT EXISTS idx_outbound_status_retry
    ON outbound_messages (status, next_retry_at);
CREATE INDEX IF NOT EXISTS idx_outbound_session
    ON outbound_messages (session_id);

CREATE TABLE IF NOT EXISTS optouts (
    phone       TEXT PRIMARY KEY,
    reason      TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS schedules (
    session_id  TEXT PRIMARY KEY,
    fire_at_ms  INTEGER NOT NULL,
    timezone    TEXT,
    created_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_schedules_fire_at
    ON schedules (fire_at_ms);

CREATE TABLE IF NOT EXISTS leases (
    session_id  TEXT PRIMARY KEY,
    owner_id    TEXT NOT NULL,
    expires_at  INTEGER NOT NULL
);
"#;

/// Apply the schema and connection pragmas
pub fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_applies_twice() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        // idempotent
        init(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap()
        };
        for table in ["sessions", "outbound_messages", "optouts", "schedules", "leases"] {
            assert!(tables.iter().any(|t| t == table), "missing {table}");
        }
    }
}
