//! SQL schema + migrations (spec §4.B.1).

use rusqlite::Connection;

pub fn init(conn: &Connection, busy_timeout_ms: u64) -> rusqlite::Result<bool> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            event_id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            command_id TEXT NOT NULL,
            ts_ms INTEGER NOT NULL,
            cwd TEXT NOT NULL,
            repo_key TEXT,
            repo_root TEXT,
            branch TEXT,
            cmd_raw TEXT NOT NULL,
            cmd_norm TEXT NOT NULL,
            exit_code INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            tool TEXT NOT NULL,
            pipeline_segments TEXT NOT NULL,
            risk_tags TEXT NOT NULL,
            source_ingest_batch INTEGER NOT NULL,
            normalizer_version INTEGER NOT NULL,
            standalone_end INTEGER NOT NULL,
            UNIQUE(session_id, command_id)
        );
        CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts_ms DESC);
        CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id);
        CREATE INDEX IF NOT EXISTS idx_events_repo ON events(repo_key);
        CREATE INDEX IF NOT EXISTS idx_events_cwd ON events(cwd);

        CREATE TABLE IF NOT EXISTS transitions (
            scope TEXT NOT NULL,
            prev_norm TEXT NOT NULL,
            next_norm TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            last_ts INTEGER NOT NULL,
            PRIMARY KEY (scope, prev_norm, next_norm)
        );
        CREATE INDEX IF NOT EXISTS idx_transitions_lookup ON transitions(scope, prev_norm, count DESC);

        CREATE TABLE IF NOT EXISTS frequency (
            scope TEXT NOT NULL,
            cmd_norm TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            last_ts INTEGER NOT NULL,
            PRIMARY KEY (scope, cmd_norm)
        );
        CREATE INDEX IF NOT EXISTS idx_frequency_lookup ON frequency(scope, count DESC);

        CREATE TABLE IF NOT EXISTS feedback (
            scope TEXT NOT NULL,
            cmd_norm TEXT NOT NULL,
            accepts INTEGER NOT NULL DEFAULT 0,
            dismisses INTEGER NOT NULL DEFAULT 0,
            learned_dismiss_ts INTEGER,
            PRIMARY KEY (scope, cmd_norm)
        );

        CREATE TABLE IF NOT EXISTS failure_recovery (
            session_scope TEXT NOT NULL,
            failed_norm TEXT NOT NULL,
            recovery_norm TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (session_scope, failed_norm, recovery_norm)
        );

        CREATE TABLE IF NOT EXISTS weights (
            signal TEXT PRIMARY KEY,
            value REAL NOT NULL,
            updated_ts INTEGER NOT NULL,
            sample_count INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )?;

    Ok(ensure_fts(conn))
}

/// Probe for FTS5 support by attempting to create (and immediately drop) a
/// virtual table inside a transaction that gets rolled back on failure. This
/// is the only way to learn whether the SQLite build has FTS5 compiled in
/// short of inspecting `sqlite3_compileoption_used`, which rusqlite does not
/// expose directly.
fn ensure_fts(conn: &Connection) -> bool {
    let result = conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS events_fts USING fts5(cmd_raw, content='events', content_rowid=rowid);
         CREATE TRIGGER IF NOT EXISTS events_ai AFTER INSERT ON events BEGIN
           INSERT INTO events_fts(rowid, cmd_raw) VALUES (new.rowid, new.cmd_raw);
         END;",
    );
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(init(&conn, 1000).unwrap());
        assert!(init(&conn, 1000).unwrap());
    }
}
