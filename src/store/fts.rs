//! Full-text search over `cmd_raw`, with a bounded LIKE-scan fallback for
//! SQLite builds without FTS5 (spec §4.B: "never silently disable search").

use rusqlite::Connection;

pub struct SearchHit {
    pub event_id: String,
    pub cmd_raw: String,
    pub cmd_norm: String,
    pub ts_ms: i64,
}

pub fn search(
    conn: &Connection,
    fts_available: bool,
    query: &str,
    scope_filter: Option<&str>,
    limit: u32,
    fallback_scan_limit: usize,
) -> rusqlite::Result<Vec<SearchHit>> {
    if fts_available {
        search_fts(conn, query, scope_filter, limit)
    } else {
        search_like(conn, query, scope_filter, limit, fallback_scan_limit)
    }
}

fn search_fts(
    conn: &Connection,
    query: &str,
    scope_filter: Option<&str>,
    limit: u32,
) -> rusqlite::Result<Vec<SearchHit>> {
    let fts_query = sanitize_fts_query(query);
    let sql = match scope_filter {
        Some(_) => {
            "SELECT e.event_id, e.cmd_raw, e.cmd_norm, e.ts_ms
             FROM events_fts f
             JOIN events e ON e.rowid = f.rowid
             WHERE events_fts MATCH ?1 AND e.repo_key = ?2
             ORDER BY e.ts_ms DESC LIMIT ?3"
        }
        None => {
            "SELECT e.event_id, e.cmd_raw, e.cmd_norm, e.ts_ms
             FROM events_fts f
             JOIN events e ON e.rowid = f.rowid
             WHERE events_fts MATCH ?1
             ORDER BY e.ts_ms DESC LIMIT ?2"
        }
    };

    let mut stmt = conn.prepare(sql)?;
    let map_row = |row: &rusqlite::Row| -> rusqlite::Result<SearchHit> {
        Ok(SearchHit {
            event_id: row.get(0)?,
            cmd_raw: row.get(1)?,
            cmd_norm: row.get(2)?,
            ts_ms: row.get(3)?,
        })
    };

    let rows = if let Some(scope) = scope_filter {
        stmt.query_map(
            rusqlite::params![fts_query, scope, limit],
            map_row,
        )?
    } else {
        stmt.query_map(rusqlite::params![fts_query, limit], map_row)?
    };

    rows.collect()
}

/// Bounded table scan with `LIKE`, capped at `fallback_scan_limit` rows
/// inspected regardless of how many match — degraded but never absent.
fn search_like(
    conn: &Connection,
    query: &str,
    scope_filter: Option<&str>,
    limit: u32,
    fallback_scan_limit: usize,
) -> rusqlite::Result<Vec<SearchHit>> {
    let pattern = format!("%{}%", query.replace('%', "").replace('_', ""));
    let sql = match scope_filter {
        Some(_) => {
            "SELECT event_id, cmd_raw, cmd_norm, ts_ms FROM
             (SELECT * FROM events WHERE repo_key = ?2 ORDER BY ts_ms DESC LIMIT ?4)
             WHERE cmd_raw LIKE ?1 LIMIT ?3"
        }
        None => {
            "SELECT event_id, cmd_raw, cmd_norm, ts_ms FROM
             (SELECT * FROM events ORDER BY ts_ms DESC LIMIT ?3)
             WHERE cmd_raw LIKE ?1 LIMIT ?2"
        }
    };

    let mut stmt = conn.prepare(sql)?;
    let map_row = |row: &rusqlite::Row| -> rusqlite::Result<SearchHit> {
        Ok(SearchHit {
            event_id: row.get(0)?,
            cmd_raw: row.get(1)?,
            cmd_norm: row.get(2)?,
            ts_ms: row.get(3)?,
        })
    };

    let rows = if let Some(scope) = scope_filter {
        stmt.query_map(
            rusqlite::params![pattern, scope, limit, fallback_scan_limit as u32],
            map_row,
        )?
    } else {
        stmt.query_map(
            rusqlite::params![pattern, limit, fallback_scan_limit as u32],
            map_row,
        )?
    };

    rows.collect()
}

/// Strips FTS5 query-syntax operators a raw user-typed fragment might
/// accidentally trigger (`"`, `*`, `:`) so search behaves as plain substring
/// matching rather than exposing MATCH syntax to callers.
fn sanitize_fts_query(query: &str) -> String {
    let cleaned: String = query
        .chars()
        .filter(|c| !matches!(c, '"' | '*' | ':' | '(' | ')'))
        .collect();
    format!("\"{}\"", cleaned.trim())
}

pub fn rebuild(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("INSERT INTO events_fts(events_fts) VALUES('rebuild');")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::init(&conn, 1000).unwrap();
        conn
    }

    fn insert_event(conn: &Connection, id: &str, cmd_raw: &str, ts: i64) {
        conn.execute(
            "INSERT INTO events (event_id, session_id, command_id, ts_ms, cwd, repo_key, repo_root,
                branch, cmd_raw, cmd_norm, exit_code, duration_ms, tool, pipeline_segments,
                risk_tags, source_ingest_batch, normalizer_version, standalone_end)
             VALUES (?1, 's1', ?1, ?2, '/tmp', NULL, NULL, NULL, ?3, ?3, 0, 10, 'git', '[]', '[]', 0, 1, 0)",
            rusqlite::params![id, ts, cmd_raw],
        )
        .unwrap();
    }

    #[test]
    fn like_fallback_finds_substring() {
        let conn = setup();
        insert_event(&conn, "e1", "git commit -m fix", 1);
        insert_event(&conn, "e2", "ls -la", 2);
        let hits = search_like(&conn, "commit", None, 10, 5000).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].event_id, "e1");
    }

    #[test]
    fn sanitize_strips_fts_operators() {
        let cleaned = sanitize_fts_query("rm -rf \"*\"");
        assert!(!cleaned.contains('*'));
    }
}
