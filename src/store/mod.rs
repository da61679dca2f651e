//! Store facade (spec §4.B): one dedicated writer task owns the read-write
//! `rusqlite::Connection` in WAL mode; every mutation is serialized through an
//! mpsc channel of boxed jobs, the way `src/ledger.rs`'s single-file-lock
//! discipline in the teacher serializes JSONL appends, generalized here to a
//! real SQL writer instead of a flock. Reads never touch the writer: they
//! open their own short-lived connection via `spawn_blocking`, relying on
//! WAL's MVCC snapshotting plus `busy_timeout` for the rare writer collision
//! (§5 "serialized writer, MVCC readers with busy-timeout").

mod fts;
mod schema;

use crate::models::CommandEvent;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

pub use fts::SearchHit;

type WriteJob = Box<dyn FnOnce(&Connection) + Send>;

#[derive(Debug, Clone)]
pub struct TransitionRow {
    pub next_norm: String,
    pub count: u64,
    pub last_ts: i64,
}

#[derive(Debug, Clone)]
pub struct FrequencyRow {
    pub cmd_norm: String,
    pub count: u64,
    pub success_count: u64,
    pub last_ts: i64,
}

#[derive(Debug, Clone)]
pub struct FailureRecoveryRow {
    pub recovery_norm: String,
    pub count: u64,
}

#[derive(Debug, Clone)]
pub struct EventRow {
    pub event_id: String,
    pub ts_ms: i64,
    pub cwd: String,
    pub cmd_raw: String,
    pub cmd_norm: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub session_id: Option<String>,
    pub cwd: Option<String>,
    pub repo_key: Option<String>,
    pub success_only: Option<bool>,
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
}

#[derive(Clone)]
pub struct Store {
    tx: mpsc::Sender<WriteJob>,
    db_path: PathBuf,
    busy_timeout_ms: u64,
    fts_available: bool,
}

impl Store {
    /// Opens (creating if needed) the database at `db_path`, runs schema
    /// migrations, and spawns the writer task. Must be called once at daemon
    /// startup (§5).
    pub async fn open(db_path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }

        let writer_conn =
            Connection::open(db_path).with_context(|| format!("opening {db_path:?}"))?;
        let fts_available = schema::init(&writer_conn, busy_timeout_ms)?;

        let (tx, mut rx) = mpsc::channel::<WriteJob>(256);
        std::thread::Builder::new()
            .name("clai-store-writer".into())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job(&writer_conn);
                }
            })
            .context("spawning store writer thread")?;

        Ok(Store {
            tx,
            db_path: db_path.to_path_buf(),
            busy_timeout_ms,
            fts_available,
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: WriteJob = Box::new(move |conn| {
            let result = f(conn);
            let _ = tx.send(result);
        });
        self.tx
            .send(job)
            .await
            .map_err(|_| anyhow::anyhow!("store writer task has shut down"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("store writer dropped response"))?
    }

    fn read_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_millis(self.busy_timeout_ms))?;
        Ok(conn)
    }

    pub fn fts_available(&self) -> bool {
        self.fts_available
    }

    /// Idempotent insert keyed on `(session_id, command_id)` (§3 invariant:
    /// replays of the same command_start/command_end pair must not duplicate
    /// rows), followed by the transition/frequency aggregate bumps for every
    /// scope the event belongs to. All in one writer-thread job so the event
    /// row and its aggregates land atomically.
    pub async fn append_event(
        &self,
        event: CommandEvent,
        scopes: Vec<String>,
        prev_norm: Option<String>,
    ) -> Result<bool> {
        self.call(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO events (event_id, session_id, command_id, ts_ms, cwd,
                    repo_key, repo_root, branch, cmd_raw, cmd_norm, exit_code, duration_ms, tool,
                    pipeline_segments, risk_tags, source_ingest_batch, normalizer_version, standalone_end)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
                params![
                    event.event_id,
                    event.session_id,
                    event.command_id,
                    event.ts_ms,
                    event.cwd,
                    event.repo_key,
                    event.repo_root,
                    event.branch,
                    event.cmd_raw,
                    event.cmd_norm,
                    event.exit_code,
                    event.duration_ms,
                    event.tool,
                    serde_json::to_string(&event.pipeline_segments)?,
                    serde_json::to_string(&event.risk_tags)?,
                    event.source_ingest_batch,
                    crate::normalizer::NORMALIZER_VERSION,
                    event.standalone_end,
                ],
            )?;

            if inserted > 0 {
                for scope in &scopes {
                    tx.execute(
                        "INSERT INTO frequency (scope, cmd_norm, count, success_count, last_ts)
                         VALUES (?1, ?2, 1, ?3, ?4)
                         ON CONFLICT(scope, cmd_norm) DO UPDATE SET
                            count = count + 1,
                            success_count = success_count + ?3,
                            last_ts = ?4",
                        params![
                            scope,
                            event.cmd_norm,
                            if event.exit_code == 0 { 1 } else { 0 },
                            event.ts_ms
                        ],
                    )?;

                    if let Some(prev) = &prev_norm {
                        tx.execute(
                            "INSERT INTO transitions (scope, prev_norm, next_norm, count, last_ts)
                             VALUES (?1, ?2, ?3, 1, ?4)
                             ON CONFLICT(scope, prev_norm, next_norm) DO UPDATE SET
                                count = count + 1,
                                last_ts = ?4",
                            params![scope, prev, event.cmd_norm, event.ts_ms],
                        )?;
                    }
                }
            }

            tx.commit()?;
            Ok(inserted > 0)
        })
        .await
    }

    pub async fn record_failure_recovery(
        &self,
        session_scope: String,
        failed_norm: String,
        recovery_norm: String,
    ) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO failure_recovery (session_scope, failed_norm, recovery_norm, count)
                 VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(session_scope, failed_norm, recovery_norm) DO UPDATE SET
                    count = count + 1",
                params![session_scope, failed_norm, recovery_norm],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn record_feedback(&self, scope: String, cmd_norm: String, accepted: bool) -> Result<()> {
        self.call(move |conn| {
            if accepted {
                conn.execute(
                    "INSERT INTO feedback (scope, cmd_norm, accepts, dismisses)
                     VALUES (?1, ?2, 1, 0)
                     ON CONFLICT(scope, cmd_norm) DO UPDATE SET accepts = accepts + 1",
                    params![scope, cmd_norm],
                )?;
            } else {
                conn.execute(
                    "INSERT INTO feedback (scope, cmd_norm, accepts, dismisses, learned_dismiss_ts)
                     VALUES (?1, ?2, 0, 1, ?3)
                     ON CONFLICT(scope, cmd_norm) DO UPDATE SET
                        dismisses = dismisses + 1,
                        learned_dismiss_ts = ?3",
                    params![scope, cmd_norm, crate::util::now_ms()],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn save_weight(&self, signal: String, value: f64, sample_count: u64) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO weights (signal, value, updated_ts, sample_count)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(signal) DO UPDATE SET
                    value = ?2, updated_ts = ?3, sample_count = ?4",
                params![signal, value, crate::util::now_ms(), sample_count],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn load_weights(&self) -> Result<Vec<(String, f64, u64)>> {
        let conn = self.read_conn()?;
        tokio::task::spawn_blocking(move || -> Result<Vec<(String, f64, u64)>> {
            let mut stmt = conn.prepare("SELECT signal, value, sample_count FROM weights")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?, row.get::<_, i64>(2)? as u64))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await?
    }

    pub async fn top_transitions(
        &self,
        scope: String,
        prev_norm: String,
        limit: u32,
    ) -> Result<Vec<TransitionRow>> {
        let conn = self.read_conn()?;
        tokio::task::spawn_blocking(move || -> Result<Vec<TransitionRow>> {
            let mut stmt = conn.prepare(
                "SELECT next_norm, count, last_ts FROM transitions
                 WHERE scope = ?1 AND prev_norm = ?2
                 ORDER BY count DESC, last_ts DESC LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![scope, prev_norm, limit], |row| {
                    Ok(TransitionRow {
                        next_norm: row.get(0)?,
                        count: row.get::<_, i64>(1)? as u64,
                        last_ts: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await?
    }

    /// Most recent command in a scope, used by the Candidate generator's
    /// transition fallback when the session itself has no `prev_norm` yet
    /// (§4.E: "absent a session match... the most-recent command in the same
    /// repo within the window").
    pub async fn most_recent_in_scope(&self, repo_key: String, window_floor_ms: i64) -> Result<Option<String>> {
        let conn = self.read_conn()?;
        tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            conn.query_row(
                "SELECT cmd_norm FROM events WHERE repo_key = ?1 AND ts_ms >= ?2
                 ORDER BY ts_ms DESC LIMIT 1",
                params![repo_key, window_floor_ms],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
        })
        .await?
    }

    pub async fn top_frequency(&self, scope: String, limit: u32) -> Result<Vec<FrequencyRow>> {
        let conn = self.read_conn()?;
        tokio::task::spawn_blocking(move || -> Result<Vec<FrequencyRow>> {
            let mut stmt = conn.prepare(
                "SELECT cmd_norm, count, success_count, last_ts FROM frequency
                 WHERE scope = ?1 ORDER BY count DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![scope, limit], |row| {
                    Ok(FrequencyRow {
                        cmd_norm: row.get(0)?,
                        count: row.get::<_, i64>(1)? as u64,
                        success_count: row.get::<_, i64>(2)? as u64,
                        last_ts: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await?
    }

    pub async fn failure_recoveries(
        &self,
        session_scope: String,
        failed_norm: String,
        min_count: u64,
    ) -> Result<Vec<FailureRecoveryRow>> {
        let conn = self.read_conn()?;
        tokio::task::spawn_blocking(move || -> Result<Vec<FailureRecoveryRow>> {
            let mut stmt = conn.prepare(
                "SELECT recovery_norm, count FROM failure_recovery
                 WHERE session_scope = ?1 AND failed_norm = ?2 AND count >= ?3
                 ORDER BY count DESC",
            )?;
            let rows = stmt
                .query_map(params![session_scope, failed_norm, min_count as i64], |row| {
                    Ok(FailureRecoveryRow {
                        recovery_norm: row.get(0)?,
                        count: row.get::<_, i64>(1)? as u64,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await?
    }

    pub async fn feedback_counts(&self, scope: String, cmd_norm: String) -> Result<(u64, u64)> {
        let conn = self.read_conn()?;
        tokio::task::spawn_blocking(move || -> Result<(u64, u64)> {
            let row = conn
                .query_row(
                    "SELECT accepts, dismisses FROM feedback WHERE scope = ?1 AND cmd_norm = ?2",
                    params![scope, cmd_norm],
                    |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
                )
                .optional()?;
            Ok(row.unwrap_or((0, 0)))
        })
        .await?
    }

    pub async fn search(
        &self,
        query: String,
        scope_filter: Option<String>,
        limit: u32,
        fallback_scan_limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let conn = self.read_conn()?;
        let fts_available = self.fts_available;
        tokio::task::spawn_blocking(move || -> Result<Vec<SearchHit>> {
            Ok(fts::search(
                &conn,
                fts_available,
                &query,
                scope_filter.as_deref(),
                limit,
                fallback_scan_limit,
            )?)
        })
        .await?
    }

    /// Plain filtered listing for `history{}` requests that carry no text
    /// query (§6) — `search` above handles the FTS/LIKE text-match path,
    /// this handles the structural session/cwd/repo/status/time filters.
    pub async fn list_events(&self, filter: EventFilter, limit: u32) -> Result<Vec<EventRow>> {
        let conn = self.read_conn()?;
        tokio::task::spawn_blocking(move || -> Result<Vec<EventRow>> {
            let mut clauses = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(session_id) = &filter.session_id {
                clauses.push("session_id = ?".to_string());
                values.push(Box::new(session_id.clone()));
            }
            if let Some(cwd) = &filter.cwd {
                clauses.push("cwd = ?".to_string());
                values.push(Box::new(cwd.clone()));
            }
            if let Some(repo_key) = &filter.repo_key {
                clauses.push("repo_key = ?".to_string());
                values.push(Box::new(repo_key.clone()));
            }
            if let Some(success_only) = filter.success_only {
                clauses.push(if success_only { "exit_code = 0".to_string() } else { "exit_code != 0".to_string() });
            }
            if let Some(since) = filter.since_ms {
                clauses.push("ts_ms >= ?".to_string());
                values.push(Box::new(since));
            }
            if let Some(until) = filter.until_ms {
                clauses.push("ts_ms <= ?".to_string());
                values.push(Box::new(until));
            }

            let where_clause = if clauses.is_empty() { String::new() } else { format!("WHERE {}", clauses.join(" AND ")) };
            let sql = format!(
                "SELECT event_id, ts_ms, cwd, cmd_raw, cmd_norm, exit_code FROM events {where_clause} ORDER BY ts_ms DESC LIMIT ?"
            );
            values.push(Box::new(limit));

            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
            let rows = stmt
                .query_map(param_refs.as_slice(), |row| {
                    Ok(EventRow {
                        event_id: row.get(0)?,
                        ts_ms: row.get(1)?,
                        cwd: row.get(2)?,
                        cmd_raw: row.get(3)?,
                        cmd_norm: row.get(4)?,
                        exit_code: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await?
    }

    /// Deletes events older than `retention_days` or beyond
    /// `retention_max_events` (oldest first), and rebuilds the FTS index
    /// afterwards (§4.J Maintenance).
    pub async fn prune(&self, retention_cutoff_ms: i64, max_events: u64) -> Result<u64> {
        let fts_available = self.fts_available;
        self.call(move |conn| {
            let mut deleted = conn.execute("DELETE FROM events WHERE ts_ms < ?1", params![retention_cutoff_ms])? as u64;

            let total: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
            if (total as u64) > max_events {
                let overflow = total as u64 - max_events;
                deleted += conn.execute(
                    "DELETE FROM events WHERE event_id IN
                        (SELECT event_id FROM events ORDER BY ts_ms ASC LIMIT ?1)",
                    params![overflow as i64],
                )? as u64;
            }

            if deleted > 0 && fts_available {
                fts::rebuild(conn)?;
            }
            Ok(deleted)
        })
        .await
    }

    pub async fn vacuum(&self) -> Result<()> {
        self.call(|conn| {
            conn.execute_batch("VACUUM;")?;
            Ok(())
        })
        .await
    }

    /// Multiplies every `(scope, cmd_norm)` feedback row's effective weight
    /// toward zero by `decay_factor` once its `learned_dismiss_ts` is older
    /// than the caller's horizon, letting stale dismissals fade (§4.J).
    pub async fn decay_dismissals(&self, horizon_ms: i64, decay_factor: f64) -> Result<u64> {
        self.call(move |conn| {
            let updated = conn.execute(
                "UPDATE feedback SET dismisses = CAST(dismisses AS REAL) * ?2
                 WHERE learned_dismiss_ts IS NOT NULL AND learned_dismiss_ts < ?1 AND dismisses > 0",
                params![horizon_ms, decay_factor],
            )?;
            Ok(updated as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CommandEvent;

    fn sample_event(id: &str, cmd_norm: &str) -> CommandEvent {
        CommandEvent {
            event_id: id.to_string(),
            session_id: "s1".to_string(),
            command_id: id.to_string(),
            ts_ms: 1000,
            cwd: "/tmp".to_string(),
            repo_key: None,
            repo_root: None,
            branch: None,
            cmd_raw: cmd_norm.to_string(),
            cmd_norm: cmd_norm.to_string(),
            exit_code: 0,
            duration_ms: 5,
            tool: "git".to_string(),
            pipeline_segments: vec![cmd_norm.to_string()],
            risk_tags: vec![],
            source_ingest_batch: 0,
            standalone_end: true,
        }
    }

    #[tokio::test]
    async fn append_is_idempotent_on_same_session_command_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("state.db"), 1000).await.unwrap();

        let ev = sample_event("e1", "git status");
        let inserted1 = store
            .append_event(ev.clone(), vec!["global".to_string()], None)
            .await
            .unwrap();
        let inserted2 = store
            .append_event(ev, vec!["global".to_string()], None)
            .await
            .unwrap();

        assert!(inserted1);
        assert!(!inserted2);

        let freq = store.top_frequency("global".to_string(), 10).await.unwrap();
        assert_eq!(freq.len(), 1);
        assert_eq!(freq[0].count, 1);
    }

    #[tokio::test]
    async fn transitions_accumulate_across_scopes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("state.db"), 1000).await.unwrap();

        store
            .append_event(sample_event("e1", "git status"), vec!["global".to_string()], None)
            .await
            .unwrap();
        store
            .append_event(
                sample_event("e2", "git commit"),
                vec!["global".to_string()],
                Some("git status".to_string()),
            )
            .await
            .unwrap();

        let transitions = store
            .top_transitions("global".to_string(), "git status".to_string(), 5)
            .await
            .unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].next_norm, "git commit");
    }

    #[tokio::test]
    async fn prune_respects_retention_and_max_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("state.db"), 1000).await.unwrap();

        for i in 0..5 {
            let mut ev = sample_event(&format!("e{i}"), "ls");
            ev.ts_ms = i as i64;
            store.append_event(ev, vec!["global".to_string()], None).await.unwrap();
        }

        let deleted = store.prune(i64::MIN, 2).await.unwrap();
        assert_eq!(deleted, 3);
    }
}
