//! Server (spec §4.H): accepts Unix-socket connections, decodes length-
//! prefixed frames, validates, dispatches, and replies with status +
//! telemetry. Framing and the "decode → validate → dispatch → encode" shape
//! mirror the teacher's `process_messages` loop in `src/server/mod.rs`,
//! carried from newline-delimited JSON-RPC over stdio to 4-byte-length-
//! prefixed JSON over a Unix socket, since shells are not an interactive
//! stdio client.

pub mod protocol;
pub mod validator;

use crate::cache::Cache;
use crate::candidates::{self, GenerateArgs, PlaybookEntry};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::ingest::{Ingest, IngestEvent};
use crate::models::Incognito;
use crate::scorer::{Scorer, ScoringContext};
use crate::session::SessionTracker;
use crate::store::{EventFilter, Store};
use protocol::{FeedbackAction, HistoryItem, HistoryStatus, Request, Response, ResponsePayload, SuggestionItem, Telemetry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

const MAX_FRAME_BYTES: u32 = 1024 * 1024;

pub struct EngineState {
    pub store: Arc<Store>,
    pub sessions: Arc<SessionTracker>,
    pub ingest: Arc<Ingest>,
    pub scorer: Arc<Scorer>,
    pub suggest_cache: Cache<Vec<SuggestionItem>>,
    pub cfg: Arc<EngineConfig>,
    pub start_time: Instant,
    pub playbooks: Vec<PlaybookEntry>,
    pub suggestions_enabled: std::sync::atomic::AtomicBool,
    pub shutdown_requested: tokio::sync::Notify,
    pub last_activity: std::sync::Mutex<Instant>,
    pub dropped_total_snapshot: AtomicU64,
    /// `suggestion_id -> (scope, cmd_norm, signal snapshot)` so a later
    /// `feedback{}` can attribute to the real candidate instead of the opaque
    /// id handed to the shell (§4.F online learning). Swept for entries older
    /// than `feedback_match_window_ms` on every insert/lookup.
    pub suggestions: std::sync::Mutex<HashMap<String, SuggestionRecord>>,
}

#[derive(Debug, Clone)]
pub struct SuggestionRecord {
    pub scope: String,
    pub cmd_norm: String,
    pub signals: [f64; 10],
    pub predicted: f64,
    pub created_at: Instant,
}

fn prune_expired_suggestions(map: &mut HashMap<String, SuggestionRecord>, window_ms: u64) {
    let window = Duration::from_millis(window_ms);
    map.retain(|_, rec| rec.created_at.elapsed() <= window);
}

/// Accept loop: one task per connection, each connection processed until EOF
/// or a framing error (§4.H: "Close on error, keep-alive on success").
pub async fn run(listener: UnixListener, state: Arc<EngineState>) {
    loop {
        tokio::select! {
            _ = state.shutdown_requested.notified() => {
                crate::logging::info("server: shutdown requested, stopping accept loop");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, state).await {
                                crate::logging::debug(&format!("connection closed: {e}"));
                            }
                        });
                    }
                    Err(e) => {
                        crate::logging::warn(&format!("accept failed: {e}"));
                    }
                }
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, state: Arc<EngineState>) -> anyhow::Result<()> {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e),
        };

        let response = dispatch_frame(&frame, &state).await;
        let encoded = serde_json::to_vec(&response)?;
        write_frame(&mut stream, &encoded).await?;

        *state.last_activity.lock().unwrap() = Instant::now();

        if !response.ok {
            return Ok(());
        }
    }
}

async fn read_frame(stream: &mut UnixStream) -> anyhow::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        anyhow::bail!("frame of {len} bytes exceeds {MAX_FRAME_BYTES}");
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

async fn write_frame(stream: &mut UnixStream, body: &[u8]) -> anyhow::Result<()> {
    let len = (body.len() as u32).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

async fn dispatch_frame(frame: &[u8], state: &Arc<EngineState>) -> Response {
    let started = Instant::now();
    let request: Request = match serde_json::from_slice(frame) {
        Ok(r) => r,
        Err(e) => {
            let wire = EngineError::invalid("request", format!("malformed request: {e}")).to_wire();
            return Response {
                ok: false,
                error: Some(wire),
                warnings: vec![],
                payload: ResponsePayload::Empty,
                telemetry: Telemetry::empty(elapsed_ms(started)),
            };
        }
    };

    let now_ms = crate::util::now_ms();
    let validated = match validator::validate(request, &state.cfg, now_ms) {
        Ok(v) => v,
        Err(e) => {
            return Response {
                ok: false,
                error: Some(e.to_wire()),
                warnings: vec![],
                payload: ResponsePayload::Empty,
                telemetry: Telemetry::empty(elapsed_ms(started)),
            }
        }
    };

    let hard_timeout = Duration::from_millis(state.cfg.hard_timeout_ms);
    let deadline = started + hard_timeout;

    match dispatch(validated.request, state, deadline).await {
        Ok((payload, source_breakdown, degraded)) => Response {
            ok: true,
            error: None,
            warnings: validated.warnings,
            payload,
            telemetry: Telemetry {
                elapsed_ms: elapsed_ms(started),
                source_breakdown,
                degraded,
            },
        },
        Err(e) => Response {
            ok: false,
            error: Some(e.to_wire()),
            warnings: validated.warnings,
            payload: ResponsePayload::Empty,
            telemetry: Telemetry::empty(elapsed_ms(started)),
        },
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

async fn dispatch(
    request: Request,
    state: &Arc<EngineState>,
    deadline: Instant,
) -> Result<(ResponsePayload, HashMap<String, u32>, bool), EngineError> {
    match request {
        Request::CommandStart {
            session_id,
            command_id,
            cwd,
            command,
            ts_unix_ms,
            git_branch,
            git_repo_name,
            git_repo_root,
            incognito,
            alias_map,
        } => {
            state
                .ingest
                .submit(IngestEvent::CommandStart {
                    session_id,
                    command_id,
                    cwd,
                    command,
                    ts_unix_ms,
                    git_branch,
                    git_repo_name,
                    git_repo_root,
                    incognito,
                    alias_map,
                })
                .await;
            Ok((ResponsePayload::Ack, HashMap::new(), false))
        }
        Request::CommandEnd {
            session_id,
            command_id,
            exit_code,
            duration_ms,
            ts_unix_ms,
        } => {
            state
                .ingest
                .submit_and_wait(IngestEvent::CommandEnd {
                    session_id,
                    command_id,
                    exit_code,
                    duration_ms,
                    ts_unix_ms,
                })
                .await;
            Ok((ResponsePayload::Ack, HashMap::new(), false))
        }
        Request::Suggest {
            session_id,
            cwd,
            buffer,
            cursor_pos: _,
            max_results,
            repo_key,
            include_low_confidence: _,
            deadline_ms,
        } => suggest(state, session_id, cwd, buffer, max_results.unwrap_or(state.cfg.max_results_default), repo_key, deadline, deadline_ms).await,
        Request::History { filter, limit, offset } => history(state, filter, limit, offset).await,
        Request::Feedback {
            session_id,
            suggestion_id,
            action,
            ts_unix_ms: _,
        } => feedback(state, session_id, suggestion_id, action).await,
        Request::Shutdown {} => {
            state.shutdown_requested.notify_waiters();
            Ok((ResponsePayload::Ack, HashMap::new(), false))
        }
        Request::Status {} => status(state).await,
    }
}

async fn suggest(
    state: &Arc<EngineState>,
    session_id: String,
    cwd: String,
    buffer: Option<String>,
    max_results: u32,
    repo_key: Option<String>,
    mut deadline: Instant,
    deadline_ms: Option<u64>,
) -> Result<(ResponsePayload, HashMap<String, u32>, bool), EngineError> {
    if let Some(ms) = deadline_ms {
        deadline = deadline.min(Instant::now() + Duration::from_millis(ms));
    }

    if !state.suggestions_enabled.load(Ordering::Relaxed) {
        return Ok((ResponsePayload::Suggestions { items: vec![] }, HashMap::new(), false));
    }

    let session_snapshot = state.sessions.snapshot(&session_id).await;
    let incognito = session_snapshot.as_ref().map(|s| s.incognito).unwrap_or_default();

    let fingerprint = fingerprint_for(&session_id, &cwd, &buffer, max_results, &repo_key, incognito);

    let cfg = state.cfg.clone();
    let store = state.store.clone();
    let scorer = state.scorer.clone();
    let playbooks = state.playbooks.clone();
    let session_for_build = session_snapshot.clone();
    let repo_key_for_build = repo_key.clone();
    let buffer_for_build = buffer.clone();
    let session_id_for_build = session_id.clone();
    let feedback_scope = repo_key.clone().unwrap_or_else(|| crate::models::Scope::Global.key());
    let state_for_build = state.clone();

    let build = move || async move {
        let args = GenerateArgs {
            session_id: session_id_for_build,
            session: session_for_build.as_ref(),
            repo_key: repo_key_for_build,
            buffer: buffer_for_build.clone(),
            case_sensitive: false,
            playbooks: &playbooks,
            project_type: None,
        };
        let candidates = candidates::generate(&store, &cfg, args).await.unwrap_or_default();
        let ctx = ScoringContext {
            session_tool: None,
            project_type: None,
            buffer: buffer_for_build,
            prior_exit_nonzero: false,
        };
        let (scored, _truncated) = scorer.score_all(candidates, &ctx, max_results, deadline);

        scored
            .into_iter()
            .map(|s| {
                let suggestion_id = uuid::Uuid::new_v4().to_string();
                let source = s.candidate.sources.first().copied().unwrap_or(crate::models::CandidateSource::Frequency);

                let mut suggestions = state_for_build.suggestions.lock().unwrap();
                prune_expired_suggestions(&mut suggestions, cfg.feedback_match_window_ms);
                suggestions.insert(
                    suggestion_id.clone(),
                    SuggestionRecord {
                        scope: feedback_scope.clone(),
                        cmd_norm: s.cmd_norm.clone(),
                        signals: s.signals,
                        predicted: s.score,
                        created_at: Instant::now(),
                    },
                );

                SuggestionItem {
                    suggestion_id,
                    cmd_norm: s.cmd_norm,
                    score: s.score,
                    source,
                }
            })
            .collect::<Vec<_>>()
    };

    let use_cache = incognito != Incognito::NoSend;
    let (items, degraded) = if use_cache {
        state
            .suggest_cache
            .get_or_build(&fingerprint, 512, deadline, vec![], build)
            .await
    } else {
        (build().await, false)
    };

    let mut breakdown = HashMap::new();
    breakdown.insert("suggest".to_string(), items.len() as u32);
    Ok((ResponsePayload::Suggestions { items }, breakdown, degraded))
}

fn fingerprint_for(
    session_id: &str,
    cwd: &str,
    buffer: &Option<String>,
    max_results: u32,
    repo_key: &Option<String>,
    incognito: Incognito,
) -> String {
    format!(
        "{session_id}|{cwd}|{}|{max_results}|{}|{incognito:?}",
        buffer.as_deref().unwrap_or(""),
        repo_key.as_deref().unwrap_or("")
    )
}

async fn history(
    state: &Arc<EngineState>,
    filter: protocol::HistoryFilter,
    limit: u32,
    _offset: u32,
) -> Result<(ResponsePayload, HashMap<String, u32>, bool), EngineError> {
    let limit = if limit == 0 { state.cfg.max_results_default } else { limit.min(state.cfg.max_results_cap) };
    let query = filter.query.clone().unwrap_or_default();

    let events: Vec<HistoryItem> = if query.is_empty() {
        let event_filter = EventFilter {
            session_id: filter.session.clone(),
            cwd: filter.cwd.clone(),
            repo_key: filter.repo.clone(),
            success_only: filter.status.map(|s| matches!(s, HistoryStatus::Success)),
            since_ms: filter.since_ms,
            until_ms: filter.until_ms,
        };
        state
            .store
            .list_events(event_filter, limit)
            .await
            .map_err(EngineError::from)?
            .into_iter()
            .map(|e| HistoryItem {
                event_id: e.event_id,
                ts_ms: e.ts_ms,
                cwd: e.cwd,
                cmd_raw: e.cmd_raw,
                cmd_norm: e.cmd_norm,
                exit_code: e.exit_code,
            })
            .collect()
    } else {
        state
            .store
            .search(query, filter.repo.clone(), limit, state.cfg.search_fallback_scan_limit)
            .await
            .map_err(EngineError::from)?
            .into_iter()
            .map(|h| HistoryItem {
                event_id: h.event_id,
                ts_ms: h.ts_ms,
                cwd: String::new(),
                cmd_raw: h.cmd_raw,
                cmd_norm: h.cmd_norm,
                exit_code: 0,
            })
            .collect()
    };

    let total = events.len() as u64;
    Ok((ResponsePayload::History { events, total }, HashMap::new(), false))
}

async fn feedback(
    state: &Arc<EngineState>,
    session_id: String,
    suggestion_id: String,
    action: FeedbackAction,
) -> Result<(ResponsePayload, HashMap<String, u32>, bool), EngineError> {
    let accepted = action == FeedbackAction::Accept;
    let target = if accepted { 1.0 } else { 0.0 };

    let record = {
        let mut suggestions = state.suggestions.lock().unwrap();
        prune_expired_suggestions(&mut suggestions, state.cfg.feedback_match_window_ms);
        suggestions.remove(&suggestion_id)
    };

    match record {
        Some(rec) => {
            state
                .store
                .record_feedback(rec.scope, rec.cmd_norm, accepted)
                .await
                .map_err(EngineError::from)?;
            state.scorer.observe_feedback(rec.signals, rec.predicted, target);
        }
        None => {
            crate::logging::debug(&format!(
                "feedback: no suggestion record for {suggestion_id} (session {session_id}), dropping"
            ));
        }
    }

    Ok((ResponsePayload::Ack, HashMap::new(), false))
}

async fn status(state: &Arc<EngineState>) -> Result<(ResponsePayload, HashMap<String, u32>, bool), EngineError> {
    let db_size_bytes = std::fs::metadata(crate::models::db_path())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok((
        ResponsePayload::Status {
            pid: std::process::id(),
            uptime_secs: state.start_time.elapsed().as_secs(),
            sessions_active: state.sessions.active_count().await as u32,
            queue_depth: state.ingest.queue_depth().await,
            queue_dropped_total: state.ingest.dropped_total().await,
            cache_entries: state.suggest_cache.len().await,
            cache_hit_ratio: state.suggest_cache.hit_ratio(),
            db_size_bytes,
            fts_enabled: state.store.fts_available(),
            suggestions_enabled: state.suggestions_enabled.load(Ordering::Relaxed),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        HashMap::new(),
        false,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_changes_with_incognito_mode() {
        let a = fingerprint_for("s1", "/tmp", &None, 10, &None, Incognito::Off);
        let b = fingerprint_for("s1", "/tmp", &None, 10, &None, Incognito::Ephemeral);
        assert_ne!(a, b);
    }
}
