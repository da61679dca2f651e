//! Ingest pipeline (spec §4.C): bounded queue with two caps, drop-oldest-
//! non-`end` overflow policy, burst-mode coalescing, and an optional
//! synchronous flush wait for the submitting client.
//!
//! Producers never block (§5 "Backpressure"): `submit` always returns
//! immediately. The worker loop is the only task that touches Normalizer,
//! Session, and Store for a given event, which is what gives "events are
//! processed in submission order per session" its guarantee.

use crate::config::EngineConfig;
use crate::models::{CommandEvent, Incognito, Scope};
use crate::normalizer;
use crate::session::SessionTracker;
use crate::store::Store;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex, Notify};

#[derive(Debug, Clone)]
pub enum IngestEvent {
    CommandStart {
        session_id: String,
        command_id: String,
        cwd: String,
        command: String,
        ts_unix_ms: i64,
        git_branch: Option<String>,
        git_repo_name: Option<String>,
        git_repo_root: Option<String>,
        incognito: Option<Incognito>,
        alias_map: Option<HashMap<String, String>>,
    },
    CommandEnd {
        session_id: String,
        command_id: String,
        exit_code: i32,
        duration_ms: Option<i64>,
        ts_unix_ms: i64,
    },
}

impl IngestEvent {
    fn is_end(&self) -> bool {
        matches!(self, IngestEvent::CommandEnd { .. })
    }

    fn approx_bytes(&self) -> usize {
        match self {
            IngestEvent::CommandStart { command, cwd, .. } => command.len() + cwd.len() + 96,
            IngestEvent::CommandEnd { .. } => 64,
        }
    }
}

struct QueuedItem {
    event: IngestEvent,
    bytes: usize,
    done: Option<oneshot::Sender<()>>,
}

struct Inner {
    items: VecDeque<QueuedItem>,
    total_bytes: usize,
    dropped_total: u64,
    recent_arrivals: VecDeque<Instant>,
    burst_until: Option<Instant>,
}

pub struct Ingest {
    inner: Mutex<Inner>,
    notify: Notify,
    max_events: usize,
    max_bytes: usize,
    burst_threshold: u32,
    burst_window: Duration,
    burst_quiet: Duration,
    sync_wait: Duration,
    processed_total: AtomicU64,
}

impl Ingest {
    pub fn new(cfg: &EngineConfig) -> Arc<Self> {
        Arc::new(Ingest {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                total_bytes: 0,
                dropped_total: 0,
                recent_arrivals: VecDeque::new(),
                burst_until: None,
            }),
            notify: Notify::new(),
            max_events: cfg.ingest_queue_max_events,
            max_bytes: cfg.ingest_queue_max_bytes,
            burst_threshold: cfg.burst_events_threshold,
            burst_window: Duration::from_millis(cfg.burst_window_ms),
            burst_quiet: Duration::from_millis(cfg.burst_quiet_ms),
            sync_wait: Duration::from_millis(cfg.ingest_sync_wait_ms),
            processed_total: AtomicU64::new(0),
        })
    }

    pub async fn queue_depth(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    pub async fn dropped_total(&self) -> u64 {
        self.inner.lock().await.dropped_total
    }

    /// Enqueues an event, evicting the oldest non-`end` item(s) if either cap
    /// would be exceeded. Returns a handle the caller can await (bounded by
    /// `ingest_sync_wait_ms`) to observe the event having been applied.
    pub async fn submit(self: &Arc<Self>, event: IngestEvent) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let bytes = event.approx_bytes();
        let mut inner = self.inner.lock().await;

        let now = Instant::now();
        inner.recent_arrivals.push_back(now);
        while inner
            .recent_arrivals
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.burst_window)
        {
            inner.recent_arrivals.pop_front();
        }
        if inner.recent_arrivals.len() as u32 > self.burst_threshold {
            inner.burst_until = Some(now + self.burst_quiet);
        }

        while inner.items.len() >= self.max_events || inner.total_bytes + bytes > self.max_bytes {
            let evict_at = inner.items.iter().position(|q| !q.event.is_end());
            match evict_at {
                Some(idx) => {
                    let evicted = inner.items.remove(idx).unwrap();
                    inner.total_bytes -= evicted.bytes;
                    inner.dropped_total += 1;
                }
                None => break,
            }
        }

        inner.items.push_back(QueuedItem {
            event,
            bytes,
            done: Some(tx),
        });
        inner.total_bytes += bytes;
        drop(inner);
        self.notify.notify_one();
        rx
    }

    /// Convenience wrapper: submit and wait up to `ingest_sync_wait_ms` for
    /// the event to be applied, returning early (without error) on timeout.
    pub async fn submit_and_wait(self: &Arc<Self>, event: IngestEvent) {
        let rx = self.submit(event).await;
        let _ = tokio::time::timeout(self.sync_wait, rx).await;
    }

    pub async fn is_bursting(&self) -> bool {
        match self.inner.lock().await.burst_until {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    pub fn processed_total(&self) -> u64 {
        self.processed_total.load(Ordering::Relaxed)
    }

    async fn pop(self: &Arc<Self>) -> QueuedItem {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(item) = inner.items.pop_front() {
                    inner.total_bytes -= item.bytes;
                    return item;
                }
            }
            self.notify.notified().await;
        }
    }

    /// The worker loop: pops one event at a time, pairs/normalizes/persists
    /// it, and signals any sync-wait caller. Long-lived, spawned once at
    /// daemon startup (§5 "ingest... are long-lived tasks").
    pub async fn run(
        self: Arc<Self>,
        store: Arc<Store>,
        sessions: Arc<SessionTracker>,
        cfg: Arc<EngineConfig>,
    ) {
        loop {
            let item = self.pop().await;
            if let Err(e) = self.process(&item.event, &store, &sessions, &cfg).await {
                crate::logging::warn(&format!("ingest: failed to process event: {e}"));
            }
            self.processed_total.fetch_add(1, Ordering::Relaxed);
            if let Some(done) = item.done {
                let _ = done.send(());
            }
        }
    }

    async fn process(
        &self,
        event: &IngestEvent,
        store: &Arc<Store>,
        sessions: &Arc<SessionTracker>,
        cfg: &Arc<EngineConfig>,
    ) -> anyhow::Result<()> {
        match event {
            IngestEvent::CommandStart {
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
                sessions
                    .on_command_start(
                        session_id,
                        cwd.clone(),
                        command_id.clone(),
                        command.clone(),
                        *ts_unix_ms,
                        git_branch.clone(),
                        git_repo_name.clone(),
                        git_repo_root.clone(),
                        *incognito,
                        alias_map.clone().unwrap_or_default(),
                    )
                    .await;
                Ok(())
            }
            IngestEvent::CommandEnd {
                session_id,
                command_id,
                exit_code,
                duration_ms,
                ts_unix_ms,
            } => {
                let (pending, prev_norm, prev_exit_code, incognito) =
                    sessions.on_command_end(session_id, command_id).await;

                let (cmd_raw, cwd, repo_root, branch, alias_map, standalone_end) = match &pending {
                    Some(p) => (
                        p.command.clone(),
                        p.cwd.clone(),
                        p.git_repo_root.clone(),
                        p.git_branch.clone(),
                        p.alias_map.clone(),
                        false,
                    ),
                    None => (String::new(), String::new(), None, None, HashMap::new(), true),
                };

                let normalized = normalizer::normalize(
                    &cmd_raw,
                    &alias_map,
                    cfg.pipeline_max_segments,
                    cfg.alias_expand_max_depth,
                );

                let repo_key = repo_root.as_deref().map(|r| Scope::repo_for(r).key());
                let dir_key = if cwd.is_empty() {
                    None
                } else {
                    Some(Scope::dir_for(&cwd, 1).key())
                };

                let event_id = uuid::Uuid::new_v4().to_string();
                let command_event = CommandEvent {
                    event_id,
                    session_id: session_id.clone(),
                    command_id: command_id.clone(),
                    ts_ms: *ts_unix_ms,
                    cwd,
                    repo_key: repo_key.clone(),
                    repo_root,
                    branch,
                    cmd_raw,
                    cmd_norm: normalized.cmd_norm.clone(),
                    exit_code: *exit_code,
                    duration_ms: duration_ms.unwrap_or(0),
                    tool: normalized.tool,
                    pipeline_segments: normalized.pipeline_segments,
                    risk_tags: normalized.risk_tags,
                    source_ingest_batch: 0,
                    standalone_end,
                };

                sessions.record_outcome(session_id, &command_event).await;

                if incognito.persists() {
                    let mut scopes = vec![Scope::Global.key()];
                    if let Some(k) = &repo_key {
                        scopes.push(k.clone());
                    }
                    if let Some(k) = &dir_key {
                        scopes.push(k.clone());
                    }

                    store
                        .append_event(command_event.clone(), scopes, prev_norm.clone())
                        .await?;

                    if let Some(prev_exit) = prev_exit_code {
                        if prev_exit != 0 {
                            if let Some(failed_norm) = prev_norm {
                                store
                                    .record_failure_recovery(
                                        session_id.clone(),
                                        failed_norm,
                                        command_event.cmd_norm.clone(),
                                    )
                                    .await?;
                            }
                        }
                    }
                }

                Ok(())
            }
        }
    }
}
