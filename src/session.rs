//! Session/context tracker (spec §4.D). One process-wide map protected by a
//! read-write lock (§5 "Session map... updates are short and non-blocking"),
//! holding per-session cwd/repo/last-command state, the `pending_start`
//! pairing buffer, a typing-rhythm EWMA, and the incognito overlay.

use crate::models::{CommandEvent, Incognito};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct PendingStart {
    pub command_id: String,
    pub cwd: String,
    pub command: String,
    pub ts_unix_ms: i64,
    pub git_branch: Option<String>,
    pub git_repo_name: Option<String>,
    pub git_repo_root: Option<String>,
    pub alias_map: HashMap<String, String>,
    pub stashed_at: Instant,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub cwd: String,
    pub repo_root: Option<String>,
    pub repo_key: Option<String>,
    pub branch: Option<String>,
    pub started_at: Instant,
    pub last_activity: Instant,
    pub pending_start: Option<PendingStart>,
    pub last_norm: Option<String>,
    pub last_exit_code: Option<i32>,
    pub typing_ewma_ms: Option<f64>,
    pub last_keystroke_at: Option<Instant>,
    pub incognito: Incognito,
    /// In-memory-only command log for `incognito=ephemeral|no_send` sessions;
    /// never written to the Store, dropped wholesale on session end (§3
    /// invariant: "no event reaches the Store" in ephemeral mode).
    pub ephemeral_events: Vec<CommandEvent>,
}

impl SessionState {
    fn new(cwd: String, incognito: Incognito) -> Self {
        let now = Instant::now();
        SessionState {
            cwd,
            repo_root: None,
            repo_key: None,
            branch: None,
            started_at: now,
            last_activity: now,
            pending_start: None,
            last_norm: None,
            last_exit_code: None,
            typing_ewma_ms: None,
            last_keystroke_at: None,
            incognito,
            ephemeral_events: Vec::new(),
        }
    }
}

pub struct SessionTracker {
    sessions: RwLock<HashMap<String, SessionState>>,
    pending_start_ttl: Duration,
    idle_evict: Duration,
    default_incognito: Incognito,
}

/// EWMA smoothing factor for typing-rhythm tracking; low weight on each new
/// sample so a single outlier keystroke gap doesn't swing the estimate.
const TYPING_EWMA_ALPHA: f64 = 0.2;

impl SessionTracker {
    pub fn new(pending_start_ttl: Duration, idle_evict: Duration, default_incognito: Incognito) -> Self {
        SessionTracker {
            sessions: RwLock::new(HashMap::new()),
            pending_start_ttl,
            idle_evict,
            default_incognito,
        }
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Stashes a `CommandStart` payload as `pending_start`, creating the
    /// session if this is its first event.
    pub async fn on_command_start(
        &self,
        session_id: &str,
        cwd: String,
        command_id: String,
        command: String,
        ts_unix_ms: i64,
        git_branch: Option<String>,
        git_repo_name: Option<String>,
        git_repo_root: Option<String>,
        incognito: Option<Incognito>,
        alias_map: HashMap<String, String>,
    ) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(cwd.clone(), incognito.unwrap_or(self.default_incognito)));

        session.cwd = cwd;
        session.last_activity = Instant::now();
        if let Some(root) = &git_repo_root {
            session.repo_root = Some(root.clone());
            session.repo_key = Some(crate::models::Scope::repo_for(root).key());
        }
        if git_branch.is_some() {
            session.branch = git_branch.clone();
        }
        session.pending_start = Some(PendingStart {
            command_id,
            cwd: session.cwd.clone(),
            command,
            ts_unix_ms,
            git_branch,
            git_repo_name,
            git_repo_root,
            alias_map,
            stashed_at: Instant::now(),
        });
    }

    /// Pairs a `CommandEnd` with its `pending_start` by `command_id`. Returns
    /// `(pending, prev_norm, incognito)` for the ingest pipeline to normalize
    /// and persist; `pending` is `None` if no matching start was stashed
    /// within `pending_start_ttl` — the caller synthesizes a standalone event
    /// with `cmd_raw=""` per §3.
    pub async fn on_command_end(
        &self,
        session_id: &str,
        command_id: &str,
    ) -> (Option<PendingStart>, Option<String>, Option<i32>, Incognito) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(String::new(), self.default_incognito));

        session.last_activity = Instant::now();

        let pending = session.pending_start.take().and_then(|p| {
            if p.command_id == command_id && p.stashed_at.elapsed() <= self.pending_start_ttl {
                Some(p)
            } else {
                None
            }
        });

        (
            pending,
            session.last_norm.clone(),
            session.last_exit_code,
            session.incognito,
        )
    }

    /// Records the event's `cmd_norm`/exit code as session context for the
    /// next transition lookup, and — if the session is ephemeral — appends
    /// the event to its volatile overlay instead of the Store.
    pub async fn record_outcome(&self, session_id: &str, event: &CommandEvent) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.last_norm = Some(event.cmd_norm.clone());
            session.last_exit_code = Some(event.exit_code);
            if !session.incognito.persists() {
                session.ephemeral_events.push(event.clone());
            }
        }
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn set_incognito(&self, session_id: &str, incognito: Incognito) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(String::new(), incognito));
        session.incognito = incognito;
    }

    /// Inter-keystroke EWMA, updated as the shell hook streams typing events;
    /// unused until the shell side wires a `keystroke` notification, but kept
    /// so `suggest`'s adaptive-timing path has something to read once it
    /// does (spec: "typing rhythm (EWMA)... to inform adaptive-timing").
    pub async fn record_keystroke(&self, session_id: &str, at: Instant) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            if let Some(prev) = session.last_keystroke_at {
                let gap_ms = at.saturating_duration_since(prev).as_millis() as f64;
                session.typing_ewma_ms = Some(match session.typing_ewma_ms {
                    Some(prev_ewma) => TYPING_EWMA_ALPHA * gap_ms + (1.0 - TYPING_EWMA_ALPHA) * prev_ewma,
                    None => gap_ms,
                });
            }
            session.last_keystroke_at = Some(at);
        }
    }

    /// Garbage-collects `pending_start` entries older than the TTL and
    /// sessions idle past `idle_evict`. Ephemeral overlays simply vanish with
    /// their session — nothing is flushed anywhere.
    pub async fn gc(&self) {
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, session| session.last_activity.elapsed() <= self.idle_evict);
        for session in sessions.values_mut() {
            if let Some(pending) = &session.pending_start {
                if pending.stashed_at.elapsed() > self.pending_start_ttl {
                    session.pending_start = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tracker() -> SessionTracker {
        SessionTracker::new(Duration::from_secs(60), Duration::from_secs(3600), Incognito::Off)
    }

    #[tokio::test]
    async fn start_then_end_pairs_by_command_id() {
        let tracker = tracker();
        tracker
            .on_command_start(
                "s1",
                "/tmp".into(),
                "c1".into(),
                "git status".into(),
                1000,
                None,
                None,
                None,
                None,
                HashMap::new(),
            )
            .await;

        let (pending, prev_norm, _prev_exit, incognito) = tracker.on_command_end("s1", "c1").await;
        assert!(pending.is_some());
        assert_eq!(pending.unwrap().command, "git status");
        assert!(prev_norm.is_none());
        assert_eq!(incognito, Incognito::Off);
    }

    #[tokio::test]
    async fn end_without_start_yields_none() {
        let tracker = tracker();
        let (pending, _, _, _) = tracker.on_command_end("s1", "missing").await;
        assert!(pending.is_none());
    }

    #[tokio::test]
    async fn mismatched_command_id_is_not_paired() {
        let tracker = tracker();
        tracker
            .on_command_start("s1", "/tmp".into(), "c1".into(), "ls".into(), 1000, None, None, None, None, HashMap::new())
            .await;
        let (pending, _, _, _) = tracker.on_command_end("s1", "c2").await;
        assert!(pending.is_none());
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted() {
        let tracker = SessionTracker::new(Duration::from_secs(60), Duration::from_millis(1), Incognito::Off);
        tracker
            .on_command_start("s1", "/tmp".into(), "c1".into(), "ls".into(), 1000, None, None, None, None, HashMap::new())
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.gc().await;
        assert_eq!(tracker.active_count().await, 0);
    }
}
