//! Wire request/response types (spec §6). Serialized as JSON inside the
//! 4-byte-length-prefixed frame that `server::mod` reads/writes — the same
//! "plain JSON over a stream, no custom binary codec" choice the teacher
//! makes for its MCP stdio protocol in `src/server/mod.rs`, just carried over
//! a Unix socket instead of stdio.

use crate::models::{CandidateSource, Incognito};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    CommandStart {
        session_id: String,
        command_id: String,
        cwd: String,
        command: String,
        ts_unix_ms: i64,
        #[serde(default)]
        git_branch: Option<String>,
        #[serde(default)]
        git_repo_name: Option<String>,
        #[serde(default)]
        git_repo_root: Option<String>,
        #[serde(default)]
        incognito: Option<Incognito>,
        /// Shell-supplied alias table (`alias`/`source`-derived), fed to the
        /// Normalizer's bounded alias expansion (§4.A).
        #[serde(default)]
        alias_map: Option<HashMap<String, String>>,
    },
    CommandEnd {
        session_id: String,
        command_id: String,
        exit_code: i32,
        #[serde(default)]
        duration_ms: Option<i64>,
        ts_unix_ms: i64,
    },
    Suggest {
        session_id: String,
        cwd: String,
        #[serde(default)]
        buffer: Option<String>,
        #[serde(default)]
        cursor_pos: Option<usize>,
        #[serde(default)]
        max_results: Option<u32>,
        #[serde(default)]
        repo_key: Option<String>,
        #[serde(default)]
        include_low_confidence: bool,
        #[serde(default)]
        deadline_ms: Option<u64>,
    },
    History {
        #[serde(default)]
        filter: HistoryFilter,
        #[serde(default)]
        limit: u32,
        #[serde(default)]
        offset: u32,
    },
    Feedback {
        session_id: String,
        suggestion_id: String,
        action: FeedbackAction,
        ts_unix_ms: i64,
    },
    Shutdown {},
    Status {},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackAction {
    Accept,
    Dismiss,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryFilter {
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
    #[serde(default)]
    pub since_ms: Option<i64>,
    #[serde(default)]
    pub until_ms: Option<i64>,
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::errors::WireError>,
    pub warnings: Vec<String>,
    pub payload: ResponsePayload,
    pub telemetry: Telemetry,
}

#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub elapsed_ms: u64,
    pub source_breakdown: std::collections::HashMap<String, u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl Telemetry {
    pub fn empty(elapsed_ms: u64) -> Self {
        Telemetry {
            elapsed_ms,
            source_breakdown: std::collections::HashMap::new(),
            degraded: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponsePayload {
    Ack,
    Suggestions {
        items: Vec<SuggestionItem>,
    },
    History {
        events: Vec<HistoryItem>,
        total: u64,
    },
    Status {
        pid: u32,
        uptime_secs: u64,
        sessions_active: u32,
        queue_depth: usize,
        queue_dropped_total: u64,
        cache_entries: usize,
        cache_hit_ratio: f64,
        db_size_bytes: u64,
        fts_enabled: bool,
        suggestions_enabled: bool,
        version: String,
    },
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuggestionItem {
    pub suggestion_id: String,
    pub cmd_norm: String,
    pub score: f64,
    pub source: CandidateSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryItem {
    pub event_id: String,
    pub ts_ms: i64,
    pub cwd: String,
    pub cmd_raw: String,
    pub cmd_norm: String,
    pub exit_code: i32,
}
