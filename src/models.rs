//! Shared domain types for the event/aggregate data model (spec §3).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub fn home_dir() -> PathBuf {
    if let Ok(home) = std::env::var("CLAI_HOME") {
        return PathBuf::from(home);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".clai")
}

pub fn clai_path(subpath: &str) -> PathBuf {
    home_dir().join(subpath)
}

pub fn db_path() -> PathBuf {
    clai_path("state.db")
}

pub fn socket_path() -> PathBuf {
    std::env::var("CLAI_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| clai_path("clai.sock"))
}

pub fn lock_path() -> PathBuf {
    clai_path("clai.lock")
}

pub fn log_path() -> PathBuf {
    clai_path("logs/daemon.log")
}

/// Incognito modes (glossary): `off` records normally, `ephemeral` never
/// touches disk, `no_send` behaves as ephemeral and additionally suppresses
/// any external call the engine would otherwise make (none today, kept for
/// parity with the CLI-level concept).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Incognito {
    #[default]
    Off,
    Ephemeral,
    NoSend,
}

impl Incognito {
    pub fn persists(&self) -> bool {
        matches!(self, Incognito::Off)
    }
}

/// A scope aggregates are bucketed under (§3, §9 Open Question 3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Repo(String),
    Dir(String, u8),
}

impl Scope {
    pub fn key(&self) -> String {
        match self {
            Scope::Global => "global".to_string(),
            Scope::Repo(hash) => format!("repo:{hash}"),
            Scope::Dir(hash, depth) => format!("dir:{hash}@{depth}"),
        }
    }

    /// `dir:<sha1(canonical_path)>@<depth>` — resolved Open Question 3.
    pub fn dir_for(canonical_path: &str, depth: u8) -> Scope {
        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        hasher.update(canonical_path.as_bytes());
        let hash = hex_digest(hasher.finalize().as_slice());
        Scope::Dir(hash, depth)
    }

    pub fn repo_for(repo_root: &str) -> Scope {
        use sha1::{Digest, Sha1};
        let mut hasher = Sha1::new();
        hasher.update(repo_root.as_bytes());
        let hash = hex_digest(hasher.finalize().as_slice());
        Scope::Repo(hash)
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// One persisted (or ephemeral-overlay) command record (§3 CommandEvent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEvent {
    pub event_id: String,
    pub session_id: String,
    pub command_id: String,
    pub ts_ms: i64,
    pub cwd: String,
    pub repo_key: Option<String>,
    pub repo_root: Option<String>,
    pub branch: Option<String>,
    pub cmd_raw: String,
    pub cmd_norm: String,
    pub exit_code: i32,
    pub duration_ms: i64,
    pub tool: String,
    pub pipeline_segments: Vec<String>,
    pub risk_tags: Vec<String>,
    pub source_ingest_batch: i64,
    pub standalone_end: bool,
}

/// A candidate's provenance, used by the Scorer for source-specific weighting
/// (§9: "closed set of tagged variants").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Transition,
    Frequency,
    Prefix,
    FailureRecovery,
    Playbook,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_scope_key_matches_resolved_convention() {
        let scope = Scope::dir_for("/home/user/project", 2);
        let key = scope.key();
        assert!(key.starts_with("dir:"));
        assert!(key.ends_with("@2"));
    }

    #[test]
    fn dir_scope_is_deterministic() {
        let a = Scope::dir_for("/a/b", 1).key();
        let b = Scope::dir_for("/a/b", 1).key();
        assert_eq!(a, b);
    }

    #[test]
    fn different_paths_hash_differently() {
        let a = Scope::dir_for("/a/b", 1).key();
        let b = Scope::dir_for("/a/c", 1).key();
        assert_ne!(a, b);
    }

    #[test]
    fn global_scope_key_is_stable() {
        assert_eq!(Scope::Global.key(), "global");
    }

    #[test]
    fn incognito_off_is_only_persisting_mode() {
        assert!(Incognito::Off.persists());
        assert!(!Incognito::Ephemeral.persists());
        assert!(!Incognito::NoSend.persists());
    }
}
