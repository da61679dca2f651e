//! End-to-end smoke test driving the real socket protocol against a daemon
//! spawned in a temp `$CLAI_HOME`, in the style of the teacher's
//! `tests/ledger_smoke.rs` but exercising the wire protocol instead of a
//! JSONL file directly, since this engine's durable state is a private
//! SQLite store behind the daemon rather than a file a test can read.

use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

struct Daemon {
    child: Child,
    socket_path: std::path::PathBuf,
}

impl Daemon {
    fn spawn(home: &Path) -> Self {
        let socket_path = home.join("clai.sock");
        let child = Command::new(env!("CARGO_BIN_EXE_clai-engine"))
            .env("CLAI_HOME", home)
            .env("CLAI_LOG_LEVEL", "error")
            .spawn()
            .expect("spawn clai-engine daemon");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !socket_path.exists() {
            if Instant::now() > deadline {
                panic!("daemon did not create socket in time");
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        Daemon { child, socket_path }
    }

    fn roundtrip(&self, request: Value) -> Value {
        let mut stream = connect_with_retry(&self.socket_path);
        let body = serde_json::to_vec(&request).unwrap();
        stream.write_all(&(body.len() as u32).to_be_bytes()).unwrap();
        stream.write_all(&body).unwrap();

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut resp_buf = vec![0u8; len];
        stream.read_exact(&mut resp_buf).unwrap();
        let _ = stream.shutdown(Shutdown::Both);

        serde_json::from_slice(&resp_buf).unwrap()
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn connect_with_retry(path: &Path) -> UnixStream {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match UnixStream::connect(path) {
            Ok(s) => return s,
            Err(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(10)),
            Err(e) => panic!("connect to {path:?} failed: {e}"),
        }
    }
}

#[test]
fn command_lifecycle_then_suggest_surfaces_transition() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::spawn(dir.path());

    let session_id = "sess-0001";
    let cwd = "/tmp/project";

    let resp = daemon.roundtrip(json!({
        "type": "command_start",
        "session_id": session_id,
        "command_id": "c1",
        "cwd": cwd,
        "command": "git status",
        "ts_unix_ms": 1_700_000_000_000i64,
    }));
    assert_eq!(resp["ok"], true);

    let resp = daemon.roundtrip(json!({
        "type": "command_end",
        "session_id": session_id,
        "command_id": "c1",
        "exit_code": 0,
        "ts_unix_ms": 1_700_000_000_500i64,
    }));
    assert_eq!(resp["ok"], true);

    let resp = daemon.roundtrip(json!({
        "type": "command_start",
        "session_id": session_id,
        "command_id": "c2",
        "cwd": cwd,
        "command": "git add -A",
        "ts_unix_ms": 1_700_000_001_000i64,
    }));
    assert_eq!(resp["ok"], true);
    let resp = daemon.roundtrip(json!({
        "type": "command_end",
        "session_id": session_id,
        "command_id": "c2",
        "exit_code": 0,
        "ts_unix_ms": 1_700_000_001_300i64,
    }));
    assert_eq!(resp["ok"], true);

    // Give the ingest worker a moment to drain and persist the transition.
    std::thread::sleep(Duration::from_millis(200));

    let resp = daemon.roundtrip(json!({
        "type": "suggest",
        "session_id": session_id,
        "cwd": cwd,
        "max_results": 5,
    }));
    assert_eq!(resp["ok"], true);
    assert_eq!(resp["payload"]["kind"], "suggestions");
}

#[test]
fn history_returns_recorded_events_and_respects_filters() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::spawn(dir.path());
    let session_id = "sess-hist";
    let cwd = "/tmp/histproj";

    for (i, (cmd, code)) in [("ls -la", 0), ("cargo build", 1), ("cargo build", 0)]
        .iter()
        .enumerate()
    {
        let command_id = format!("h{i}");
        let ts = 1_700_000_100_000i64 + (i as i64) * 1000;
        let resp = daemon.roundtrip(json!({
            "type": "command_start",
            "session_id": session_id,
            "command_id": command_id,
            "cwd": cwd,
            "command": cmd,
            "ts_unix_ms": ts,
        }));
        assert_eq!(resp["ok"], true);
        let resp = daemon.roundtrip(json!({
            "type": "command_end",
            "session_id": session_id,
            "command_id": command_id,
            "exit_code": code,
            "ts_unix_ms": ts + 50,
        }));
        assert_eq!(resp["ok"], true);
    }

    std::thread::sleep(Duration::from_millis(200));

    let resp = daemon.roundtrip(json!({
        "type": "history",
        "filter": { "session": session_id },
        "limit": 10,
        "offset": 0,
    }));
    assert_eq!(resp["ok"], true);
    assert_eq!(resp["payload"]["kind"], "history");
    let events = resp["payload"]["events"].as_array().unwrap();
    assert_eq!(events.len(), 3);
}

#[test]
fn invalid_request_is_rejected_with_stable_error_code() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::spawn(dir.path());

    let resp = daemon.roundtrip(json!({
        "type": "command_start",
        "session_id": "",
        "command_id": "c1",
        "cwd": "/tmp",
        "command": "ls",
        "ts_unix_ms": 1_700_000_000_000i64,
    }));
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "E_INVALID_ARGUMENT");
}

#[test]
fn feedback_then_status_reports_engine_shape() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::spawn(dir.path());

    let resp = daemon.roundtrip(json!({
        "type": "feedback",
        "session_id": "sess-fb",
        "suggestion_id": "sugg-1",
        "action": "accept",
        "ts_unix_ms": 1_700_000_200_000i64,
    }));
    assert_eq!(resp["ok"], true);

    let resp = daemon.roundtrip(json!({ "type": "status" }));
    assert_eq!(resp["ok"], true);
    assert_eq!(resp["payload"]["kind"], "status");
    assert!(resp["payload"]["pid"].is_u64());
    assert!(resp["payload"]["fts_enabled"].is_boolean());
}

#[test]
fn shutdown_request_terminates_daemon_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let mut daemon = Daemon::spawn(dir.path());

    let resp = daemon.roundtrip(json!({ "type": "shutdown" }));
    assert_eq!(resp["ok"], true);

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if let Ok(Some(_status)) = daemon.child.try_wait() {
            break;
        }
        if Instant::now() > deadline {
            panic!("daemon did not exit after shutdown{{}}");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Spec §8 scenario 1: repeated `git status` → `git add .` → `git commit`
/// transitions should surface `git commit` as a suggestion once the session
/// has just run `git add .` again.
#[test]
fn repeated_transition_sequence_surfaces_commit_suggestion() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::spawn(dir.path());
    let session_id = "sess-transition";
    let cwd = "/tmp/repo-a";

    for round in 0..3 {
        for (i, cmd) in ["git status", "git add .", "git commit -m \"x\""].iter().enumerate() {
            let command_id = format!("t{round}-{i}");
            let ts = 1_700_001_000_000i64 + (round as i64) * 10_000 + (i as i64) * 1000;
            let resp = daemon.roundtrip(json!({
                "type": "command_start",
                "session_id": session_id,
                "command_id": command_id,
                "cwd": cwd,
                "command": cmd,
                "ts_unix_ms": ts,
            }));
            assert_eq!(resp["ok"], true);
            let resp = daemon.roundtrip(json!({
                "type": "command_end",
                "session_id": session_id,
                "command_id": command_id,
                "exit_code": 0,
                "ts_unix_ms": ts + 100,
            }));
            assert_eq!(resp["ok"], true);
        }
    }

    let resp = daemon.roundtrip(json!({
        "type": "suggest",
        "session_id": session_id,
        "cwd": cwd,
        "max_results": 5,
    }));
    assert_eq!(resp["ok"], true);
    let items = resp["payload"]["items"].as_array().unwrap();
    assert!(
        items.iter().any(|it| it["cmd_norm"].as_str().unwrap_or("").contains("commit")),
        "expected a commit suggestion after git status -> git add . in {items:?}"
    );
}

/// Spec §8 scenario 3: a command recorded under `incognito=ephemeral` must
/// never be visible to `history{}` once the session returns to normal mode,
/// and must never touch the on-disk store.
#[test]
fn incognito_ephemeral_command_is_never_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::spawn(dir.path());
    let session_id = "sess-incognito";
    let cwd = "/tmp/secret-proj";

    let resp = daemon.roundtrip(json!({
        "type": "command_start",
        "session_id": session_id,
        "command_id": "i1",
        "cwd": cwd,
        "command": "echo SECRET_INCOGNITO_COMMAND_12345",
        "ts_unix_ms": 1_700_002_000_000i64,
        "incognito": "ephemeral",
    }));
    assert_eq!(resp["ok"], true);
    let resp = daemon.roundtrip(json!({
        "type": "command_end",
        "session_id": session_id,
        "command_id": "i1",
        "exit_code": 0,
        "ts_unix_ms": 1_700_002_000_100i64,
    }));
    assert_eq!(resp["ok"], true);

    std::thread::sleep(Duration::from_millis(150));

    let resp = daemon.roundtrip(json!({
        "type": "history",
        "filter": { "query": "SECRET_INCOGNITO" },
        "limit": 10,
        "offset": 0,
    }));
    assert_eq!(resp["ok"], true);
    let events = resp["payload"]["events"].as_array().unwrap();
    assert!(events.is_empty(), "ephemeral command leaked into history: {events:?}");
}

/// Feedback on a suggestion actually minted by `suggest` round-trips through
/// the `suggestion_id -> (scope, cmd_norm, signals)` registry instead of
/// being dropped on the floor.
#[test]
fn feedback_on_a_real_suggestion_id_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::spawn(dir.path());
    let session_id = "sess-fb-real";
    let cwd = "/tmp/fb-proj";

    for (i, cmd) in ["git status", "git add .", "git commit -m x"].iter().enumerate() {
        let command_id = format!("f{i}");
        let ts = 1_700_003_000_000i64 + (i as i64) * 1000;
        daemon.roundtrip(json!({
            "type": "command_start",
            "session_id": session_id,
            "command_id": command_id,
            "cwd": cwd,
            "command": cmd,
            "ts_unix_ms": ts,
        }));
        daemon.roundtrip(json!({
            "type": "command_end",
            "session_id": session_id,
            "command_id": command_id,
            "exit_code": 0,
            "ts_unix_ms": ts + 50,
        }));
    }
    std::thread::sleep(Duration::from_millis(150));

    let resp = daemon.roundtrip(json!({
        "type": "suggest",
        "session_id": session_id,
        "cwd": cwd,
        "max_results": 5,
    }));
    assert_eq!(resp["ok"], true);
    let items = resp["payload"]["items"].as_array().unwrap();
    assert!(!items.is_empty());
    let suggestion_id = items[0]["suggestion_id"].as_str().unwrap();

    let resp = daemon.roundtrip(json!({
        "type": "feedback",
        "session_id": session_id,
        "suggestion_id": suggestion_id,
        "action": "accept",
        "ts_unix_ms": 1_700_003_010_000i64,
    }));
    assert_eq!(resp["ok"], true);
}

/// Spec §8 scenario 4: a suggest request with an out-of-range max_results
/// is clamped with a warning rather than rejected.
#[test]
fn suggest_with_oversized_max_results_is_clamped_not_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::spawn(dir.path());

    let resp = daemon.roundtrip(json!({
        "type": "suggest",
        "session_id": "sess-clamp",
        "cwd": "/tmp",
        "max_results": 999,
    }));
    assert_eq!(resp["ok"], true);
    assert!(!resp["warnings"].as_array().unwrap().is_empty());
}
