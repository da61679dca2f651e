//! stderr status lines with a `[clai]` prefix (teacher convention, `src/server/mod.rs`),
//! plus a size-rotated on-disk log under `$CLAI_HOME/logs/daemon.log`.
//!
//! The rotation scheme — rename-on-overflow, keep the newest N, relock on
//! every append — is the teacher's `src/ledger.rs` applied to log lines
//! instead of JSONL event rows.

use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

const MAX_SIZE: u64 = 10 * 1024 * 1024;
const MAX_ROTATED: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Eq, Ord)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

static LOG_PATH: OnceLock<Option<PathBuf>> = OnceLock::new();
static LEVEL: OnceLock<Level> = OnceLock::new();

pub fn init(log_path: Option<PathBuf>, level: Level) {
    let _ = LOG_PATH.set(log_path);
    let _ = LEVEL.set(level);
}

pub fn level_from_env() -> Level {
    if std::env::var("CLAI_DEBUG").map(|v| v == "1").unwrap_or(false) {
        return Level::Debug;
    }
    match std::env::var("CLAI_LOG_LEVEL").as_deref() {
        Ok("error") => Level::Error,
        Ok("warn") => Level::Warn,
        Ok("debug") => Level::Debug,
        _ => Level::Info,
    }
}

fn current_level() -> Level {
    *LEVEL.get().unwrap_or(&Level::Info)
}

fn emit(level: Level, msg: &str) {
    if level > current_level() {
        return;
    }
    let label = match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN ",
        Level::Info => "INFO ",
        Level::Debug => "DEBUG",
    };
    eprintln!("[clai] {label} {msg}");
    if let Some(Some(path)) = LOG_PATH.get() {
        if let Err(e) = append_line(path, &format!("{} {label} {msg}", now_rfc3339())) {
            eprintln!("[clai] WARN  failed to write log file: {e}");
        }
    }
}

pub fn error(msg: &str) {
    emit(Level::Error, msg);
}
pub fn warn(msg: &str) {
    emit(Level::Warn, msg);
}
pub fn info(msg: &str) {
    emit(Level::Info, msg);
}
pub fn debug(msg: &str) {
    emit(Level::Debug, msg);
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn append_line(log_path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = log_path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    file.lock_exclusive()?;

    writeln!(file, "{line}")?;
    file.flush()?;

    if let Ok(meta) = file.metadata() {
        if meta.len() > MAX_SIZE {
            drop(file);
            rotate_and_cleanup(log_path, MAX_ROTATED)?;
        } else {
            file.unlock().ok();
        }
    } else {
        file.unlock().ok();
    }

    Ok(())
}

fn rotate_and_cleanup(log_path: &Path, keep: usize) -> std::io::Result<()> {
    let parent = log_path.parent().unwrap_or_else(|| Path::new("."));
    let stem = log_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("daemon");

    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();

    let rotated_name = format!("{stem}.{ts}.log");
    fs::rename(log_path, parent.join(rotated_name))?;

    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)?;

    let mut rotated: Vec<(PathBuf, SystemTime)> = fs::read_dir(parent)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().into_string().ok()?;
            let matches = name.starts_with(stem)
                && name.ends_with(".log")
                && name != log_path.file_name()?.to_str()?;
            if !matches {
                return None;
            }
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((e.path(), modified))
        })
        .collect();

    rotated.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in rotated.into_iter().skip(keep) {
        if let Err(e) = fs::remove_file(&path) {
            eprintln!("[clai] WARN  failed to remove rotated log {path:?}: {e}");
        }
    }

    Ok(())
}
