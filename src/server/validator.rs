//! Request validator (spec §4.I): structural checks split into hard errors
//! (reject with `E_INVALID_ARGUMENT`, naming the field) and warnings (clamp,
//! proceed, log). Never panics — every branch returns instead of unwrapping.

use super::protocol::Request;
use crate::config::EngineConfig;
use crate::errors::EngineError;
use regex::Regex;
use std::sync::OnceLock;

pub struct Validated {
    pub request: Request,
    pub warnings: Vec<String>,
}

const MAX_COMMAND_BYTES: usize = 10 * 1024;
const MAX_CWD_CHARS: usize = 4096;
const MAX_SESSION_ID_CHARS: usize = 128;
const FUTURE_SKEW_MS: i64 = 5 * 60 * 1000;
const MAX_DURATION_MS: i64 = 24 * 3600 * 1000;

fn session_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9-]+$").unwrap())
}

pub fn validate(request: Request, cfg: &EngineConfig, now_ms: i64) -> Result<Validated, EngineError> {
    let mut warnings = Vec::new();

    match &request {
        Request::CommandStart {
            session_id,
            cwd,
            command,
            ts_unix_ms,
            ..
        } => {
            check_session_id(session_id)?;
            check_cwd(cwd)?;
            if command.len() > MAX_COMMAND_BYTES {
                return Err(EngineError::invalid(
                    "command",
                    format!("exceeds {MAX_COMMAND_BYTES} bytes"),
                ));
            }
            check_timestamp(*ts_unix_ms, now_ms)?;
        }
        Request::CommandEnd {
            session_id,
            exit_code,
            duration_ms,
            ts_unix_ms,
            ..
        } => {
            check_session_id(session_id)?;
            if !(-128..=255).contains(exit_code) {
                return Err(EngineError::invalid("exit_code", "must be in [-128,255]"));
            }
            check_timestamp(*ts_unix_ms, now_ms)?;
            if let Some(d) = duration_ms {
                if *d < 0 {
                    return Err(EngineError::invalid("duration_ms", "must be >= 0"));
                }
            }
        }
        Request::Suggest {
            session_id,
            cwd,
            buffer,
            cursor_pos,
            ..
        } => {
            check_session_id(session_id)?;
            check_cwd(cwd)?;
            if let (Some(buf), Some(pos)) = (buffer, cursor_pos) {
                if *pos > buf.len() {
                    warnings.push(format!("cursor_pos {pos} clamped to buffer length {}", buf.len()));
                }
            }
        }
        Request::Feedback { session_id, .. } => {
            check_session_id(session_id)?;
        }
        Request::History { .. } | Request::Shutdown {} | Request::Status {} => {}
    }

    let request = clamp_request(request, cfg, &mut warnings);
    Ok(Validated { request, warnings })
}

fn check_session_id(session_id: &str) -> Result<(), EngineError> {
    if session_id.is_empty() {
        return Err(EngineError::invalid("session_id", "must not be empty"));
    }
    if session_id.len() > MAX_SESSION_ID_CHARS {
        return Err(EngineError::invalid(
            "session_id",
            format!("exceeds {MAX_SESSION_ID_CHARS} characters"),
        ));
    }
    if !session_id_pattern().is_match(session_id) {
        return Err(EngineError::invalid("session_id", "must match [A-Za-z0-9-]+"));
    }
    Ok(())
}

fn check_cwd(cwd: &str) -> Result<(), EngineError> {
    if cwd.is_empty() {
        return Err(EngineError::invalid("cwd", "must not be empty"));
    }
    if !cwd.starts_with('/') {
        return Err(EngineError::invalid("cwd", "must be absolute"));
    }
    if cwd.len() > MAX_CWD_CHARS {
        return Err(EngineError::invalid("cwd", format!("exceeds {MAX_CWD_CHARS} characters")));
    }
    Ok(())
}

fn check_timestamp(ts_unix_ms: i64, now_ms: i64) -> Result<(), EngineError> {
    if ts_unix_ms <= 0 {
        return Err(EngineError::invalid("ts_unix_ms", "must be positive"));
    }
    if ts_unix_ms > now_ms + FUTURE_SKEW_MS {
        return Err(EngineError::invalid("ts_unix_ms", "more than 5 minutes in the future"));
    }
    Ok(())
}

/// Second pass: clamp rather than reject (§4.I "warnings: clamp the value,
/// proceed, and log").
fn clamp_request(request: Request, cfg: &EngineConfig, warnings: &mut Vec<String>) -> Request {
    match request {
        Request::Suggest {
            session_id,
            cwd,
            buffer,
            cursor_pos,
            max_results,
            repo_key,
            include_low_confidence,
            deadline_ms,
        } => {
            let clamped_cursor = match (&buffer, cursor_pos) {
                (Some(buf), Some(pos)) if pos > buf.len() => Some(buf.len()),
                (_, pos) => pos,
            };
            let clamped_max = match max_results {
                None | Some(0) => {
                    warnings.push(format!("max_results defaulted to {}", cfg.max_results_default));
                    cfg.max_results_default
                }
                Some(n) if n > cfg.max_results_cap => {
                    warnings.push(format!("max_results clamped to {}", cfg.max_results_cap));
                    cfg.max_results_cap
                }
                Some(n) => n,
            };
            Request::Suggest {
                session_id,
                cwd,
                buffer,
                cursor_pos: clamped_cursor,
                max_results: Some(clamped_max),
                repo_key,
                include_low_confidence,
                deadline_ms,
            }
        }
        Request::CommandEnd {
            session_id,
            command_id,
            exit_code,
            duration_ms,
            ts_unix_ms,
        } => {
            let clamped_duration = duration_ms.map(|d| {
                if d > MAX_DURATION_MS {
                    warnings.push(format!("duration_ms clamped to {MAX_DURATION_MS}"));
                    MAX_DURATION_MS
                } else {
                    d
                }
            });
            Request::CommandEnd {
                session_id,
                command_id,
                exit_code,
                duration_ms: clamped_duration,
                ts_unix_ms,
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn empty_session_id_is_rejected() {
        let req = Request::Suggest {
            session_id: "".into(),
            cwd: "/tmp".into(),
            buffer: None,
            cursor_pos: None,
            max_results: None,
            repo_key: None,
            include_low_confidence: false,
            deadline_ms: None,
        };
        let err = validate(req, &cfg(), 1_000).unwrap_err();
        assert_eq!(err.code(), "E_INVALID_ARGUMENT");
    }

    #[test]
    fn max_results_zero_defaults_with_warning() {
        let req = Request::Suggest {
            session_id: "abc".into(),
            cwd: "/tmp".into(),
            buffer: None,
            cursor_pos: None,
            max_results: Some(0),
            repo_key: None,
            include_low_confidence: false,
            deadline_ms: None,
        };
        let validated = validate(req, &cfg(), 1_000).unwrap();
        assert!(!validated.warnings.is_empty());
        match validated.request {
            Request::Suggest { max_results, .. } => assert_eq!(max_results, Some(10)),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn max_results_over_cap_is_clamped() {
        let req = Request::Suggest {
            session_id: "abc".into(),
            cwd: "/tmp".into(),
            buffer: None,
            cursor_pos: None,
            max_results: Some(999),
            repo_key: None,
            include_low_confidence: false,
            deadline_ms: None,
        };
        let validated = validate(req, &cfg(), 1_000).unwrap();
        match validated.request {
            Request::Suggest { max_results, .. } => assert_eq!(max_results, Some(50)),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn cursor_pos_beyond_buffer_is_clamped() {
        let req = Request::Suggest {
            session_id: "abc".into(),
            cwd: "/tmp".into(),
            buffer: Some("gi".into()),
            cursor_pos: Some(99),
            max_results: Some(5),
            repo_key: None,
            include_low_confidence: false,
            deadline_ms: None,
        };
        let validated = validate(req, &cfg(), 1_000).unwrap();
        match validated.request {
            Request::Suggest { cursor_pos, .. } => assert_eq!(cursor_pos, Some(2)),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn exit_code_out_of_range_is_rejected() {
        let req = Request::CommandEnd {
            session_id: "abc".into(),
            command_id: "c1".into(),
            exit_code: 300,
            duration_ms: Some(1),
            ts_unix_ms: 1_000,
        };
        let err = validate(req, &cfg(), 1_000).unwrap_err();
        assert_eq!(err.code(), "E_INVALID_ARGUMENT");
    }

    #[test]
    fn command_exactly_10kb_is_accepted_10kb_plus_one_rejected() {
        let cfg = cfg();
        let ok = Request::CommandStart {
            session_id: "abc".into(),
            command_id: "c1".into(),
            cwd: "/tmp".into(),
            command: "a".repeat(10 * 1024),
            ts_unix_ms: 1_000,
            git_branch: None,
            git_repo_name: None,
            git_repo_root: None,
            incognito: None,
            alias_map: None,
        };
        assert!(validate(ok, &cfg, 1_000).is_ok());

        let too_big = Request::CommandStart {
            session_id: "abc".into(),
            command_id: "c1".into(),
            cwd: "/tmp".into(),
            command: "a".repeat(10 * 1024 + 1),
            ts_unix_ms: 1_000,
            git_branch: None,
            git_repo_name: None,
            git_repo_root: None,
            incognito: None,
            alias_map: None,
        };
        assert!(validate(too_big, &cfg, 1_000).is_err());
    }
}
