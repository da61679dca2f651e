//! Stable error taxonomy mapped onto the five wire codes from spec §7.
//!
//! Internal plumbing keeps returning `anyhow::Result` the way the teacher's
//! modules do (`ledger::append_event`, `git::root`, …); `EngineError` only
//! exists at the Server boundary, where every failure gets collapsed into one
//! of these five variants before it crosses the socket.

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid argument: {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("busy: {0}")]
    Busy(String),

    #[error("degraded: {0}")]
    Degraded(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument { .. } => "E_INVALID_ARGUMENT",
            EngineError::Busy(_) => "E_BUSY",
            EngineError::Degraded(_) => "E_DEGRADED",
            EngineError::Unavailable(_) => "E_UNAVAILABLE",
            EngineError::Internal(_) => "E_UNAVAILABLE",
        }
    }

    /// Internal invariant violations are logged with detail but never
    /// surfaced to the caller as anything other than Unavailable (§7).
    pub fn to_wire(&self) -> WireError {
        let field = match self {
            EngineError::InvalidArgument { field, .. } => Some(field.clone()),
            _ => None,
        };
        if matches!(self, EngineError::Internal(msg)) {
            crate::logging::error(&format!("internal invariant violation: {msg}"));
        }
        WireError {
            code: self.code().to_string(),
            message: self.to_string(),
            field,
        }
    }
}

/// Any `anyhow::Error` surfacing from Store/ingest plumbing is, by policy, a
/// backend failure rather than a caller mistake — map it to Unavailable.
impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Unavailable(e.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::DatabaseBusy =>
            {
                EngineError::Busy(e.to_string())
            }
            other => EngineError::Unavailable(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_argument_maps_to_stable_code() {
        let e = EngineError::invalid("session_id", "must not be empty");
        assert_eq!(e.code(), "E_INVALID_ARGUMENT");
        let wire = e.to_wire();
        assert_eq!(wire.field.as_deref(), Some("session_id"));
    }

    #[test]
    fn internal_surfaces_as_unavailable() {
        let e = EngineError::Internal("transition count went negative".into());
        assert_eq!(e.code(), "E_UNAVAILABLE");
    }

    #[test]
    fn busy_and_degraded_codes() {
        assert_eq!(EngineError::Busy("queue full".into()).code(), "E_BUSY");
        assert_eq!(
            EngineError::Degraded("deadline exceeded".into()).code(),
            "E_DEGRADED"
        );
    }
}
