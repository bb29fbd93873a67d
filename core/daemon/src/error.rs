//! Error taxonomy for daemon operations.
//!
//! Foreground errors are mapped to an HTTP status plus a stable `code` string
//! so clients can branch without parsing messages. Background persistence
//! failures use the same type but only ever reach the log and queue metrics.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kinetic_scan_protocol::{ErrorInfo, ScanState};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("Unknown action: {0}")]
    InvalidAction(String),

    #[error("Action {action} is not allowed in state {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid record id: {0}")]
    InvalidRecordId(String),

    #[error("Scan not found: {0}")]
    RecordNotFound(String),

    #[error("No frame available")]
    NoFrame,

    #[error("Record {id} is corrupt: {details}")]
    CorruptRecord { id: String, details: String },

    #[error("Persistence failed: {0}")]
    PersistenceFailure(String),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl DaemonError {
    pub fn invalid_transition(action: &'static str, state: ScanState) -> Self {
        DaemonError::InvalidTransition {
            action,
            state: state.as_str(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        DaemonError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            DaemonError::InvalidAction(_) => "invalid_action",
            DaemonError::InvalidTransition { .. } => "invalid_transition",
            DaemonError::InvalidFrame(_) => "invalid_frame",
            DaemonError::InvalidPayload(_) => "invalid_payload",
            DaemonError::InvalidRecordId(_) => "invalid_record_id",
            DaemonError::RecordNotFound(_) => "record_not_found",
            DaemonError::NoFrame => "not_found",
            DaemonError::CorruptRecord { .. } => "corrupt_record",
            DaemonError::PersistenceFailure(_) => "persistence_failure",
            DaemonError::Io { .. } => "io_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DaemonError::InvalidAction(_)
            | DaemonError::InvalidFrame(_)
            | DaemonError::InvalidPayload(_)
            | DaemonError::InvalidRecordId(_) => StatusCode::BAD_REQUEST,
            DaemonError::InvalidTransition { .. } => StatusCode::CONFLICT,
            DaemonError::RecordNotFound(_) | DaemonError::NoFrame => StatusCode::NOT_FOUND,
            DaemonError::CorruptRecord { .. }
            | DaemonError::PersistenceFailure(_)
            | DaemonError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn info(&self) -> ErrorInfo {
        ErrorInfo::new(self.code(), self.to_string())
    }
}

impl From<ErrorInfo> for DaemonError {
    fn from(info: ErrorInfo) -> Self {
        DaemonError::InvalidPayload(info.detail)
    }
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "Request rejected");
        }
        (status, Json(self.info())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_action_reports_name() {
        let err = DaemonError::InvalidAction("pause".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.info().detail, "Unknown action: pause");
    }

    #[test]
    fn transition_conflict_maps_to_409() {
        let err = DaemonError::invalid_transition("start-scan", ScanState::Scanning);
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "invalid_transition");
        assert!(err.to_string().contains("SCANNING"));
    }

    #[test]
    fn io_failure_reports_io_error_code() {
        let err = DaemonError::io(
            "Failed to list records",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let info = err.info();
        assert_eq!(info.code, "io_error");
        assert!(info.detail.contains("Failed to list records"));
    }

    #[test]
    fn corrupt_record_is_server_error() {
        let err = DaemonError::CorruptRecord {
            id: "scan_x".to_string(),
            details: "eof".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
