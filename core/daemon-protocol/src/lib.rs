//! HTTP wire types and validation for kinetic-scan-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to decode responses and pre-check result payloads.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const HISTORY_VIEW_LIMIT: usize = 20;
pub const DEFAULT_PROFILE_NAME: &str = "Mobile Spectrometry";
pub const SERVICE_NAME: &str = "Enzyme Kinetic Detector";
pub const SERVICE_MODE: &str = "phone-first (calculations on device)";
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024; // 8MB

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanState {
    #[default]
    Idle,
    BlankingCountdown,
    Scanning,
}

impl ScanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Idle => "IDLE",
            ScanState::BlankingCountdown => "BLANKING_COUNTDOWN",
            ScanState::Scanning => "SCANNING",
        }
    }

    /// Human-readable label shown by clients.
    pub fn label(&self) -> String {
        format!("State: {}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    StartScan,
    StopScan,
    ProceedToScan,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::StartScan => "start-scan",
            Action::StopScan => "stop-scan",
            Action::ProceedToScan => "proceed-to-scan",
        }
    }

    /// Only the three lifecycle names are recognized; matching is exact.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "start-scan" => Some(Action::StartScan),
            "stop-scan" => Some(Action::StopScan),
            "proceed-to-scan" => Some(Action::ProceedToScan),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Server-side snapshot taken when a live session is stopped.
    Session,
    /// Full result payload supplied by the client.
    Result,
}

impl RecordKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            RecordKind::Session => "scan",
            RecordKind::Result => "result",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ErrorInfo {
    pub code: String,
    pub detail: String,
}

impl ErrorInfo {
    pub fn new(code: &str, detail: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StatusResponse {
    pub app_state: ScanState,
    pub ui_state_text: String,
    pub active_profile_name: String,
    /// Always null: the phone renders its own camera preview.
    pub latest_frame_jpeg: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FrameAccepted {
    pub status: String,
    pub frame_size: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ActionResponse {
    pub status: String,
    pub app_state: ScanState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SaveResultResponse {
    pub status: String,
    pub record_id: String,
    pub filename: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HistoryEntry {
    pub seq: u64,
    pub timestamp: String,
    pub record_id: String,
    pub kind: RecordKind,
    pub v0: Option<f64>,
    pub r_squared: Option<f64>,
}

impl HistoryEntry {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.record_id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_entry", "record_id is required"));
        }
        if self.seq == u64::MAX {
            return Err(ErrorInfo::new("invalid_entry", "seq is out of range"));
        }
        if DateTime::parse_from_rfc3339(&self.timestamp).is_err() {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "timestamp must be RFC3339",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HistoryResponse {
    pub count: usize,
    pub scans: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RecordListResponse {
    pub count: usize,
    pub records: Vec<String>,
}

/// Key result fields lifted out of a client-computed `analysis` object.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResultSummary {
    pub v0: Option<f64>,
    pub r_squared: Option<f64>,
}

/// Validates a `/save-result` body and extracts its summary fields.
///
/// The body must be a JSON object. `analysis` may be missing or null, but
/// when present it must be an object whose `v0`/`r_squared` are numbers or
/// null.
pub fn parse_save_result(payload: &Value) -> Result<ResultSummary, ErrorInfo> {
    if !payload.is_object() {
        return Err(ErrorInfo::new(
            "invalid_payload",
            "result payload must be a JSON object",
        ));
    }
    summarize_analysis(payload.get("analysis"))
}

pub fn summarize_analysis(analysis: Option<&Value>) -> Result<ResultSummary, ErrorInfo> {
    let analysis = match analysis {
        None | Some(Value::Null) => return Ok(ResultSummary::default()),
        Some(value) => value,
    };
    if !analysis.is_object() {
        return Err(ErrorInfo::new(
            "invalid_payload",
            "analysis must be a JSON object",
        ));
    }

    Ok(ResultSummary {
        v0: optional_number(analysis, "v0")?,
        r_squared: optional_number(analysis, "r_squared")?,
    })
}

fn optional_number(object: &Value, field: &str) -> Result<Option<f64>, ErrorInfo> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_f64().map(Some).ok_or_else(|| {
            ErrorInfo::new(
                "invalid_payload",
                format!("analysis.{} must be a number", field),
            )
        }),
    }
}
