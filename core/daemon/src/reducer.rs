//! Scan lifecycle reducer.
//!
//! Pure `(state, action) -> transition` function. It never touches shared
//! state; `SharedState` applies the returned effect under its guard.

use kinetic_scan_protocol::{Action, ScanState};
use serde::Serialize;
use serde_json::Value;

use crate::error::DaemonError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameRef {
    pub seq: u64,
    pub size: usize,
    pub received_at: String,
}

/// The live scan. Exists iff the state is not `IDLE`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub started_at: String,
    pub frames: Vec<FrameRef>,
    pub analysis: Option<Value>,
}

impl Session {
    pub fn new(started_at: String) -> Self {
        Self {
            started_at,
            frames: Vec::new(),
            analysis: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    OpenSession,
    CloseSession,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: ScanState,
    pub effect: Effect,
    pub status: &'static str,
}

pub fn reduce(current: ScanState, action: Action) -> Result<Transition, DaemonError> {
    match (current, action) {
        (ScanState::Idle, Action::StartScan) => Ok(Transition {
            next: ScanState::BlankingCountdown,
            effect: Effect::OpenSession,
            status: "scan_started",
        }),
        (ScanState::BlankingCountdown, Action::ProceedToScan) => Ok(Transition {
            next: ScanState::Scanning,
            effect: Effect::None,
            status: "proceeding_to_scan",
        }),
        // Allowed from IDLE too: acts as an idempotent reset.
        (_, Action::StopScan) => Ok(Transition {
            next: ScanState::Idle,
            effect: Effect::CloseSession,
            status: "scan_stopped",
        }),
        (state, action) => Err(DaemonError::invalid_transition(action.as_str(), state)),
    }
}

/// Resolves an action name from the URL, rejecting anything unrecognized.
pub fn parse_action(name: &str) -> Result<Action, DaemonError> {
    Action::parse(name).ok_or_else(|| DaemonError::InvalidAction(name.to_string()))
}
