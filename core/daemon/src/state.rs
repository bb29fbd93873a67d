//! In-memory state managed by the daemon.
//!
//! One mutex covers the scan state, the live session, the latest frame, the
//! history index and the record-id generator. It is only ever held for
//! in-memory work: every operation prepares its changes, commits them with
//! plain assignments, releases the guard and only then submits persistence
//! jobs. Because of that a poisoned guard still holds consistent state and
//! is recovered rather than propagated.

use axum::body::Bytes;
use chrono::{SecondsFormat, Utc};
use kinetic_scan_protocol::{
    parse_save_result, summarize_analysis, ActionResponse, FrameAccepted, HistoryEntry,
    HistoryResponse, RecordKind, SaveResultResponse, ScanState, StatusResponse,
    HISTORY_VIEW_LIMIT,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::config::{DaemonConfig, StoragePaths};
use crate::error::DaemonError;
use crate::frame::{decode_frame, Frame, FrameStore};
use crate::history::{load_history, HistoryIndex};
use crate::persist::{PersistJob, PersistMetrics, PersistQueue};
use crate::records::{RecordIdGenerator, RecordStore};
use crate::reducer::{parse_action, reduce, Effect, FrameRef, Session};

#[derive(Debug, Clone)]
pub struct StateSettings {
    pub profile_name: String,
    pub history_view_limit: usize,
    pub max_frame_bytes: usize,
    pub frames_require_scanning: bool,
    pub attach_frames_to_session: bool,
}

impl From<&DaemonConfig> for StateSettings {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            profile_name: config.profile.name.clone(),
            // Responses never expose more than the protocol cap.
            history_view_limit: config.history.view_limit.min(HISTORY_VIEW_LIMIT),
            max_frame_bytes: config.server.max_frame_bytes,
            frames_require_scanning: config.frames.require_scanning,
            attach_frames_to_session: config.frames.attach_to_session,
        }
    }
}

struct Inner {
    scan_state: ScanState,
    session: Option<Session>,
    frames: FrameStore,
    history: HistoryIndex,
    record_ids: RecordIdGenerator,
}

#[derive(Serialize)]
struct SessionSnapshot<'a> {
    kind: RecordKind,
    record_id: &'a str,
    timestamp: &'a str,
    stopped_at: &'a str,
    stopped_from: ScanState,
    frames: &'a [FrameRef],
    analysis: &'a Option<Value>,
}

pub struct SharedState {
    inner: Mutex<Inner>,
    records: RecordStore,
    queue: PersistQueue,
    settings: StateSettings,
}

impl SharedState {
    pub fn new(
        settings: StateSettings,
        records: RecordStore,
        queue: PersistQueue,
        history: HistoryIndex,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                scan_state: ScanState::Idle,
                session: None,
                frames: FrameStore::default(),
                history,
                record_ids: RecordIdGenerator::new(),
            }),
            records,
            queue,
            settings,
        }
    }

    /// Opens the records area, replays the history log and starts the writer.
    pub fn open(config: &DaemonConfig, paths: &StoragePaths) -> Result<Self, String> {
        let records = RecordStore::open(paths.records_dir()).map_err(|err| err.to_string())?;
        let history_path = paths.history_path();
        let history = load_history(&history_path)?;
        info!(
            entries = history.len(),
            path = %history_path.display(),
            "History log replayed"
        );
        let queue = PersistQueue::start(
            records.clone(),
            history_path,
            config.persistence.queue_capacity,
        )
        .map_err(|err| err.to_string())?;

        Ok(Self::new(StateSettings::from(config), records, queue, history))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> StatusResponse {
        let scan_state = self.lock().scan_state;
        StatusResponse {
            app_state: scan_state,
            ui_state_text: scan_state.label(),
            active_profile_name: self.settings.profile_name.clone(),
            latest_frame_jpeg: None,
        }
    }

    pub async fn apply_action(&self, name: &str) -> Result<ActionResponse, DaemonError> {
        let action = parse_action(name)?;

        let (response, jobs) = {
            let mut inner = self.lock();
            let current = inner.scan_state;
            let transition = reduce(current, action)?;

            let mut jobs = Vec::new();
            let mut record_id = None;
            match transition.effect {
                Effect::OpenSession => {
                    inner.session = Some(Session::new(now_rfc3339()));
                }
                Effect::CloseSession => {
                    if let Some(session) = inner.session.clone() {
                        let (id, payload, entry) = close_session(&mut inner, session, current)?;
                        jobs.push(PersistJob::WriteRecord {
                            id: id.clone(),
                            payload,
                        });
                        jobs.push(PersistJob::AppendHistory(entry.clone()));
                        inner.history.append(entry);
                        record_id = Some(id);
                    }
                    inner.session = None;
                }
                Effect::None => {}
            }
            inner.scan_state = transition.next;

            info!(
                action = action.as_str(),
                from = current.as_str(),
                to = transition.next.as_str(),
                record_id = ?record_id,
                "Scan state transition"
            );

            (
                ActionResponse {
                    status: transition.status.to_string(),
                    app_state: transition.next,
                    record_id,
                },
                jobs,
            )
        };

        // The response does not wait for these; failures only reach the log.
        for job in jobs {
            if let Err(err) = self.queue.submit(job).await {
                warn!(error = %err, "Failed to queue session persistence");
            }
        }

        Ok(response)
    }

    pub async fn ingest_frame(&self, bytes: Bytes) -> Result<FrameAccepted, DaemonError> {
        let max_bytes = self.settings.max_frame_bytes;
        let decoded = tokio::task::spawn_blocking(move || decode_frame(bytes, max_bytes))
            .await
            .map_err(|err| DaemonError::InvalidFrame(format!("decoder task failed: {}", err)))??;

        let mut inner = self.lock();
        if self.settings.frames_require_scanning && inner.scan_state != ScanState::Scanning {
            return Err(DaemonError::invalid_transition("frame", inner.scan_state));
        }

        let received_at = now_rfc3339();
        let frame = inner.frames.store(decoded, received_at.clone());
        let frame_ref = FrameRef {
            seq: frame.seq,
            size: frame.bytes.len(),
            received_at,
        };
        tracing::debug!(
            seq = frame.seq,
            size = frame_ref.size,
            width = frame.width,
            height = frame.height,
            "Frame stored"
        );

        if self.settings.attach_frames_to_session {
            if let Some(session) = inner.session.as_mut() {
                session.frames.push(frame_ref.clone());
            }
        }

        Ok(FrameAccepted {
            status: "ok".to_string(),
            frame_size: frame_ref.size,
        })
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        self.lock().frames.latest().cloned()
    }

    /// Writes a client result and waits for it to reach disk before the
    /// history entry is added.
    pub async fn save_result(&self, body: Bytes) -> Result<SaveResultResponse, DaemonError> {
        let payload: Value = serde_json::from_slice(&body)
            .map_err(|err| DaemonError::InvalidPayload(format!("body is not valid JSON: {}", err)))?;
        let summary = parse_save_result(&payload)?;

        let id = self.lock().record_ids.next_id(RecordKind::Result, Utc::now());
        self.queue
            .submit_and_wait(PersistJob::WriteRecord {
                id: id.clone(),
                payload: body.to_vec(),
            })
            .await?;

        let entry = {
            let mut inner = self.lock();
            let entry = HistoryEntry {
                seq: inner.history.next_seq(),
                timestamp: now_rfc3339(),
                record_id: id.clone(),
                kind: RecordKind::Result,
                v0: summary.v0,
                r_squared: summary.r_squared,
            };
            inner.history.append(entry.clone());
            if let Some(session) = inner.session.as_mut() {
                session.analysis = payload.get("analysis").cloned();
            }
            entry
        };

        if let Err(err) = self.queue.submit(PersistJob::AppendHistory(entry)).await {
            warn!(error = %err, record_id = %id, "Failed to queue history append");
        }

        info!(record_id = %id, v0 = ?summary.v0, r_squared = ?summary.r_squared, "Saved client result");
        Ok(SaveResultResponse {
            status: "saved".to_string(),
            filename: self.records.filename_for(&id),
            record_id: id,
        })
    }

    pub fn history(&self) -> HistoryResponse {
        let inner = self.lock();
        HistoryResponse {
            count: inner.history.len(),
            scans: inner
                .history
                .recent(self.settings.history_view_limit)
                .to_vec(),
        }
    }

    pub fn scan_count(&self) -> usize {
        self.lock().history.len()
    }

    pub async fn record(&self, id: String) -> Result<Vec<u8>, DaemonError> {
        let records = self.records.clone();
        tokio::task::spawn_blocking(move || records.retrieve(&id))
            .await
            .map_err(|err| DaemonError::PersistenceFailure(format!("reader task failed: {}", err)))?
    }

    pub async fn record_ids(&self) -> Result<Vec<String>, DaemonError> {
        let records = self.records.clone();
        tokio::task::spawn_blocking(move || records.list())
            .await
            .map_err(|err| DaemonError::PersistenceFailure(format!("reader task failed: {}", err)))?
    }

    pub fn persist_metrics(&self) -> PersistMetrics {
        self.queue.metrics()
    }

    pub async fn flush(&self) -> Result<(), DaemonError> {
        self.queue.flush().await
    }
}

/// Builds the snapshot record and history entry for a session being stopped.
/// Nothing in `inner` changes if serialization fails.
fn close_session(
    inner: &mut Inner,
    session: Session,
    stopped_from: ScanState,
) -> Result<(String, Vec<u8>, HistoryEntry), DaemonError> {
    let now = Utc::now();
    let stopped_at = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    let id = inner.record_ids.next_id(RecordKind::Session, now);

    let snapshot = SessionSnapshot {
        kind: RecordKind::Session,
        record_id: &id,
        timestamp: &session.started_at,
        stopped_at: &stopped_at,
        stopped_from,
        frames: &session.frames,
        analysis: &session.analysis,
    };
    let payload = serde_json::to_vec_pretty(&snapshot).map_err(|err| {
        DaemonError::PersistenceFailure(format!("Failed to serialize session snapshot: {}", err))
    })?;

    let summary = summarize_analysis(session.analysis.as_ref()).unwrap_or_else(|err| {
        warn!(code = %err.code, detail = %err.detail, "Session analysis has no usable summary");
        Default::default()
    });

    let entry = HistoryEntry {
        seq: inner.history.next_seq(),
        timestamp: stopped_at,
        record_id: id.clone(),
        kind: RecordKind::Session,
        v0: summary.v0,
        r_squared: summary.r_squared,
    };
    Ok((id, payload, entry))
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}


#[cfg(test)]
mod tests {
    use super::test_support::open_state;
    use super::*;
    use crate::frame::test_support::png_bytes;
    use std::sync::Arc;

    fn default_state() -> (tempfile::TempDir, Arc<SharedState>) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let state = open_state(&temp_dir, &DaemonConfig::default());
        (temp_dir, state)
    }

    #[tokio::test]
    async fn full_cycle_appends_one_history_entry() {
        let (_temp_dir, state) = default_state();

        let started = state.apply_action("start-scan").await.expect("start");
        assert_eq!(started.status, "scan_started");
        assert_eq!(started.app_state, ScanState::BlankingCountdown);
        assert_eq!(state.status().ui_state_text, "State: BLANKING_COUNTDOWN");

        state.apply_action("proceed-to-scan").await.expect("proceed");
        assert_eq!(state.status().app_state, ScanState::Scanning);

        let stopped = state.apply_action("stop-scan").await.expect("stop");
        assert_eq!(stopped.app_state, ScanState::Idle);
        let record_id = stopped.record_id.expect("record id");

        let history = state.history();
        assert_eq!(history.count, 1);
        assert_eq!(history.scans[0].record_id, record_id);
        assert_eq!(history.scans[0].kind, RecordKind::Session);

        state.flush().await.expect("flush");
        let stored: Value =
            serde_json::from_slice(&state.record(record_id.clone()).await.expect("record"))
                .expect("json");
        assert_eq!(stored["record_id"], Value::String(record_id));
        assert_eq!(stored["stopped_from"], "SCANNING");
        assert_eq!(stored["analysis"], Value::Null);
    }

    #[tokio::test]
    async fn stop_from_countdown_saves_session() {
        let (_temp_dir, state) = default_state();
        state.apply_action("start-scan").await.expect("start");
        let stopped = state.apply_action("stop-scan").await.expect("stop");
        assert!(stopped.record_id.is_some());
        assert_eq!(state.status().app_state, ScanState::Idle);
        assert_eq!(state.scan_count(), 1);
    }

    #[tokio::test]
    async fn stop_while_idle_is_a_noop() {
        let (_temp_dir, state) = default_state();
        let stopped = state.apply_action("stop-scan").await.expect("stop");
        assert_eq!(stopped.status, "scan_stopped");
        assert!(stopped.record_id.is_none());
        assert_eq!(state.status().app_state, ScanState::Idle);
        assert_eq!(state.scan_count(), 0);
    }

    #[tokio::test]
    async fn unknown_action_leaves_everything_unchanged() {
        let (_temp_dir, state) = default_state();
        state.apply_action("start-scan").await.expect("start");

        let err = state.apply_action("reboot").await.expect_err("unknown");
        assert!(matches!(err, DaemonError::InvalidAction(ref name) if name == "reboot"));
        assert_eq!(state.status().app_state, ScanState::BlankingCountdown);
        assert_eq!(state.scan_count(), 0);

        // The session survived: stopping it still produces a record.
        let stopped = state.apply_action("stop-scan").await.expect("stop");
        assert!(stopped.record_id.is_some());
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let (_temp_dir, state) = default_state();
        let err = state.apply_action("proceed-to-scan").await.expect_err("rejected");
        assert_eq!(err.code(), "invalid_transition");
        assert_eq!(state.status().app_state, ScanState::Idle);
    }

    #[tokio::test]
    async fn history_view_is_capped_at_twenty() {
        let (_temp_dir, state) = default_state();
        for _ in 0..23 {
            state.apply_action("start-scan").await.expect("start");
            state.apply_action("stop-scan").await.expect("stop");
        }

        let history = state.history();
        assert_eq!(history.count, 23);
        assert_eq!(history.scans.len(), 20);
        let seqs: Vec<u64> = history.scans.iter().map(|entry| entry.seq).collect();
        assert_eq!(seqs, (4..=23).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn configured_view_limit_cannot_exceed_cap() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let mut config = DaemonConfig::default();
        config.history.view_limit = 50;
        let state = open_state(&temp_dir, &config);
        for _ in 0..30 {
            state.apply_action("start-scan").await.expect("start");
            state.apply_action("stop-scan").await.expect("stop");
        }

        let history = state.history();
        assert_eq!(history.count, 30);
        assert_eq!(history.scans.len(), HISTORY_VIEW_LIMIT);
        assert_eq!(history.scans.last().map(|entry| entry.seq), Some(30));
    }

    #[tokio::test]
    async fn smaller_view_limit_is_honored() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let mut config = DaemonConfig::default();
        config.history.view_limit = 5;
        let state = open_state(&temp_dir, &config);
        for _ in 0..8 {
            state.apply_action("start-scan").await.expect("start");
            state.apply_action("stop-scan").await.expect("stop");
        }
        assert_eq!(state.history().scans.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_start_scans_create_one_session() {
        let (_temp_dir, state) = default_state();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let state = Arc::clone(&state);
            handles.push(tokio::spawn(async move {
                state.apply_action("start-scan").await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.expect("join") {
                Ok(_) => winners += 1,
                Err(err) => assert_eq!(err.code(), "invalid_transition"),
            }
        }
        assert_eq!(winners, 1);

        state.apply_action("stop-scan").await.expect("stop");
        state.apply_action("stop-scan").await.expect("second stop");
        assert_eq!(state.scan_count(), 1);
    }

    #[tokio::test]
    async fn bad_frame_keeps_previous_frame() {
        let (_temp_dir, state) = default_state();
        let good = png_bytes(5, 5);
        let accepted = state.ingest_frame(good.clone()).await.expect("ingest");
        assert_eq!(accepted.frame_size, good.len());

        let err = state
            .ingest_frame(Bytes::from_static(b"garbage"))
            .await
            .expect_err("invalid");
        assert_eq!(err.code(), "invalid_frame");

        let latest = state.latest_frame().expect("frame");
        assert_eq!(latest.bytes, good);
    }

    #[tokio::test]
    async fn frames_can_be_restricted_to_scanning() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let mut config = DaemonConfig::default();
        config.frames.require_scanning = true;
        config.frames.attach_to_session = true;
        let state = open_state(&temp_dir, &config);

        let err = state.ingest_frame(png_bytes(2, 2)).await.expect_err("idle");
        assert_eq!(err.code(), "invalid_transition");
        assert!(state.latest_frame().is_none());

        state.apply_action("start-scan").await.expect("start");
        state.apply_action("proceed-to-scan").await.expect("proceed");
        state.ingest_frame(png_bytes(2, 2)).await.expect("ingest");
        state.ingest_frame(png_bytes(3, 3)).await.expect("ingest");
        let record_id = state
            .apply_action("stop-scan")
            .await
            .expect("stop")
            .record_id
            .expect("record");

        state.flush().await.expect("flush");
        let stored: Value =
            serde_json::from_slice(&state.record(record_id).await.expect("record")).expect("json");
        let frames = stored["frames"].as_array().expect("frames");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1]["seq"], 2);
    }

    #[tokio::test]
    async fn frames_are_not_attached_by_default() {
        let (_temp_dir, state) = default_state();
        state.apply_action("start-scan").await.expect("start");
        state.ingest_frame(png_bytes(2, 2)).await.expect("ingest");
        let record_id = state
            .apply_action("stop-scan")
            .await
            .expect("stop")
            .record_id
            .expect("record");
        state.flush().await.expect("flush");
        let stored: Value =
            serde_json::from_slice(&state.record(record_id).await.expect("record")).expect("json");
        assert_eq!(stored["frames"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn save_result_is_durable_before_returning() {
        let (_temp_dir, state) = default_state();
        let body = Bytes::from_static(br#"{"analysis": {"v0": 0.12, "r_squared": 0.995}}"#);

        let saved = state.save_result(body.clone()).await.expect("save");
        assert_eq!(saved.status, "saved");
        assert!(saved.record_id.starts_with("result_"));
        assert_eq!(saved.filename, format!("records/{}.json", saved.record_id));

        let stored = state.record(saved.record_id.clone()).await.expect("record");
        assert_eq!(stored, body.to_vec());

        let history = state.history();
        assert_eq!(history.count, 1);
        assert_eq!(history.scans[0].v0, Some(0.12));
        assert_eq!(history.scans[0].r_squared, Some(0.995));
    }

    #[tokio::test]
    async fn save_result_rejects_invalid_payloads() {
        let (_temp_dir, state) = default_state();
        for body in [&b"not json"[..], b"[1,2]", br#"{"analysis": 3}"#] {
            let err = state
                .save_result(Bytes::copy_from_slice(body))
                .await
                .expect_err("invalid");
            assert_eq!(err.code(), "invalid_payload");
        }
        assert_eq!(state.scan_count(), 0);
        assert!(state.record_ids().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn save_result_during_session_attaches_analysis() {
        let (_temp_dir, state) = default_state();
        state.apply_action("start-scan").await.expect("start");
        state
            .save_result(Bytes::from_static(br#"{"analysis": {"v0": 2.0, "r_squared": 0.5}}"#))
            .await
            .expect("save");
        state.apply_action("stop-scan").await.expect("stop");

        let history = state.history();
        assert_eq!(history.count, 2);
        assert_eq!(history.scans[1].kind, RecordKind::Session);
        assert_eq!(history.scans[1].v0, Some(2.0));
    }

    #[tokio::test]
    async fn history_survives_restart() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        {
            let state = open_state(&temp_dir, &DaemonConfig::default());
            state.apply_action("start-scan").await.expect("start");
            state.apply_action("stop-scan").await.expect("stop");
            state
                .save_result(Bytes::from_static(br#"{"analysis": {"v0": 1.0}}"#))
                .await
                .expect("save");
            state.flush().await.expect("flush");
        }

        let reopened = open_state(&temp_dir, &DaemonConfig::default());
        let history = reopened.history();
        assert_eq!(history.count, 2);
        assert_eq!(history.scans[0].kind, RecordKind::Session);
        assert_eq!(history.scans[1].kind, RecordKind::Result);
        assert_eq!(history.scans[1].seq, 2);
        assert_eq!(reopened.record_ids().await.expect("list").len(), 2);
    }
}
