//! Single-writer persistence queue.
//!
//! Request handlers never do file I/O under the state guard. They build
//! `PersistJob`s, release the guard, and submit the jobs here. One dedicated
//! thread drains the bounded channel in FIFO order, so record writes and
//! history appends land in the order they were submitted.
//!
//! Failures are logged and counted, never retried. Callers that need to know
//! the outcome use `submit_and_wait`; everyone else is best-effort.

use kinetic_scan_protocol::HistoryEntry;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::error::DaemonError;
use crate::history::append_history_line;
use crate::records::RecordStore;

#[derive(Debug, Clone, PartialEq)]
pub enum PersistJob {
    WriteRecord { id: String, payload: Vec<u8> },
    AppendHistory(HistoryEntry),
    /// Completes once every earlier job has run.
    Flush,
}

impl PersistJob {
    fn is_counted(&self) -> bool {
        !matches!(self, PersistJob::Flush)
    }

    fn describe(&self) -> String {
        match self {
            PersistJob::WriteRecord { id, .. } => format!("write_record:{}", id),
            PersistJob::AppendHistory(entry) => format!("append_history:{}", entry.seq),
            PersistJob::Flush => "flush".to_string(),
        }
    }
}

type Completion = oneshot::Sender<Result<(), String>>;

struct Envelope {
    job: PersistJob,
    done: Option<Completion>,
}

#[derive(Default)]
struct QueueCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl QueueCounters {
    fn record_failure(&self, message: String) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        let mut last_error = self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last_error = Some(message);
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PersistMetrics {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub backlog: u64,
    pub capacity: usize,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Clone)]
pub struct PersistQueue {
    tx: mpsc::Sender<Envelope>,
    counters: Arc<QueueCounters>,
    capacity: usize,
}

impl PersistQueue {
    pub fn start(
        records: RecordStore,
        history_path: PathBuf,
        capacity: usize,
    ) -> Result<Self, DaemonError> {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let counters = Arc::new(QueueCounters::default());

        let worker_counters = Arc::clone(&counters);
        thread::Builder::new()
            .name("persist-writer".to_string())
            .spawn(move || run_writer(rx, records, history_path, worker_counters))
            .map_err(|err| DaemonError::io("Failed to spawn persist writer", err))?;

        Ok(Self {
            tx,
            counters,
            capacity,
        })
    }

    /// Queues a job without waiting for it to run. Waits for queue capacity
    /// instead of dropping the job when the writer falls behind.
    pub async fn submit(&self, job: PersistJob) -> Result<(), DaemonError> {
        self.enqueue(job, None).await
    }

    pub async fn submit_and_wait(&self, job: PersistJob) -> Result<(), DaemonError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(job, Some(done_tx)).await?;
        match done_rx.await {
            Ok(result) => result.map_err(DaemonError::PersistenceFailure),
            Err(_) => Err(DaemonError::PersistenceFailure(
                "persist writer stopped before completing the job".to_string(),
            )),
        }
    }

    pub async fn flush(&self) -> Result<(), DaemonError> {
        self.submit_and_wait(PersistJob::Flush).await
    }

    pub fn metrics(&self) -> PersistMetrics {
        let submitted = self.counters.submitted.load(Ordering::SeqCst);
        let completed = self.counters.completed.load(Ordering::SeqCst);
        let failed = self.counters.failed.load(Ordering::SeqCst);
        let backlog = submitted.saturating_sub(completed + failed);
        let last_error = self
            .counters
            .last_error
            .lock()
            .map(|value| value.clone())
            .unwrap_or_default();

        PersistMetrics {
            submitted,
            completed,
            failed,
            backlog,
            capacity: self.capacity,
            degraded: backlog * 4 >= (self.capacity as u64) * 3,
            last_error,
        }
    }

    async fn enqueue(&self, job: PersistJob, done: Option<Completion>) -> Result<(), DaemonError> {
        let counted = job.is_counted();
        let description = job.describe();
        if counted {
            self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        }

        if self.tx.send(Envelope { job, done }).await.is_err() {
            let message = format!("persist writer is not running; dropped {}", description);
            error!(job = %description, "Persistence failure: writer channel closed");
            if counted {
                self.counters.record_failure(message.clone());
            }
            return Err(DaemonError::PersistenceFailure(message));
        }
        debug!(job = %description, "Persist job queued");
        Ok(())
    }
}

fn run_writer(
    mut rx: mpsc::Receiver<Envelope>,
    records: RecordStore,
    history_path: PathBuf,
    counters: Arc<QueueCounters>,
) {
    info!(records = %records.dir().display(), "Persist writer started");

    while let Some(Envelope { job, done }) = rx.blocking_recv() {
        let result = execute(&job, &records, &history_path);
        if job.is_counted() {
            match &result {
                Ok(()) => {
                    counters.completed.fetch_add(1, Ordering::SeqCst);
                }
                Err(message) => {
                    error!(job = %job.describe(), error = %message, "Persistence failure");
                    counters.record_failure(message.clone());
                }
            }
        }
        if let Some(done) = done {
            let _ = done.send(result);
        }
    }

    info!("Persist writer stopped");
}

fn execute(job: &PersistJob, records: &RecordStore, history_path: &Path) -> Result<(), String> {
    match job {
        PersistJob::WriteRecord { id, payload } => {
            let path = records.persist(id, payload).map_err(|err| match err {
                DaemonError::PersistenceFailure(message) => message,
                other => other.to_string(),
            })?;
            info!(record_id = %id, path = %path.display(), "Saved scan record");
            Ok(())
        }
        PersistJob::AppendHistory(entry) => append_history_line(history_path, entry),
        PersistJob::Flush => Ok(()),
    }
}
