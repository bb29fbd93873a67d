//! Summary log of saved scans.
//!
//! The in-memory index is append-only and unbounded; the 20-entry cap only
//! shapes responses. `history.jsonl` is the durable copy, one entry per line,
//! written by the persist queue and replayed on startup.

use fs_err as fs;
use fs_err::OpenOptions;
use kinetic_scan_protocol::HistoryEntry;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Default)]
pub struct HistoryIndex {
    entries: Vec<HistoryEntry>,
    next_seq: u64,
}

impl HistoryIndex {
    pub fn from_entries(mut entries: Vec<HistoryEntry>) -> Self {
        entries.sort_by_key(|entry| entry.seq);
        let next_seq = entries.last().map(|entry| entry.seq.saturating_add(1)).unwrap_or(1);
        Self { entries, next_seq }
    }

    /// Sequence number for the next entry; callers must append it before
    /// asking again.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.max(1)
    }

    pub fn append(&mut self, entry: HistoryEntry) {
        self.next_seq = self.next_seq.max(entry.seq.saturating_add(1));
        self.entries.push(entry);
    }

    /// Last `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> &[HistoryEntry] {
        let start = self.entries.len().saturating_sub(limit);
        &self.entries[start..]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Replays the durable log. Corrupt or invalid lines are skipped.
pub fn load_history(path: &Path) -> Result<HistoryIndex, String> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HistoryIndex::default()),
        Err(err) => return Err(format!("Failed to read history log: {}", err)),
    };

    let mut entries = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = match serde_json::from_str::<HistoryEntry>(line) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(line = index + 1, error = %err, "Skipping unparsable history line");
                continue;
            }
        };
        if let Err(err) = entry.validate() {
            warn!(line = index + 1, code = %err.code, detail = %err.detail, "Skipping invalid history entry");
            continue;
        }
        entries.push(entry);
    }

    Ok(HistoryIndex::from_entries(entries))
}

pub fn append_history_line(path: &Path, entry: &HistoryEntry) -> Result<(), String> {
    let mut line = serde_json::to_vec(entry)
        .map_err(|err| format!("Failed to serialize history entry: {}", err))?;
    line.push(b'\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| format!("Failed to open history log: {}", err))?;
    file.write_all(&line)
        .map_err(|err| format!("Failed to append history entry: {}", err))?;
    file.sync_data()
        .map_err(|err| format!("Failed to sync history log: {}", err))
}
