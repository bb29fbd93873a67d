//! Flat, write-once JSON record store.
//!
//! Each record is one `<id>.json` file in the records directory. Writes go
//! through a temp file and a rename so a reader never sees a half-written
//! record; an existing record is never replaced.

use chrono::{DateTime, Utc};
use fs_err as fs;
use kinetic_scan_protocol::RecordKind;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use ulid::Generator;

use crate::error::DaemonError;

const RECORD_EXTENSION: &str = "json";
const MAX_RECORD_ID_LEN: usize = 128;

/// Allocates `<prefix>_<YYYYMMDD_HHMMSS>_<ulid>` identifiers.
///
/// The ULID suffix is monotonic within the process, so two records created in
/// the same second still get distinct, ordered ids.
pub struct RecordIdGenerator {
    ulids: Generator,
}

impl RecordIdGenerator {
    pub fn new() -> Self {
        Self {
            ulids: Generator::new(),
        }
    }

    pub fn next_id(&mut self, kind: RecordKind, now: DateTime<Utc>) -> String {
        let suffix = match self.ulids.generate() {
            Ok(ulid) => ulid,
            // Random bits exhausted within one millisecond; fall back to a fresh ULID.
            Err(_) => ulid::Ulid::new(),
        };
        format!(
            "{}_{}_{}",
            kind.prefix(),
            now.format("%Y%m%d_%H%M%S"),
            suffix.to_string().to_lowercase()
        )
    }
}

impl Default for RecordIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

pub fn validate_record_id(id: &str) -> Result<(), DaemonError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_RECORD_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(DaemonError::InvalidRecordId(id.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn open(dir: PathBuf) -> Result<Self, DaemonError> {
        fs::create_dir_all(&dir)
            .map_err(|err| DaemonError::io("Failed to create records directory", err))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, RECORD_EXTENSION))
    }

    /// File name reported back to clients, relative to the data directory.
    pub fn filename_for(&self, id: &str) -> String {
        format!("records/{}.{}", id, RECORD_EXTENSION)
    }

    pub fn persist(&self, id: &str, payload: &[u8]) -> Result<PathBuf, DaemonError> {
        validate_record_id(id)?;
        let path = self.path_for(id);
        if path.exists() {
            return Err(DaemonError::PersistenceFailure(format!(
                "record {} already exists",
                id
            )));
        }

        let tmp_path = self.dir.join(format!(".{}.tmp", id));
        fs::write(&tmp_path, payload).map_err(|err| {
            DaemonError::PersistenceFailure(format!("Failed to write record {}: {}", id, err))
        })?;
        if let Err(err) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(DaemonError::PersistenceFailure(format!(
                "Failed to commit record {}: {}",
                id, err
            )));
        }
        Ok(path)
    }

    /// Returns the stored bytes unchanged once they are known to parse as JSON.
    pub fn retrieve(&self, id: &str) -> Result<Vec<u8>, DaemonError> {
        validate_record_id(id)?;
        let data = match fs::read(self.path_for(id)) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(DaemonError::RecordNotFound(id.to_string()))
            }
            Err(err) => return Err(DaemonError::io(format!("Failed to read record {}", id), err)),
        };

        serde_json::from_slice::<serde_json::Value>(&data).map_err(|err| {
            DaemonError::CorruptRecord {
                id: id.to_string(),
                details: err.to_string(),
            }
        })?;
        Ok(data)
    }

    pub fn list(&self) -> Result<Vec<String>, DaemonError> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|err| DaemonError::io("Failed to list records", err))?;

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| DaemonError::io("Failed to list records", err))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if validate_record_id(stem).is_ok() {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> (tempfile::TempDir, RecordStore) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let store = RecordStore::open(temp_dir.path().join("records")).expect("open store");
        (temp_dir, store)
    }

    #[test]
    fn ids_are_time_derived_and_distinct() {
        let mut ids = RecordIdGenerator::new();
        let now = Utc.with_ymd_and_hms(2026, 1, 31, 9, 5, 7).unwrap();
        let first = ids.next_id(RecordKind::Session, now);
        let second = ids.next_id(RecordKind::Session, now);

        assert!(first.starts_with("scan_20260131_090507_"));
        assert_ne!(first, second);
        assert!(first < second);
        assert!(validate_record_id(&first).is_ok());
        assert!(ids
            .next_id(RecordKind::Result, now)
            .starts_with("result_20260131_090507_"));
    }

    #[test]
    fn persist_then_retrieve_is_byte_exact() {
        let (_temp_dir, store) = store();
        let payload = br#"{ "analysis": {"v0": 1.5,   "r_squared": 0.9} }"#;
        store.persist("result_a", payload).expect("persist");
        assert_eq!(store.retrieve("result_a").expect("retrieve"), payload.to_vec());
    }

    #[test]
    fn records_are_write_once() {
        let (_temp_dir, store) = store();
        store.persist("scan_a", b"{}").expect("first write");
        let err = store.persist("scan_a", b"[]").expect_err("second write");
        assert_eq!(err.code(), "persistence_failure");
        assert_eq!(store.retrieve("scan_a").expect("retrieve"), b"{}".to_vec());
    }

    #[test]
    fn missing_record_is_not_found() {
        let (_temp_dir, store) = store();
        let err = store.retrieve("scan_missing").expect_err("missing");
        assert!(matches!(err, DaemonError::RecordNotFound(_)));
    }

    #[test]
    fn unparsable_record_is_corrupt() {
        let (_temp_dir, store) = store();
        fs::write(store.path_for("scan_bad"), b"{\"truncated\": ").expect("write");
        let err = store.retrieve("scan_bad").expect_err("corrupt");
        assert!(matches!(err, DaemonError::CorruptRecord { .. }));
    }

    #[test]
    fn rejects_traversal_ids() {
        let (_temp_dir, store) = store();
        for id in ["../secrets", "a/b", "", "scan.json"] {
            let err = store.retrieve(id).expect_err("invalid id");
            assert!(matches!(err, DaemonError::InvalidRecordId(_)), "id {:?}", id);
        }
    }

    #[test]
    fn list_skips_temp_and_foreign_files() {
        let (_temp_dir, store) = store();
        store.persist("scan_b", b"{}").expect("persist");
        store.persist("result_a", b"{}").expect("persist");
        fs::write(store.dir().join(".scan_c.tmp"), b"{}").expect("write tmp");
        fs::write(store.dir().join("notes.txt"), b"hi").expect("write txt");

        assert_eq!(
            store.list().expect("list"),
            vec!["result_a".to_string(), "scan_b".to_string()]
        );
    }
}
