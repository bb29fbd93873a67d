//! Daemon runtime configuration.
//!
//! Loaded from `<data_dir>/daemon.toml` when present; every section falls
//! back to defaults so a missing or partial file is fine. CLI flags and env
//! vars are layered on top in `main`.

use kinetic_scan_protocol::{DEFAULT_PROFILE_NAME, HISTORY_VIEW_LIMIT, MAX_FRAME_BYTES};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DATA_DIR_NAME: &str = ".kinetic-scan";
pub const CONFIG_FILE_NAME: &str = "daemon.toml";
pub const HISTORY_FILE_NAME: &str = "history.jsonl";
pub const RECORDS_DIR_NAME: &str = "records";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub frames: FrameConfig,
    #[serde(default)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub queue_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub view_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            view_limit: HISTORY_VIEW_LIMIT,
        }
    }
}

/// Frame ingestion policy. Both switches default to off, which accepts
/// frames in any state and keeps them out of the session snapshot.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FrameConfig {
    pub require_scanning: bool,
    pub attach_to_session: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub name: String,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_PROFILE_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub file: bool,
}

/// Resolved on-disk layout for one daemon instance.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub data_dir: PathBuf,
}

impl StoragePaths {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn records_dir(&self) -> PathBuf {
        self.data_dir.join(RECORDS_DIR_NAME)
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join(HISTORY_FILE_NAME)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

pub fn default_data_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(DATA_DIR_NAME))
}

pub fn default_config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

pub fn load_config(path: &Path) -> Result<DaemonConfig, String> {
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(path)
        .map_err(|err| format!("Failed to read daemon config {}: {}", path.display(), err))?;
    toml::from_str::<DaemonConfig>(&content)
        .map_err(|err| format!("Failed to parse daemon config {}: {}", path.display(), err))
}
