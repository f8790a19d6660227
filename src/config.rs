// Store configuration
// Process-wide knobs (batch sizes, backup policy, CSV layout). Per-store
// settings live in the image set row instead.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::Result;

/// How a DateTime field is laid out in exported CSV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CsvDateMode {
    /// One `DateTime` column.
    Single,
    /// Legacy `Date` and `Time` columns.
    Split,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    pub insert_batch_size: usize,
    pub import_batch_size: usize,
    pub max_reported_error_rows: usize,
    pub backup_interval_minutes: u64,
    pub backups_to_keep: usize,
    pub backup_folder: String,
    pub progress_interval_ms: u64,
    pub backoff_ms: u64,
    pub csv_date_mode: CsvDateMode,
    pub csv_t_separator: bool,
    pub csv_leading_space: bool,
    pub csv_include_root_folder: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            insert_batch_size: DEFAULT_INSERT_BATCH_SIZE,
            import_batch_size: DEFAULT_IMPORT_BATCH_SIZE,
            max_reported_error_rows: DEFAULT_MAX_REPORTED_ERROR_ROWS,
            backup_interval_minutes: DEFAULT_BACKUP_INTERVAL_MINUTES,
            backups_to_keep: DEFAULT_BACKUPS_TO_KEEP,
            backup_folder: BACKUP_FOLDER.to_string(),
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            backoff_ms: DEFAULT_BACKOFF_MS,
            csv_date_mode: CsvDateMode::Single,
            csv_t_separator: false,
            csv_leading_space: false,
            csv_include_root_folder: false,
        }
    }
}

impl StoreConfig {
    /// Load from a JSON file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: StoreConfig = serde_json::from_str(&text)?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load from the default location, falling back to defaults when no file exists.
    pub fn load_or_default() -> Result<Self> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_minutes * 60)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Config used by tests: no backoff, small batches.
    pub fn for_tests() -> Self {
        Self {
            insert_batch_size: 3,
            import_batch_size: 2,
            backoff_ms: 0,
            ..Self::default()
        }
    }
}

/// Platform config file location, e.g. `~/.config/trapstore/trapstore.json`.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "trapstore", "trapstore")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILENAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, r#"{ "importBatchSize": 10, "csvDateMode": "split" }"#).unwrap();

        let config = StoreConfig::load(&path).unwrap();
        assert_eq!(config.import_batch_size, 10);
        assert_eq!(config.csv_date_mode, CsvDateMode::Split);
        assert_eq!(config.insert_batch_size, DEFAULT_INSERT_BATCH_SIZE);
        assert_eq!(config.backups_to_keep, DEFAULT_BACKUPS_TO_KEEP);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cfg.json");
        let mut config = StoreConfig::default();
        config.csv_leading_space = true;
        config.save(&path).unwrap();

        let loaded = StoreConfig::load(&path).unwrap();
        assert!(loaded.csv_leading_space);
        assert_eq!(loaded.backup_interval(), Duration::from_secs(30 * 60));
    }
}
