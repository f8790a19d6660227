// Time-gated store snapshots
// Every mutating store call asks the policy first; when the interval has
// elapsed a consistent copy is written next to the store and old copies are
// pruned.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use rusqlite::{params, Connection};
use walkdir::WalkDir;

use crate::config::StoreConfig;
use crate::constants::BACKUP_TIMESTAMP_FORMAT;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct BackupPolicy {
    interval: Duration,
    keep: usize,
    folder: String,
    last_backup: Option<NaiveDateTime>,
}

impl BackupPolicy {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            interval: config.backup_interval(),
            keep: config.backups_to_keep,
            folder: config.backup_folder.clone(),
            last_backup: None,
        }
    }

    /// Policy for a store on disk; the last backup time is recovered from
    /// the newest snapshot already in the backup folder.
    pub fn for_store(config: &StoreConfig, store_path: &Path) -> Self {
        let mut policy = Self::new(config);
        policy.last_backup = list_backups(store_path, &policy.folder)
            .first()
            .map(|(stamp, _)| *stamp);
        policy
    }

    pub fn last_backup(&self) -> Option<NaiveDateTime> {
        self.last_backup
    }

    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        match self.last_backup {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(last);
                elapsed.to_std().map(|e| e >= self.interval).unwrap_or(false)
            }
        }
    }

    /// Snapshot the store if the interval has elapsed. In-memory stores
    /// (no path) are never backed up.
    pub fn backup_if_due(&mut self, conn: &Connection, store_path: Option<&Path>) -> Result<Option<PathBuf>> {
        let Some(store_path) = store_path else {
            return Ok(None);
        };
        let now = Local::now().naive_local();
        if !self.is_due(now) {
            return Ok(None);
        }
        self.snapshot(conn, store_path, now).map(Some)
    }

    /// Snapshot unconditionally.
    pub fn backup_now(&mut self, conn: &Connection, store_path: &Path) -> Result<PathBuf> {
        self.snapshot(conn, store_path, Local::now().naive_local())
    }

    fn snapshot(&mut self, conn: &Connection, store_path: &Path, now: NaiveDateTime) -> Result<PathBuf> {
        let folder = backup_folder(store_path, &self.folder);
        std::fs::create_dir_all(&folder)?;

        let target = folder.join(backup_file_name(store_path, now));
        if !target.exists() {
            conn.execute("VACUUM INTO ?1", params![target.to_string_lossy().into_owned()])?;
            log::info!("Backed up store to {}", target.display());
        }
        self.last_backup = Some(now);

        prune_backups(store_path, &self.folder, self.keep)?;
        Ok(target)
    }
}

pub fn backup_folder(store_path: &Path, folder: &str) -> PathBuf {
    store_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(folder)
}

fn store_stem_and_ext(store_path: &Path) -> (String, String) {
    let stem = store_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = store_path
        .extension()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    (stem, ext)
}

fn backup_file_name(store_path: &Path, at: NaiveDateTime) -> String {
    let (stem, ext) = store_stem_and_ext(store_path);
    let stamp = at.format(BACKUP_TIMESTAMP_FORMAT);
    if ext.is_empty() {
        format!("{}.{}", stem, stamp)
    } else {
        format!("{}.{}.{}", stem, stamp, ext)
    }
}

/// Snapshots of this store, newest first.
pub fn list_backups(store_path: &Path, folder: &str) -> Vec<(NaiveDateTime, PathBuf)> {
    let dir = backup_folder(store_path, folder);
    let (stem, ext) = store_stem_and_ext(store_path);
    let prefix = format!("{}.", stem);
    let suffix = if ext.is_empty() { String::new() } else { format!(".{}", ext) };

    let mut found: Vec<(NaiveDateTime, PathBuf)> = WalkDir::new(&dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            let middle = name.strip_prefix(&prefix)?.strip_suffix(suffix.as_str())?;
            let stamp = NaiveDateTime::parse_from_str(middle, BACKUP_TIMESTAMP_FORMAT).ok()?;
            Some((stamp, e.into_path()))
        })
        .collect();

    found.sort_by(|a, b| b.0.cmp(&a.0));
    found
}

/// Delete all but the newest `keep` snapshots. Returns how many were removed.
pub fn prune_backups(store_path: &Path, folder: &str, keep: usize) -> Result<usize> {
    let mut removed = 0;
    for (_, path) in list_backups(store_path, folder).into_iter().skip(keep) {
        std::fs::remove_file(&path)?;
        log::debug!("Pruned backup {}", path.display());
        removed += 1;
    }
    Ok(removed)
}
