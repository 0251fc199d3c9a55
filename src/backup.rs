//! Full declared-state backups taken before destructive operations

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::info;

use crate::error::{ControlError, Result};
use crate::model::Snapshot;

pub struct BackupWriter {
    dir: PathBuf,
}

impl BackupWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `snapshot` to `backup-<UTC timestamp>-<reason>.json` and return the path
    pub fn write(&self, snapshot: &Snapshot, reason: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| ControlError::Backup(format!("create {:?}: {}", self.dir, e)))?;

        let name = format!(
            "backup-{}-{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
            sanitize(reason)
        );
        let path = self.dir.join(name);

        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| ControlError::Backup(format!("serialize snapshot: {}", e)))?;
        std::fs::write(&path, json)
            .map_err(|e| ControlError::Backup(format!("write {:?}: {}", path, e)))?;

        info!(
            "Backup written to {:?} ({} hosts, {} certificates)",
            path,
            snapshot.hosts.len(),
            snapshot.certificates.len()
        );
        Ok(path)
    }
}

/// Keep file names portable
fn sanitize(reason: &str) -> String {
    reason
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
