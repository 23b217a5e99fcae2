use crate::types::{AgentNode, HealthSample, QueueStats, Task, ValidationRecord};
use chrono::{DateTime, Utc};
use hierarch_core::HierarchResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Point-in-time export of the four engine tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Every task, active or archived.
    pub tasks: Vec<Task>,
    /// Every agent node.
    pub agents: Vec<AgentNode>,
    /// Current sample per agent.
    pub health: Vec<HealthSample>,
    /// The validation ledger.
    pub validations: Vec<ValidationRecord>,
}

impl EngineSnapshot {
    /// Task counts per status in this snapshot.
    pub fn queue_stats(&self) -> QueueStats {
        QueueStats::from_statuses(self.tasks.iter().map(|t| t.status))
    }
}

/// JSON-file persistence for engine snapshots.
///
/// Each save writes `snapshot_<timestamp>.json`; names sort chronologically.
pub struct JsonSnapshotStore {
    base_dir: PathBuf,
}

impl JsonSnapshotStore {
    /// Store writing under `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Directory snapshots are written to.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Save a snapshot. Returns the path it was written to.
    pub async fn save(&self, snapshot: &EngineSnapshot) -> HierarchResult<PathBuf> {
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let timestamp = snapshot.taken_at.format("%Y%m%d_%H%M%S_%6f");
        let path = self.base_dir.join(format!("snapshot_{timestamp}.json"));

        let json = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }

    /// The most recent snapshot, if any was saved.
    pub async fn load_latest(&self) -> HierarchResult<Option<EngineSnapshot>> {
        match self.list().await?.last() {
            Some(path) => {
                let content = tokio::fs::read_to_string(path).await?;
                Ok(Some(serde_json::from_str(&content)?))
            }
            None => Ok(None),
        }
    }

    /// Snapshot files, oldest first.
    pub async fn list(&self) -> HierarchResult<Vec<PathBuf>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with("snapshot_") && name.ends_with(".json") {
                    entries.push(path);
                }
            }
        }

        entries.sort();
        Ok(entries)
    }
}
