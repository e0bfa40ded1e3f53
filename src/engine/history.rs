//! Deployment history journal
//!
//! Append-only JSON lines under the config root. Retention is unbounded;
//! callers prune explicitly.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub strategy: String,
    pub image_tag: String,
    pub container_name: String,
    pub status: DeployStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Append-only journal of deployment outcomes.
pub struct HistoryJournal {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl HistoryJournal {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn append(&self, entry: &DeploymentHistoryEntry) -> Result<()> {
        let _guard = self.lock.lock().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Last `limit` entries, newest first. Unparseable lines are skipped.
    pub async fn recent(&self, limit: usize) -> Result<Vec<DeploymentHistoryEntry>> {
        let _guard = self.lock.lock().await;

        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries: Vec<DeploymentHistoryEntry> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str(l) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("skipping corrupt history line: {}", e);
                    None
                }
            })
            .collect();

        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }

    /// Keep only the newest `keep` entries.
    pub async fn prune(&self, keep: usize) -> Result<()> {
        let mut entries = self.recent(usize::MAX).await?;
        entries.truncate(keep);
        entries.reverse();

        let _guard = self.lock.lock().await;
        let mut content = String::new();
        for entry in &entries {
            content.push_str(&serde_json::to_string(entry)?);
            content.push('\n');
        }
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, status: DeployStatus) -> DeploymentHistoryEntry {
        DeploymentHistoryEntry {
            timestamp: Utc::now(),
            strategy: "rolling".into(),
            image_tag: "app:1".into(),
            container_name: name.into(),
            status,
            duration_ms: 1200,
            output: None,
        }
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let journal = HistoryJournal::new(dir.path().join("history.json"));

        journal.append(&entry("a", DeployStatus::Success)).await.unwrap();
        journal.append(&entry("b", DeployStatus::Failed)).await.unwrap();
        journal.append(&entry("c", DeployStatus::Success)).await.unwrap();

        let recent = journal.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].container_name, "c");
        assert_eq!(recent[1].container_name, "b");
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = HistoryJournal::new(dir.path().join("none.json"));
        assert!(journal.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let journal = HistoryJournal::new(dir.path().join("history.json"));

        for name in ["a", "b", "c", "d"] {
            journal.append(&entry(name, DeployStatus::Success)).await.unwrap();
        }
        journal.prune(2).await.unwrap();

        let all = journal.recent(10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].container_name, "d");
        assert_eq!(all[1].container_name, "c");
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let journal = HistoryJournal::new(path.clone());

        journal.append(&entry("good", DeployStatus::Success)).await.unwrap();
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap()
            .write_all(b"{not json}\n")
            .await
            .unwrap();

        let recent = journal.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
    }
}
