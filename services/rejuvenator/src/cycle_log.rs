//! Per-batch JSON-lines record of every cycle.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::decommission::DecommissionSummary;
use crate::model::Generation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed,
    /// The cycle's new resources were torn down; the previous generation
    /// keeps serving.
    Aborted,
    /// The batch stopped and needs manual reconciliation.
    Halted,
}

#[derive(Debug, Serialize)]
pub struct CycleRecord<'a> {
    pub batch: usize,
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: CycleOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<&'a Generation>,
    pub notified_clients: usize,
    pub failed_clients: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decommission: Option<&'a DecommissionSummary>,
}

/// Appends records to `<dir>/batch-<n>.jsonl`.
#[derive(Debug, Clone)]
pub struct CycleLog {
    path: PathBuf,
}

impl CycleLog {
    pub fn new(dir: &Path, batch: usize) -> Self {
        Self {
            path: dir.join(format!("batch-{batch}.jsonl")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &CycleRecord<'_>) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}
