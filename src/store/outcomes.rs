//! Append-only terminal-state outcome log. Never pruned; this is the
//! long-horizon memory that project lessons are derived from.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Merged,
    Killed,
    Stuck,
    Errored,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merged => "merged",
            Self::Killed => "killed",
            Self::Stuck => "stuck",
            Self::Errored => "errored",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Merged)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub session_id: String,
    pub project_id: String,
    pub outcome: OutcomeKind,
    pub duration_ms: u64,
    pub ci_retries: usize,
    pub review_rounds: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_checks: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub struct OutcomeStore {
    path: PathBuf,
}

impl OutcomeStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub async fn append(&self, outcome: &Outcome) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(outcome)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// All outcomes in append order. Malformed lines are skipped.
    pub async fn read_all(&self) -> Result<Vec<Outcome>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut outcomes = Vec::new();
        let mut malformed = 0usize;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Outcome>(line) {
                Ok(outcome) => outcomes.push(outcome),
                Err(_) => malformed += 1,
            }
        }
        if malformed > 0 {
            warn!(
                path = %self.path.display(),
                malformed,
                "Skipped malformed outcome lines"
            );
        }
        Ok(outcomes)
    }

    /// The most recent `n` outcomes, newest-first.
    pub async fn recent(&self, n: usize) -> Result<Vec<Outcome>> {
        let mut outcomes = self.read_all().await?;
        outcomes.reverse();
        outcomes.truncate(n);
        Ok(outcomes)
    }
}
