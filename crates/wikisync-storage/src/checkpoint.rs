//! Versioned checkpoint document and its on-disk store.
//!
//! The checkpoint is a tagged union over the pipeline phases. Each variant carries exactly the
//! state needed to resume that phase, so a run interrupted anywhere restarts at the last
//! persisted cursor or batch boundary.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;
use wikisync_core::{
    ClassifiedPage, DetailNeed, DetailPayload, MergedDataset, PlannedFetch, RunStats,
};

use crate::write_json_atomic;

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Loading,
    Scanning,
    Detailed,
    Merging,
    Saving,
    Cleared,
}

impl Phase {
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Loading => Some(Phase::Scanning),
            Phase::Scanning => Some(Phase::Detailed),
            Phase::Detailed => Some(Phase::Merging),
            Phase::Merging => Some(Phase::Saving),
            Phase::Saving => Some(Phase::Cleared),
            Phase::Cleared => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Loading => "loading",
            Phase::Scanning => "scanning",
            Phase::Detailed => "detailed",
            Phase::Merging => "merging",
            Phase::Saving => "saving",
            Phase::Cleared => "cleared",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanProgress {
    /// Cursor after the last fully classified batch; `None` before the first page.
    pub cursor: Option<String>,
    pub classified: BTreeMap<String, ClassifiedPage>,
    pub batches: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailProgress {
    pub classified: BTreeMap<String, ClassifiedPage>,
    pub needs: BTreeMap<String, DetailNeed>,
    pub pending: VecDeque<String>,
    pub completed: BTreeSet<String>,
    pub payloads: BTreeMap<String, DetailPayload>,
    pub batches: u64,
}

impl DetailProgress {
    pub fn new(classified: BTreeMap<String, ClassifiedPage>, plan: Vec<PlannedFetch>) -> Self {
        let pending = plan.iter().map(|p| p.url.clone()).collect();
        let needs = plan.into_iter().map(|p| (p.url, p.need)).collect();
        Self {
            classified,
            needs,
            pending,
            completed: BTreeSet::new(),
            payloads: BTreeMap::new(),
            batches: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Pop up to `width` pending fetches off the front of the queue.
    pub fn take_batch(&mut self, width: usize) -> Vec<PlannedFetch> {
        let mut batch = Vec::with_capacity(width.max(1));
        while batch.len() < width.max(1) {
            let Some(url) = self.pending.pop_front() else {
                break;
            };
            if self.completed.contains(&url) {
                continue;
            }
            let need = self.needs.get(&url).cloned().unwrap_or_default();
            batch.push(PlannedFetch { url, need });
        }
        batch
    }

    /// Push an entire failed batch back to the end of the queue.
    pub fn requeue(&mut self, batch: Vec<PlannedFetch>) {
        self.pending.extend(batch.into_iter().map(|p| p.url));
    }

    pub fn complete(&mut self, payloads: Vec<DetailPayload>) {
        for payload in payloads {
            self.completed.insert(payload.url.clone());
            self.payloads.insert(payload.url.clone(), payload);
        }
        self.batches += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeInput {
    pub classified: BTreeMap<String, ClassifiedPage>,
    pub payloads: BTreeMap<String, DetailPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavingProgress {
    pub dataset: MergedDataset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "progress", rename_all = "snake_case")]
pub enum PhaseState {
    Scanning(ScanProgress),
    Detailed(DetailProgress),
    Merging(MergeInput),
    Saving(SavingProgress),
}

impl PhaseState {
    pub fn phase(&self) -> Phase {
        match self {
            PhaseState::Scanning(_) => Phase::Scanning,
            PhaseState::Detailed(_) => Phase::Detailed,
            PhaseState::Merging(_) => Phase::Merging,
            PhaseState::Saving(_) => Phase::Saving,
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("illegal checkpoint transition {from} -> {to}")]
    IllegalTransition { from: Phase, to: Phase },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub mode: String,
    /// Snapshot the run started from; a different baseline invalidates the checkpoint.
    pub baseline: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stats: RunStats,
    pub state: PhaseState,
}

impl Checkpoint {
    pub fn new(run_id: Uuid, mode: impl Into<String>, baseline: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            run_id,
            mode: mode.into(),
            baseline,
            started_at: now,
            updated_at: now,
            stats: RunStats::default(),
            state: PhaseState::Scanning(ScanProgress::default()),
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Move to the next phase; skipping or repeating a phase is rejected.
    pub fn advance(&mut self, next: PhaseState) -> Result<(), CheckpointError> {
        let from = self.phase();
        let to = next.phase();
        if from.next() != Some(to) {
            return Err(CheckpointError::IllegalTransition { from, to });
        }
        self.state = next;
        Ok(())
    }
}

#[derive(Debug)]
pub enum CheckpointLoad {
    Missing,
    Resumable(Box<Checkpoint>),
    /// Present but unusable: corrupt, or written by an incompatible pipeline version.
    Discarded { reason: String },
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> anyhow::Result<CheckpointLoad> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking checkpoint {}", self.path.display()))?
        {
            return Ok(CheckpointLoad::Missing);
        }

        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) => return Ok(Self::discard(format!("unreadable: {err}"))),
        };
        let raw: JsonValue = match serde_json::from_slice(&bytes) {
            Ok(raw) => raw,
            Err(err) => return Ok(Self::discard(format!("corrupt json: {err}"))),
        };
        match raw.get("schema_version").and_then(JsonValue::as_u64) {
            Some(v) if v == u64::from(CHECKPOINT_SCHEMA_VERSION) => {}
            Some(v) => {
                return Ok(Self::discard(format!(
                    "schema version {v} is not {CHECKPOINT_SCHEMA_VERSION}"
                )))
            }
            None => return Ok(Self::discard("missing schema_version".to_string())),
        }
        match serde_json::from_value::<Checkpoint>(raw) {
            Ok(checkpoint) => Ok(CheckpointLoad::Resumable(Box::new(checkpoint))),
            Err(err) => Ok(Self::discard(format!("unrecognised layout: {err}"))),
        }
    }

    fn discard(reason: String) -> CheckpointLoad {
        warn!(%reason, "ignoring unusable checkpoint; starting fresh");
        CheckpointLoad::Discarded { reason }
    }

    pub async fn save(&self, checkpoint: &mut Checkpoint) -> anyhow::Result<()> {
        checkpoint.updated_at = Utc::now();
        write_json_atomic(&self.path, checkpoint)
            .await
            .with_context(|| format!("saving checkpoint {}", self.path.display()))?;
        Ok(())
    }

    pub async fn clear(&self) -> anyhow::Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "checkpoint cleared");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("removing checkpoint {}", self.path.display()))
            }
        }
    }
}
