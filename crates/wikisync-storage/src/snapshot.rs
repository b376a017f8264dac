//! Timestamped snapshot files; the most recently modified one is the next run's baseline.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::info;
use wikisync_core::Snapshot;

use crate::{sha256_hex, write_bytes_atomic};

const SNAPSHOT_PREFIX: &str = "snapshot_";

#[derive(Debug, Clone)]
pub struct LoadedSnapshot {
    pub path: PathBuf,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone)]
pub struct WrittenSnapshot {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name_for(finished_at: DateTime<Utc>) -> String {
        format!(
            "{SNAPSHOT_PREFIX}{}.json",
            finished_at.format("%Y%m%dT%H%M%S%3fZ")
        )
    }

    fn is_snapshot_file(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(SNAPSHOT_PREFIX) && n.ends_with(".json"))
    }

    /// Most recently modified snapshot file, ties broken by the timestamped name.
    pub async fn latest_path(&self) -> anyhow::Result<Option<PathBuf>> {
        if !fs::try_exists(&self.dir)
            .await
            .with_context(|| format!("checking {}", self.dir.display()))?
        {
            return Ok(None);
        }

        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("reading {}", self.dir.display()))?;
        let mut best: Option<(SystemTime, PathBuf)> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.dir.display()))?
        {
            let path = entry.path();
            if !Self::is_snapshot_file(&path) {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let newer = match &best {
                None => true,
                Some((best_time, best_path)) => {
                    (modified, &path) > (*best_time, best_path)
                }
            };
            if newer {
                best = Some((modified, path));
            }
        }
        Ok(best.map(|(_, path)| path))
    }

    pub async fn load(&self, path: &Path) -> anyhow::Result<Snapshot> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing snapshot {}", path.display()))
    }

    pub async fn load_latest(&self) -> anyhow::Result<Option<LoadedSnapshot>> {
        let Some(path) = self.latest_path().await? else {
            return Ok(None);
        };
        let snapshot = self.load(&path).await?;
        info!(
            path = %path.display(),
            pages = snapshot.dataset.pages.len(),
            votes = snapshot.dataset.vote_records.len(),
            "loaded baseline snapshot"
        );
        Ok(Some(LoadedSnapshot { path, snapshot }))
    }

    pub async fn write(&self, snapshot: &Snapshot) -> anyhow::Result<WrittenSnapshot> {
        let path = self
            .dir
            .join(Self::file_name_for(snapshot.metadata.finished_at));
        let bytes = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;
        write_bytes_atomic(&path, &bytes).await?;
        Ok(WrittenSnapshot {
            sha256: sha256_hex(&bytes),
            byte_size: bytes.len(),
            path,
        })
    }
}
