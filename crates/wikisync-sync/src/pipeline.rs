//! Phase state machine driving one sync run: loading, scanning, detailed, merging, saving.
//!
//! Every phase transition is persisted before the next phase starts, and the scanning and
//! detailed phases additionally checkpoint every `checkpoint_every_batches` batches.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use wikisync_core::{MergedDataset, RunStats, Snapshot, SnapshotMetadata, SNAPSHOT_SCHEMA_VERSION};
use wikisync_remote::{FixtureSource, GraphqlSource, RemoteSource};
use wikisync_storage::{
    Checkpoint, CheckpointLoad, CheckpointStore, DetailProgress, GraphqlClient, MergeInput, Phase,
    PhaseState, RetryExecutor, RunErrorLog, SavingProgress, SnapshotStore,
};

use crate::classify::Classifier;
use crate::config::{SyncConfig, SyncMode};
use crate::fetch::DetailFetcher;
use crate::index::DatasetIndex;
use crate::merge::MergeContext;
use crate::plan::Planner;
use crate::scan::SummaryPager;
use crate::writer::{export_parquet, write_run_report, RunReport, SnapshotRef};

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub mode: String,
    pub source: String,
    pub resumed_from: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: RunStats,
    pub snapshot_path: String,
    pub snapshot_sha256: String,
    pub reports_dir: String,
    pub parquet_manifest: Option<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Arc<dyn RemoteSource>,
    snapshots: SnapshotStore,
    checkpoints: CheckpointStore,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, source: Arc<dyn RemoteSource>) -> Self {
        let snapshots = SnapshotStore::new(config.snapshot_dir());
        let checkpoints = CheckpointStore::new(config.checkpoint_path.clone());
        Self {
            config,
            source,
            snapshots,
            checkpoints,
        }
    }

    /// Build the remote source the config asks for: a fixture wiki or the live GraphQL API.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let source: Arc<dyn RemoteSource> = match &config.fixture_path {
            Some(path) => {
                info!(fixture = %path.display(), "using fixture wiki as the remote source");
                Arc::new(FixtureSource::from_path(path)?)
            }
            None => Arc::new(GraphqlSource::new(GraphqlClient::new(
                config.graphql_client(),
            )?)),
        };
        Ok(Self::new(config, source))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let (checkpoint, resumed_from) = self
            .open_checkpoint()
            .instrument(info_span!("phase", phase = %Phase::Loading))
            .await?;

        let baseline = if checkpoint.phase() == Phase::Saving {
            MergedDataset::default()
        } else {
            self.load_baseline(&checkpoint).await?
        };
        let index = DatasetIndex::build(&baseline);

        let errors = RunErrorLog::new();
        let executor = RetryExecutor::new(self.config.retry_policy(), errors.clone());
        let span = info_span!(
            "sync_run",
            run_id = %checkpoint.run_id,
            mode = %checkpoint.mode,
            source = self.source.name()
        );
        let mut run = Run {
            pipeline: self,
            base_errors: checkpoint.stats.errors,
            checkpoint,
            errors,
        };

        run.drive(&executor, &index, baseline, resumed_from)
            .instrument(span)
            .await
    }

    /// Resume a compatible checkpoint or start a fresh one, persisting it before any work.
    async fn open_checkpoint(&self) -> Result<(Checkpoint, Option<Phase>)> {
        let mode = self.config.mode;
        let baseline = match mode {
            SyncMode::Full => None,
            SyncMode::Incremental => self
                .snapshots
                .latest_path()
                .await?
                .map(|p| p.display().to_string()),
        };

        match self.checkpoints.load().await? {
            CheckpointLoad::Resumable(checkpoint) => {
                let checkpoint = *checkpoint;
                let phase = checkpoint.phase();
                if phase == Phase::Saving {
                    info!(
                        run_id = %checkpoint.run_id,
                        "finishing a run that was interrupted while saving"
                    );
                    return Ok((checkpoint, Some(phase)));
                }
                if checkpoint.mode != mode.as_str() {
                    warn!(
                        checkpoint_mode = %checkpoint.mode,
                        requested = %mode,
                        "checkpoint was written for another mode; starting fresh"
                    );
                } else if checkpoint.baseline != baseline {
                    warn!(
                        checkpoint_baseline = ?checkpoint.baseline,
                        latest = ?baseline,
                        "baseline snapshot changed since the checkpoint was written; starting fresh"
                    );
                } else {
                    info!(run_id = %checkpoint.run_id, %phase, "resuming from checkpoint");
                    return Ok((checkpoint, Some(phase)));
                }
                self.checkpoints.clear().await?;
            }
            CheckpointLoad::Discarded { .. } => self.checkpoints.clear().await?,
            CheckpointLoad::Missing => {}
        }

        let mut checkpoint = Checkpoint::new(Uuid::new_v4(), mode.as_str(), baseline);
        self.checkpoints.save(&mut checkpoint).await?;
        info!(run_id = %checkpoint.run_id, baseline = ?checkpoint.baseline, "starting fresh run");
        Ok((checkpoint, None))
    }

    async fn load_baseline(&self, checkpoint: &Checkpoint) -> Result<MergedDataset> {
        match &checkpoint.baseline {
            Some(path) => {
                let snapshot = self
                    .snapshots
                    .load(Path::new(path))
                    .await
                    .with_context(|| format!("loading baseline {path}"))?;
                info!(
                    baseline = %path,
                    pages = snapshot.dataset.pages.len(),
                    votes = snapshot.dataset.vote_records.len(),
                    "baseline indexed"
                );
                Ok(snapshot.dataset)
            }
            None => Ok(MergedDataset::default()),
        }
    }
}

/// Coordinator-owned state for one run. Nothing here is shared across tasks.
struct Run<'p> {
    pipeline: &'p SyncPipeline,
    checkpoint: Checkpoint,
    errors: RunErrorLog,
    /// Errors recorded by earlier processes working on the same checkpoint.
    base_errors: u64,
}

impl Run<'_> {
    async fn drive(
        &mut self,
        executor: &RetryExecutor,
        index: &DatasetIndex,
        baseline: MergedDataset,
        resumed_from: Option<Phase>,
    ) -> Result<SyncRunSummary> {
        let mut baseline = Some(baseline);
        loop {
            let phase = self.checkpoint.phase();
            let span = info_span!("phase", phase = %phase);
            match phase {
                Phase::Scanning => self.scan(executor, index).instrument(span).await?,
                Phase::Detailed => self.fetch_details(executor, index).instrument(span).await?,
                Phase::Merging => {
                    let baseline = baseline.take().unwrap_or_default();
                    self.merge(baseline).instrument(span).await?
                }
                Phase::Saving => return self.finish(resumed_from).instrument(span).await,
                Phase::Loading | Phase::Cleared => {
                    bail!("checkpoint cannot rest in phase {phase}")
                }
            }
        }
    }

    async fn persist(&mut self) -> Result<()> {
        self.checkpoint.stats.errors = self.base_errors + self.errors.len() as u64;
        self.pipeline.checkpoints.save(&mut self.checkpoint).await
    }

    async fn advance(&mut self, next: PhaseState) -> Result<()> {
        let from = self.checkpoint.phase();
        self.checkpoint.advance(next)?;
        self.persist().await?;
        info!(%from, to = %self.checkpoint.phase(), "phase complete");
        Ok(())
    }

    async fn scan(&mut self, executor: &RetryExecutor, index: &DatasetIndex) -> Result<()> {
        let pipeline = self.pipeline;
        let config = &pipeline.config;
        let cursor = match &self.checkpoint.state {
            PhaseState::Scanning(scan) => scan.cursor.clone(),
            other => bail!("expected scanning progress, found {}", other.phase()),
        };
        if cursor.is_some() {
            info!(cursor = ?cursor, "resuming scan");
        }

        let mut pager = SummaryPager::new(
            pipeline.source.as_ref(),
            executor,
            config.scan_page_size,
            cursor,
        );
        let classifier = Classifier::new(index, config.fast_stop);
        let every = config.checkpoint_every_batches.max(1);
        let mut since_save = 0u64;

        loop {
            let batch = match pager.next_batch().await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(err) => {
                    self.persist().await?;
                    return Err(err).context("scanning page summaries");
                }
            };
            let PhaseState::Scanning(scan) = &mut self.checkpoint.state else {
                bail!("scan progress vanished mid-phase");
            };
            let halted =
                classifier.classify_into(batch, &mut scan.classified, &mut self.checkpoint.stats);
            scan.cursor = pager.cursor().map(str::to_string);
            scan.batches += 1;
            self.checkpoint.stats.scan_batches += 1;
            if halted {
                self.checkpoint.stats.fast_stopped = true;
                break;
            }

            since_save += 1;
            if since_save >= every {
                self.persist().await?;
                since_save = 0;
                debug!(cursor = ?pager.cursor(), "scan checkpoint saved");
            }
        }

        let PhaseState::Scanning(scan) = &mut self.checkpoint.state else {
            bail!("scan progress vanished mid-phase");
        };
        let classified = std::mem::take(&mut scan.classified);
        let plan = Planner::new(config.planner(), index, Utc::now())
            .plan(&classified, &mut self.checkpoint.stats);
        let stats = &self.checkpoint.stats;
        info!(
            scanned = stats.scanned,
            new = stats.new_pages,
            unchanged = stats.unchanged,
            planned = plan.len(),
            fast_stopped = stats.fast_stopped,
            "classification complete"
        );
        self.advance(PhaseState::Detailed(DetailProgress::new(classified, plan)))
            .await
    }

    async fn fetch_details(
        &mut self,
        executor: &RetryExecutor,
        index: &DatasetIndex,
    ) -> Result<()> {
        let pipeline = self.pipeline;
        let config = &pipeline.config;
        let fetcher = DetailFetcher::new(
            pipeline.source.as_ref(),
            executor,
            index,
            config.fetch_limits(),
        );
        let every = config.checkpoint_every_batches.max(1);
        let mut since_save = 0u64;
        let mut consecutive_failures = 0u32;

        loop {
            let PhaseState::Detailed(progress) = &mut self.checkpoint.state else {
                bail!("detail progress vanished mid-phase");
            };
            let batch = progress.take_batch(config.detail_batch_width);
            if batch.is_empty() {
                break;
            }
            let batch_no = progress.batches + 1;
            let span = info_span!("detail_batch", batch = batch_no, size = batch.len());
            let result = fetcher.fetch_batch(&batch).instrument(span).await;

            let PhaseState::Detailed(progress) = &mut self.checkpoint.state else {
                bail!("detail progress vanished mid-phase");
            };
            match result {
                Ok(payloads) => {
                    self.checkpoint.stats.payloads_fetched += payloads.len() as u64;
                    self.checkpoint.stats.detail_batches += 1;
                    progress.complete(payloads);
                    consecutive_failures = 0;
                    since_save += 1;
                    if since_save >= every && !progress.is_done() {
                        let remaining = progress.remaining();
                        self.persist().await?;
                        since_save = 0;
                        debug!(remaining, "detail checkpoint saved");
                    }
                }
                Err(err) => {
                    progress.requeue(batch);
                    self.checkpoint.stats.requeued_batches += 1;
                    consecutive_failures += 1;
                    self.persist().await?;
                    if err.is_fatal() {
                        return Err(err).context(format!(
                            "detail batch {batch_no} hit a non-retryable error; \
                             progress checkpointed"
                        ));
                    }
                    if consecutive_failures > config.max_batch_retries {
                        return Err(err).context(format!(
                            "detail batches failed {consecutive_failures} times in a row; \
                             progress checkpointed"
                        ));
                    }
                    warn!(
                        batch = batch_no,
                        failures = consecutive_failures,
                        cooldown_ms = config.batch_cooldown_ms,
                        error = %err,
                        cause = %err.remote(),
                        "detail batch failed; requeued whole"
                    );
                    tokio::time::sleep(config.batch_cooldown()).await;
                }
            }
        }

        let PhaseState::Detailed(progress) = &mut self.checkpoint.state else {
            bail!("detail progress vanished mid-phase");
        };
        let input = MergeInput {
            classified: std::mem::take(&mut progress.classified),
            payloads: std::mem::take(&mut progress.payloads),
        };
        let throughput = executor.throughput();
        info!(
            payloads = input.payloads.len(),
            avg_call_ms = throughput.average().map(|d| d.as_millis() as u64),
            calls_per_sec = throughput.calls_per_second(),
            "detail fetch complete"
        );
        self.advance(PhaseState::Merging(input)).await
    }

    async fn merge(&mut self, baseline: MergedDataset) -> Result<()> {
        let PhaseState::Merging(input) = &mut self.checkpoint.state else {
            bail!("expected merge input, found {}", self.checkpoint.phase());
        };
        let classified = std::mem::take(&mut input.classified);
        let payloads = std::mem::take(&mut input.payloads);

        let stats = &mut self.checkpoint.stats;
        let mut context = MergeContext::from_baseline(baseline, Utc::now());
        for page in classified.values() {
            context.apply_summary(page, stats);
        }
        let scanned = classified.keys().map(String::as_str).collect::<BTreeSet<_>>();
        stats.pages_carried_over = context.carried_over(&scanned) as u64;
        for payload in payloads.into_values() {
            context.apply_detail(payload, stats);
        }
        let dataset = context.into_dataset();
        info!(
            pages = dataset.pages.len(),
            votes = dataset.vote_records.len(),
            votes_added = stats.votes_added,
            carried_over = stats.pages_carried_over,
            "merge complete"
        );
        self.advance(PhaseState::Saving(SavingProgress { dataset }))
            .await
    }

    async fn finish(&mut self, resumed_from: Option<Phase>) -> Result<SyncRunSummary> {
        let pipeline = self.pipeline;
        let config = &pipeline.config;
        let PhaseState::Saving(saving) = &mut self.checkpoint.state else {
            bail!("expected a dataset to save, found {}", self.checkpoint.phase());
        };
        let dataset = std::mem::take(&mut saving.dataset);
        self.checkpoint.stats.errors = self.base_errors + self.errors.len() as u64;

        let checkpoint = &self.checkpoint;
        let run_id = checkpoint.run_id;
        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                schema_version: SNAPSHOT_SCHEMA_VERSION,
                run_id,
                mode: checkpoint.mode.clone(),
                started_at: checkpoint.started_at,
                finished_at: Utc::now(),
                baseline: checkpoint.baseline.clone(),
                stats: checkpoint.stats.clone(),
            },
            dataset,
        };
        let written = pipeline.snapshots.write(&snapshot).await?;
        info!(
            path = %written.path.display(),
            sha256 = %written.sha256,
            bytes = written.byte_size,
            "snapshot written"
        );

        let reports_root = config.reports_dir();
        let run_dir = reports_root.join(run_id.to_string());
        let parquet_manifest = if config.export_parquet {
            let manifest = export_parquet(&run_dir, run_id, &snapshot.dataset).await?;
            Some(manifest.display().to_string())
        } else {
            None
        };

        let report = RunReport {
            run_id,
            mode: checkpoint.mode.clone(),
            source: pipeline.source.name().to_string(),
            started_at: checkpoint.started_at,
            finished_at: snapshot.metadata.finished_at,
            resumed_from: resumed_from.map(|p| p.to_string()),
            baseline: checkpoint.baseline.clone(),
            snapshot: SnapshotRef {
                path: written.path.display().to_string(),
                sha256: written.sha256.clone(),
                bytes: written.byte_size as u64,
            },
            parquet_manifest: parquet_manifest.clone(),
            stats: checkpoint.stats.clone(),
            errors: self.errors.entries(),
        };
        let reports_dir = write_run_report(&reports_root, &report).await?;

        pipeline.checkpoints.clear().await?;
        info!(reports_dir = %reports_dir.display(), "run complete");

        Ok(SyncRunSummary {
            run_id,
            mode: report.mode,
            source: report.source,
            resumed_from: report.resumed_from,
            started_at: report.started_at,
            finished_at: report.finished_at,
            stats: report.stats,
            snapshot_path: report.snapshot.path,
            snapshot_sha256: report.snapshot.sha256,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest,
        })
    }
}
