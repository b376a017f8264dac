//! Read-side summaries for the CLI: recent run reports and the pending checkpoint.

use std::path::Path;

use anyhow::{Context, Result};
use wikisync_storage::{CheckpointLoad, CheckpointStore, PhaseState};

use crate::writer::{RunReport, RUN_REPORT_JSON, RUN_REPORT_MARKDOWN};

/// Markdown digest of the `runs` most recently modified run report directories.
pub fn report_recent_runs(runs: usize, reports_root: &Path) -> Result<String> {
    let mut lines = vec!["# Wiki Mirror Recent Runs".to_string(), String::new()];
    if !reports_root.exists() {
        lines.push(format!("No runs recorded under `{}`.", reports_root.display()));
        return Ok(lines.join("\n"));
    }

    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join(RUN_REPORT_JSON).exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| {
        (
            e.metadata().and_then(|m| m.modified()).ok(),
            e.file_name(),
        )
    });
    dirs.reverse();

    for dir in dirs.into_iter().take(runs.max(1)) {
        let json_path = dir.path().join(RUN_REPORT_JSON);
        let report: RunReport = serde_json::from_str(
            &std::fs::read_to_string(&json_path)
                .with_context(|| format!("reading {}", json_path.display()))?,
        )
        .with_context(|| format!("parsing {}", json_path.display()))?;
        let stats = &report.stats;

        lines.push(format!("## Run `{}` ({})", report.run_id, report.mode));
        lines.push(format!("- finished: {}", report.finished_at.to_rfc3339()));
        lines.push(format!(
            "- scanned: {} (new {}, changed {}, unchanged {})",
            stats.scanned,
            stats.new_pages,
            stats.scanned.saturating_sub(stats.new_pages + stats.unchanged),
            stats.unchanged
        ));
        lines.push(format!(
            "- detail: {} planned, {} batches, {} requeued",
            stats.planned_fetches, stats.detail_batches, stats.requeued_batches
        ));
        lines.push(format!(
            "- merge: +{} pages, +{} votes ({} flipped), +{} revisions",
            stats.pages_added, stats.votes_added, stats.votes_updated, stats.revisions_added
        ));
        lines.push(format!("- errors: {}", stats.errors));
        lines.push(format!("- snapshot: `{}`", report.snapshot.path));
        if let Some(manifest) = &report.parquet_manifest {
            lines.push(format!("- parquet manifest: `{manifest}`"));
        }
        let markdown = dir.path().join(RUN_REPORT_MARKDOWN);
        if markdown.exists() {
            lines.push(format!("- full report: `{}`", markdown.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

/// One-paragraph description of whatever checkpoint sits at the store's path.
pub async fn checkpoint_status(store: &CheckpointStore) -> Result<String> {
    let load = store.load().await?;
    let checkpoint = match load {
        CheckpointLoad::Missing => return Ok("no checkpoint; the next run starts fresh".into()),
        CheckpointLoad::Discarded { reason } => {
            return Ok(format!(
                "checkpoint at {} is unusable ({reason}); the next run starts fresh",
                store.path().display()
            ))
        }
        CheckpointLoad::Resumable(checkpoint) => checkpoint,
    };

    let progress = match &checkpoint.state {
        PhaseState::Scanning(scan) => format!(
            "{} pages classified over {} batches, cursor {}",
            scan.classified.len(),
            scan.batches,
            scan.cursor.as_deref().unwrap_or("<start>")
        ),
        PhaseState::Detailed(detail) => format!(
            "{} fetched, {} pending, {} batches done",
            detail.completed.len(),
            detail.remaining(),
            detail.batches
        ),
        PhaseState::Merging(input) => format!(
            "{} classified pages and {} payloads ready to merge",
            input.classified.len(),
            input.payloads.len()
        ),
        PhaseState::Saving(saving) => format!(
            "{} pages and {} votes waiting to be written",
            saving.dataset.pages.len(),
            saving.dataset.vote_records.len()
        ),
    };
    Ok(format!(
        "run {} ({}) paused in phase {}: {}; baseline {}; last saved {}",
        checkpoint.run_id,
        checkpoint.mode,
        checkpoint.phase(),
        progress,
        checkpoint.baseline.as_deref().unwrap_or("none"),
        checkpoint.updated_at.to_rfc3339()
    ))
}
