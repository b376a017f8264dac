//! End-of-run artifacts: the run report (markdown + JSON) and the optional Parquet export.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    ArrayRef, BooleanArray, Int64Array, Int8Array, RecordBatch, StringArray, UInt32Array,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wikisync_core::{MergedDataset, Page, RunStats};
use wikisync_storage::{sha256_hex, write_bytes_atomic, write_json_atomic, RunError};

pub const RUN_REPORT_JSON: &str = "run_report.json";
pub const RUN_REPORT_MARKDOWN: &str = "run_report.md";
pub const PARQUET_MANIFEST: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: String,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Phase the run resumed from, when it picked up an earlier checkpoint.
    pub resumed_from: Option<String>,
    pub baseline: Option<String>,
    pub snapshot: SnapshotRef,
    pub parquet_manifest: Option<String>,
    pub stats: RunStats,
    pub errors: Vec<RunError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

pub fn render_markdown(report: &RunReport) -> String {
    let stats = &report.stats;
    let bullet = |label: &str, value: String| format!("- {label}: {value}");
    let mut lines = vec![
        "# Wiki Mirror Run Report".to_string(),
        String::new(),
        bullet("Run ID", format!("`{}`", report.run_id)),
        bullet("Mode", report.mode.clone()),
        bullet("Source", report.source.clone()),
        bullet("Started", report.started_at.to_rfc3339()),
        bullet("Finished", report.finished_at.to_rfc3339()),
        bullet(
            "Resumed from",
            report.resumed_from.clone().unwrap_or_else(|| "fresh start".into()),
        ),
        bullet(
            "Baseline",
            report
                .baseline
                .as_deref()
                .map(|b| format!("`{b}`"))
                .unwrap_or_else(|| "none".into()),
        ),
        bullet(
            "Snapshot",
            format!(
                "`{}` ({} bytes, sha256 `{}`)",
                report.snapshot.path, report.snapshot.bytes, report.snapshot.sha256
            ),
        ),
    ];
    if let Some(manifest) = &report.parquet_manifest {
        lines.push(bullet("Parquet manifest", format!("`{manifest}`")));
    }

    lines.extend([
        String::new(),
        "## Classification".to_string(),
        bullet("Scanned", stats.scanned.to_string()),
        bullet("New", stats.new_pages.to_string()),
        bullet("Voting changed", stats.voting_changed.to_string()),
        bullet("Content changed", stats.content_changed.to_string()),
        bullet("Revision changed", stats.revision_changed.to_string()),
        bullet("Attribution changed", stats.attribution_changed.to_string()),
        bullet("Unchanged", stats.unchanged.to_string()),
    ]);
    if stats.fast_stopped {
        lines.push("- Scan halted early (fast-stop)".to_string());
    }
    lines.push(String::new());
    lines.push("### Primary buckets".to_string());
    lines.extend(
        stats
            .primary_buckets
            .iter()
            .map(|(bucket, n)| format!("- {bucket}: {n}")),
    );

    lines.extend([
        String::new(),
        "## Detail fetches".to_string(),
        bullet("Planned", stats.planned_fetches.to_string()),
    ]);
    lines.extend(
        stats
            .planned_by_kind
            .iter()
            .map(|(kind, n)| format!("  - {kind}: {n}")),
    );
    lines.extend([
        bullet("Batches", stats.detail_batches.to_string()),
        bullet("Requeued batches", stats.requeued_batches.to_string()),
        bullet("Payloads", stats.payloads_fetched.to_string()),
        String::new(),
        "## Merge".to_string(),
        bullet("Pages added", stats.pages_added.to_string()),
        bullet("Pages updated", stats.pages_updated.to_string()),
        bullet("Pages carried over", stats.pages_carried_over.to_string()),
        bullet("Votes added", stats.votes_added.to_string()),
        bullet("Votes updated", stats.votes_updated.to_string()),
        bullet("Revisions added", stats.revisions_added.to_string()),
        bullet("Attribution lists replaced", stats.attributions_replaced.to_string()),
        String::new(),
        format!("## Errors ({})", stats.errors),
    ]);
    if report.errors.is_empty() {
        lines.push("- none".to_string());
    }
    lines.extend(report.errors.iter().map(|e| {
        format!(
            "- [{}] {} (attempt {}, {}): {}",
            e.kind,
            e.context,
            e.attempt,
            e.at.to_rfc3339(),
            e.message
        )
    }));
    lines.push(String::new());
    lines.join("\n")
}

/// Write `run_report.md` and `run_report.json` into `<reports_root>/<run_id>/`.
pub async fn write_run_report(reports_root: &Path, report: &RunReport) -> Result<PathBuf> {
    let dir = reports_root.join(report.run_id.to_string());
    write_bytes_atomic(&dir.join(RUN_REPORT_MARKDOWN), render_markdown(report).as_bytes())
        .await
        .context("writing run report markdown")?;
    write_json_atomic(&dir.join(RUN_REPORT_JSON), report)
        .await
        .context("writing run report json")?;
    Ok(dir)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_pages_parquet(path: &Path, dataset: &MergedDataset) -> Result<usize> {
    let pages = &dataset.pages;
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("category", DataType::Utf8, true),
        ArrowField::new("tags", DataType::Utf8, false),
        ArrowField::new("rating", DataType::Int64, true),
        ArrowField::new("vote_count", DataType::UInt32, true),
        ArrowField::new("revision_count", DataType::UInt32, true),
        ArrowField::new("created_by", DataType::Utf8, true),
        ArrowField::new("has_source", DataType::Boolean, false),
        ArrowField::new("last_seen_at", DataType::Utf8, false),
    ]));

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            pages.iter().map(|p| Some(p.url.as_str())).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            pages.iter().map(|p| p.title.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            pages.iter().map(|p| p.category.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            pages.iter().map(|p| Some(p.tags.join(" "))).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            pages.iter().map(|p| p.rating).collect::<Vec<_>>(),
        )),
        Arc::new(UInt32Array::from(
            pages.iter().map(|p| p.vote_count).collect::<Vec<_>>(),
        )),
        Arc::new(UInt32Array::from(
            pages.iter().map(|p| p.revision_count).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            pages.iter().map(|p| p.created_by.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(
            pages.iter().map(Page::has_source).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            pages
                .iter()
                .map(|p| Some(p.last_seen_at.to_rfc3339()))
                .collect::<Vec<_>>(),
        )),
    ];
    let batch = RecordBatch::try_new(schema, columns).context("building pages record batch")?;
    write_parquet(path, batch)?;
    Ok(pages.len())
}

fn write_votes_parquet(path: &Path, dataset: &MergedDataset) -> Result<usize> {
    let votes = &dataset.vote_records;
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("page_url", DataType::Utf8, false),
        ArrowField::new("voter_id", DataType::Utf8, true),
        ArrowField::new("direction", DataType::Int8, false),
        ArrowField::new("timestamp", DataType::Utf8, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                votes.iter().map(|v| Some(v.page_url.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                votes.iter().map(|v| v.voter_id.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(Int8Array::from(
                votes.iter().map(|v| v.direction).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                votes
                    .iter()
                    .map(|v| Some(v.timestamp.to_rfc3339()))
                    .collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building votes record batch")?;
    write_parquet(path, batch)?;
    Ok(votes.len())
}

fn manifest_entry(
    name: &str,
    root: &Path,
    path: &Path,
    rows: usize,
) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(root).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

/// Write `pages.parquet` and `votes.parquet` plus a digest manifest under `<run_dir>/parquet/`.
pub async fn export_parquet(
    run_dir: &Path,
    run_id: Uuid,
    dataset: &MergedDataset,
) -> Result<PathBuf> {
    let dir = run_dir.join("parquet");
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let pages_path = dir.join("pages.parquet");
    let votes_path = dir.join("votes.parquet");
    let page_rows = write_pages_parquet(&pages_path, dataset)?;
    let vote_rows = write_votes_parquet(&votes_path, dataset)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        run_id,
        files: vec![
            manifest_entry("pages", run_dir, &pages_path, page_rows)?,
            manifest_entry("votes", run_dir, &votes_path, vote_rows)?,
        ],
    };
    let manifest_path = dir.join(PARQUET_MANIFEST);
    write_json_atomic(&manifest_path, &manifest)
        .await
        .context("writing parquet manifest")?;
    Ok(manifest_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wikisync_core::{PageSummary, VoteRecord};
    use wikisync_storage::ErrorContext;

    fn report() -> RunReport {
        let mut stats = RunStats::default();
        stats.scanned = 3;
        stats.votes_added = 4;
        stats.primary_buckets.insert("voting_changed".into(), 1);
        stats.errors = 1;
        RunReport {
            run_id: Uuid::new_v4(),
            mode: "incremental".into(),
            source: "fixture".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            resumed_from: Some("detailed".into()),
            baseline: None,
            snapshot: SnapshotRef {
                path: "snapshots/snapshot_x.json".into(),
                sha256: "abc".into(),
                bytes: 10,
            },
            parquet_manifest: None,
            stats,
            errors: vec![RunError {
                kind: "transient".into(),
                message: "http status 503".into(),
                context: ErrorContext::new("fetch_detail").with_page("http://wiki/a"),
                attempt: 1,
                at: Utc::now(),
            }],
        }
    }

    #[test]
    fn markdown_lists_counts_and_errors() {
        let text = render_markdown(&report());
        assert!(text.contains("- Scanned: 3"));
        assert!(text.contains("- Votes added: 4"));
        assert!(text.contains("- voting_changed: 1"));
        assert!(text.contains("- Resumed from: detailed"));
        assert!(text.contains("[transient] fetch_detail page=http://wiki/a"));
    }

    #[tokio::test]
    async fn report_and_parquet_land_in_the_run_dir() {
        let dir = tempdir().expect("tempdir");
        let report = report();
        let run_dir = write_run_report(dir.path(), &report).await.expect("report");
        assert!(run_dir.join(RUN_REPORT_MARKDOWN).exists());
        let parsed: RunReport = serde_json::from_slice(
            &std::fs::read(run_dir.join(RUN_REPORT_JSON)).expect("read"),
        )
        .expect("parse");
        assert_eq!(parsed, report);

        let page = Page::from_summary(
            &PageSummary {
                url: "http://wiki/a".into(),
                rating: Some(3),
                ..Default::default()
            },
            Utc::now(),
        );
        let dataset = MergedDataset {
            pages: vec![page],
            vote_records: vec![VoteRecord {
                page_url: "http://wiki/a".into(),
                voter_id: None,
                direction: -1,
                timestamp: Utc::now(),
            }],
            ..Default::default()
        };
        let manifest_path = export_parquet(&run_dir, report.run_id, &dataset)
            .await
            .expect("parquet");
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest_path).expect("read")).expect("parse");
        let files = manifest["files"].as_array().expect("files");
        assert_eq!(files.len(), 2);
        assert_eq!(files[0]["path"], "parquet/pages.parquet");
        assert_eq!(files[1]["rows"], 1);
        assert_eq!(files[0]["sha256"].as_str().map(str::len), Some(64));
    }
}
