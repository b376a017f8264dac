//! Incremental sync engine: scan, classify, plan, fetch, merge and save a wiki mirror.

pub mod classify;
pub mod config;
pub mod fetch;
pub mod index;
pub mod merge;
pub mod pipeline;
pub mod plan;
pub mod report;
pub mod scan;
pub mod writer;

pub use classify::{classify, Classifier};
pub use config::{SyncConfig, SyncMode};
pub use fetch::DetailFetcher;
pub use index::DatasetIndex;
pub use merge::MergeContext;
pub use pipeline::{SyncPipeline, SyncRunSummary};
pub use plan::{Planner, PlannerConfig};
pub use report::{checkpoint_status, report_recent_runs};
pub use scan::SummaryPager;
pub use writer::{export_parquet, render_markdown, write_run_report, RunReport};

pub const CRATE_NAME: &str = "wikisync-sync";
