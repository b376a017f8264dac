//! Run configuration: defaults, an optional YAML file, then `WIKISYNC_*` environment overrides.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use wikisync_remote::FetchLimits;
use wikisync_storage::{GraphqlClientConfig, RateBudgetConfig, RetryPolicy};

use crate::plan::PlannerConfig;

pub const DEFAULT_CONFIG_FILE: &str = "wikisync.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Incremental,
    /// Ignore the baseline snapshot and re-mirror everything.
    Full,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Incremental => "incremental",
            SyncMode::Full => "full",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incremental" => Ok(SyncMode::Incremental),
            "full" => Ok(SyncMode::Full),
            other => bail!("unknown sync mode {other:?} (expected incremental or full)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub api_url: String,
    pub api_token: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Serve the remote side from a JSON fixture wiki instead of the live API.
    pub fixture_path: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub checkpoint_path: PathBuf,
    pub mode: SyncMode,
    pub fast_stop: bool,
    pub export_parquet: bool,

    pub scan_page_size: usize,
    pub checkpoint_every_batches: u64,
    pub detail_batch_width: usize,
    pub max_attempts: usize,
    pub network_retry_delay_ms: u64,
    pub rate_limit_delay_ms: u64,
    pub batch_cooldown_ms: u64,
    pub max_batch_retries: u32,
    pub rate_budget_requests: u32,
    pub rate_budget_window_secs: u64,
    pub vote_page_size: usize,
    pub revision_page_size: usize,

    pub vote_gap_threshold: u32,
    pub large_page_votes: u32,
    pub stale_after_days: i64,
    pub zero_to_large_votes: u32,
    pub revision_gap_threshold: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:4000/graphql".to_string(),
            api_token: None,
            user_agent: "wikisync-bot/0.1".to_string(),
            http_timeout_secs: 30,
            fixture_path: None,
            data_dir: PathBuf::from("./data"),
            checkpoint_path: PathBuf::from("./data/checkpoint.json"),
            mode: SyncMode::Incremental,
            fast_stop: false,
            export_parquet: false,
            scan_page_size: 100,
            checkpoint_every_batches: 5,
            detail_batch_width: 8,
            max_attempts: 3,
            network_retry_delay_ms: 2_000,
            rate_limit_delay_ms: 30_000,
            batch_cooldown_ms: 5_000,
            max_batch_retries: 3,
            rate_budget_requests: 300,
            rate_budget_window_secs: 60,
            vote_page_size: 100,
            revision_page_size: 100,
            vote_gap_threshold: 5,
            large_page_votes: 100,
            stale_after_days: 30,
            zero_to_large_votes: 10,
            revision_gap_threshold: 2,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid {name}={raw:?}: {err}"))
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl SyncConfig {
    /// YAML from `WIKISYNC_CONFIG` (or `./wikisync.yaml` when present), then environment overrides.
    pub fn from_env() -> Result<Self> {
        let explicit = std::env::var("WIKISYNC_CONFIG").ok().map(PathBuf::from);
        let base = match explicit {
            Some(path) => Self::from_yaml_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_yaml_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        base.with_overrides(|name| std::env::var(name).ok())
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Apply `WIKISYNC_*` variables resolved through `lookup` on top of `self`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        macro_rules! parsed {
            ($target:expr, $var:literal) => {
                if let Some(raw) = lookup($var) {
                    $target = parse_var($var, &raw)?;
                }
            };
        }

        if let Some(raw) = lookup("WIKISYNC_API_URL") {
            self.api_url = raw;
        }
        if let Some(raw) = lookup("WIKISYNC_API_TOKEN") {
            self.api_token = Some(raw).filter(|t| !t.trim().is_empty());
        }
        if let Some(raw) = lookup("WIKISYNC_USER_AGENT") {
            self.user_agent = raw;
        }
        if let Some(raw) = lookup("WIKISYNC_FIXTURE") {
            self.fixture_path = Some(PathBuf::from(raw)).filter(|p| !p.as_os_str().is_empty());
        }
        if let Some(raw) = lookup("WIKISYNC_DATA_DIR") {
            self.data_dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("WIKISYNC_CHECKPOINT_PATH") {
            self.checkpoint_path = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("WIKISYNC_FAST_STOP") {
            self.fast_stop = parse_flag(&raw);
        }
        if let Some(raw) = lookup("WIKISYNC_EXPORT_PARQUET") {
            self.export_parquet = parse_flag(&raw);
        }
        parsed!(self.mode, "WIKISYNC_MODE");
        parsed!(self.http_timeout_secs, "WIKISYNC_HTTP_TIMEOUT_SECS");
        parsed!(self.scan_page_size, "WIKISYNC_SCAN_PAGE_SIZE");
        parsed!(self.checkpoint_every_batches, "WIKISYNC_CHECKPOINT_EVERY_BATCHES");
        parsed!(self.detail_batch_width, "WIKISYNC_DETAIL_BATCH_WIDTH");
        parsed!(self.max_attempts, "WIKISYNC_MAX_ATTEMPTS");
        parsed!(self.network_retry_delay_ms, "WIKISYNC_NETWORK_RETRY_DELAY_MS");
        parsed!(self.rate_limit_delay_ms, "WIKISYNC_RATE_LIMIT_DELAY_MS");
        parsed!(self.batch_cooldown_ms, "WIKISYNC_BATCH_COOLDOWN_MS");
        parsed!(self.max_batch_retries, "WIKISYNC_MAX_BATCH_RETRIES");
        parsed!(self.rate_budget_requests, "WIKISYNC_RATE_BUDGET_REQUESTS");
        parsed!(self.rate_budget_window_secs, "WIKISYNC_RATE_BUDGET_WINDOW_SECS");
        parsed!(self.vote_page_size, "WIKISYNC_VOTE_PAGE_SIZE");
        parsed!(self.revision_page_size, "WIKISYNC_REVISION_PAGE_SIZE");
        parsed!(self.vote_gap_threshold, "WIKISYNC_VOTE_GAP_THRESHOLD");
        parsed!(self.large_page_votes, "WIKISYNC_LARGE_PAGE_VOTES");
        parsed!(self.stale_after_days, "WIKISYNC_STALE_AFTER_DAYS");
        parsed!(self.zero_to_large_votes, "WIKISYNC_ZERO_TO_LARGE_VOTES");
        parsed!(self.revision_gap_threshold, "WIKISYNC_REVISION_GAP_THRESHOLD");
        Ok(self)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            network_delay: Duration::from_millis(self.network_retry_delay_ms),
            rate_limit_delay: Duration::from_millis(self.rate_limit_delay_ms),
        }
    }

    pub fn batch_cooldown(&self) -> Duration {
        Duration::from_millis(self.batch_cooldown_ms)
    }

    pub fn fetch_limits(&self) -> FetchLimits {
        FetchLimits {
            vote_page_size: self.vote_page_size.max(1),
            revision_page_size: self.revision_page_size.max(1),
        }
    }

    pub fn planner(&self) -> PlannerConfig {
        PlannerConfig {
            vote_gap_threshold: self.vote_gap_threshold,
            large_page_votes: self.large_page_votes,
            stale_after: chrono::Duration::days(self.stale_after_days.max(0)),
            zero_to_large_votes: self.zero_to_large_votes,
            revision_gap_threshold: self.revision_gap_threshold,
        }
    }

    pub fn graphql_client(&self) -> GraphqlClientConfig {
        GraphqlClientConfig {
            endpoint: self.api_url.clone(),
            api_token: self.api_token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.detail_batch_width.max(1),
            rate_budget: (self.rate_budget_requests > 0).then(|| RateBudgetConfig {
                max_requests: self.rate_budget_requests,
                window: Duration::from_secs(self.rate_budget_window_secs.max(1)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn env_overrides_win_over_yaml() {
        let yaml = "mode: full\nscan_page_size: 25\ndata_dir: /srv/wiki\n";
        let config = SyncConfig::from_yaml_str(yaml)
            .expect("yaml")
            .with_overrides(lookup(&[
                ("WIKISYNC_SCAN_PAGE_SIZE", "50"),
                ("WIKISYNC_FAST_STOP", "true"),
            ]))
            .expect("overrides");
        assert_eq!(config.mode, SyncMode::Full);
        assert_eq!(config.scan_page_size, 50);
        assert!(config.fast_stop);
        assert_eq!(config.snapshot_dir(), PathBuf::from("/srv/wiki/snapshots"));
        assert_eq!(config.detail_batch_width, SyncConfig::default().detail_batch_width);
    }

    #[test]
    fn bad_numbers_name_the_variable() {
        let err = SyncConfig::default()
            .with_overrides(lookup(&[("WIKISYNC_MAX_ATTEMPTS", "lots")]))
            .expect_err("not a number");
        assert!(err.to_string().contains("WIKISYNC_MAX_ATTEMPTS"));
    }

    #[test]
    fn derived_settings_follow_the_knobs() {
        let config = SyncConfig {
            rate_budget_requests: 0,
            network_retry_delay_ms: 10,
            rate_limit_delay_ms: 40,
            ..SyncConfig::default()
        };
        assert!(config.graphql_client().rate_budget.is_none());
        let policy = config.retry_policy();
        assert!(policy.rate_limit_delay > policy.network_delay);
        assert_eq!("FULL".parse::<SyncMode>().expect("mode"), SyncMode::Full);
        assert!("partial".parse::<SyncMode>().is_err());
    }
}
