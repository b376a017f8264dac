//! Deterministic fixture-backed source for smoke runs and tests.
//!
//! Pages are served in fixture order; cursors are stringified offsets. Vote feeds and revision
//! histories are served newest first regardless of fixture order, matching the live API.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use wikisync_core::{
    AlternateTitle, Attribution, DetailNeed, PageSummary, RevisionRecord, User, VoteRecord,
};
use wikisync_storage::{ErrorClass, RemoteError};

use crate::{Connection, DetailResponse, FetchLimits, PageInfo, RemoteSource, SummaryPage};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FixturePage {
    pub summary: PageSummary,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub votes: Vec<VoteRecord>,
    #[serde(default)]
    pub revisions: Vec<RevisionRecord>,
    #[serde(default)]
    pub attributions: Vec<Attribution>,
    #[serde(default)]
    pub alternate_titles: Vec<AlternateTitle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FixtureWiki {
    pub pages: Vec<FixturePage>,
    #[serde(default)]
    pub users: Vec<User>,
}

pub fn load_fixture_wiki(path: impl AsRef<Path>) -> Result<FixtureWiki> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Make calls `after_calls..after_calls + failures` fail with the given class.
#[derive(Debug, Clone, Copy)]
pub struct FailurePlan {
    pub after_calls: usize,
    pub failures: usize,
    pub class: ErrorClass,
}

impl FailurePlan {
    pub fn forever_after(after_calls: usize, class: ErrorClass) -> Self {
        Self {
            after_calls,
            failures: usize::MAX,
            class,
        }
    }

    fn applies_to(&self, call_index: usize) -> bool {
        call_index >= self.after_calls && call_index - self.after_calls < self.failures
    }

    fn error(&self, operation: &str) -> RemoteError {
        let url = format!("fixture://{operation}");
        match self.class {
            ErrorClass::RateLimited => RemoteError::RateLimited { status: 429 },
            ErrorClass::Transient => RemoteError::HttpStatus { status: 503, url },
            ErrorClass::Fatal => RemoteError::Unauthorized { status: 401, url },
        }
    }
}

#[derive(Debug)]
pub struct FixtureSource {
    pages: Vec<FixturePage>,
    by_url: BTreeMap<String, usize>,
    users: BTreeMap<String, User>,
    detail_failures: Option<FailurePlan>,
    scan_failures: Option<FailurePlan>,
    scan_calls: AtomicUsize,
    detail_calls: AtomicUsize,
    vote_calls: AtomicUsize,
    revision_calls: AtomicUsize,
}

fn parse_offset(cursor: Option<&str>) -> Result<usize, RemoteError> {
    match cursor {
        None => Ok(0),
        Some(c) => c
            .parse()
            .map_err(|_| RemoteError::Graphql(format!("invalid cursor {c:?}"))),
    }
}

fn slice_page<T: Clone>(
    items: &[T],
    after: Option<&str>,
    first: usize,
) -> Result<Connection<T>, RemoteError> {
    let start = parse_offset(after)?.min(items.len());
    let end = start.saturating_add(first.max(1)).min(items.len());
    Ok(Connection {
        items: items[start..end].to_vec(),
        page_info: PageInfo {
            has_next_page: end < items.len(),
            end_cursor: (end > start).then(|| end.to_string()),
        },
    })
}

impl FixtureSource {
    pub fn new(wiki: FixtureWiki) -> Self {
        let mut pages = wiki.pages;
        for page in &mut pages {
            page.votes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            page.revisions.sort_by(|a, b| {
                (b.timestamp, b.revision_number).cmp(&(a.timestamp, a.revision_number))
            });
        }
        let by_url = pages
            .iter()
            .enumerate()
            .map(|(i, p)| (p.summary.url.clone(), i))
            .collect();
        let users = wiki.users.into_iter().map(|u| (u.id.clone(), u)).collect();
        Self {
            pages,
            by_url,
            users,
            detail_failures: None,
            scan_failures: None,
            scan_calls: AtomicUsize::new(0),
            detail_calls: AtomicUsize::new(0),
            vote_calls: AtomicUsize::new(0),
            revision_calls: AtomicUsize::new(0),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_wiki(path)?))
    }

    pub fn with_detail_failures(mut self, plan: FailurePlan) -> Self {
        self.detail_failures = Some(plan);
        self
    }

    pub fn with_scan_failures(mut self, plan: FailurePlan) -> Self {
        self.scan_failures = Some(plan);
        self
    }

    pub fn scan_calls(&self) -> usize {
        self.scan_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }

    pub fn vote_calls(&self) -> usize {
        self.vote_calls.load(Ordering::SeqCst)
    }

    pub fn revision_calls(&self) -> usize {
        self.revision_calls.load(Ordering::SeqCst)
    }

    fn page(&self, url: &str) -> Option<&FixturePage> {
        self.by_url.get(url).map(|i| &self.pages[*i])
    }

    fn users_for(&self, page: &FixturePage, need: &DetailNeed) -> Vec<User> {
        let mut ids = Vec::new();
        if need.needs_voting {
            ids.extend(page.votes.iter().filter_map(|v| v.voter_id.clone()));
        }
        if need.needs_revisions {
            ids.extend(page.revisions.iter().filter_map(|r| r.user_id.clone()));
        }
        if need.needs_attributions {
            ids.extend(page.attributions.iter().filter_map(|a| a.user_id.clone()));
        }
        ids.sort();
        ids.dedup();
        ids.into_iter()
            .map(|id| {
                self.users.get(&id).cloned().unwrap_or(User { id, name: None })
            })
            .collect()
    }
}

#[async_trait]
impl RemoteSource for FixtureSource {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn scan_page(
        &self,
        after: Option<&str>,
        first: usize,
    ) -> Result<SummaryPage, RemoteError> {
        let call_index = self.scan_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(plan) = self.scan_failures.filter(|p| p.applies_to(call_index)) {
            return Err(plan.error("scan"));
        }
        let summaries = self
            .pages
            .iter()
            .map(|p| p.summary.clone())
            .collect::<Vec<_>>();
        slice_page(&summaries, after, first)
    }

    async fn fetch_detail(
        &self,
        url: &str,
        need: &DetailNeed,
        limits: FetchLimits,
    ) -> Result<DetailResponse, RemoteError> {
        let call_index = self.detail_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(plan) = self.detail_failures.filter(|p| p.applies_to(call_index)) {
            return Err(plan.error("detail"));
        }

        let Some(page) = self.page(url) else {
            return Ok(DetailResponse::default());
        };
        Ok(DetailResponse {
            source: if need.needs_source {
                page.source.clone()
            } else {
                None
            },
            votes: if need.needs_voting {
                Some(slice_page(&page.votes, None, limits.vote_page_size)?)
            } else {
                None
            },
            revisions: if need.needs_revisions {
                Some(slice_page(&page.revisions, None, limits.revision_page_size)?)
            } else {
                None
            },
            attributions: need.needs_attributions.then(|| page.attributions.clone()),
            alternate_titles: need
                .needs_alternate_titles
                .then(|| page.alternate_titles.clone()),
            users: self.users_for(page, need),
        })
    }

    async fn fetch_votes(
        &self,
        url: &str,
        after: Option<&str>,
        first: usize,
    ) -> Result<Connection<VoteRecord>, RemoteError> {
        self.vote_calls.fetch_add(1, Ordering::SeqCst);
        match self.page(url) {
            Some(page) => slice_page(&page.votes, after, first),
            None => Ok(Connection::empty()),
        }
    }

    async fn fetch_revisions(
        &self,
        url: &str,
        after: Option<&str>,
        first: usize,
    ) -> Result<Connection<RevisionRecord>, RemoteError> {
        self.revision_calls.fetch_add(1, Ordering::SeqCst);
        match self.page(url) {
            Some(page) => slice_page(&page.revisions, after, first),
            None => Ok(Connection::empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn vote(url: &str, voter: &str, day: u32) -> VoteRecord {
        VoteRecord {
            page_url: url.to_string(),
            voter_id: Some(voter.to_string()),
            direction: 1,
            timestamp: Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0).single().expect("ts"),
        }
    }

    fn wiki() -> FixtureWiki {
        let pages = (1..=5)
            .map(|i| {
                let url = format!("http://wiki/page-{i}");
                FixturePage {
                    summary: PageSummary {
                        url: url.clone(),
                        title: Some(format!("Page {i}")),
                        ..Default::default()
                    },
                    source: Some(format!("source {i}")),
                    votes: vec![vote(&url, "u1", 1), vote(&url, "u2", 3), vote(&url, "u3", 2)],
                    ..Default::default()
                }
            })
            .collect();
        FixtureWiki {
            pages,
            users: vec![User {
                id: "u1".into(),
                name: Some("alice".into()),
            }],
        }
    }

    #[tokio::test]
    async fn scan_paginates_with_offset_cursors() {
        let source = FixtureSource::new(wiki());
        let first = source.scan_page(None, 2).await.expect("page 1");
        assert_eq!(first.items.len(), 2);
        assert!(first.page_info.has_next_page);
        let cursor = first.page_info.end_cursor.expect("cursor");

        let second = source.scan_page(Some(&cursor), 10).await.expect("page 2");
        assert_eq!(second.items.len(), 3);
        assert!(!second.page_info.has_next_page);
        assert_eq!(second.items[0].url, "http://wiki/page-3");
        assert_eq!(source.scan_calls(), 2);
    }

    #[tokio::test]
    async fn votes_are_served_newest_first() {
        let source = FixtureSource::new(wiki());
        let need = DetailNeed::for_tag(wikisync_core::ChangeTag::VotingChanged);
        let detail = source
            .fetch_detail(
                "http://wiki/page-1",
                &need,
                FetchLimits {
                    vote_page_size: 2,
                    revision_page_size: 10,
                },
            )
            .await
            .expect("detail");
        assert!(detail.source.is_none());
        let votes = detail.votes.expect("votes");
        let voters = votes
            .items
            .iter()
            .map(|v| v.voter_id.clone().unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(voters, vec!["u2", "u3"]);
        assert!(votes.page_info.has_next_page);
        assert_eq!(detail.users.len(), 3);
        assert_eq!(detail.users[0].name.as_deref(), Some("alice"));

        let rest = source
            .fetch_votes("http://wiki/page-1", votes.page_info.end_cursor.as_deref(), 2)
            .await
            .expect("continuation");
        assert_eq!(rest.items.len(), 1);
        assert_eq!(rest.items[0].voter_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn revisions_page_newest_first() {
        let mut wiki = wiki();
        let url = "http://wiki/page-1";
        wiki.pages[0].revisions = (0..5)
            .map(|n| RevisionRecord {
                page_url: url.to_string(),
                revision_id: format!("r{n}"),
                revision_number: Some(n),
                timestamp: Utc.with_ymd_and_hms(2026, 1, n + 1, 0, 0, 0).single(),
                user_id: None,
                comment: None,
            })
            .collect();
        let source = FixtureSource::new(wiki);
        let need = DetailNeed::for_tag(wikisync_core::ChangeTag::RevisionChanged);
        let limits = FetchLimits {
            vote_page_size: 10,
            revision_page_size: 2,
        };
        let first = source
            .fetch_detail(url, &need, limits)
            .await
            .expect("detail")
            .revisions
            .expect("revisions");
        let ids = first.items.iter().map(|r| r.revision_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["r4", "r3"]);
        assert!(first.page_info.has_next_page);

        let rest = source
            .fetch_revisions(url, first.page_info.end_cursor.as_deref(), 10)
            .await
            .expect("continuation");
        assert_eq!(rest.items.len(), 3);
        assert_eq!(rest.items[2].revision_id, "r0");
        assert_eq!(source.revision_calls(), 1);
    }

    #[tokio::test]
    async fn scan_failures_hit_only_the_listing() {
        let source = FixtureSource::new(wiki())
            .with_scan_failures(FailurePlan::forever_after(1, ErrorClass::Fatal));
        assert!(source.scan_page(None, 2).await.is_ok());
        let err = source.scan_page(Some("2"), 2).await.expect_err("second scan fails");
        assert_eq!(err.class(), ErrorClass::Fatal);
        let need = DetailNeed::all("new");
        assert!(source
            .fetch_detail("http://wiki/page-1", &need, FetchLimits::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn failure_plan_targets_a_call_window() {
        let source = FixtureSource::new(wiki()).with_detail_failures(FailurePlan {
            after_calls: 1,
            failures: 1,
            class: ErrorClass::Transient,
        });
        let need = DetailNeed::all("new");
        let limits = FetchLimits::default();
        assert!(source.fetch_detail("http://wiki/page-1", &need, limits).await.is_ok());
        let err = source
            .fetch_detail("http://wiki/page-2", &need, limits)
            .await
            .expect_err("second call fails");
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(source.fetch_detail("http://wiki/page-2", &need, limits).await.is_ok());
    }

    #[test]
    fn fixture_files_load_from_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("wiki.json");
        fs::write(&path, serde_json::to_vec(&wiki()).expect("serialize")).expect("write");
        let source = FixtureSource::from_path(&path).expect("load");
        assert_eq!(source.pages.len(), 5);
        assert_eq!(source.by_url["http://wiki/page-4"], 3);
    }
}
