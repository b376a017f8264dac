//! Remote content source contracts plus the GraphQL and fixture-backed implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use wikisync_core::{
    AlternateTitle, Attribution, DetailNeed, PageSummary, RevisionRecord, User, VoteRecord,
};
use wikisync_storage::RemoteError;

pub mod fixture;
pub mod graphql;
pub mod query;

pub use fixture::{load_fixture_wiki, FailurePlan, FixturePage, FixtureSource, FixtureWiki};
pub use graphql::GraphqlSource;

pub const CRATE_NAME: &str = "wikisync-remote";

/// Cursor pagination result (`hasNextPage` / `endCursor`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection<T> {
    pub items: Vec<T>,
    pub page_info: PageInfo,
}

impl<T> Connection<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            page_info: PageInfo::default(),
        }
    }
}

pub type SummaryPage = Connection<PageSummary>;

/// Size limits applied to the sub-resource selections of a detail query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    pub vote_page_size: usize,
    pub revision_page_size: usize,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            vote_page_size: 100,
            revision_page_size: 100,
        }
    }
}

/// Raw detail response; only the sub-resources that were requested are `Some`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DetailResponse {
    pub source: Option<String>,
    /// First page of the vote feed, newest first.
    pub votes: Option<Connection<VoteRecord>>,
    /// First page of the revision history, newest first.
    pub revisions: Option<Connection<RevisionRecord>>,
    pub attributions: Option<Vec<Attribution>>,
    pub alternate_titles: Option<Vec<AlternateTitle>>,
    pub users: Vec<User>,
}

#[async_trait]
pub trait RemoteSource: Send + Sync {
    fn name(&self) -> &str;

    /// One page of lightweight summaries, starting after `after`.
    async fn scan_page(&self, after: Option<&str>, first: usize)
        -> Result<SummaryPage, RemoteError>;

    /// One selective query returning only the sub-resources flagged in `need`.
    async fn fetch_detail(
        &self,
        url: &str,
        need: &DetailNeed,
        limits: FetchLimits,
    ) -> Result<DetailResponse, RemoteError>;

    /// Continuation page of a page's newest-first vote feed.
    async fn fetch_votes(
        &self,
        url: &str,
        after: Option<&str>,
        first: usize,
    ) -> Result<Connection<VoteRecord>, RemoteError>;

    /// Continuation page of a page's newest-first revision history.
    async fn fetch_revisions(
        &self,
        url: &str,
        after: Option<&str>,
        first: usize,
    ) -> Result<Connection<RevisionRecord>, RemoteError>;
}
