//! Detail fetching: one selective query per planned page, run concurrently per batch.

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info_span, Instrument};
use wikisync_core::{DetailPayload, PlannedFetch, RevisionRecord, VoteRecord};
use wikisync_remote::{Connection, FetchLimits, RemoteSource};
use wikisync_storage::{ErrorContext, ExecutorError, RetryExecutor};

use crate::index::DatasetIndex;

pub struct DetailFetcher<'a> {
    source: &'a dyn RemoteSource,
    executor: &'a RetryExecutor,
    index: &'a DatasetIndex,
    limits: FetchLimits,
}

impl<'a> DetailFetcher<'a> {
    pub fn new(
        source: &'a dyn RemoteSource,
        executor: &'a RetryExecutor,
        index: &'a DatasetIndex,
        limits: FetchLimits,
    ) -> Self {
        Self {
            source,
            executor,
            index,
            limits,
        }
    }

    /// Fetch every entry of `batch` concurrently. Any failure fails the whole batch; a fatal
    /// failure is reported in preference to an exhausted one.
    pub async fn fetch_batch(
        &self,
        batch: &[PlannedFetch],
    ) -> Result<Vec<DetailPayload>, ExecutorError> {
        let results = join_all(batch.iter().map(|planned| self.fetch_one(planned))).await;

        let mut payloads = Vec::with_capacity(results.len());
        let mut failure: Option<ExecutorError> = None;
        for result in results {
            match result {
                Ok(payload) => payloads.push(payload),
                Err(err) => {
                    let replace = match &failure {
                        None => true,
                        Some(current) => err.is_fatal() && !current.is_fatal(),
                    };
                    if replace {
                        failure = Some(err);
                    }
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(payloads),
        }
    }

    pub async fn fetch_one(&self, planned: &PlannedFetch) -> Result<DetailPayload, ExecutorError> {
        let url = planned.url.as_str();
        let need = &planned.need;
        let source = self.source;
        let limits = self.limits;
        let span = info_span!("fetch_detail", page_url = %url, reason = %need.reason);

        async move {
            let context = ErrorContext::new("fetch_detail").with_page(url);
            let response = self
                .executor
                .execute(&context, move || source.fetch_detail(url, need, limits))
                .await?;

            let votes = match response.votes {
                Some(first_page) => Some(self.collect_new_votes(url, first_page).await?),
                None => None,
            };
            let revisions = match response.revisions {
                Some(first_page) => Some(self.collect_new_revisions(url, first_page).await?),
                None => None,
            };
            Ok(DetailPayload {
                url: url.to_string(),
                fetched_at: Utc::now(),
                source: response.source,
                votes,
                revisions,
                attributions: response.attributions,
                alternate_titles: response.alternate_titles,
                users: response.users,
            })
        }
        .instrument(span)
        .await
    }

    /// Walk the newest-first vote feed until the first already-stored (voter, timestamp) key.
    ///
    /// Everything before the halt is new. The halting vote itself is returned only when its
    /// direction differs from the stored one, so the merge can update it in place.
    async fn collect_new_votes(
        &self,
        url: &str,
        first_page: Connection<VoteRecord>,
    ) -> Result<Vec<VoteRecord>, ExecutorError> {
        let source = self.source;
        let page_size = self.limits.vote_page_size;
        let mut fresh = Vec::new();
        let mut page = first_page;
        let mut pages = 1usize;

        loop {
            let mut halted = false;
            for mut vote in page.items {
                if vote.page_url.is_empty() {
                    vote.page_url = url.to_string();
                }
                match self.index.known_vote(&vote.key()) {
                    Some(direction) => {
                        if direction != vote.direction {
                            fresh.push(vote);
                        }
                        halted = true;
                        break;
                    }
                    None => fresh.push(vote),
                }
            }
            if halted || !page.page_info.has_next_page {
                break;
            }
            let Some(cursor) = page.page_info.end_cursor else {
                break;
            };

            let context = ErrorContext::new("fetch_votes")
                .with_page(url)
                .with_cursor(Some(&cursor));
            let after = cursor.as_str();
            page = self
                .executor
                .execute(&context, move || source.fetch_votes(url, Some(after), page_size))
                .await?;
            pages += 1;
        }

        debug!(page_url = %url, new_votes = fresh.len(), pages, "vote feed walked");
        Ok(fresh)
    }

    /// Walk the newest-first revision history, keeping revisions the baseline lacks.
    ///
    /// When the stored history is complete the walk stops at the first known revision id.
    /// A partial history is walked to the end so older gaps fill in as well.
    async fn collect_new_revisions(
        &self,
        url: &str,
        first_page: Connection<RevisionRecord>,
    ) -> Result<Vec<RevisionRecord>, ExecutorError> {
        let source = self.source;
        let page_size = self.limits.revision_page_size;
        let stop_at_known = self.index.revision_history_complete(url);
        let mut fresh = Vec::new();
        let mut page = first_page;
        let mut pages = 1usize;

        loop {
            let mut halted = false;
            for mut revision in page.items {
                if revision.page_url.is_empty() {
                    revision.page_url = url.to_string();
                }
                if !self.index.known_revision(url, &revision.revision_id) {
                    fresh.push(revision);
                } else if stop_at_known {
                    halted = true;
                    break;
                }
            }
            if halted || !page.page_info.has_next_page {
                break;
            }
            let Some(cursor) = page.page_info.end_cursor else {
                break;
            };

            let context = ErrorContext::new("fetch_revisions")
                .with_page(url)
                .with_cursor(Some(&cursor));
            let after = cursor.as_str();
            page = self
                .executor
                .execute(&context, move || source.fetch_revisions(url, Some(after), page_size))
                .await?;
            pages += 1;
        }

        debug!(page_url = %url, new_revisions = fresh.len(), pages, "revision history walked");
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use wikisync_core::{ChangeTag, DetailNeed, MergedDataset, Page, PageSummary};
    use wikisync_remote::{FailurePlan, FixturePage, FixtureSource, FixtureWiki};
    use wikisync_storage::{ErrorClass, RetryPolicy, RunErrorLog};

    const URL: &str = "http://wiki/scp-173";

    fn votes(n: usize) -> Vec<VoteRecord> {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("ts");
        (0..n)
            .map(|i| VoteRecord {
                page_url: URL.to_string(),
                voter_id: Some(format!("voter-{i}")),
                direction: 1,
                timestamp: base + Duration::hours(i as i64),
            })
            .collect()
    }

    fn source(all_votes: Vec<VoteRecord>) -> FixtureSource {
        FixtureSource::new(FixtureWiki {
            pages: vec![FixturePage {
                summary: PageSummary {
                    url: URL.to_string(),
                    ..Default::default()
                },
                source: Some("text".into()),
                votes: all_votes,
                ..Default::default()
            }],
            users: Vec::new(),
        })
    }

    fn index_with(stored_votes: Vec<VoteRecord>) -> DatasetIndex {
        let page = Page::from_summary(
            &PageSummary {
                url: URL.to_string(),
                ..Default::default()
            },
            Utc::now(),
        );
        DatasetIndex::build(&MergedDataset {
            pages: vec![page],
            vote_records: stored_votes,
            ..Default::default()
        })
    }

    fn executor() -> RetryExecutor {
        RetryExecutor::new(
            RetryPolicy {
                max_attempts: 2,
                network_delay: std::time::Duration::from_millis(1),
                rate_limit_delay: std::time::Duration::from_millis(1),
            },
            RunErrorLog::new(),
        )
    }

    fn voting_fetch() -> PlannedFetch {
        PlannedFetch {
            url: URL.to_string(),
            need: DetailNeed::for_tag(wikisync_core::ChangeTag::VotingChanged),
        }
    }

    #[tokio::test]
    async fn vote_walk_halts_at_first_known_vote() {
        let all = votes(14);
        let remote = source(all.clone());
        let index = index_with(all[..10].to_vec());
        let executor = executor();
        let fetcher = DetailFetcher::new(
            &remote,
            &executor,
            &index,
            FetchLimits {
                vote_page_size: 3,
                revision_page_size: 10,
            },
        );

        let payload = fetcher.fetch_one(&voting_fetch()).await.expect("payload");
        let fresh = payload.votes.expect("votes requested");
        assert_eq!(fresh.len(), 4);
        assert_eq!(fresh[0].voter_id.as_deref(), Some("voter-13"));
        assert!(payload.source.is_none());
        // one continuation page, which contains the first known vote
        assert_eq!(remote.vote_calls(), 1);
    }

    #[tokio::test]
    async fn flipped_vote_is_returned_at_the_halt() {
        let all = votes(3);
        let mut stored = all.clone();
        stored[2].direction = -1;
        let remote = source(all);
        let index = index_with(stored);
        let executor = executor();
        let fetcher = DetailFetcher::new(&remote, &executor, &index, FetchLimits::default());

        let fresh = fetcher
            .fetch_one(&voting_fetch())
            .await
            .expect("payload")
            .votes
            .expect("votes");
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].direction, 1);
        assert_eq!(fresh[0].voter_id.as_deref(), Some("voter-2"));
    }

    fn revisions(n: u32) -> Vec<RevisionRecord> {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("ts");
        (0..n)
            .map(|i| RevisionRecord {
                page_url: URL.to_string(),
                revision_id: format!("rev-{i}"),
                revision_number: Some(i),
                timestamp: Some(base + Duration::hours(i64::from(i))),
                user_id: None,
                comment: None,
            })
            .collect()
    }

    /// Remote holds `all`; the baseline holds `stored` for a page last scanned with
    /// `scanned_count` revisions.
    fn revision_setup(
        all: Vec<RevisionRecord>,
        stored: Vec<RevisionRecord>,
        scanned_count: u32,
    ) -> (FixtureSource, DatasetIndex) {
        let summary = PageSummary {
            url: URL.to_string(),
            revision_count: Some(scanned_count),
            ..Default::default()
        };
        let page = Page::from_summary(&summary, Utc::now());
        let remote = FixtureSource::new(FixtureWiki {
            pages: vec![FixturePage {
                summary,
                revisions: all,
                ..Default::default()
            }],
            users: Vec::new(),
        });
        let index = DatasetIndex::build(&MergedDataset {
            pages: vec![page],
            revisions: stored,
            ..Default::default()
        });
        (remote, index)
    }

    fn revision_fetch() -> PlannedFetch {
        PlannedFetch {
            url: URL.to_string(),
            need: DetailNeed::for_tag(ChangeTag::RevisionChanged),
        }
    }

    const SMALL_PAGES: FetchLimits = FetchLimits {
        vote_page_size: 3,
        revision_page_size: 2,
    };

    #[tokio::test]
    async fn revision_history_is_paged_to_the_end() {
        let (remote, index) = revision_setup(revisions(7), Vec::new(), 0);
        let executor = executor();
        let fetcher = DetailFetcher::new(&remote, &executor, &index, SMALL_PAGES);

        let fresh = fetcher
            .fetch_one(&revision_fetch())
            .await
            .expect("payload")
            .revisions
            .expect("revisions requested");
        assert_eq!(fresh.len(), 7);
        assert_eq!(fresh[0].revision_id, "rev-6");
        assert_eq!(fresh[6].revision_id, "rev-0");
        assert_eq!(remote.revision_calls(), 3);
    }

    #[tokio::test]
    async fn complete_history_halts_at_first_known_revision() {
        let all = revisions(7);
        let (remote, index) = revision_setup(all.clone(), all[..4].to_vec(), 4);
        let executor = executor();
        let fetcher = DetailFetcher::new(&remote, &executor, &index, SMALL_PAGES);

        let fresh = fetcher
            .fetch_one(&revision_fetch())
            .await
            .expect("payload")
            .revisions
            .expect("revisions");
        let ids = fresh.iter().map(|r| r.revision_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["rev-6", "rev-5", "rev-4"]);
        // rev-3 sits on the second page and stops the walk
        assert_eq!(remote.revision_calls(), 1);
    }

    #[tokio::test]
    async fn partial_history_fills_older_gaps() {
        let all = revisions(6);
        // the page was scanned with six revisions but only the newest two were stored
        let (remote, index) = revision_setup(all.clone(), all[4..].to_vec(), 6);
        let executor = executor();
        let fetcher = DetailFetcher::new(&remote, &executor, &index, SMALL_PAGES);

        let fresh = fetcher
            .fetch_one(&revision_fetch())
            .await
            .expect("payload")
            .revisions
            .expect("revisions");
        let ids = fresh.iter().map(|r| r.revision_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["rev-3", "rev-2", "rev-1", "rev-0"]);
        assert_eq!(remote.revision_calls(), 2);
    }

    #[tokio::test]
    async fn one_failure_fails_the_batch() {
        let remote =
            source(votes(2)).with_detail_failures(FailurePlan::forever_after(1, ErrorClass::Fatal));
        let index = index_with(Vec::new());
        let executor = executor();
        let fetcher = DetailFetcher::new(&remote, &executor, &index, FetchLimits::default());
        let batch = vec![voting_fetch(), voting_fetch()];

        let err = fetcher.fetch_batch(&batch).await.expect_err("batch fails");
        assert!(err.is_fatal());
        assert_eq!(executor.errors().len(), 1);
    }
}
