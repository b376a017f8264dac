//! Pull-based, resumable pagination over the remote summary listing.

use tracing::{debug, warn};
use wikisync_core::PageSummary;
use wikisync_remote::RemoteSource;
use wikisync_storage::{ErrorContext, ExecutorError, RetryExecutor};

/// Finite sequence of summary batches, seeded with the cursor to resume after.
pub struct SummaryPager<'a> {
    source: &'a dyn RemoteSource,
    executor: &'a RetryExecutor,
    page_size: usize,
    cursor: Option<String>,
    exhausted: bool,
}

impl<'a> SummaryPager<'a> {
    pub fn new(
        source: &'a dyn RemoteSource,
        executor: &'a RetryExecutor,
        page_size: usize,
        cursor: Option<String>,
    ) -> Self {
        Self {
            source,
            executor,
            page_size: page_size.max(1),
            cursor,
            exhausted: false,
        }
    }

    /// Cursor to resume after the last batch returned by [`Self::next_batch`].
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Next batch of summaries, or `None` once the listing is exhausted. On error the cursor
    /// is left where it was, so the same batch is requested again on resume.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<PageSummary>>, ExecutorError> {
        if self.exhausted {
            return Ok(None);
        }
        let source = self.source;
        let first = self.page_size;
        let after = self.cursor.as_deref();
        let context = ErrorContext::new("scan_page").with_cursor(after);
        let page = self
            .executor
            .execute(&context, move || source.scan_page(after, first))
            .await?;

        match (page.page_info.has_next_page, page.page_info.end_cursor) {
            (true, Some(next)) => self.cursor = Some(next),
            (true, None) => {
                warn!(
                    cursor = ?self.cursor,
                    "listing claims more pages but returned no cursor; stopping"
                );
                self.exhausted = true;
            }
            (false, next) => {
                if next.is_some() {
                    self.cursor = next;
                }
                self.exhausted = true;
            }
        }
        debug!(items = page.items.len(), cursor = ?self.cursor, "scanned summary page");

        if page.items.is_empty() && self.exhausted {
            return Ok(None);
        }
        Ok(Some(page.items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wikisync_remote::{FixturePage, FixtureSource, FixtureWiki};
    use wikisync_storage::{RetryPolicy, RunErrorLog};

    fn wiki(n: usize) -> FixtureSource {
        FixtureSource::new(FixtureWiki {
            pages: (0..n)
                .map(|i| FixturePage {
                    summary: PageSummary {
                        url: format!("http://wiki/page-{i}"),
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .collect(),
            users: Vec::new(),
        })
    }

    #[tokio::test]
    async fn pages_until_exhausted_and_resumes_from_cursor() {
        let remote = wiki(5);
        let executor = RetryExecutor::new(RetryPolicy::default(), RunErrorLog::new());
        let mut pager = SummaryPager::new(&remote, &executor, 2, None);

        let first = pager.next_batch().await.expect("batch").expect("items");
        assert_eq!(first.len(), 2);
        let resume_at = pager.cursor().map(str::to_string);

        let mut resumed = SummaryPager::new(&remote, &executor, 2, resume_at);
        let mut urls = Vec::new();
        while let Some(batch) = resumed.next_batch().await.expect("batch") {
            urls.extend(batch.into_iter().map(|s| s.url));
        }
        assert_eq!(urls, vec!["http://wiki/page-2", "http://wiki/page-3", "http://wiki/page-4"]);
        assert!(resumed.is_exhausted());
        assert!(resumed.next_batch().await.expect("done").is_none());
    }

    #[tokio::test]
    async fn empty_listing_yields_nothing() {
        let remote = wiki(0);
        let executor = RetryExecutor::new(RetryPolicy::default(), RunErrorLog::new());
        let mut pager = SummaryPager::new(&remote, &executor, 10, None);
        assert!(pager.next_batch().await.expect("batch").is_none());
        assert_eq!(remote.scan_calls(), 1);
    }
}
