//! Data-need planning: turn change tags, and for unchanged pages a gap analysis, into the
//! smallest set of expensive sub-fetches per page.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use wikisync_core::{ClassifiedPage, DetailNeed, Page, PageSummary, PlannedFetch, RunStats};

use crate::index::DatasetIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerConfig {
    /// Remote vote count may drift this far from the stored vote records before a refetch.
    pub vote_gap_threshold: u32,
    pub large_page_votes: u32,
    pub stale_after: Duration,
    pub zero_to_large_votes: u32,
    pub revision_gap_threshold: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            vote_gap_threshold: 5,
            large_page_votes: 100,
            stale_after: Duration::days(30),
            zero_to_large_votes: 10,
            revision_gap_threshold: 2,
        }
    }
}

#[derive(Debug)]
pub struct Planner<'a> {
    config: PlannerConfig,
    index: &'a DatasetIndex,
    now: DateTime<Utc>,
}

impl<'a> Planner<'a> {
    pub fn new(config: PlannerConfig, index: &'a DatasetIndex, now: DateTime<Utc>) -> Self {
        Self { config, index, now }
    }

    /// One entry per page that needs anything, in identity order.
    pub fn plan(
        &self,
        classified: &BTreeMap<String, ClassifiedPage>,
        stats: &mut RunStats,
    ) -> Vec<PlannedFetch> {
        let mut needs: BTreeMap<&str, DetailNeed> = BTreeMap::new();
        for (url, page) in classified {
            let need = if page.tags.is_unchanged() {
                match self.index.page(url) {
                    Some(stored) => self.gap_analysis(&page.summary, stored),
                    None => DetailNeed::default(),
                }
            } else {
                needs_for_tags(page)
            };
            if need.is_empty() {
                continue;
            }
            needs
                .entry(url.as_str())
                .and_modify(|existing| existing.union(&need))
                .or_insert(need);
        }

        stats.planned_fetches = needs.len() as u64;
        stats.planned_by_kind.clear();
        for need in needs.values() {
            for kind in need.kinds() {
                *stats
                    .planned_by_kind
                    .entry(kind.as_str().to_string())
                    .or_default() += 1;
            }
        }

        needs
            .into_iter()
            .map(|(url, need)| PlannedFetch {
                url: url.to_string(),
                need,
            })
            .collect()
    }

    fn gap_analysis(&self, summary: &PageSummary, stored: &Page) -> DetailNeed {
        let mut need = DetailNeed::default();
        let mut add = |gap: DetailNeed| need.union(&gap);

        if !stored.has_source() {
            add(DetailNeed {
                needs_source: true,
                needs_revisions: true,
                needs_attributions: true,
                reason: "missing_source".into(),
                ..DetailNeed::default()
            });
        }

        let remote_votes = summary.vote_count.or(stored.vote_count).unwrap_or(0);
        let local_votes =
            u32::try_from(self.index.stored_vote_count(&stored.url)).unwrap_or(u32::MAX);
        let votes = |reason: &str| DetailNeed {
            needs_voting: true,
            reason: reason.into(),
            ..DetailNeed::default()
        };
        if remote_votes.abs_diff(local_votes) > self.config.vote_gap_threshold {
            add(votes("vote_gap"));
        }
        if remote_votes >= self.config.large_page_votes && self.votes_are_stale(stored) {
            add(votes("stale_votes"));
        }
        if local_votes == 0 && remote_votes >= self.config.zero_to_large_votes {
            add(votes("zero_to_large"));
        }

        let remote_revisions = summary.revision_count.or(stored.revision_count).unwrap_or(0);
        let local_revisions =
            u32::try_from(self.index.stored_revision_count(&stored.url)).unwrap_or(u32::MAX);
        if remote_revisions.saturating_sub(local_revisions) > self.config.revision_gap_threshold
            && !need.needs_source
        {
            need.union(&DetailNeed {
                needs_revisions: true,
                reason: "revision_gap".into(),
                ..DetailNeed::default()
            });
        }

        if !need.is_empty() {
            debug!(page_url = %stored.url, reason = %need.reason, "gap analysis requested detail");
        }
        need
    }

    fn votes_are_stale(&self, stored: &Page) -> bool {
        match stored.votes_fetched_at {
            Some(at) => self.now - at > self.config.stale_after,
            None => true,
        }
    }
}

fn needs_for_tags(page: &ClassifiedPage) -> DetailNeed {
    let mut need = DetailNeed::default();
    for tag in page.tags.iter() {
        need.union(&DetailNeed::for_tag(tag));
    }
    need
}
