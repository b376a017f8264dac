//! Merge engine: fold scanned summaries and fetched detail into the cumulative dataset.
//!
//! Per-entity rules:
//! - page scalars and arrays go through [`prefer_non_empty`], so a blank fetch never erases data
//! - votes are keyed by (page, voter, timestamp); new keys are appended and a known key whose
//!   direction changed is updated in place
//! - revisions are additive by (page, revision id)
//! - attributions and alternate titles are replaced wholesale by a non-empty fetch and kept
//!   otherwise

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::warn;
use wikisync_core::{
    prefer_non_empty, AlternateTitle, Attribution, ClassifiedPage, DetailPayload, MergedDataset,
    Page, RevisionRecord, RunStats, User, VoteKey, VoteRecord,
};

/// Mutable accumulators for one merge, seeded from the baseline.
#[derive(Debug, Default)]
pub struct MergeContext {
    now: DateTime<Utc>,
    pages: BTreeMap<String, Page>,
    votes: BTreeMap<VoteKey, VoteRecord>,
    revisions: BTreeMap<(String, String), RevisionRecord>,
    attributions: BTreeMap<String, Vec<Attribution>>,
    alternate_titles: BTreeMap<String, Vec<AlternateTitle>>,
    users: BTreeMap<String, User>,
}

impl MergeContext {
    pub fn from_baseline(baseline: MergedDataset, now: DateTime<Utc>) -> Self {
        let mut context = Self {
            now,
            ..Self::default()
        };
        for page in baseline.pages {
            context.pages.insert(page.url.clone(), page);
        }
        for vote in baseline.vote_records {
            context.votes.insert(vote.key(), vote);
        }
        for revision in baseline.revisions {
            context.revisions.insert(revision.key(), revision);
        }
        for attribution in baseline.attributions {
            context
                .attributions
                .entry(attribution.page_url.clone())
                .or_default()
                .push(attribution);
        }
        for title in baseline.alternate_titles {
            context
                .alternate_titles
                .entry(title.page_url.clone())
                .or_default()
                .push(title);
        }
        for user in baseline.users {
            context.upsert_user(user);
        }
        context
    }

    pub fn page(&self, url: &str) -> Option<&Page> {
        self.pages.get(url)
    }

    /// Smart-merge a scanned summary into its page, creating the page when it is new.
    pub fn apply_summary(&mut self, classified: &ClassifiedPage, stats: &mut RunStats) {
        let summary = &classified.summary;
        if let Some(creator) = &summary.created_by {
            self.upsert_user(User {
                id: creator.id.clone(),
                name: creator.name.clone(),
            });
        }

        let Some(existing) = self.pages.get_mut(&summary.url) else {
            self.pages
                .insert(summary.url.clone(), Page::from_summary(summary, self.now));
            stats.pages_added += 1;
            return;
        };

        let before = existing.clone();
        let scanned = Page::from_summary(summary, self.now);
        existing.title = prefer_non_empty(scanned.title, existing.title.take());
        existing.category = prefer_non_empty(scanned.category, existing.category.take());
        existing.tags = prefer_non_empty(scanned.tags, std::mem::take(&mut existing.tags));
        existing.rating = prefer_non_empty(scanned.rating, existing.rating);
        existing.vote_count = prefer_non_empty(scanned.vote_count, existing.vote_count);
        existing.comment_count = prefer_non_empty(scanned.comment_count, existing.comment_count);
        existing.revision_count = prefer_non_empty(scanned.revision_count, existing.revision_count);
        existing.created_at = prefer_non_empty(scanned.created_at, existing.created_at);
        existing.created_by = prefer_non_empty(scanned.created_by, existing.created_by.take());
        existing.thumbnail_url =
            prefer_non_empty(scanned.thumbnail_url, existing.thumbnail_url.take());

        let mut compare = existing.clone();
        compare.last_seen_at = before.last_seen_at;
        if compare != before {
            stats.pages_updated += 1;
        }
        existing.last_seen_at = self.now;
    }

    /// Fold one detail payload into the accumulators. The page must already be present.
    pub fn apply_detail(&mut self, payload: DetailPayload, stats: &mut RunStats) {
        let url = payload.url;
        let Some(page) = self.pages.get_mut(&url) else {
            warn!(page_url = %url, "detail payload for a page that was never scanned; skipping");
            return;
        };

        if payload.source.is_some() {
            page.source = prefer_non_empty(payload.source, page.source.take());
        }

        if let Some(votes) = payload.votes {
            page.votes_fetched_at = Some(payload.fetched_at);
            for mut vote in votes {
                vote.page_url.clone_from(&url);
                let key = vote.key();
                match self.votes.get_mut(&key) {
                    Some(stored) if stored.direction != vote.direction => {
                        stored.direction = vote.direction;
                        stats.votes_updated += 1;
                    }
                    Some(_) => {}
                    None => {
                        self.votes.insert(key, vote);
                        stats.votes_added += 1;
                    }
                }
            }
        }

        if let Some(revisions) = payload.revisions {
            for mut revision in revisions {
                revision.page_url.clone_from(&url);
                let key = revision.key();
                if !self.revisions.contains_key(&key) {
                    self.revisions.insert(key, revision);
                    stats.revisions_added += 1;
                }
            }
        }

        if let Some(attributions) = payload.attributions.filter(|a| !a.is_empty()) {
            let attributions = attributions
                .into_iter()
                .map(|mut a| {
                    a.page_url.clone_from(&url);
                    a
                })
                .collect();
            self.attributions.insert(url.clone(), attributions);
            stats.attributions_replaced += 1;
        }

        if let Some(titles) = payload.alternate_titles.filter(|t| !t.is_empty()) {
            let titles = titles
                .into_iter()
                .map(|mut t| {
                    t.page_url.clone_from(&url);
                    t
                })
                .collect();
            self.alternate_titles.insert(url.clone(), titles);
        }

        for user in payload.users {
            self.upsert_user(user);
        }
    }

    fn upsert_user(&mut self, user: User) {
        match self.users.get_mut(&user.id) {
            Some(existing) => existing.name = prefer_non_empty(user.name, existing.name.take()),
            None => {
                self.users.insert(user.id.clone(), user);
            }
        }
    }

    /// Pages that the baseline holds but this run never scanned.
    pub fn carried_over(&self, scanned: &BTreeSet<&str>) -> usize {
        self.pages
            .keys()
            .filter(|url| !scanned.contains(url.as_str()))
            .count()
    }

    /// Deterministically ordered dataset: pages by url, votes by key, revisions by id.
    pub fn into_dataset(self) -> MergedDataset {
        let mut attributions = self.attributions.into_values().flatten().collect::<Vec<_>>();
        attributions.sort_by(|a, b| {
            (a.page_url.as_str(), a.order, a.kind.as_str())
                .cmp(&(b.page_url.as_str(), b.order, b.kind.as_str()))
        });
        MergedDataset {
            pages: self.pages.into_values().collect(),
            vote_records: self.votes.into_values().collect(),
            users: self.users.into_values().collect(),
            attributions,
            revisions: self.revisions.into_values().collect(),
            alternate_titles: self.alternate_titles.into_values().flatten().collect(),
        }
    }
}
