//! Lookup structures over the baseline snapshot, keyed by page identity.

use std::collections::{HashMap, HashSet};

use wikisync_core::{signature_of_attributions, Attribution, MergedDataset, Page, VoteKey};

#[derive(Debug, Default)]
pub struct DatasetIndex {
    pages: HashMap<String, Page>,
    votes: HashMap<VoteKey, i8>,
    vote_counts: HashMap<String, usize>,
    revisions: HashSet<(String, String)>,
    revision_counts: HashMap<String, usize>,
    attribution_signatures: HashMap<String, String>,
}

impl DatasetIndex {
    pub fn build(dataset: &MergedDataset) -> Self {
        let mut index = Self {
            pages: dataset
                .pages
                .iter()
                .map(|p| (p.url.clone(), p.clone()))
                .collect(),
            ..Self::default()
        };

        for vote in &dataset.vote_records {
            if index.votes.insert(vote.key(), vote.direction).is_none() {
                *index.vote_counts.entry(vote.page_url.clone()).or_default() += 1;
            }
        }
        for revision in &dataset.revisions {
            if !index.revisions.insert(revision.key()) {
                continue;
            }
            *index
                .revision_counts
                .entry(revision.page_url.clone())
                .or_default() += 1;
        }

        let mut by_page: HashMap<&str, Vec<Attribution>> = HashMap::new();
        for attribution in &dataset.attributions {
            by_page
                .entry(attribution.page_url.as_str())
                .or_default()
                .push(attribution.clone());
        }
        for url in index.pages.keys() {
            let entries = by_page.get(url.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            index
                .attribution_signatures
                .insert(url.clone(), signature_of_attributions(entries));
        }
        index
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn page(&self, url: &str) -> Option<&Page> {
        self.pages.get(url)
    }

    /// Stored direction of a vote, if the (page, voter, timestamp) key is already known.
    pub fn known_vote(&self, key: &VoteKey) -> Option<i8> {
        self.votes.get(key).copied()
    }

    pub fn stored_vote_count(&self, url: &str) -> usize {
        self.vote_counts.get(url).copied().unwrap_or(0)
    }

    pub fn stored_revision_count(&self, url: &str) -> usize {
        self.revision_counts.get(url).copied().unwrap_or(0)
    }

    pub fn known_revision(&self, url: &str, revision_id: &str) -> bool {
        self.revisions.contains(&(url.to_string(), revision_id.to_string()))
    }

    /// True when the baseline holds at least as many revisions as the page reported when it
    /// was last scanned, so a newest-first walk may stop at the first known revision.
    pub fn revision_history_complete(&self, url: &str) -> bool {
        let expected = self
            .pages
            .get(url)
            .and_then(|p| p.revision_count)
            .unwrap_or(0);
        self.stored_revision_count(url) >= expected as usize
    }

    pub fn attribution_signature(&self, url: &str) -> Option<&str> {
        self.attribution_signatures.get(url).map(String::as_str)
    }
}
