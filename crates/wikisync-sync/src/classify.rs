//! Change classification: diff each scanned summary against the baseline index.
//!
//! A summary field only counts as changed when the scan actually carries a value for it and
//! that value differs from the stored one. An absent field is not evidence of change, which
//! keeps classification consistent with the merge rule that never lets an empty value win.

use std::collections::BTreeMap;

use tracing::info;
use wikisync_core::{ChangeTag, ChangeTags, ClassifiedPage, Page, PageSummary, RunStats};

use crate::index::DatasetIndex;

fn same_tags(scanned: &[String], stored: &[String]) -> bool {
    let mut a = scanned.iter().collect::<Vec<_>>();
    let mut b = stored.iter().collect::<Vec<_>>();
    a.sort();
    a.dedup();
    b.sort();
    b.dedup();
    a == b
}

fn differs<T: PartialEq>(scanned: &Option<T>, stored: &Option<T>) -> bool {
    scanned.is_some() && scanned != stored
}

/// Tags for one summary given its stored counterpart, if any.
pub fn classify(
    summary: &PageSummary,
    stored: Option<&Page>,
    stored_attribution_signature: Option<&str>,
) -> ChangeTags {
    let mut tags = ChangeTags::new();
    let Some(stored) = stored else {
        tags.insert(ChangeTag::New);
        return tags;
    };

    if differs(&summary.rating, &stored.rating) || differs(&summary.vote_count, &stored.vote_count)
    {
        tags.insert(ChangeTag::VotingChanged);
    }
    let title_changed = summary.title.as_deref().is_some_and(|t| !t.is_empty())
        && summary.title != stored.title;
    let tags_changed = !summary.tags.is_empty() && !same_tags(&summary.tags, &stored.tags);
    if title_changed || tags_changed {
        tags.insert(ChangeTag::ContentChanged);
    }
    if differs(&summary.revision_count, &stored.revision_count) {
        tags.insert(ChangeTag::RevisionChanged);
    }
    if let (Some(scanned), Some(known)) = (
        summary.attribution_signature(),
        stored_attribution_signature,
    ) {
        if scanned != known {
            tags.insert(ChangeTag::AttributionChanged);
        }
    }
    tags
}

/// Streams scan batches into the classification map.
#[derive(Debug)]
pub struct Classifier<'a> {
    index: &'a DatasetIndex,
    fast_stop: bool,
}

impl<'a> Classifier<'a> {
    pub fn new(index: &'a DatasetIndex, fast_stop: bool) -> Self {
        Self { index, fast_stop }
    }

    /// Classify one batch into `classified`. Returns `true` when fast-stop fired and the scan
    /// should end; the page that triggered it is kept.
    pub fn classify_into(
        &self,
        batch: Vec<PageSummary>,
        classified: &mut BTreeMap<String, ClassifiedPage>,
        stats: &mut RunStats,
    ) -> bool {
        for summary in batch {
            if summary.url.is_empty() || classified.contains_key(&summary.url) {
                continue;
            }
            let tags = classify(
                &summary,
                self.index.page(&summary.url),
                self.index.attribution_signature(&summary.url),
            );
            stats.record_tags(&tags);
            let changed = !tags.is_unchanged();
            if changed && self.fast_stop {
                info!(
                    page_url = %summary.url,
                    tags = %tags.label(),
                    "fast-stop: first change found"
                );
            }
            classified.insert(summary.url.clone(), ClassifiedPage { summary, tags });
            if changed && self.fast_stop {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wikisync_core::{
        attribution_signature, AttributionRef, MergedDataset, VoteRecord,
    };

    fn summary(url: &str) -> PageSummary {
        PageSummary {
            url: url.to_string(),
            title: Some("SCP-173".into()),
            tags: vec!["euclid".into(), "scp".into()],
            rating: Some(5),
            vote_count: Some(10),
            revision_count: Some(3),
            ..Default::default()
        }
    }

    fn stored(url: &str) -> Page {
        Page::from_summary(&summary(url), Utc::now())
    }

    #[test]
    fn unknown_pages_are_new() {
        let tags = classify(&summary("http://wiki/a"), None, None);
        assert_eq!(tags.iter().collect::<Vec<_>>(), vec![ChangeTag::New]);
    }

    #[test]
    fn each_field_group_maps_to_its_tag() {
        let page = stored("http://wiki/a");
        assert!(classify(&summary("http://wiki/a"), Some(&page), None).is_unchanged());

        let mut voted = summary("http://wiki/a");
        voted.vote_count = Some(14);
        voted.rating = Some(9);
        let tags = classify(&voted, Some(&page), None);
        assert_eq!(tags.iter().collect::<Vec<_>>(), vec![ChangeTag::VotingChanged]);

        let mut edited = summary("http://wiki/a");
        edited.tags = vec!["keter".into()];
        edited.revision_count = Some(4);
        let tags = classify(&edited, Some(&page), None);
        assert!(tags.contains(ChangeTag::ContentChanged));
        assert!(tags.contains(ChangeTag::RevisionChanged));
        assert_eq!(tags.len(), 2);
    }

    #[test]
    fn tag_order_and_missing_fields_are_not_changes() {
        let page = stored("http://wiki/a");
        let mut scanned = summary("http://wiki/a");
        scanned.tags = vec!["scp".into(), "euclid".into()];
        scanned.rating = None;
        scanned.title = None;
        assert!(classify(&scanned, Some(&page), None).is_unchanged());
    }

    #[test]
    fn rating_zero_is_a_real_change() {
        let page = stored("http://wiki/a");
        let mut scanned = summary("http://wiki/a");
        scanned.rating = Some(0);
        assert!(classify(&scanned, Some(&page), None).contains(ChangeTag::VotingChanged));
    }

    #[test]
    fn attribution_signature_only_compares_when_listed() {
        let page = stored("http://wiki/a");
        let known = attribution_signature([("author", Some("u1"))]);
        let mut scanned = summary("http://wiki/a");
        assert!(classify(&scanned, Some(&page), Some(&known)).is_unchanged());

        scanned.attributions = Some(vec![AttributionRef {
            kind: "author".into(),
            user_id: Some("u2".into()),
        }]);
        assert!(classify(&scanned, Some(&page), Some(&known))
            .contains(ChangeTag::AttributionChanged));
    }

    #[test]
    fn fast_stop_keeps_the_triggering_page_and_halts() {
        let dataset = MergedDataset {
            pages: vec![stored("http://wiki/a"), stored("http://wiki/b")],
            vote_records: Vec::<VoteRecord>::new(),
            ..Default::default()
        };
        let index = DatasetIndex::build(&dataset);
        let mut changed = summary("http://wiki/b");
        changed.title = Some("renamed".into());
        let batch = vec![summary("http://wiki/a"), changed, summary("http://wiki/c")];

        let mut classified = BTreeMap::new();
        let mut stats = RunStats::default();
        let halted = Classifier::new(&index, true).classify_into(
            batch.clone(),
            &mut classified,
            &mut stats,
        );
        assert!(halted);
        assert_eq!(classified.len(), 2);
        assert!(classified["http://wiki/b"].tags.contains(ChangeTag::ContentChanged));

        let mut classified = BTreeMap::new();
        let mut stats = RunStats::default();
        let halted =
            Classifier::new(&index, false).classify_into(batch, &mut classified, &mut stats);
        assert!(!halted);
        assert_eq!(stats.scanned, 3);
        assert_eq!(stats.new_pages, 1);
        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.primary_buckets["content_changed"], 1);
    }
}
