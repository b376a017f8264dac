//! Core domain model for the wiki mirror: page summaries, stored records, change tags,
//! detail needs and the cumulative snapshot document.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "wikisync-core";
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Voter key used for votes cast without a resolvable account.
pub const ANONYMOUS_VOTER: &str = "anonymous";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub name: Option<String>,
}

/// Attribution entry as it appears in the lightweight scan listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionRef {
    pub kind: String,
    pub user_id: Option<String>,
}

/// Lightweight per-page listing streamed during the scan phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PageSummary {
    pub url: String,
    pub title: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub rating: Option<i64>,
    pub vote_count: Option<u32>,
    pub comment_count: Option<u32>,
    pub revision_count: Option<u32>,
    pub created_at: Option<DateTime<Utc>>,
    pub created_by: Option<UserRef>,
    pub thumbnail_url: Option<String>,
    /// `None` when the remote listing did not include attribution data.
    #[serde(default)]
    pub attributions: Option<Vec<AttributionRef>>,
}

impl PageSummary {
    pub fn attribution_signature(&self) -> Option<String> {
        self.attributions.as_ref().map(|entries| {
            attribution_signature(
                entries
                    .iter()
                    .map(|a| (a.kind.as_str(), a.user_id.as_deref())),
            )
        })
    }
}

/// Stored page record, the unit of the `pages` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub url: String,
    pub title: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub rating: Option<i64>,
    pub vote_count: Option<u32>,
    pub comment_count: Option<u32>,
    pub revision_count: Option<u32>,
    pub created_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub thumbnail_url: Option<String>,
    pub source: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub votes_fetched_at: Option<DateTime<Utc>>,
}

impl Page {
    pub fn from_summary(summary: &PageSummary, seen_at: DateTime<Utc>) -> Self {
        Self {
            url: summary.url.clone(),
            title: summary.title.clone(),
            category: summary.category.clone(),
            tags: summary.tags.clone(),
            rating: summary.rating,
            vote_count: summary.vote_count,
            comment_count: summary.comment_count,
            revision_count: summary.revision_count,
            created_at: summary.created_at,
            created_by: summary.created_by.as_ref().map(|u| u.id.clone()),
            thumbnail_url: summary.thumbnail_url.clone(),
            source: None,
            first_seen_at: seen_at,
            last_seen_at: seen_at,
            votes_fetched_at: None,
        }
    }

    pub fn has_source(&self) -> bool {
        self.source.is_present()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub page_url: String,
    pub voter_id: Option<String>,
    /// +1 / -1 for up/down votes, 0 for a retracted vote.
    pub direction: i8,
    pub timestamp: DateTime<Utc>,
}

/// Natural key of a vote: (page, voter or anonymous key, timestamp).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoteKey {
    pub page_url: String,
    pub voter: String,
    pub timestamp: DateTime<Utc>,
}

impl VoteRecord {
    pub fn key(&self) -> VoteKey {
        VoteKey {
            page_url: self.page_url.clone(),
            voter: self
                .voter_id
                .clone()
                .unwrap_or_else(|| ANONYMOUS_VOTER.to_string()),
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub page_url: String,
    pub revision_id: String,
    pub revision_number: Option<u32>,
    pub timestamp: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub comment: Option<String>,
}

impl RevisionRecord {
    pub fn key(&self) -> (String, String) {
        (self.page_url.clone(), self.revision_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    pub page_url: String,
    pub kind: String,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub order: u32,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateTitle {
    pub page_url: String,
    pub title: String,
    pub language: Option<String>,
}

/// Order-insensitive digest over (kind, user) attribution pairs.
pub fn attribution_signature<'a>(
    entries: impl IntoIterator<Item = (&'a str, Option<&'a str>)>,
) -> String {
    let mut parts = entries
        .into_iter()
        .map(|(kind, user)| format!("{}:{}", kind.to_ascii_lowercase(), user.unwrap_or("-")))
        .collect::<Vec<_>>();
    parts.sort();
    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    hex::encode(hasher.finalize())
}

pub fn signature_of_attributions(attributions: &[Attribution]) -> String {
    attribution_signature(
        attributions
            .iter()
            .map(|a| (a.kind.as_str(), a.user_id.as_deref())),
    )
}

/// "Is this value worth keeping" check backing [`prefer_non_empty`].
///
/// Strings and collections are empty when they hold nothing; numbers and timestamps are
/// always present, so `0` survives a merge.
pub trait Presence {
    fn is_present(&self) -> bool;
}

impl Presence for String {
    fn is_present(&self) -> bool {
        !self.is_empty()
    }
}

impl<T> Presence for Vec<T> {
    fn is_present(&self) -> bool {
        !self.is_empty()
    }
}

impl<T: Presence> Presence for Option<T> {
    fn is_present(&self) -> bool {
        self.as_ref().is_some_and(Presence::is_present)
    }
}

macro_rules! always_present {
    ($($ty:ty),* $(,)?) => {
        $(impl Presence for $ty {
            fn is_present(&self) -> bool {
                true
            }
        })*
    };
}

always_present!(i8, i64, u32, u64, f64, bool, DateTime<Utc>);

/// Field-level protection: keep `new` only when it carries a value, otherwise keep `old`.
pub fn prefer_non_empty<T: Presence>(new: T, old: T) -> T {
    if new.is_present() {
        new
    } else {
        old
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeTag {
    New,
    VotingChanged,
    ContentChanged,
    RevisionChanged,
    AttributionChanged,
}

impl ChangeTag {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeTag::New => "new",
            ChangeTag::VotingChanged => "voting_changed",
            ChangeTag::ContentChanged => "content_changed",
            ChangeTag::RevisionChanged => "revision_changed",
            ChangeTag::AttributionChanged => "attribution_changed",
        }
    }

    fn reporting_rank(self) -> u8 {
        match self {
            ChangeTag::New => 0,
            ChangeTag::ContentChanged => 1,
            ChangeTag::RevisionChanged => 2,
            ChangeTag::AttributionChanged => 3,
            ChangeTag::VotingChanged => 4,
        }
    }
}

impl fmt::Display for ChangeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of change categories detected for one page; empty means unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeTags(BTreeSet<ChangeTag>);

impl ChangeTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: ChangeTag) {
        self.0.insert(tag);
    }

    pub fn contains(&self, tag: ChangeTag) -> bool {
        self.0.contains(&tag)
    }

    pub fn is_unchanged(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ChangeTag> + '_ {
        self.0.iter().copied()
    }

    /// Single bucket used by run summaries; planning always uses the full set.
    pub fn primary(&self) -> Option<ChangeTag> {
        self.0.iter().copied().min_by_key(|t| t.reporting_rank())
    }

    pub fn label(&self) -> String {
        if self.is_unchanged() {
            return "unchanged".to_string();
        }
        self.iter().map(ChangeTag::as_str).collect::<Vec<_>>().join("+")
    }
}

impl FromIterator<ChangeTag> for ChangeTags {
    fn from_iter<I: IntoIterator<Item = ChangeTag>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailKind {
    Source,
    Votes,
    Revisions,
    Attributions,
    AlternateTitles,
}

impl DetailKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DetailKind::Source => "source",
            DetailKind::Votes => "votes",
            DetailKind::Revisions => "revisions",
            DetailKind::Attributions => "attributions",
            DetailKind::AlternateTitles => "alternate_titles",
        }
    }
}

/// Which expensive sub-resources to fetch for one page, and why.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DetailNeed {
    pub needs_source: bool,
    pub needs_voting: bool,
    pub needs_revisions: bool,
    pub needs_attributions: bool,
    pub needs_alternate_titles: bool,
    pub reason: String,
}

impl DetailNeed {
    pub fn all(reason: impl Into<String>) -> Self {
        Self {
            needs_source: true,
            needs_voting: true,
            needs_revisions: true,
            needs_attributions: true,
            needs_alternate_titles: true,
            reason: reason.into(),
        }
    }

    /// Detail kinds implied by a single change tag.
    pub fn for_tag(tag: ChangeTag) -> Self {
        let reason = tag.as_str().to_string();
        match tag {
            ChangeTag::New => Self::all(reason),
            ChangeTag::VotingChanged => Self {
                needs_voting: true,
                reason,
                ..Self::default()
            },
            ChangeTag::ContentChanged => Self {
                needs_source: true,
                needs_alternate_titles: true,
                reason,
                ..Self::default()
            },
            ChangeTag::RevisionChanged => Self {
                needs_source: true,
                needs_revisions: true,
                reason,
                ..Self::default()
            },
            ChangeTag::AttributionChanged => Self {
                needs_attributions: true,
                reason,
                ..Self::default()
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.needs_source
            || self.needs_voting
            || self.needs_revisions
            || self.needs_attributions
            || self.needs_alternate_titles)
    }

    /// Flag-wise OR; reasons accumulate without repeats.
    pub fn union(&mut self, other: &DetailNeed) {
        self.needs_source |= other.needs_source;
        self.needs_voting |= other.needs_voting;
        self.needs_revisions |= other.needs_revisions;
        self.needs_attributions |= other.needs_attributions;
        self.needs_alternate_titles |= other.needs_alternate_titles;
        for part in other.reason.split('+').filter(|p| !p.is_empty()) {
            if !self.reason.split('+').any(|existing| existing == part) {
                if !self.reason.is_empty() {
                    self.reason.push('+');
                }
                self.reason.push_str(part);
            }
        }
    }

    pub fn kinds(&self) -> Vec<DetailKind> {
        [
            (self.needs_source, DetailKind::Source),
            (self.needs_voting, DetailKind::Votes),
            (self.needs_revisions, DetailKind::Revisions),
            (self.needs_attributions, DetailKind::Attributions),
            (self.needs_alternate_titles, DetailKind::AlternateTitles),
        ]
        .into_iter()
        .filter_map(|(on, kind)| on.then_some(kind))
        .collect()
    }
}

/// A scanned summary together with the change tags it was classified under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedPage {
    pub summary: PageSummary,
    pub tags: ChangeTags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedFetch {
    pub url: String,
    pub need: DetailNeed,
}

/// Sub-resources fetched for one page. `None` means "not requested".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailPayload {
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub source: Option<String>,
    /// New votes seen before the incremental fetch halted, newest first.
    pub votes: Option<Vec<VoteRecord>>,
    pub revisions: Option<Vec<RevisionRecord>>,
    pub attributions: Option<Vec<Attribution>>,
    pub alternate_titles: Option<Vec<AlternateTitle>>,
    #[serde(default)]
    pub users: Vec<User>,
}

impl DetailPayload {
    pub fn empty(url: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            fetched_at,
            source: None,
            votes: None,
            revisions: None,
            attributions: None,
            alternate_titles: None,
            users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MergedDataset {
    pub pages: Vec<Page>,
    pub vote_records: Vec<VoteRecord>,
    pub users: Vec<User>,
    pub attributions: Vec<Attribution>,
    pub revisions: Vec<RevisionRecord>,
    pub alternate_titles: Vec<AlternateTitle>,
}

/// Counters collected over one pipeline run, carried across resumes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub scanned: u64,
    pub scan_batches: u64,
    pub new_pages: u64,
    pub voting_changed: u64,
    pub content_changed: u64,
    pub revision_changed: u64,
    pub attribution_changed: u64,
    pub unchanged: u64,
    pub primary_buckets: BTreeMap<String, u64>,
    pub fast_stopped: bool,
    pub planned_fetches: u64,
    pub planned_by_kind: BTreeMap<String, u64>,
    pub detail_batches: u64,
    pub requeued_batches: u64,
    pub payloads_fetched: u64,
    pub votes_added: u64,
    pub votes_updated: u64,
    pub revisions_added: u64,
    pub attributions_replaced: u64,
    pub pages_added: u64,
    pub pages_updated: u64,
    pub pages_carried_over: u64,
    pub errors: u64,
}

impl RunStats {
    pub fn record_tags(&mut self, tags: &ChangeTags) {
        self.scanned += 1;
        if tags.is_unchanged() {
            self.unchanged += 1;
        }
        for tag in tags.iter() {
            let counter = match tag {
                ChangeTag::New => &mut self.new_pages,
                ChangeTag::VotingChanged => &mut self.voting_changed,
                ChangeTag::ContentChanged => &mut self.content_changed,
                ChangeTag::RevisionChanged => &mut self.revision_changed,
                ChangeTag::AttributionChanged => &mut self.attribution_changed,
            };
            *counter += 1;
        }
        let bucket = tags.primary().map_or("unchanged", ChangeTag::as_str);
        *self.primary_buckets.entry(bucket.to_string()).or_default() += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub baseline: Option<String>,
    pub stats: RunStats,
}

/// One complete point-in-time copy of the mirrored dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    #[serde(flatten)]
    pub dataset: MergedDataset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefer_non_empty_protects_existing_values() {
        assert_eq!(
            prefer_non_empty(Some(String::new()), Some("kept".to_string())),
            Some("kept".to_string())
        );
        assert_eq!(
            prefer_non_empty(None, Some("kept".to_string())),
            Some("kept".to_string())
        );
        assert_eq!(
            prefer_non_empty(Some("new".to_string()), Some("old".to_string())),
            Some("new".to_string())
        );
        assert_eq!(
            prefer_non_empty(Vec::<String>::new(), vec!["tale".into()]),
            vec!["tale".to_string()]
        );
        assert_eq!(prefer_non_empty::<Option<String>>(None, None), None);
    }

    #[test]
    fn zero_counts_as_a_real_number() {
        assert_eq!(prefer_non_empty(Some(0i64), Some(12)), Some(0));
        assert_eq!(prefer_non_empty(None, Some(12u32)), Some(12));
    }

    #[test]
    fn attribution_signature_ignores_order() {
        let a = attribution_signature([("author", Some("u1")), ("translator", Some("u2"))]);
        let b = attribution_signature([("translator", Some("u2")), ("Author", Some("u1"))]);
        let c = attribution_signature([("author", Some("u3"))]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn primary_bucket_prefers_new_then_content() {
        let tags: ChangeTags = [ChangeTag::VotingChanged, ChangeTag::ContentChanged]
            .into_iter()
            .collect();
        assert_eq!(tags.primary(), Some(ChangeTag::ContentChanged));
        assert_eq!(tags.label(), "voting_changed+content_changed");
        assert_eq!(ChangeTags::new().primary(), None);
        assert_eq!(ChangeTags::new().label(), "unchanged");
    }

    #[test]
    fn need_union_merges_flags_and_reasons() {
        let mut need = DetailNeed::for_tag(ChangeTag::VotingChanged);
        need.union(&DetailNeed::for_tag(ChangeTag::AttributionChanged));
        need.union(&DetailNeed::for_tag(ChangeTag::VotingChanged));
        assert!(need.needs_voting);
        assert!(need.needs_attributions);
        assert!(!need.needs_source);
        assert_eq!(need.reason, "voting_changed+attribution_changed");
        assert_eq!(need.kinds(), vec![DetailKind::Votes, DetailKind::Attributions]);
    }

    #[test]
    fn anonymous_votes_share_a_voter_key() {
        let ts = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .expect("ts")
            .with_timezone(&Utc);
        let vote = VoteRecord {
            page_url: "http://wiki/scp-173".into(),
            voter_id: None,
            direction: 1,
            timestamp: ts,
        };
        assert_eq!(vote.key().voter, ANONYMOUS_VOTER);
    }

    #[test]
    fn change_tags_serialize_as_upper_snake() {
        let tags: ChangeTags = [ChangeTag::New].into_iter().collect();
        let json = serde_json::to_string(&tags).expect("serialize");
        assert_eq!(json, "[\"NEW\"]");
    }
}
