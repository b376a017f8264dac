//! `RemoteSource` over a GraphQL content API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use tracing::warn;
use wikisync_core::{
    AlternateTitle, Attribution, AttributionRef, DetailNeed, PageSummary, RevisionRecord, User,
    UserRef, VoteRecord,
};
use wikisync_storage::{GraphqlClient, RemoteError};

use crate::query::{detail_query, revisions_query, scan_query, votes_query};
use crate::{Connection, DetailResponse, FetchLimits, PageInfo, RemoteSource, SummaryPage};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EdgesNode<T> {
    #[serde(default = "Vec::new")]
    edges: Vec<Edge<T>>,
    #[serde(default)]
    page_info: Option<PageInfoNode>,
}

#[derive(Debug, Deserialize)]
struct Edge<T> {
    node: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfoNode {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct UserNode {
    id: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttributionUserNode {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SummaryAttributionNode {
    #[serde(rename = "type")]
    kind: String,
    user: Option<AttributionUserNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryNode {
    url: String,
    title: Option<String>,
    category: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    rating: Option<i64>,
    vote_count: Option<u32>,
    comment_count: Option<u32>,
    revision_count: Option<u32>,
    created_at: Option<DateTime<Utc>>,
    created_by: Option<UserNode>,
    thumbnail_url: Option<String>,
    attributions: Option<Vec<SummaryAttributionNode>>,
}

#[derive(Debug, Deserialize)]
struct VoteNode {
    direction: i8,
    timestamp: DateTime<Utc>,
    user: Option<UserNode>,
}

#[derive(Debug, Deserialize)]
struct RevisionNode {
    id: String,
    number: Option<u32>,
    timestamp: Option<DateTime<Utc>>,
    comment: Option<String>,
    user: Option<UserNode>,
}

#[derive(Debug, Deserialize)]
struct AttributionNode {
    #[serde(rename = "type")]
    kind: String,
    order: Option<u32>,
    date: Option<DateTime<Utc>>,
    user: Option<UserNode>,
}

#[derive(Debug, Deserialize)]
struct AlternateTitleNode {
    title: String,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetailNode {
    source: Option<String>,
    votes: Option<EdgesNode<VoteNode>>,
    revisions: Option<EdgesNode<RevisionNode>>,
    attributions: Option<Vec<AttributionNode>>,
    alternate_titles: Option<Vec<AlternateTitleNode>>,
}

#[derive(Debug, Deserialize)]
struct ScanData {
    pages: EdgesNode<SummaryNode>,
}

#[derive(Debug, Deserialize)]
struct PageData<T> {
    page: Option<T>,
}

#[derive(Debug, Deserialize)]
struct VotesOnly {
    votes: Option<EdgesNode<VoteNode>>,
}

#[derive(Debug, Deserialize)]
struct RevisionsOnly {
    revisions: Option<EdgesNode<RevisionNode>>,
}

fn decode<T: DeserializeOwned>(data: JsonValue, what: &str) -> Result<T, RemoteError> {
    serde_json::from_value(data).map_err(|err| RemoteError::Decode(format!("{what}: {err}")))
}

fn page_info(node: Option<PageInfoNode>) -> PageInfo {
    node.map(|p| PageInfo {
        has_next_page: p.has_next_page,
        end_cursor: p.end_cursor,
    })
    .unwrap_or_default()
}

/// Collects every user referenced by a detail response, first sighting wins per id.
#[derive(Default)]
struct UserCollector(BTreeMap<String, User>);

impl UserCollector {
    fn see(&mut self, user: &Option<UserNode>) -> Option<String> {
        let user = user.as_ref()?;
        self.0.entry(user.id.clone()).or_insert_with(|| User {
            id: user.id.clone(),
            name: user.name.clone(),
        });
        Some(user.id.clone())
    }

    fn into_users(self) -> Vec<User> {
        self.0.into_values().collect()
    }
}

fn vote_connection(
    url: &str,
    node: EdgesNode<VoteNode>,
    users: &mut UserCollector,
) -> Connection<VoteRecord> {
    let items = node
        .edges
        .into_iter()
        .map(|e| VoteRecord {
            page_url: url.to_string(),
            voter_id: users.see(&e.node.user),
            direction: e.node.direction,
            timestamp: e.node.timestamp,
        })
        .collect();
    Connection {
        items,
        page_info: page_info(node.page_info),
    }
}

fn revision_connection(
    url: &str,
    node: EdgesNode<RevisionNode>,
    users: &mut UserCollector,
) -> Connection<RevisionRecord> {
    let items = node
        .edges
        .into_iter()
        .map(|e| RevisionRecord {
            page_url: url.to_string(),
            revision_id: e.node.id,
            revision_number: e.node.number,
            timestamp: e.node.timestamp,
            user_id: users.see(&e.node.user),
            comment: e.node.comment,
        })
        .collect();
    Connection {
        items,
        page_info: page_info(node.page_info),
    }
}

impl From<SummaryNode> for PageSummary {
    fn from(node: SummaryNode) -> Self {
        PageSummary {
            url: node.url,
            title: node.title,
            category: node.category,
            tags: node.tags.unwrap_or_default(),
            rating: node.rating,
            vote_count: node.vote_count,
            comment_count: node.comment_count,
            revision_count: node.revision_count,
            created_at: node.created_at,
            created_by: node.created_by.map(|u| UserRef {
                id: u.id,
                name: u.name,
            }),
            thumbnail_url: node.thumbnail_url,
            attributions: node.attributions.map(|list| {
                list.into_iter()
                    .map(|a| AttributionRef {
                        kind: a.kind,
                        user_id: a.user.map(|u| u.id),
                    })
                    .collect()
            }),
        }
    }
}

fn detail_response(url: &str, node: DetailNode) -> DetailResponse {
    let mut users = UserCollector::default();
    let votes = node.votes.map(|v| vote_connection(url, v, &mut users));
    let revisions = node
        .revisions
        .map(|r| revision_connection(url, r, &mut users));
    let attributions = node.attributions.map(|list| {
        list.into_iter()
            .enumerate()
            .map(|(i, a)| Attribution {
                page_url: url.to_string(),
                kind: a.kind,
                user_name: a.user.as_ref().and_then(|u| u.name.clone()),
                user_id: users.see(&a.user),
                order: a.order.unwrap_or(i as u32),
                date: a.date,
            })
            .collect()
    });
    let alternate_titles = node.alternate_titles.map(|list| {
        list.into_iter()
            .map(|t| AlternateTitle {
                page_url: url.to_string(),
                title: t.title,
                language: t.language,
            })
            .collect()
    });
    DetailResponse {
        source: node.source,
        votes,
        revisions,
        attributions,
        alternate_titles,
        users: users.into_users(),
    }
}

#[derive(Debug)]
pub struct GraphqlSource {
    client: GraphqlClient,
}

impl GraphqlSource {
    pub fn new(client: GraphqlClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteSource for GraphqlSource {
    fn name(&self) -> &str {
        self.client.endpoint()
    }

    async fn scan_page(
        &self,
        after: Option<&str>,
        first: usize,
    ) -> Result<SummaryPage, RemoteError> {
        let data = self
            .client
            .query("scan_pages", &scan_query(), json!({ "first": first, "after": after }))
            .await?;
        let scan: ScanData = decode(data, "scan_pages")?;
        Ok(Connection {
            items: scan
                .pages
                .edges
                .into_iter()
                .map(|e| PageSummary::from(e.node))
                .collect(),
            page_info: page_info(scan.pages.page_info),
        })
    }

    async fn fetch_detail(
        &self,
        url: &str,
        need: &DetailNeed,
        limits: FetchLimits,
    ) -> Result<DetailResponse, RemoteError> {
        let (query, variables) = detail_query(need);
        let mut vars = Map::new();
        for name in variables {
            let value = match name {
                "url" => json!(url),
                "votesFirst" => json!(limits.vote_page_size),
                "revisionsFirst" => json!(limits.revision_page_size),
                other => return Err(RemoteError::Decode(format!("unknown variable {other}"))),
            };
            vars.insert(name.to_string(), value);
        }

        let data = self
            .client
            .query("page_detail", &query, JsonValue::Object(vars))
            .await?;
        let detail: PageData<DetailNode> = decode(data, "page_detail")?;
        match detail.page {
            Some(node) => Ok(detail_response(url, node)),
            None => {
                warn!(page_url = url, "page disappeared between scan and detail fetch");
                Ok(DetailResponse::default())
            }
        }
    }

    async fn fetch_votes(
        &self,
        url: &str,
        after: Option<&str>,
        first: usize,
    ) -> Result<Connection<VoteRecord>, RemoteError> {
        let data = self
            .client
            .query(
                "page_votes",
                &votes_query(),
                json!({ "url": url, "first": first, "after": after }),
            )
            .await?;
        let page: PageData<VotesOnly> = decode(data, "page_votes")?;
        let mut users = UserCollector::default();
        Ok(page
            .page
            .and_then(|p| p.votes)
            .map(|v| vote_connection(url, v, &mut users))
            .unwrap_or_else(Connection::empty))
    }

    async fn fetch_revisions(
        &self,
        url: &str,
        after: Option<&str>,
        first: usize,
    ) -> Result<Connection<RevisionRecord>, RemoteError> {
        let data = self
            .client
            .query(
                "page_revisions",
                &revisions_query(),
                json!({ "url": url, "first": first, "after": after }),
            )
            .await?;
        let page: PageData<RevisionsOnly> = decode(data, "page_revisions")?;
        let mut users = UserCollector::default();
        Ok(page
            .page
            .and_then(|p| p.revisions)
            .map(|r| revision_connection(url, r, &mut users))
            .unwrap_or_else(Connection::empty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_nodes_decode_into_page_summaries() {
        let data = json!({
            "pages": {
                "edges": [{"node": {
                    "url": "http://wiki/scp-173",
                    "title": "SCP-173",
                    "category": "_default",
                    "tags": ["scp", "euclid"],
                    "rating": 5,
                    "voteCount": 10,
                    "commentCount": 2,
                    "revisionCount": 7,
                    "createdAt": "2008-07-25T20:49:00Z",
                    "createdBy": {"id": "u1", "name": "Moto42"},
                    "thumbnailUrl": null,
                    "attributions": [{"type": "AUTHOR", "user": {"id": "u1"}}]
                }}],
                "pageInfo": {"hasNextPage": true, "endCursor": "c1"}
            }
        });
        let scan: ScanData = decode(data, "scan").expect("decode");
        let info = page_info(scan.pages.page_info);
        let summary = PageSummary::from(scan.pages.edges.into_iter().next().expect("edge").node);
        assert_eq!(summary.vote_count, Some(10));
        assert_eq!(summary.tags, vec!["scp", "euclid"]);
        assert_eq!(summary.created_by.expect("creator").id, "u1");
        assert_eq!(summary.attributions.expect("attributions")[0].kind, "AUTHOR");
        assert!(info.has_next_page);
        assert_eq!(info.end_cursor.as_deref(), Some("c1"));
    }

    #[test]
    fn detail_nodes_only_fill_requested_parts() {
        let node: DetailNode = decode(
            json!({
                "votes": {
                    "edges": [
                        {"node": {
                            "direction": 1,
                            "timestamp": "2026-01-02T00:00:00Z",
                            "user": {"id": "u2", "name": "b"}
                        }},
                        {"node": {
                            "direction": -1,
                            "timestamp": "2026-01-01T00:00:00Z",
                            "user": null
                        }}
                    ],
                    "pageInfo": {"hasNextPage": false, "endCursor": null}
                }
            }),
            "detail",
        )
        .expect("decode");
        let response = detail_response("http://wiki/p", node);
        assert!(response.source.is_none());
        assert!(response.revisions.is_none());
        let votes = response.votes.expect("votes");
        assert_eq!(votes.items.len(), 2);
        assert_eq!(votes.items[1].voter_id, None);
        assert_eq!(response.users.len(), 1);
    }

    #[test]
    fn revision_pages_carry_their_cursor() {
        let page: PageData<RevisionsOnly> = decode(
            json!({
                "page": {"revisions": {
                    "edges": [
                        {"node": {
                            "id": "r9",
                            "number": 9,
                            "timestamp": null,
                            "comment": "fix",
                            "user": {"id": "u1", "name": "a"}
                        }}
                    ],
                    "pageInfo": {"hasNextPage": true, "endCursor": "r9"}
                }}
            }),
            "revisions",
        )
        .expect("decode");
        let mut users = UserCollector::default();
        let connection = revision_connection(
            "http://wiki/p",
            page.page.and_then(|p| p.revisions).expect("revisions"),
            &mut users,
        );
        assert_eq!(connection.items[0].revision_id, "r9");
        assert_eq!(connection.items[0].user_id.as_deref(), Some("u1"));
        assert!(connection.page_info.has_next_page);
        assert_eq!(connection.page_info.end_cursor.as_deref(), Some("r9"));
    }

    #[test]
    fn attribution_order_falls_back_to_position() {
        let node: DetailNode = decode(
            json!({
                "attributions": [
                    {
                        "type": "AUTHOR",
                        "order": null,
                        "date": null,
                        "user": {"id": "u1", "name": "a"}
                    },
                    {"type": "TRANSLATOR", "order": null, "date": null, "user": null}
                ]
            }),
            "detail",
        )
        .expect("decode");
        let attributions = detail_response("http://wiki/p", node)
            .attributions
            .expect("attributions");
        assert_eq!(attributions[0].order, 0);
        assert_eq!(attributions[1].order, 1);
        assert_eq!(attributions[0].user_name.as_deref(), Some("a"));
    }
}
