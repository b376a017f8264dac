//! GraphQL documents. Detail queries are assembled per need-set so that only the flagged
//! sub-resources are selected and transmitted.

use wikisync_core::DetailNeed;

const USER_FIELDS: &str = "id name";

pub fn scan_query() -> String {
    format!(
        "query ScanPages($first: Int!, $after: ID) {{ \
           pages(first: $first, after: $after) {{ \
             edges {{ node {{ \
               url title category tags rating voteCount commentCount revisionCount \
               createdAt createdBy {{ {USER_FIELDS} }} thumbnailUrl \
               attributions {{ type user {{ id }} }} \
             }} }} \
             pageInfo {{ hasNextPage endCursor }} \
           }} \
         }}"
    )
}

fn vote_selection(args: &str) -> String {
    format!(
        "votes({args}) {{ \
           edges {{ node {{ direction timestamp user {{ {USER_FIELDS} }} }} }} \
           pageInfo {{ hasNextPage endCursor }} \
         }}"
    )
}

fn revision_selection(args: &str) -> String {
    format!(
        "revisions({args}) {{ \
           edges {{ node {{ id number timestamp comment user {{ {USER_FIELDS} }} }} }} \
           pageInfo {{ hasNextPage endCursor }} \
         }}"
    )
}

/// Selective detail query plus the names of the variables it declares.
pub fn detail_query(need: &DetailNeed) -> (String, Vec<&'static str>) {
    let mut declared = vec!["$url: URL!".to_string()];
    let mut variables = vec!["url"];
    let mut selections = Vec::new();

    if need.needs_source {
        selections.push("source".to_string());
    }
    if need.needs_voting {
        declared.push("$votesFirst: Int!".to_string());
        variables.push("votesFirst");
        selections.push(vote_selection("first: $votesFirst"));
    }
    if need.needs_revisions {
        declared.push("$revisionsFirst: Int!".to_string());
        variables.push("revisionsFirst");
        selections.push(revision_selection("first: $revisionsFirst"));
    }
    if need.needs_attributions {
        selections.push(format!(
            "attributions {{ type order date user {{ {USER_FIELDS} }} }}"
        ));
    }
    if need.needs_alternate_titles {
        selections.push("alternateTitles { title language }".to_string());
    }
    if selections.is_empty() {
        selections.push("url".to_string());
    }

    let query = format!(
        "query PageDetail({}) {{ page(url: $url) {{ {} }} }}",
        declared.join(", "),
        selections.join(" ")
    );
    (query, variables)
}

pub fn votes_query() -> String {
    format!(
        "query PageVotes($url: URL!, $first: Int!, $after: ID) {{ page(url: $url) {{ {} }} }}",
        vote_selection("first: $first, after: $after")
    )
}

pub fn revisions_query() -> String {
    format!(
        "query PageRevisions($url: URL!, $first: Int!, $after: ID) {{ page(url: $url) {{ {} }} }}",
        revision_selection("first: $first, after: $after")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wikisync_core::ChangeTag;

    #[test]
    fn voting_only_query_skips_other_sub_resources() {
        let (query, vars) = detail_query(&DetailNeed::for_tag(ChangeTag::VotingChanged));
        assert!(query.contains("votes(first: $votesFirst)"));
        assert!(!query.contains("source"));
        assert!(!query.contains("revisions"));
        assert!(!query.contains("attributions"));
        assert_eq!(vars, vec!["url", "votesFirst"]);
    }

    #[test]
    fn full_need_selects_everything_and_declares_only_used_variables() {
        let (query, vars) = detail_query(&DetailNeed::all("new"));
        for part in ["source", "votes(", "revisions(", "attributions {", "alternateTitles"] {
            assert!(query.contains(part), "missing {part}");
        }
        assert_eq!(vars, vec!["url", "votesFirst", "revisionsFirst"]);
        assert!(query.contains("$revisionsFirst: Int!"));
    }

    #[test]
    fn empty_need_still_produces_a_valid_selection() {
        let (query, vars) = detail_query(&DetailNeed::default());
        assert!(query.contains("page(url: $url) { url }"));
        assert_eq!(vars, vec!["url"]);
    }

    #[test]
    fn revision_continuation_is_cursor_paginated() {
        let query = revisions_query();
        assert!(query.contains("revisions(first: $first, after: $after)"));
        assert!(query.contains("pageInfo { hasNextPage endCursor }"));
        let (detail, _) = detail_query(&DetailNeed::for_tag(ChangeTag::RevisionChanged));
        assert!(detail.contains("revisions(first: $revisionsFirst) { edges"));
        assert!(detail.contains("pageInfo"));
    }

    #[test]
    fn scan_query_uses_cursor_pagination() {
        let query = scan_query();
        assert!(query.contains("pages(first: $first, after: $after)"));
        assert!(query.contains("pageInfo { hasNextPage endCursor }"));
    }
}
