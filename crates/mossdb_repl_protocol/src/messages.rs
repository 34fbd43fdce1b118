//! Wire bodies for the replication protocol endpoints.

use crate::error::ProtocolResult;
use crate::revision::parse_rev_id;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Request body for `_revs_diff`: per document, the candidate revision IDs
/// the caller holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevsDiffRequest {
    /// Candidate revision IDs keyed by document ID.
    pub docs: BTreeMap<String, Vec<String>>,
}

impl RevsDiffRequest {
    /// Creates an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a candidate revision for a document.
    pub fn add(&mut self, doc_id: &str, rev_id: &str) {
        self.docs
            .entry(doc_id.to_string())
            .or_default()
            .push(rev_id.to_string());
    }

    /// Returns true if no candidates were added.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// Per-document entry of a `_revs_diff` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissingRevs {
    /// Revision IDs the remote does not have.
    #[serde(default)]
    pub missing: Vec<String>,
    /// Revisions the remote suggests as ancestors for delta uploads.
    #[serde(default, rename = "possible_ancestors")]
    pub possible_ancestors: Vec<String>,
}

/// Response body for `_revs_diff`: per document, the subset of candidate
/// revisions the remote is missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevsDiffResponse {
    /// Missing-revision entries keyed by document ID.
    pub docs: BTreeMap<String, MissingRevs>,
}

impl RevsDiffResponse {
    /// Parses a response from its JSON form.
    pub fn from_value(value: Value) -> ProtocolResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Returns true if the remote reported the given revision as missing.
    pub fn is_missing(&self, doc_id: &str, rev_id: &str) -> bool {
        self.docs
            .get(doc_id)
            .map(|entry| entry.missing.iter().any(|r| r == rev_id))
            .unwrap_or(false)
    }

    /// Total number of missing revisions across all documents.
    pub fn total_missing(&self) -> usize {
        self.docs.values().map(|entry| entry.missing.len()).sum()
    }
}

/// Request body for `_bulk_docs`.
///
/// `new_edits` is false for replication uploads: the remote must accept the
/// supplied revision IDs verbatim so the revision trees stay equivalent
/// across peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkDocsRequest {
    /// Documents to store, each carrying `_id`, `_rev` and `_revisions`.
    pub docs: Vec<Value>,
    /// Whether the remote may assign new revision IDs.
    pub new_edits: bool,
}

impl BulkDocsRequest {
    /// Creates a replication upload request (`new_edits: false`).
    pub fn new(docs: Vec<Value>) -> Self {
        Self {
            docs,
            new_edits: false,
        }
    }
}

/// Per-document result of a `_bulk_docs` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkDocsResult {
    /// Document ID.
    #[serde(default)]
    pub id: String,
    /// Stored revision ID, when successful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Error name, when the document was rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Response body for `_bulk_docs`: one result per document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkDocsResponse {
    /// Per-document results in request order.
    pub results: Vec<BulkDocsResult>,
}

impl BulkDocsResponse {
    /// Parses a response from its JSON form (an array of results).
    pub fn from_value(value: Value) -> ProtocolResult<Self> {
        let results = serde_json::from_value(value)?;
        Ok(Self { results })
    }

    /// Iterates over the results that carry an error.
    pub fn errors(&self) -> impl Iterator<Item = &BulkDocsResult> {
        self.results.iter().filter(|r| r.error.is_some())
    }
}

/// Body of the `_local` checkpoint document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointBody {
    /// Remote document revision, for optimistic-concurrency writes.
    #[serde(default, rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// The persisted progress token.
    #[serde(default, rename = "lastSequence", skip_serializing_if = "Option::is_none")]
    pub last_sequence: Option<String>,
}

impl CheckpointBody {
    /// Creates a body carrying the given progress token.
    pub fn new(last_sequence: impl Into<String>) -> Self {
        Self {
            rev: None,
            last_sequence: Some(last_sequence.into()),
        }
    }

    /// Parses a checkpoint document from its JSON form.
    pub fn from_value(value: Value) -> ProtocolResult<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// User context reported by `_session`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    /// Authenticated user name, or null for anonymous sessions.
    #[serde(default)]
    pub name: Option<String>,
}

/// Response body of the `_session` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// The session's user context.
    #[serde(default, rename = "userCtx")]
    pub user_ctx: UserContext,
}

impl SessionInfo {
    /// Parses a session response from its JSON form.
    pub fn from_value(value: Value) -> ProtocolResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Returns the authenticated user name, if the session is logged in.
    pub fn authenticated_user(&self) -> Option<&str> {
        self.user_ctx.name.as_deref().filter(|n| !n.is_empty())
    }
}

/// The `_revisions` ancestry encoding: the starting generation and the hash
/// suffixes of the ancestor chain, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevisionHistory {
    /// Generation of the newest revision in `ids`.
    pub start: u64,
    /// Hash suffixes, newest first.
    pub ids: Vec<String>,
}

impl RevisionHistory {
    /// Builds a history from full revision IDs, newest first.
    ///
    /// IDs that do not parse keep their whole text as the suffix; the start
    /// generation comes from the first ID, falling back to the chain length.
    pub fn from_rev_ids(rev_ids: &[String]) -> Self {
        let start = rev_ids
            .first()
            .and_then(|r| parse_rev_id(r))
            .map(|(gen, _)| gen)
            .unwrap_or(rev_ids.len() as u64);
        let ids = rev_ids
            .iter()
            .map(|r| {
                parse_rev_id(r)
                    .map(|(_, suffix)| suffix.to_string())
                    .unwrap_or_else(|| r.clone())
            })
            .collect();
        Self { start, ids }
    }

    /// Expands the history back into full revision IDs, newest first.
    pub fn to_rev_ids(&self) -> Vec<String> {
        self.ids
            .iter()
            .enumerate()
            .filter_map(|(i, id)| {
                self.start
                    .checked_sub(i as u64)
                    .filter(|gen| *gen > 0)
                    .map(|gen| format!("{gen}-{id}"))
            })
            .collect()
    }

    /// Extracts the full revision history from a fetched document body
    /// (its `_revisions` field), newest first.
    ///
    /// Returns `None` when the body carries no parsable history.
    pub fn parse_document_history(properties: &Value) -> Option<Vec<String>> {
        let revisions = properties.get("_revisions")?;
        let history: RevisionHistory = serde_json::from_value(revisions.clone()).ok()?;
        if history.ids.is_empty() {
            return None;
        }
        let rev_ids = history.to_rev_ids();
        if rev_ids.is_empty() {
            return None;
        }
        Some(rev_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn revs_diff_request_groups_by_document() {
        let mut request = RevsDiffRequest::new();
        request.add("doc1", "1-a");
        request.add("doc1", "1-b");
        request.add("doc2", "2-c");

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"doc1": ["1-a", "1-b"], "doc2": ["2-c"]})
        );
    }

    #[test]
    fn revs_diff_response_lookup() {
        let value = json!({
            "doc1": {"missing": ["1-a"], "possible_ancestors": ["1-x"]},
            "doc2": {"missing": []}
        });
        let response = RevsDiffResponse::from_value(value).unwrap();

        assert!(response.is_missing("doc1", "1-a"));
        assert!(!response.is_missing("doc1", "1-b"));
        assert!(!response.is_missing("doc3", "1-a"));
        assert_eq!(response.total_missing(), 1);
    }

    #[test]
    fn empty_revs_diff_response() {
        let response = RevsDiffResponse::from_value(json!({})).unwrap();
        assert_eq!(response.total_missing(), 0);
    }

    #[test]
    fn bulk_docs_request_pins_new_edits_false() {
        let request = BulkDocsRequest::new(vec![json!({"_id": "d", "_rev": "1-a"})]);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["new_edits"], json!(false));
        assert_eq!(value["docs"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn bulk_docs_response_errors() {
        let value = json!([
            {"id": "d1", "rev": "1-a"},
            {"id": "d2", "error": "forbidden", "reason": "no"}
        ]);
        let response = BulkDocsResponse::from_value(value).unwrap();
        let errors: Vec<_> = response.errors().collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].id, "d2");
    }

    #[test]
    fn checkpoint_body_round_trip() {
        let mut body = CheckpointBody::new("42");
        body.rev = Some("0-1".into());
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value, json!({"_rev": "0-1", "lastSequence": "42"}));

        let parsed = CheckpointBody::from_value(value).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn checkpoint_body_tolerates_extra_fields_absent() {
        let parsed = CheckpointBody::from_value(json!({})).unwrap();
        assert!(parsed.rev.is_none());
        assert!(parsed.last_sequence.is_none());
    }

    #[test]
    fn session_info_authenticated_user() {
        let info = SessionInfo::from_value(json!({"userCtx": {"name": "alice"}})).unwrap();
        assert_eq!(info.authenticated_user(), Some("alice"));

        let info = SessionInfo::from_value(json!({"userCtx": {"name": null}})).unwrap();
        assert_eq!(info.authenticated_user(), None);

        let info = SessionInfo::from_value(json!({})).unwrap();
        assert_eq!(info.authenticated_user(), None);
    }

    #[test]
    fn revision_history_round_trip() {
        let rev_ids = vec!["3-ccc".to_string(), "2-bbb".into(), "1-aaa".into()];
        let history = RevisionHistory::from_rev_ids(&rev_ids);
        assert_eq!(history.start, 3);
        assert_eq!(
            history.ids,
            vec!["ccc".to_string(), "bbb".into(), "aaa".into()]
        );
        assert_eq!(history.to_rev_ids(), rev_ids);
    }

    #[test]
    fn parse_document_history() {
        let doc = json!({
            "_id": "doc1",
            "_rev": "2-bbb",
            "_revisions": {"start": 2, "ids": ["bbb", "aaa"]}
        });
        let history = RevisionHistory::parse_document_history(&doc).unwrap();
        assert_eq!(history, vec!["2-bbb".to_string(), "1-aaa".into()]);
    }

    #[test]
    fn parse_document_history_missing_or_empty() {
        assert!(RevisionHistory::parse_document_history(&json!({"_id": "d"})).is_none());
        let doc = json!({"_revisions": {"start": 0, "ids": []}});
        assert!(RevisionHistory::parse_document_history(&doc).is_none());
    }

    #[test]
    fn history_expansion_stops_at_generation_one() {
        let history = RevisionHistory {
            start: 2,
            ids: vec!["bb".into(), "aa".into(), "zz".into()],
        };
        // The third suffix would need generation 0; it is dropped.
        assert_eq!(
            history.to_rev_ids(),
            vec!["2-bb".to_string(), "1-aa".into()]
        );
    }
}
