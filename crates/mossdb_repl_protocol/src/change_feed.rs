//! Rows of the remote change feed.

use serde_json::Value;

/// One row of the remote `_changes` feed.
///
/// A row carries the remote sequence token, the document ID, the deletion
/// flag, and one revision ID per conflicting branch the remote currently
/// holds for that document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    /// Opaque remote sequence token for this row.
    pub seq: String,
    /// Document ID.
    pub doc_id: String,
    /// Whether the document is deleted at this position.
    pub deleted: bool,
    /// Revision IDs listed for this row, one per branch.
    pub rev_ids: Vec<String>,
}

impl ChangeEntry {
    /// Creates a new entry with no revisions.
    pub fn new(seq: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            seq: seq.into(),
            doc_id: doc_id.into(),
            deleted: false,
            rev_ids: Vec::new(),
        }
    }

    /// Adds a revision ID.
    pub fn with_rev(mut self, rev_id: impl Into<String>) -> Self {
        self.rev_ids.push(rev_id.into());
        self
    }

    /// Marks the entry as a deletion.
    pub fn with_deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Parses a feed row from its JSON form.
    ///
    /// The parse is tolerant: `seq` may be an integer or a string, rows
    /// without a usable `id` yield `None`, and `changes` elements without a
    /// `rev` field are skipped.
    pub fn from_json(value: &Value) -> Option<Self> {
        let seq = match value.get("seq") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return None,
        };
        let doc_id = value.get("id")?.as_str()?;
        if doc_id.is_empty() {
            return None;
        }
        let deleted = value
            .get("deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let rev_ids = value
            .get("changes")
            .and_then(Value::as_array)
            .map(|changes| {
                changes
                    .iter()
                    .filter_map(|c| c.get("rev").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            seq,
            doc_id: doc_id.to_string(),
            deleted,
            rev_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_basic_row() {
        let row = json!({
            "seq": "12-abc",
            "id": "doc1",
            "changes": [{"rev": "1-aaa"}, {"rev": "1-bbb"}]
        });
        let entry = ChangeEntry::from_json(&row).unwrap();
        assert_eq!(entry.seq, "12-abc");
        assert_eq!(entry.doc_id, "doc1");
        assert!(!entry.deleted);
        assert_eq!(entry.rev_ids, vec!["1-aaa".to_string(), "1-bbb".into()]);
    }

    #[test]
    fn parse_integer_seq() {
        let row = json!({"seq": 42, "id": "doc1", "changes": [{"rev": "1-a"}]});
        let entry = ChangeEntry::from_json(&row).unwrap();
        assert_eq!(entry.seq, "42");
    }

    #[test]
    fn parse_deleted_row() {
        let row = json!({
            "seq": 7,
            "id": "gone",
            "deleted": true,
            "changes": [{"rev": "3-x"}]
        });
        let entry = ChangeEntry::from_json(&row).unwrap();
        assert!(entry.deleted);
    }

    #[test]
    fn rows_without_id_are_skipped() {
        assert!(ChangeEntry::from_json(&json!({"seq": 1})).is_none());
        assert!(ChangeEntry::from_json(&json!({"seq": 1, "id": ""})).is_none());
        assert!(ChangeEntry::from_json(&json!({"id": "doc1"})).is_none());
    }

    #[test]
    fn changes_without_rev_are_skipped() {
        let row = json!({
            "seq": 3,
            "id": "doc1",
            "changes": [{"rev": "1-a"}, {"other": true}]
        });
        let entry = ChangeEntry::from_json(&row).unwrap();
        assert_eq!(entry.rev_ids, vec!["1-a".to_string()]);
    }

    #[test]
    fn builder_round_trip() {
        let entry = ChangeEntry::new("5", "doc1").with_rev("1-a").with_deleted();
        assert_eq!(entry.seq, "5");
        assert!(entry.deleted);
        assert_eq!(entry.rev_ids.len(), 1);
    }
}
