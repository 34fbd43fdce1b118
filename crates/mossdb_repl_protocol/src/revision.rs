//! Revisions moving through a replication.

use serde_json::{Map, Value};

/// Parses a revision ID of the form `<generation>-<hash>`.
///
/// Returns the generation number and the hash suffix, or `None` when the
/// ID does not match that form.
pub fn parse_rev_id(rev_id: &str) -> Option<(u64, &str)> {
    let (gen, suffix) = rev_id.split_once('-')?;
    let generation: u64 = gen.parse().ok()?;
    if generation == 0 || suffix.is_empty() {
        return None;
    }
    Some((generation, suffix))
}

/// One document edit, as seen by the replication engine.
///
/// A `Revision` is created when a change notification or a local-change
/// event arrives, gains its `properties` body when fetched (pull) or loaded
/// for upload (push), and is discarded once durably applied or uploaded.
///
/// `sequence` is a local monotonic slot: during a pull it is assigned by
/// the sequence tracker, during a push it is the local store's commit
/// sequence. `remote_seq` is the opaque position token supplied by the
/// remote change feed and is only set while pulling.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Revision {
    /// Document ID.
    pub doc_id: String,
    /// Revision ID (`<generation>-<hash>`).
    pub rev_id: String,
    /// Whether this revision is a deletion tombstone.
    pub deleted: bool,
    /// Local monotonic slot or commit sequence.
    pub sequence: u64,
    /// Opaque remote change-feed token (pull only).
    pub remote_seq: Option<String>,
    /// Document body, populated lazily.
    pub properties: Option<Map<String, Value>>,
}

impl Revision {
    /// Creates a new revision without a body.
    pub fn new(doc_id: impl Into<String>, rev_id: impl Into<String>, deleted: bool) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            deleted,
            sequence: 0,
            remote_seq: None,
            properties: None,
        }
    }

    /// Sets the local sequence slot.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Sets the remote change-feed token.
    pub fn with_remote_seq(mut self, token: impl Into<String>) -> Self {
        self.remote_seq = Some(token.into());
        self
    }

    /// Sets the document body.
    pub fn with_properties(mut self, properties: Map<String, Value>) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Returns the generation number of the revision ID, or 0 when the ID
    /// is not of the `<generation>-<hash>` form.
    pub fn generation(&self) -> u64 {
        parse_rev_id(&self.rev_id).map(|(gen, _)| gen).unwrap_or(0)
    }
}

/// An ordered list of revisions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RevisionList {
    revisions: Vec<Revision>,
}

impl RevisionList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self {
            revisions: Vec::new(),
        }
    }

    /// Appends a revision.
    pub fn push(&mut self, revision: Revision) {
        self.revisions.push(revision);
    }

    /// Returns the number of revisions.
    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// Returns the last revision, if any.
    pub fn last(&self) -> Option<&Revision> {
        self.revisions.last()
    }

    /// Iterates over the revisions in order.
    pub fn iter(&self) -> impl Iterator<Item = &Revision> {
        self.revisions.iter()
    }

    /// Returns every revision ID in order.
    pub fn all_rev_ids(&self) -> Vec<String> {
        self.revisions.iter().map(|r| r.rev_id.clone()).collect()
    }

    /// Consumes the list, returning the underlying vector.
    pub fn into_vec(self) -> Vec<Revision> {
        self.revisions
    }
}

impl From<Vec<Revision>> for RevisionList {
    fn from(revisions: Vec<Revision>) -> Self {
        Self { revisions }
    }
}

impl IntoIterator for RevisionList {
    type Item = Revision;
    type IntoIter = std::vec::IntoIter<Revision>;

    fn into_iter(self) -> Self::IntoIter {
        self.revisions.into_iter()
    }
}
