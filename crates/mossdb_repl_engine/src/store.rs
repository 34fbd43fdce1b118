//! Local revision-tree store interface.

use crate::error::{ReplError, ReplResult};
use mossdb_repl_protocol::{Revision, RevisionHistory, RevisionList};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Predicate applied to local revisions before they are pushed.
pub type RevisionFilter = dyn Fn(&Revision) -> bool + Send + Sync;

/// Outcome of a forced revision insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The revision was written into the local revision tree.
    Inserted,
    /// A validation hook rejected the revision; this is final for the
    /// revision but not an engine failure.
    RejectedByValidation,
}

/// The local revision-tree store, as seen by the replication engine.
///
/// The engine never touches storage directly; everything it needs from the
/// local database flows through this trait. Implementations must be safe
/// to call from many threads at once.
pub trait LocalStore: Send + Sync {
    /// Returns true if `id` is acceptable as a document ID.
    fn is_valid_doc_id(&self, id: &str) -> bool;

    /// The database's private identifier, used to derive checkpoint keys.
    fn private_uuid(&self) -> String;

    /// Returns the subset of `revisions` that the store does not have.
    ///
    /// A lookup failure is an `Err`; it is never conflated with "all
    /// missing".
    fn find_missing_revisions(&self, revisions: &[Revision]) -> ReplResult<Vec<Revision>>;

    /// Inserts a pulled revision with its ancestry into the revision tree.
    fn force_insert(
        &self,
        revision: &Revision,
        history: &[String],
        source: &str,
    ) -> ReplResult<InsertOutcome>;

    /// Local revisions committed after `sequence`, in commit order,
    /// optionally filtered.
    fn changes_since(
        &self,
        sequence: u64,
        filter: Option<&RevisionFilter>,
    ) -> ReplResult<RevisionList>;

    /// Loads the full body (including attachments) of a local revision.
    fn load_body(&self, revision: &Revision) -> ReplResult<Revision>;

    /// The ancestor chain of a local revision, for the `_revisions` field.
    fn revision_history(&self, revision: &Revision) -> ReplResult<RevisionHistory>;

    /// Every revision ID the store currently holds for a document.
    fn all_known_rev_ids(&self, doc_id: &str) -> ReplResult<Vec<String>>;

    /// Opens a storage transaction.
    fn begin_transaction(&self) -> ReplResult<()>;

    /// Closes the current transaction, committing or rolling back.
    fn end_transaction(&self, commit: bool) -> ReplResult<()>;

    /// Reads the locally persisted checkpoint for a checkpoint key.
    fn persisted_checkpoint(&self, key: &str) -> ReplResult<Option<String>>;

    /// Persists the checkpoint for a checkpoint key.
    fn persist_checkpoint(&self, key: &str, sequence: &str) -> ReplResult<()>;
}

#[derive(Debug, Clone)]
struct StoredRevision {
    deleted: bool,
    properties: Option<serde_json::Map<String, Value>>,
    history: Vec<String>,
}

#[derive(Default)]
struct StoreInner {
    docs: HashMap<String, HashMap<String, StoredRevision>>,
    changes: Vec<Revision>,
    next_sequence: u64,
    checkpoints: HashMap<String, String>,
    rejected_docs: HashSet<String>,
    failing_docs: HashSet<String>,
    fail_missing_lookup: bool,
    open_transactions: u64,
}

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// An in-memory [`LocalStore`] for tests.
///
/// Documents live in a doc-id → rev-id map; local writes through
/// [`MemoryStore::put_local`] are assigned commit sequences and show up in
/// `changes_since`. Validation rejections and write failures can be
/// injected per document.
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    uuid: String,
}

impl MemoryStore {
    /// Creates an empty store with a unique private UUID.
    pub fn new() -> Self {
        let id = NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Mutex::new(StoreInner {
                next_sequence: 1,
                ..StoreInner::default()
            }),
            uuid: format!("memstore-{id:04}"),
        }
    }

    /// Overrides the private UUID.
    pub fn with_private_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    /// Commits a local revision, assigning it the next commit sequence.
    pub fn put_local(
        &self,
        doc_id: &str,
        rev_id: &str,
        deleted: bool,
        properties: Option<Value>,
    ) -> Revision {
        let mut inner = self.inner.lock();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        let history = {
            let parents = inner
                .docs
                .get(doc_id)
                .map(|revs| revs.keys().cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            let mut history = vec![rev_id.to_string()];
            history.extend(parents);
            history
        };
        inner.docs.entry(doc_id.to_string()).or_default().insert(
            rev_id.to_string(),
            StoredRevision {
                deleted,
                properties: properties.and_then(|v| v.as_object().cloned()),
                history,
            },
        );

        let revision = Revision::new(doc_id, rev_id, deleted).with_sequence(sequence);
        inner.changes.push(revision.clone());
        revision
    }

    /// Makes `force_insert` reject revisions of the given document.
    pub fn reject_doc(&self, doc_id: &str) {
        self.inner.lock().rejected_docs.insert(doc_id.to_string());
    }

    /// Makes `force_insert` fail for revisions of the given document.
    pub fn fail_doc(&self, doc_id: &str) {
        self.inner.lock().failing_docs.insert(doc_id.to_string());
    }

    /// Makes `find_missing_revisions` report a lookup failure.
    pub fn fail_missing_lookup(&self) {
        self.inner.lock().fail_missing_lookup = true;
    }

    /// Returns true if the store holds the given revision.
    pub fn contains_revision(&self, doc_id: &str, rev_id: &str) -> bool {
        self.inner
            .lock()
            .docs
            .get(doc_id)
            .map(|revs| revs.contains_key(rev_id))
            .unwrap_or(false)
    }

    /// Total number of stored revisions.
    pub fn revision_count(&self) -> usize {
        self.inner.lock().docs.values().map(HashMap::len).sum()
    }

    /// All persisted checkpoints, keyed by checkpoint ID.
    pub fn checkpoints(&self) -> HashMap<String, String> {
        self.inner.lock().checkpoints.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for MemoryStore {
    fn is_valid_doc_id(&self, id: &str) -> bool {
        !id.is_empty() && !id.starts_with('_')
    }

    fn private_uuid(&self) -> String {
        self.uuid.clone()
    }

    fn find_missing_revisions(&self, revisions: &[Revision]) -> ReplResult<Vec<Revision>> {
        let inner = self.inner.lock();
        if inner.fail_missing_lookup {
            return Err(ReplError::Store("revision lookup failed".into()));
        }
        Ok(revisions
            .iter()
            .filter(|rev| {
                !inner
                    .docs
                    .get(&rev.doc_id)
                    .map(|revs| revs.contains_key(&rev.rev_id))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    fn force_insert(
        &self,
        revision: &Revision,
        history: &[String],
        _source: &str,
    ) -> ReplResult<InsertOutcome> {
        let mut inner = self.inner.lock();
        if inner.failing_docs.contains(&revision.doc_id) {
            return Err(ReplError::Store(format!(
                "write failed for {}",
                revision.doc_id
            )));
        }
        if inner.rejected_docs.contains(&revision.doc_id) {
            return Ok(InsertOutcome::RejectedByValidation);
        }
        inner
            .docs
            .entry(revision.doc_id.clone())
            .or_default()
            .insert(
                revision.rev_id.clone(),
                StoredRevision {
                    deleted: revision.deleted,
                    properties: revision.properties.clone(),
                    history: history.to_vec(),
                },
            );
        Ok(InsertOutcome::Inserted)
    }

    fn changes_since(
        &self,
        sequence: u64,
        filter: Option<&RevisionFilter>,
    ) -> ReplResult<RevisionList> {
        let inner = self.inner.lock();
        let revisions: Vec<Revision> = inner
            .changes
            .iter()
            .filter(|rev| rev.sequence > sequence)
            .filter(|rev| filter.map(|f| f(rev)).unwrap_or(true))
            .cloned()
            .collect();
        Ok(revisions.into())
    }

    fn load_body(&self, revision: &Revision) -> ReplResult<Revision> {
        let inner = self.inner.lock();
        let stored = inner
            .docs
            .get(&revision.doc_id)
            .and_then(|revs| revs.get(&revision.rev_id))
            .ok_or_else(|| {
                ReplError::Store(format!(
                    "revision not found: {} {}",
                    revision.doc_id, revision.rev_id
                ))
            })?;

        let mut properties = stored.properties.clone().unwrap_or_default();
        properties.insert("_id".into(), json!(revision.doc_id));
        properties.insert("_rev".into(), json!(revision.rev_id));
        if stored.deleted {
            properties.insert("_deleted".into(), json!(true));
        }
        Ok(revision.clone().with_properties(properties))
    }

    fn revision_history(&self, revision: &Revision) -> ReplResult<RevisionHistory> {
        let inner = self.inner.lock();
        let stored = inner
            .docs
            .get(&revision.doc_id)
            .and_then(|revs| revs.get(&revision.rev_id))
            .ok_or_else(|| {
                ReplError::Store(format!(
                    "revision not found: {} {}",
                    revision.doc_id, revision.rev_id
                ))
            })?;
        Ok(RevisionHistory::from_rev_ids(&stored.history))
    }

    fn all_known_rev_ids(&self, doc_id: &str) -> ReplResult<Vec<String>> {
        let inner = self.inner.lock();
        let mut ids: Vec<String> = inner
            .docs
            .get(doc_id)
            .map(|revs| revs.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    fn begin_transaction(&self) -> ReplResult<()> {
        self.inner.lock().open_transactions += 1;
        Ok(())
    }

    fn end_transaction(&self, _commit: bool) -> ReplResult<()> {
        let mut inner = self.inner.lock();
        if inner.open_transactions == 0 {
            return Err(ReplError::Store("no open transaction".into()));
        }
        inner.open_transactions -= 1;
        Ok(())
    }

    fn persisted_checkpoint(&self, key: &str) -> ReplResult<Option<String>> {
        Ok(self.inner.lock().checkpoints.get(key).cloned())
    }

    fn persist_checkpoint(&self, key: &str, sequence: &str) -> ReplResult<()> {
        self.inner
            .lock()
            .checkpoints
            .insert(key.to_string(), sequence.to_string());
        Ok(())
    }
}
