//! Push engine: local → remote.
//!
//! Local changes are batched, diffed against the remote's known revisions
//! through `_revs_diff`, and the missing ones uploaded with `_bulk_docs`
//! under `new_edits: false` so the remote keeps the local revision IDs.
//! The checkpoint advances to the last local sequence of the whole batch,
//! whether or not anything needed uploading.

use crate::config::{Direction, ReplicatorConfig};
use crate::replicator::ReplicatorInner;
use crate::store::RevisionFilter;
use crate::transport::Method;
use mossdb_repl_protocol::{
    BulkDocsRequest, BulkDocsResponse, Revision, RevsDiffRequest, RevsDiffResponse,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) struct PushState {
    /// Create the remote database before the first push, then clear.
    pub create_target: bool,
    /// True while a continuous push accepts live local changes.
    pub observing: bool,
    /// Local predicate applied before queueing a revision.
    pub filter: Option<Arc<RevisionFilter>>,
}

impl PushState {
    pub(crate) fn new(config: &ReplicatorConfig) -> Self {
        Self {
            create_target: config.create_target,
            observing: false,
            filter: None,
        }
    }
}

impl ReplicatorInner {
    /// Creates the remote database when `create_target` is set. 412 means
    /// it already exists, which is fine; any other failure stops the
    /// replicator. On success `begin_replicating` runs again with the flag
    /// cleared.
    pub(crate) fn maybe_create_remote_db(self: &Arc<Self>) {
        if self.config.direction != Direction::Push {
            return;
        }
        if !self.push.lock().create_target {
            return;
        }
        info!("remote database may not exist; creating it");
        self.async_task_started();
        self.send_async_request(Method::Put, "", None, |inner, result| {
            match result {
                Err(err) if err.status() != Some(412) => {
                    warn!(error = %err, "failed to create remote database");
                    inner.record_error(err);
                    inner.stop();
                }
                _ => {
                    debug!("remote database ready");
                    inner.push.lock().create_target = false;
                    inner.begin_replicating();
                }
            }
            inner.async_task_finished(1);
        });
    }

    pub(crate) fn begin_pushing(self: &Arc<Self>) {
        // Still waiting on the remote database: begin_replicating runs
        // again from the create completion.
        if self.push.lock().create_target {
            return;
        }

        let since = self
            .checkpoint
            .lock()
            .last_sequence
            .as_deref()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let filter = self.push.lock().filter.clone();
        let changes = match self.store.changes_since(since, filter.as_deref()) {
            Ok(changes) => changes,
            Err(err) => {
                self.record_error(err);
                self.stop();
                return;
            }
        };
        info!(since, count = changes.len(), "pushing local changes");
        for revision in changes {
            self.add_to_inbox(revision);
        }

        if self.config.continuous {
            let start_observing = {
                let mut push = self.push.lock();
                !std::mem::replace(&mut push.observing, true)
            };
            if start_observing {
                // Holds the replicator open for live changes.
                self.async_task_started();
            }
        }
    }

    /// Accepts one live local change into a running continuous push.
    pub(crate) fn local_change(self: &Arc<Self>, revision: Revision, source: Option<&str>) {
        if self.config.direction != Direction::Push {
            return;
        }
        {
            let st = self.state.lock();
            if !st.running {
                return;
            }
        }
        if !self.push.lock().observing {
            return;
        }
        // Skip revisions that originally came from the database we are
        // pushing to.
        if source == Some(self.config.remote_url.as_str()) {
            debug!(doc = %revision.doc_id, "skipping echo of remote-origin revision");
            return;
        }
        let filter = self.push.lock().filter.clone();
        if let Some(filter) = filter {
            if !filter(&revision) {
                return;
            }
        }
        self.add_to_inbox(revision);
    }

    pub(crate) fn push_stop_observing(self: &Arc<Self>) {
        let was_observing = {
            let mut push = self.push.lock();
            std::mem::replace(&mut push.observing, false)
        };
        if was_observing {
            self.async_task_finished(1);
        }
    }

    /// Processes one inbox batch of local revisions: diff against the
    /// remote, then upload whatever it is missing.
    pub(crate) fn process_push_inbox(self: &Arc<Self>, batch: Vec<Revision>) {
        let n = batch.len() as u64;
        let last_inbox_sequence = batch.last().map(|rev| rev.sequence).unwrap_or(0);

        let mut diffs = RevsDiffRequest::new();
        for revision in &batch {
            diffs.add(&revision.doc_id, &revision.rev_id);
        }
        let body = match serde_json::to_value(&diffs) {
            Ok(body) => body,
            Err(err) => {
                self.record_error(crate::error::ReplError::Protocol(err.to_string()));
                self.async_task_finished(n);
                self.stop();
                return;
            }
        };

        self.async_task_started();
        self.send_async_request(Method::Post, "/_revs_diff", Some(body), move |inner, result| {
            match result {
                Err(err) => {
                    // Push cannot safely skip a diff step.
                    inner.record_error(err);
                    inner.stop();
                }
                Ok(value) => match RevsDiffResponse::from_value(value) {
                    Err(err) => {
                        inner.record_error(err.into());
                        inner.stop();
                    }
                    Ok(response) => {
                        inner.upload_missing_revisions(&batch, &response, last_inbox_sequence);
                    }
                },
            }
            inner.async_task_finished(1);
        });
        self.async_task_finished(n);
    }

    /// Uploads the revisions `_revs_diff` reported missing. A batch with
    /// nothing missing still advances the checkpoint to its last local
    /// sequence.
    fn upload_missing_revisions(
        self: &Arc<Self>,
        batch: &[Revision],
        diffs: &RevsDiffResponse,
        last_inbox_sequence: u64,
    ) {
        let mut docs: Vec<Value> = Vec::new();
        for revision in batch {
            if !diffs.is_missing(&revision.doc_id, &revision.rev_id) {
                continue;
            }
            let mut properties = if revision.deleted {
                // Deletions need no stored body; synthesize the tombstone.
                let mut map = serde_json::Map::new();
                map.insert("_id".into(), json!(revision.doc_id));
                map.insert("_rev".into(), json!(revision.rev_id));
                map.insert("_deleted".into(), json!(true));
                map
            } else {
                match self.store.load_body(revision) {
                    Ok(loaded) => match loaded.properties {
                        Some(properties) => properties,
                        None => {
                            warn!(doc = %revision.doc_id, rev = %revision.rev_id, "local revision has no body");
                            continue;
                        }
                    },
                    Err(err) => {
                        warn!(doc = %revision.doc_id, rev = %revision.rev_id, error = %err, "could not load local revision body");
                        continue;
                    }
                }
            };
            match self.store.revision_history(revision) {
                Ok(history) => {
                    if let Ok(value) = serde_json::to_value(&history) {
                        properties.insert("_revisions".into(), value);
                    }
                }
                Err(err) => {
                    warn!(doc = %revision.doc_id, error = %err, "could not read revision history");
                }
            }
            docs.push(Value::Object(properties));
        }

        if docs.is_empty() {
            // The remote already has everything in this batch.
            debug!("no revisions new to the remote");
            self.note_sequence(&last_inbox_sequence.to_string());
            return;
        }

        let count = docs.len() as u64;
        info!(count, "sending revisions to remote");
        self.bump_changes_total(count);
        let request = BulkDocsRequest::new(docs);
        let body = match serde_json::to_value(&request) {
            Ok(body) => body,
            Err(err) => {
                self.record_error(crate::error::ReplError::Protocol(err.to_string()));
                return;
            }
        };

        self.async_task_started();
        self.send_async_request(Method::Post, "/_bulk_docs", Some(body), move |inner, result| {
            match result {
                Ok(value) => {
                    if let Ok(response) = BulkDocsResponse::from_value(value) {
                        for item in response.errors() {
                            warn!(doc = %item.id, error = ?item.error, "remote rejected revision");
                        }
                    }
                    inner.note_sequence(&last_inbox_sequence.to_string());
                }
                Err(err) => {
                    // The checkpoint stays put so these revisions retry.
                    inner.record_error(err);
                }
            }
            inner.bump_changes_processed(count);
            inner.async_task_finished(1);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicatorConfig;
    use crate::replicator::Replicator;
    use crate::store::MemoryStore;
    use crate::transport::MockTransport;
    use std::time::Duration;

    fn fast_push_config() -> ReplicatorConfig {
        ReplicatorConfig::push("http://host/db")
            .with_inbox_delay(Duration::from_millis(5))
            .with_checkpoint_save_delay(Duration::from_millis(5))
    }

    #[test]
    fn tombstones_are_synthesized_for_deleted_revisions() {
        let store = Arc::new(MemoryStore::new());
        store.put_local("doc1", "1-a", false, Some(json!({"v": 1})));
        store.put_local("doc1", "2-b", true, None);

        let transport = Arc::new(MockTransport::new());
        transport.set_response(
            Method::Post,
            "/_revs_diff",
            json!({"doc1": {"missing": ["2-b"]}}),
        );
        transport.set_response(Method::Post, "/_bulk_docs", json!([]));
        transport.set_response(Method::Put, "/_local/", json!({"ok": true, "rev": "0-1"}));

        let repl = Replicator::new(fast_push_config(), store, transport.clone());
        repl.start();
        assert!(repl.wait_until_stopped(Duration::from_secs(10)));

        let bulk = transport.requests_matching(Method::Post, "/_bulk_docs");
        assert_eq!(bulk.len(), 1);
        let docs = bulk[0].body.as_ref().unwrap()["docs"].as_array().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["_id"], json!("doc1"));
        assert_eq!(docs[0]["_rev"], json!("2-b"));
        assert_eq!(docs[0]["_deleted"], json!(true));
        assert!(docs[0]["_revisions"].is_object());
        assert_eq!(bulk[0].body.as_ref().unwrap()["new_edits"], json!(false));
    }

    #[test]
    fn push_filter_limits_the_backlog() {
        let store = Arc::new(MemoryStore::new());
        store.put_local("keep", "1-a", false, Some(json!({"v": 1})));
        store.put_local("drop", "1-b", false, Some(json!({"v": 2})));

        let transport = Arc::new(MockTransport::new());
        transport.set_response(Method::Post, "/_revs_diff", json!({}));
        transport.set_response(Method::Put, "/_local/", json!({"ok": true, "rev": "0-1"}));

        let repl = Replicator::new(fast_push_config(), store, transport.clone());
        repl.set_push_filter(Arc::new(|rev: &Revision| rev.doc_id == "keep"));
        repl.start();
        assert!(repl.wait_until_stopped(Duration::from_secs(10)));

        let diffs = transport.requests_matching(Method::Post, "/_revs_diff");
        assert_eq!(diffs.len(), 1);
        let body = diffs[0].body.as_ref().unwrap();
        assert!(body.get("keep").is_some());
        assert!(body.get("drop").is_none());
    }

    #[test]
    fn revs_diff_failure_stops_the_replicator() {
        let store = Arc::new(MemoryStore::new());
        store.put_local("doc1", "1-a", false, Some(json!({"v": 1})));

        let transport = Arc::new(MockTransport::new());
        transport.set_error(
            Method::Post,
            "/_revs_diff",
            crate::error::ReplError::from_status(500, "boom"),
        );

        let repl = Replicator::new(fast_push_config(), store, transport);
        repl.start();
        assert!(repl.wait_until_stopped(Duration::from_secs(10)));
        assert!(repl.error().is_some());
        assert_eq!(repl.last_sequence(), None);
    }

    #[test]
    fn bulk_docs_failure_keeps_the_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        store.put_local("doc1", "1-a", false, Some(json!({"v": 1})));

        let transport = Arc::new(MockTransport::new());
        transport.set_response(
            Method::Post,
            "/_revs_diff",
            json!({"doc1": {"missing": ["1-a"]}}),
        );
        transport.set_error(
            Method::Post,
            "/_bulk_docs",
            crate::error::ReplError::from_status(503, "unavailable"),
        );

        let repl = Replicator::new(fast_push_config(), store, transport);
        repl.start();
        assert!(repl.wait_until_stopped(Duration::from_secs(10)));
        assert!(repl.error().is_some());
        // Not advanced: the same revisions will retry next run.
        assert_eq!(repl.last_sequence(), None);
    }
}
