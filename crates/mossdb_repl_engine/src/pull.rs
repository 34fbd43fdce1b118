//! Pull engine: remote → local.
//!
//! Change notifications are slotted into the sequence tracker, checked
//! against the local store in bulk, fetched with a bounded number of
//! concurrent GETs, and inserted in slot order in batched transactions.
//! The checkpoint only ever advances through the tracker's contiguous
//! completed prefix.

use crate::batcher::Batcher;
use crate::error::ReplError;
use crate::events::ReplicatorState;
use crate::feed::{FeedMode, FeedSink};
use crate::replicator::ReplicatorInner;
use crate::sequence::SequenceTracker;
use crate::store::InsertOutcome;
use crate::transport::Method;
use mossdb_repl_protocol::{ChangeEntry, Revision, RevisionHistory};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, info, warn};

/// A fetched revision with its parsed ancestry, waiting for insertion.
pub(crate) type PendingInsert = (Revision, Vec<String>);

pub(crate) struct PullState {
    /// Revisions waiting for a fetch slot. Mutated under the pull mutex;
    /// network calls never run while it is held.
    pub revs_to_pull: VecDeque<Revision>,
    pub tracker: SequenceTracker,
    /// Batches fetched revisions into single local-store transactions.
    pub inserts: Option<Arc<Batcher<PendingInsert>>>,
    pub http_connection_count: usize,
    /// True between feed start and the terminal feed event.
    pub feed_active: bool,
}

impl PullState {
    pub(crate) fn new() -> Self {
        Self {
            revs_to_pull: VecDeque::new(),
            tracker: SequenceTracker::new(),
            inserts: None,
            http_connection_count: 0,
            feed_active: false,
        }
    }
}

/// Routes feed callbacks to the replicator without keeping it alive.
pub(crate) struct FeedRelay {
    inner: Weak<ReplicatorInner>,
}

impl FeedSink for FeedRelay {
    fn change_received(&self, entry: ChangeEntry) {
        if let Some(inner) = self.inner.upgrade() {
            inner.change_received(entry);
        }
    }

    fn feed_stopped(&self, error: Option<ReplError>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.feed_stopped(error);
        }
    }
}

/// Percent-encodes a URI path or query component.
fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

impl ReplicatorInner {
    pub(crate) fn begin_pulling(self: &Arc<Self>) {
        let Some(feed) = self.feed.read().clone() else {
            self.record_error(ReplError::Protocol(
                "pull replication requires a change feed".into(),
            ));
            self.stop();
            return;
        };

        let since = self.checkpoint.lock().last_sequence.clone();
        {
            let weak = Arc::downgrade(self);
            let mut pull = self.pull.lock();
            if pull.tracker.is_empty() {
                if let Some(since) = &since {
                    pull.tracker.set_baseline(since.clone());
                }
            }
            if pull.inserts.is_none() {
                pull.inserts = Some(Arc::new(Batcher::new(
                    self.config.insert_capacity,
                    self.config.insert_delay,
                    move |batch: Vec<PendingInsert>| {
                        if let Some(inner) = weak.upgrade() {
                            inner.insert_downloads(batch);
                        }
                    },
                )));
            }
            pull.feed_active = true;
        }

        let mode = if self.config.continuous {
            FeedMode::LongPoll
        } else {
            FeedMode::OneShot
        };
        info!(since = ?since, ?mode, "starting change feed");
        self.async_task_started();
        let sink: Arc<dyn FeedSink> = Arc::new(FeedRelay {
            inner: Arc::downgrade(self),
        });
        if let Err(err) = feed.start(
            since,
            mode,
            self.config.filter_name.as_deref(),
            self.config.filter_params.as_ref(),
            sink,
        ) {
            self.pull.lock().feed_active = false;
            self.record_error(err);
            self.async_task_finished(1);
            self.stop();
        }
    }

    /// One change-feed row arrived: slot each listed branch revision and
    /// queue it for the inbox.
    pub(crate) fn change_received(self: &Arc<Self>, entry: ChangeEntry) {
        {
            let mut st = self.state.lock();
            if !st.running {
                return;
            }
            // The feed is delivering again; reset the offline backoff.
            st.retry_attempt = 0;
        }
        if !self.store.is_valid_doc_id(&entry.doc_id) {
            warn!(doc = %entry.doc_id, "received invalid document ID from change feed");
            return;
        }
        if entry.rev_ids.is_empty() {
            return;
        }

        let revisions: Vec<Revision> = {
            let mut pull = self.pull.lock();
            entry
                .rev_ids
                .iter()
                .map(|rev_id| {
                    let slot = pull.tracker.add_token(entry.seq.clone());
                    Revision::new(&entry.doc_id, rev_id, entry.deleted)
                        .with_sequence(slot)
                        .with_remote_seq(entry.seq.clone())
                })
                .collect()
        };
        let count = revisions.len() as u64;
        for revision in revisions {
            self.add_to_inbox(revision);
        }
        self.bump_changes_total(count);
    }

    pub(crate) fn feed_stopped(self: &Arc<Self>, error: Option<ReplError>) {
        let was_active = {
            let mut pull = self.pull.lock();
            std::mem::replace(&mut pull.feed_active, false)
        };
        if !was_active {
            return;
        }
        info!(error = ?error, "change feed stopped");
        let inbox = self.inbox.lock().clone();
        if let Some(batcher) = inbox {
            batcher.flush();
        }

        let (continuous, running) = {
            let st = self.state.lock();
            (st.continuous, st.running)
        };
        match error {
            Some(err) if continuous && running && err.is_retryable() => {
                let attempt = {
                    let mut st = self.state.lock();
                    st.retry_attempt += 1;
                    st.retry_attempt
                };
                let delay = self.config.retry.delay_for_attempt(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, "change feed offline, will retry");
                self.set_phase(ReplicatorState::Offline);
                let weak = Arc::downgrade(self);
                thread::spawn(move || {
                    thread::sleep(delay);
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let resume = {
                        let st = inner.state.lock();
                        st.running && st.continuous
                    };
                    if resume {
                        inner.set_phase(ReplicatorState::Running);
                        inner.begin_pulling();
                    }
                });
            }
            Some(err) => self.record_error(err),
            None => {}
        }
        self.async_task_finished(1);
    }

    /// Processes one inbox batch of change notifications: bulk-check which
    /// revisions the local store lacks, free the slots of the known ones,
    /// and queue the rest for fetching.
    pub(crate) fn process_pull_inbox(self: &Arc<Self>, batch: Vec<Revision>) {
        let n = batch.len() as u64;
        let missing = match self.store.find_missing_revisions(&batch) {
            Ok(missing) => missing,
            Err(err) => {
                // A failed lookup is not "all missing": stop without
                // freeing these slots so the checkpoint cannot pass them.
                warn!(error = %err, "failed to look up local revisions");
                self.record_error(err);
                self.async_task_finished(n);
                self.stop();
                return;
            }
        };

        let missing_keys: HashSet<(&str, &str)> = missing
            .iter()
            .map(|rev| (rev.doc_id.as_str(), rev.rev_id.as_str()))
            .collect();
        let dropped = batch.len() - missing.len();
        {
            let mut pull = self.pull.lock();
            for revision in &batch {
                if !missing_keys.contains(&(revision.doc_id.as_str(), revision.rev_id.as_str())) {
                    pull.tracker.remove_slot(revision.sequence);
                }
            }
        }
        if dropped > 0 {
            self.shrink_changes_total(dropped as u64);
        }

        if missing.is_empty() {
            // Nothing to fetch; the tracker already advanced through this
            // batch's tokens, so just bump the checkpoint.
            debug!("no new remote revisions to fetch");
            self.note_checkpoint_from_tracker();
            self.async_task_finished(n);
            return;
        }

        debug!(count = missing.len(), "fetching remote revisions");
        {
            let mut pull = self.pull.lock();
            pull.revs_to_pull.extend(missing);
        }
        self.pull_remote_revisions();

        // Backpressure: stall this consumer while the backlog is
        // saturated; fetch completions wake it as the queue drains.
        {
            let mut pull = self.pull.lock();
            while pull.revs_to_pull.len() > self.config.max_pending_pulls {
                self.pull_cv.wait(&mut pull);
            }
        }
        self.async_task_finished(n);
    }

    /// Starts fetches up to the connection limit. Queue mutation happens
    /// under the pull lock; the fetches launch after it is released.
    pub(crate) fn pull_remote_revisions(self: &Arc<Self>) {
        let to_fetch = {
            let mut pull = self.pull.lock();
            let mut to_fetch = Vec::new();
            while pull.http_connection_count < self.config.max_open_connections {
                match pull.revs_to_pull.pop_front() {
                    Some(revision) => {
                        pull.http_connection_count += 1;
                        to_fetch.push(revision);
                    }
                    None => break,
                }
            }
            to_fetch
        };
        if to_fetch.is_empty() {
            return;
        }
        self.pull_cv.notify_all();
        for revision in to_fetch {
            self.pull_remote_revision(revision);
        }
    }

    /// Fetches one revision's body and history from the remote.
    fn pull_remote_revision(self: &Arc<Self>, revision: Revision) {
        self.async_task_started();
        let mut path = format!(
            "/{}?rev={}&revs=true&attachments=true",
            encode_component(&revision.doc_id),
            encode_component(&revision.rev_id)
        );
        // Ask only for attachments added after the revisions we already
        // have.
        match self.store.all_known_rev_ids(&revision.doc_id) {
            Ok(known) if !known.is_empty() => {
                if let Ok(json) = serde_json::to_string(&known) {
                    path.push_str("&atts_since=");
                    path.push_str(&encode_component(&json));
                }
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "could not read known revisions"),
        }

        self.send_async_request(Method::Get, &path, None, move |inner, result| {
            let mut revision = revision;
            match result {
                Ok(value) => match RevisionHistory::parse_document_history(&value) {
                    Some(history) => {
                        revision.properties = value.as_object().cloned();
                        inner.async_task_started();
                        let inserts = inner.pull.lock().inserts.clone();
                        match inserts {
                            Some(batcher) => batcher.queue((revision, history)),
                            None => inner.async_task_finished(1),
                        }
                    }
                    None => {
                        // Processed but skipped; its slot must not hold
                        // back the checkpoint forever.
                        warn!("missing revision history in fetched revision");
                        inner.finish_pulled_revision(revision.sequence);
                    }
                },
                Err(err) => {
                    inner.record_error(err);
                    inner.finish_pulled_revision(revision.sequence);
                }
            }
            {
                let mut pull = inner.pull.lock();
                pull.http_connection_count -= 1;
            }
            inner.pull_remote_revisions();
            inner.async_task_finished(1);
        });
    }

    /// Frees a slot whose revision will not be inserted in this run.
    fn finish_pulled_revision(self: &Arc<Self>, slot: u64) {
        {
            let mut pull = self.pull.lock();
            pull.tracker.remove_slot(slot);
        }
        self.note_checkpoint_from_tracker();
        self.bump_changes_processed(1);
    }

    fn note_checkpoint_from_tracker(self: &Arc<Self>) {
        let token = self.pull.lock().tracker.checkpointable_token();
        if let Some(token) = token {
            self.note_sequence(&token);
        }
    }

    /// Inserts a batch of fetched revisions in one transaction, sorted by
    /// slot so insertion order respects the local store's guarantees even
    /// though fetch completions race.
    pub(crate) fn insert_downloads(self: &Arc<Self>, mut batch: Vec<PendingInsert>) {
        if batch.is_empty() {
            return;
        }
        let n = batch.len() as u64;
        info!(count = batch.len(), "inserting pulled revisions");
        batch.sort_by_key(|(revision, _)| revision.sequence);

        if let Err(err) = self.store.begin_transaction() {
            self.record_error(err);
            self.async_task_finished(n);
            self.stop();
            return;
        }
        let source = self.config.remote_url.clone();
        for (revision, history) in &batch {
            match self.store.force_insert(revision, history, &source) {
                Ok(InsertOutcome::Inserted) => {}
                Ok(InsertOutcome::RejectedByValidation) => {
                    info!(doc = %revision.doc_id, rev = %revision.rev_id, "remote revision failed validation");
                }
                Err(err) => {
                    warn!(doc = %revision.doc_id, rev = %revision.rev_id, error = %err, "failed to write pulled revision");
                    self.record_error(err);
                }
            }
            // Success, rejection and failure all complete the slot.
            let mut pull = self.pull.lock();
            pull.tracker.remove_slot(revision.sequence);
        }
        if let Err(err) = self.store.end_transaction(true) {
            self.record_error(err);
        }

        self.note_checkpoint_from_tracker();
        self.bump_changes_processed(n);
        self.async_task_finished(n);
    }

    /// Pull-specific part of `stop()`: detach the feed and drop the fetch
    /// backlog so the backpressure wait cannot outlive the stop request.
    pub(crate) fn pull_stop(self: &Arc<Self>) {
        let feed = self.feed.read().clone();
        let was_active = {
            let mut pull = self.pull.lock();
            pull.revs_to_pull.clear();
            std::mem::replace(&mut pull.feed_active, false)
        };
        if let Some(feed) = feed {
            feed.stop();
        }
        self.pull_cv.notify_all();
        if was_active {
            self.async_task_finished(1);
        }
    }

    /// Pull-specific part of `stopped()`: drain and join the insert
    /// batcher.
    pub(crate) fn pull_stopped(self: &Arc<Self>) {
        let inserts = {
            let mut pull = self.pull.lock();
            pull.inserts.take()
        };
        if let Some(batcher) = inserts {
            batcher.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicatorConfig;
    use crate::error::ReplResult;
    use crate::feed::MockChangeFeed;
    use crate::replicator::Replicator;
    use crate::store::MemoryStore;
    use crate::transport::Transport;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn component_encoding() {
        assert_eq!(encode_component("doc1"), "doc1");
        assert_eq!(encode_component("a/b c"), "a%2Fb%20c");
        assert_eq!(encode_component("1-a_b.c~"), "1-a_b.c~");
        assert_eq!(encode_component("[\"x\"]"), "%5B%22x%22%5D");
    }

    /// A transport that answers revision GETs slowly, to hold a backlog
    /// open.
    struct SlowDocTransport {
        delay: Duration,
        served: AtomicUsize,
    }

    impl Transport for SlowDocTransport {
        fn send(&self, method: Method, path: &str, _body: Option<&Value>) -> ReplResult<Value> {
            if method == Method::Get && path.starts_with("/doc") {
                std::thread::sleep(self.delay);
                self.served.fetch_add(1, Ordering::SeqCst);
                let doc_id = path[1..].split('?').next().unwrap_or_default();
                return Ok(json!({
                    "_id": doc_id,
                    "_rev": "1-a",
                    "_revisions": {"start": 1, "ids": ["a"]}
                }));
            }
            Ok(json!({"ok": true, "rev": "0-1"}))
        }
    }

    #[test]
    fn backpressure_bounds_the_pending_backlog() {
        let transport = Arc::new(SlowDocTransport {
            delay: Duration::from_millis(10),
            served: AtomicUsize::new(0),
        });
        let store = Arc::new(MemoryStore::new());
        let feed = Arc::new(MockChangeFeed::new());
        let total = 40u64;
        for i in 1..=total {
            feed.add_entry(ChangeEntry::new(i.to_string(), format!("doc{i}")).with_rev("1-a"));
        }

        let config = ReplicatorConfig::pull("http://host/db")
            .with_inbox_capacity(5)
            .with_inbox_delay(Duration::from_millis(5))
            .with_insert_capacity(10)
            .with_insert_delay(Duration::from_millis(5))
            .with_max_open_connections(2)
            .with_max_pending_pulls(4)
            .with_checkpoint_save_delay(Duration::from_millis(5));
        let repl = Replicator::new(config, store.clone(), transport.clone());
        repl.set_change_feed(feed);

        let inner = repl.inner().clone();
        let stop_sampling = Arc::new(AtomicBool::new(false));
        let max_backlog = Arc::new(AtomicUsize::new(0));
        let sampler = {
            let stop_sampling = stop_sampling.clone();
            let max_backlog = max_backlog.clone();
            std::thread::spawn(move || {
                while !stop_sampling.load(Ordering::SeqCst) {
                    let backlog = inner.pull.lock().revs_to_pull.len();
                    max_backlog.fetch_max(backlog, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        repl.start();
        assert!(repl.wait_until_stopped(Duration::from_secs(20)));
        stop_sampling.store(true, Ordering::SeqCst);
        sampler.join().unwrap();

        // The backlog may overshoot by at most one inbox batch before the
        // consumer stalls.
        assert!(max_backlog.load(Ordering::SeqCst) <= 4 + 5);
        assert_eq!(store.revision_count(), total as usize);
        assert_eq!(repl.last_sequence(), Some(total.to_string()));
    }

    /// Fetch concurrency never exceeds the configured connection limit.
    struct CountingTransport {
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl Transport for CountingTransport {
        fn send(&self, method: Method, path: &str, _body: Option<&Value>) -> ReplResult<Value> {
            if method == Method::Get && path.starts_with("/doc") {
                let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_concurrent.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
                self.concurrent.fetch_sub(1, Ordering::SeqCst);
                let doc_id = path[1..].split('?').next().unwrap_or_default();
                return Ok(json!({
                    "_id": doc_id,
                    "_rev": "1-a",
                    "_revisions": {"start": 1, "ids": ["a"]}
                }));
            }
            Ok(json!({"ok": true, "rev": "0-1"}))
        }
    }

    #[test]
    fn fetches_respect_the_connection_limit() {
        let transport = Arc::new(CountingTransport {
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        });
        let feed = Arc::new(MockChangeFeed::new());
        for i in 1..=30u64 {
            feed.add_entry(ChangeEntry::new(i.to_string(), format!("doc{i}")).with_rev("1-a"));
        }

        let config = ReplicatorConfig::pull("http://host/db")
            .with_inbox_delay(Duration::from_millis(5))
            .with_insert_delay(Duration::from_millis(5))
            .with_max_open_connections(3)
            .with_checkpoint_save_delay(Duration::from_millis(5));
        let repl = Replicator::new(config, Arc::new(MemoryStore::new()), transport.clone());
        repl.set_change_feed(feed);

        repl.start();
        assert!(repl.wait_until_stopped(Duration::from_secs(20)));
        assert!(transport.max_concurrent.load(Ordering::SeqCst) <= 3);
        assert_eq!(repl.changes_processed(), 30);
    }

    /// The revision GET carries revs/attachments flags and atts_since for
    /// known revisions.
    #[test]
    fn fetch_path_includes_known_revisions() {
        let paths = Arc::new(Mutex::new(Vec::new()));

        struct PathLogger {
            paths: Arc<Mutex<Vec<String>>>,
        }
        impl Transport for PathLogger {
            fn send(&self, method: Method, path: &str, _body: Option<&Value>) -> ReplResult<Value> {
                if method == Method::Get && path.starts_with("/doc") {
                    self.paths.lock().push(path.to_string());
                    return Ok(json!({
                        "_id": "doc1",
                        "_rev": "2-b",
                        "_revisions": {"start": 2, "ids": ["b", "a"]}
                    }));
                }
                Ok(json!({"ok": true, "rev": "0-1"}))
            }
        }

        let store = Arc::new(MemoryStore::new());
        store.put_local("doc1", "1-a", false, None);
        let feed = Arc::new(MockChangeFeed::new());
        feed.add_entry(ChangeEntry::new("1", "doc1").with_rev("2-b"));

        let config = ReplicatorConfig::pull("http://host/db")
            .with_inbox_delay(Duration::from_millis(5))
            .with_insert_delay(Duration::from_millis(5))
            .with_checkpoint_save_delay(Duration::from_millis(5));
        let repl = Replicator::new(
            config,
            store,
            Arc::new(PathLogger {
                paths: paths.clone(),
            }),
        );
        repl.set_change_feed(feed);

        repl.start();
        assert!(repl.wait_until_stopped(Duration::from_secs(10)));

        let paths = paths.lock();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].starts_with("/doc1?rev=2-b&revs=true&attachments=true"));
        assert!(paths[0].contains("atts_since="));
    }
}
