//! Replicator core state machine.

use crate::auth::Authenticator;
use crate::batcher::Batcher;
use crate::checkpoint::CheckpointState;
use crate::config::{Direction, ReplicatorConfig};
use crate::error::{ReplError, ReplResult};
use crate::events::{EventHub, ReplicatorEvent, ReplicatorState};
use crate::feed::ChangeFeed;
use crate::pull::PullState;
use crate::push::PushState;
use crate::store::{LocalStore, RevisionFilter};
use crate::transport::{Method, Transport};
use mossdb_repl_protocol::Revision;
use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Produces unique session identifiers for replicator runs.
///
/// Hosts that run several replicators can share one factory (via
/// [`ReplicatorConfig::with_session_ids`]) so session IDs stay unique
/// across them; the counter's lifetime is the factory's, not the process's.
#[derive(Debug, Default)]
pub struct SessionIdFactory {
    counter: AtomicU64,
}

impl SessionIdFactory {
    /// Creates a factory starting at `repl001`.
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Returns the next session identifier.
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("repl{n:03}")
    }
}

pub(crate) struct CoreState {
    pub running: bool,
    pub continuous: bool,
    pub phase: ReplicatorState,
    /// Set once the stop path has been entered, so it runs exactly once.
    pub finalizing: bool,
    pub async_task_count: u64,
    pub changes_processed: u64,
    pub changes_total: u64,
    pub error: Option<ReplError>,
    pub session_id: Option<String>,
    pub retry_attempt: u32,
}

impl CoreState {
    fn new() -> Self {
        Self {
            running: false,
            continuous: false,
            phase: ReplicatorState::Stopped,
            finalizing: false,
            async_task_count: 0,
            changes_processed: 0,
            changes_total: 0,
            error: None,
            session_id: None,
            retry_attempt: 0,
        }
    }
}

pub(crate) struct ReplicatorInner {
    pub config: ReplicatorConfig,
    pub store: Arc<dyn LocalStore>,
    pub transport: Arc<dyn Transport>,
    pub feed: RwLock<Option<Arc<dyn ChangeFeed>>>,
    pub authenticator: RwLock<Option<Arc<dyn Authenticator>>>,
    pub state: Mutex<CoreState>,
    pub stopped_cv: Condvar,
    /// The inbox batcher, behind an `Arc` so it can be flushed without
    /// holding this slot's lock.
    pub inbox: Mutex<Option<Arc<Batcher<Revision>>>>,
    pub checkpoint: Mutex<CheckpointState>,
    pub events: EventHub,
    pub pull: Mutex<PullState>,
    /// Wakes the pull inbox consumer when the pending backlog shrinks.
    pub pull_cv: Condvar,
    pub push: Mutex<PushState>,
}

/// The replication engine's public face.
///
/// A replicator owns one direction of synchronization against one remote
/// database. `start()` negotiates a session, reconciles the checkpoint and
/// begins replicating; the replicator stops by itself once all outstanding
/// work drains (one-shot) or when `stop()` is called (continuous).
pub struct Replicator {
    inner: Arc<ReplicatorInner>,
}

impl Replicator {
    /// Creates a replicator over the given collaborators.
    pub fn new(
        config: ReplicatorConfig,
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let push_state = PushState::new(&config);
        Self {
            inner: Arc::new(ReplicatorInner {
                config,
                store,
                transport,
                feed: RwLock::new(None),
                authenticator: RwLock::new(None),
                state: Mutex::new(CoreState::new()),
                stopped_cv: Condvar::new(),
                inbox: Mutex::new(None),
                checkpoint: Mutex::new(CheckpointState::new()),
                events: EventHub::new(),
                pull: Mutex::new(PullState::new()),
                pull_cv: Condvar::new(),
                push: Mutex::new(push_state),
            }),
        }
    }

    /// Attaches the change-feed client (required for pull replications).
    ///
    /// Ignored while the replicator is running.
    pub fn set_change_feed(&self, feed: Arc<dyn ChangeFeed>) {
        if self.is_running() {
            warn!("ignoring change feed set on a running replicator");
            return;
        }
        *self.inner.feed.write() = Some(feed);
    }

    /// Attaches an authenticator for session negotiation.
    ///
    /// Ignored while the replicator is running.
    pub fn set_authenticator(&self, authenticator: Arc<dyn Authenticator>) {
        if self.is_running() {
            warn!("ignoring authenticator set on a running replicator");
            return;
        }
        *self.inner.authenticator.write() = Some(authenticator);
    }

    /// Sets a predicate applied to local revisions before pushing.
    ///
    /// Ignored while the replicator is running.
    pub fn set_push_filter(&self, filter: Arc<RevisionFilter>) {
        if self.is_running() {
            warn!("ignoring push filter set on a running replicator");
            return;
        }
        self.inner.push.lock().filter = Some(filter);
    }

    /// Starts replicating. A no-op if already running.
    pub fn start(&self) {
        ReplicatorInner::start(&self.inner);
    }

    /// Stops the replication: flushes the inbox, degrades a continuous run
    /// to drain-and-stop, and finalizes once outstanding work completes.
    pub fn stop(&self) {
        ReplicatorInner::stop(&self.inner);
    }

    /// Feeds a locally committed revision into a running continuous push.
    ///
    /// `source` is the URL the revision was originally pulled from, if
    /// any; revisions originating from this replication's own remote are
    /// skipped to avoid ping-pong echoes in bidirectional setups.
    pub fn local_change(&self, revision: Revision, source: Option<&str>) {
        ReplicatorInner::local_change(&self.inner, revision, source);
    }

    /// Returns true while the replicator runs (including offline retry).
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReplicatorState {
        self.inner.state.lock().phase
    }

    /// The last fatal or transient error recorded, if any.
    pub fn error(&self) -> Option<ReplError> {
        self.inner.state.lock().error.clone()
    }

    /// The current checkpoint token.
    pub fn last_sequence(&self) -> Option<String> {
        self.inner.checkpoint.lock().last_sequence.clone()
    }

    /// Revisions processed so far in this run.
    pub fn changes_processed(&self) -> u64 {
        self.inner.state.lock().changes_processed
    }

    /// Revisions known about so far in this run.
    pub fn changes_total(&self) -> u64 {
        self.inner.state.lock().changes_total
    }

    /// The session identifier of the current (or last) run.
    pub fn session_id(&self) -> Option<String> {
        self.inner.state.lock().session_id.clone()
    }

    /// The ID of the checkpoint document this replication reads and
    /// writes, derived from the local database's private UUID, the
    /// credential-stripped remote URL and the direction.
    pub fn checkpoint_doc_id(&self) -> String {
        self.inner.remote_checkpoint_doc_id()
    }

    /// Subscribes to state and progress events.
    pub fn subscribe(&self) -> mpsc::Receiver<ReplicatorEvent> {
        self.inner.events.subscribe()
    }

    /// Blocks until the replicator stops, or the timeout elapses.
    /// Returns true if the replicator is stopped.
    pub fn wait_until_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.inner.state.lock();
        while st.running {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.inner.stopped_cv.wait_for(&mut st, deadline - now);
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ReplicatorInner> {
        &self.inner
    }
}

impl ReplicatorInner {
    pub(crate) fn start(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            if st.running {
                return;
            }
            st.running = true;
            st.continuous = self.config.continuous;
            st.phase = ReplicatorState::Running;
            st.finalizing = false;
            st.async_task_count = 0;
            st.changes_processed = 0;
            st.changes_total = 0;
            st.error = None;
            st.retry_attempt = 0;
            st.session_id = Some(self.config.session_ids.next_id());
        }
        self.checkpoint.lock().reset();
        self.reset_engine_state();

        {
            let weak = Arc::downgrade(self);
            let batcher = Batcher::new(
                self.config.inbox_capacity,
                self.config.inbox_delay,
                move |batch: Vec<Revision>| {
                    if let Some(inner) = weak.upgrade() {
                        inner.process_inbox(batch);
                    }
                },
            );
            *self.inbox.lock() = Some(Arc::new(batcher));
        }

        let session = self.state.lock().session_id.clone().unwrap_or_default();
        info!(session = %session, remote = %self.config.remote_url, direction = ?self.config.direction, "replicator starting");
        self.events
            .emit(ReplicatorEvent::StateChanged(ReplicatorState::Running));
        self.check_session();
    }

    pub(crate) fn stop(self: &Arc<Self>) {
        {
            let st = self.state.lock();
            if !st.running {
                return;
            }
        }
        info!("replicator stopping");
        match self.config.direction {
            Direction::Pull => self.pull_stop(),
            Direction::Push => self.push_stop_observing(),
        }
        self.state.lock().continuous = false;
        let inbox = self.inbox.lock().clone();
        if let Some(batcher) = inbox {
            batcher.flush();
        }
        self.maybe_finalize();
    }

    fn reset_engine_state(&self) {
        *self.pull.lock() = PullState::new();
        let mut push = self.push.lock();
        let filter = push.filter.take();
        *push = PushState::new(&self.config);
        push.filter = filter;
    }

    pub(crate) fn async_task_started(&self) {
        let mut st = self.state.lock();
        st.async_task_count += 1;
    }

    pub(crate) fn async_task_finished(self: &Arc<Self>, n: u64) {
        {
            let mut st = self.state.lock();
            debug_assert!(st.async_task_count >= n);
            st.async_task_count = st.async_task_count.saturating_sub(n);
        }
        self.maybe_finalize();
    }

    /// Enters the stop path when no work is outstanding and the run is not
    /// continuous. `stopped()` runs on its own thread so a request or
    /// batcher thread never joins itself.
    pub(crate) fn maybe_finalize(self: &Arc<Self>) {
        let finalize = {
            let mut st = self.state.lock();
            if st.running && !st.finalizing && !st.continuous && st.async_task_count == 0 {
                st.finalizing = true;
                true
            } else {
                false
            }
        };
        if finalize {
            let this = self.clone();
            thread::spawn(move || this.stopped());
        }
    }

    pub(crate) fn stopped(self: &Arc<Self>) {
        if self.config.direction == Direction::Pull {
            self.pull_stopped();
        }
        let inbox = self.inbox.lock().take();
        if let Some(batcher) = inbox {
            batcher.close();
        }
        self.save_last_sequence();

        let error = {
            let mut st = self.state.lock();
            st.running = false;
            st.finalizing = false;
            st.async_task_count = 0;
            st.phase = ReplicatorState::Stopped;
            st.error.clone()
        };
        info!(error = ?error, "replicator stopped");
        self.stopped_cv.notify_all();
        self.events
            .emit(ReplicatorEvent::StateChanged(ReplicatorState::Stopped));
    }

    /// Queues a revision for the inbox batcher. Each queued revision holds
    /// an async task until its batch has been handed to the next stage, so
    /// the replicator cannot finalize with inbox work pending.
    pub(crate) fn add_to_inbox(self: &Arc<Self>, revision: Revision) {
        self.async_task_started();
        let inbox = self.inbox.lock().clone();
        match inbox {
            Some(batcher) => batcher.queue(revision),
            None => self.async_task_finished(1),
        }
    }

    fn process_inbox(self: &Arc<Self>, batch: Vec<Revision>) {
        if batch.is_empty() {
            return;
        }
        debug!(count = batch.len(), "processing inbox batch");
        match self.config.direction {
            Direction::Pull => self.process_pull_inbox(batch),
            Direction::Push => self.process_push_inbox(batch),
        }
    }

    pub(crate) fn begin_replicating(self: &Arc<Self>) {
        match self.config.direction {
            Direction::Pull => self.begin_pulling(),
            Direction::Push => self.begin_pushing(),
        }
        // A run with nothing to do must still reach stopped().
        self.maybe_finalize();
    }

    /// Dispatches a request on its own thread and hands the outcome to
    /// `on_completion`. Callers that need the request to hold the
    /// replicator open wrap it in `async_task_started`/`finished`.
    pub(crate) fn send_async_request<F>(
        self: &Arc<Self>,
        method: Method,
        path: &str,
        body: Option<Value>,
        on_completion: F,
    ) where
        F: FnOnce(&Arc<ReplicatorInner>, ReplResult<Value>) + Send + 'static,
    {
        debug!(method = method.as_str(), %path, "dispatching request");
        let this = self.clone();
        let path = path.to_string();
        thread::spawn(move || {
            let result = this.transport.send(method, &path, body.as_ref());
            on_completion(&this, result);
        });
    }

    /// Records the first error of the run; later errors only log.
    pub(crate) fn record_error(&self, error: ReplError) {
        warn!(error = %error, "replication error");
        let mut st = self.state.lock();
        if st.error.is_none() {
            st.error = Some(error);
        }
    }

    pub(crate) fn set_phase(&self, phase: ReplicatorState) {
        {
            let mut st = self.state.lock();
            if st.phase == phase {
                return;
            }
            st.phase = phase;
        }
        self.events.emit(ReplicatorEvent::StateChanged(phase));
    }

    pub(crate) fn bump_changes_total(&self, n: u64) {
        let (processed, total) = {
            let mut st = self.state.lock();
            st.changes_total += n;
            (st.changes_processed, st.changes_total)
        };
        self.events
            .emit(ReplicatorEvent::Progress { processed, total });
    }

    pub(crate) fn shrink_changes_total(&self, n: u64) {
        let (processed, total) = {
            let mut st = self.state.lock();
            st.changes_total = st.changes_total.saturating_sub(n);
            (st.changes_processed, st.changes_total)
        };
        self.events
            .emit(ReplicatorEvent::Progress { processed, total });
    }

    pub(crate) fn bump_changes_processed(&self, n: u64) {
        let (processed, total) = {
            let mut st = self.state.lock();
            st.changes_processed += n;
            (st.changes_processed, st.changes_total)
        };
        self.events
            .emit(ReplicatorEvent::Progress { processed, total });
    }
}
