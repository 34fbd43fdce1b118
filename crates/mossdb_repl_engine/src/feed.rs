//! Change-feed client interface.

use crate::error::{ReplError, ReplResult};
use mossdb_repl_protocol::ChangeEntry;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How the change feed is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// Read the feed once and stop at its current end.
    OneShot,
    /// Keep a long-poll open for future changes.
    LongPoll,
}

/// Receives change notifications and the feed's terminal event.
///
/// `change_received` may block to apply backpressure; implementations of
/// [`ChangeFeed`] must tolerate that.
pub trait FeedSink: Send + Sync {
    /// One change-feed row arrived.
    fn change_received(&self, entry: ChangeEntry);

    /// The feed terminated, normally or with an error.
    fn feed_stopped(&self, error: Option<ReplError>);
}

/// A client of the remote change feed.
///
/// The reader's internals (long-poll handling, wire format) are out of the
/// engine's scope; the engine only starts it, stops it, and consumes its
/// callbacks.
pub trait ChangeFeed: Send + Sync {
    /// Starts delivering changes after `since` to `sink`.
    fn start(
        &self,
        since: Option<String>,
        mode: FeedMode,
        filter_name: Option<&str>,
        filter_params: Option<&Value>,
        sink: Arc<dyn FeedSink>,
    ) -> ReplResult<()>;

    /// Detaches the sink and stops the feed. No further sink calls are
    /// made after this returns.
    fn stop(&self);
}

/// A scripted change feed for tests.
///
/// Entries added with [`MockChangeFeed::add_entry`] are delivered from a
/// background thread on `start`, followed by the terminal event (an error
/// if one was scripted with [`MockChangeFeed::stop_with_error`]).
#[derive(Default)]
pub struct MockChangeFeed {
    entries: Mutex<Vec<ChangeEntry>>,
    final_error: Mutex<Option<ReplError>>,
    /// Shared with the delivery thread so `stop()` can detach it mid-run.
    sink: Arc<Mutex<Option<Arc<dyn FeedSink>>>>,
    starts: Mutex<Vec<Option<String>>>,
    entry_delay: Mutex<Duration>,
}

impl MockChangeFeed {
    /// Creates an empty feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts one feed row.
    pub fn add_entry(&self, entry: ChangeEntry) {
        self.entries.lock().push(entry);
    }

    /// Scripts the terminal event as an error.
    pub fn stop_with_error(&self, error: ReplError) {
        *self.final_error.lock() = Some(error);
    }

    /// Inserts a pause between delivered rows.
    pub fn set_entry_delay(&self, delay: Duration) {
        *self.entry_delay.lock() = delay;
    }

    /// The `since` token of every `start` call observed so far.
    pub fn start_log(&self) -> Vec<Option<String>> {
        self.starts.lock().clone()
    }
}

impl ChangeFeed for MockChangeFeed {
    fn start(
        &self,
        since: Option<String>,
        _mode: FeedMode,
        _filter_name: Option<&str>,
        _filter_params: Option<&Value>,
        sink: Arc<dyn FeedSink>,
    ) -> ReplResult<()> {
        self.starts.lock().push(since);
        *self.sink.lock() = Some(sink);

        let entries = self.entries.lock().clone();
        let delay = *self.entry_delay.lock();
        let error = self.final_error.lock().take();
        let sink_slot = self.sink.clone();
        thread::spawn(move || {
            for entry in entries {
                let Some(sink) = sink_slot.lock().clone() else {
                    return;
                };
                sink.change_received(entry);
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
            if let Some(sink) = sink_slot.lock().take() {
                sink.feed_stopped(error);
            }
        });
        Ok(())
    }

    fn stop(&self) {
        *self.sink.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        received: AtomicUsize,
        stops: AtomicUsize,
        error_seen: Mutex<Option<ReplError>>,
    }

    impl CountingSink {
        fn new() -> Self {
            Self {
                received: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                error_seen: Mutex::new(None),
            }
        }
    }

    impl FeedSink for CountingSink {
        fn change_received(&self, _entry: ChangeEntry) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }

        fn feed_stopped(&self, error: Option<ReplError>) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            *self.error_seen.lock() = error;
        }
    }

    fn wait_for(predicate: impl Fn() -> bool) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn delivers_entries_then_terminal_event() {
        let feed = MockChangeFeed::new();
        feed.add_entry(ChangeEntry::new("1", "doc1").with_rev("1-a"));
        feed.add_entry(ChangeEntry::new("2", "doc2").with_rev("1-b"));

        let sink = Arc::new(CountingSink::new());
        feed.start(None, FeedMode::OneShot, None, None, sink.clone())
            .unwrap();

        wait_for(|| sink.stops.load(Ordering::SeqCst) == 1);
        assert_eq!(sink.received.load(Ordering::SeqCst), 2);
        assert!(sink.error_seen.lock().is_none());
    }

    #[test]
    fn terminal_error_is_forwarded() {
        let feed = MockChangeFeed::new();
        feed.stop_with_error(ReplError::transport_retryable("gone"));

        let sink = Arc::new(CountingSink::new());
        feed.start(Some("9".into()), FeedMode::LongPoll, None, None, sink.clone())
            .unwrap();

        wait_for(|| sink.stops.load(Ordering::SeqCst) == 1);
        assert!(sink.error_seen.lock().as_ref().unwrap().is_retryable());
        assert_eq!(feed.start_log(), vec![Some("9".to_string())]);
    }

    #[test]
    fn stop_detaches_the_sink() {
        let feed = MockChangeFeed::new();
        for i in 0..50 {
            feed.add_entry(ChangeEntry::new(i.to_string(), "doc").with_rev("1-a"));
        }
        feed.set_entry_delay(Duration::from_millis(5));

        let sink = Arc::new(CountingSink::new());
        feed.start(None, FeedMode::OneShot, None, None, sink.clone())
            .unwrap();
        wait_for(|| sink.received.load(Ordering::SeqCst) >= 2);
        feed.stop();

        thread::sleep(Duration::from_millis(50));
        let seen = sink.received.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.received.load(Ordering::SeqCst), seen);
        assert_eq!(sink.stops.load(Ordering::SeqCst), 0);
    }
}
