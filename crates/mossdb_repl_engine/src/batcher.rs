//! Debounced batch delivery.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct BatcherState<T> {
    queue: VecDeque<T>,
    deadline: Option<Instant>,
    flush_requested: bool,
    delivering: bool,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<BatcherState<T>>,
    /// Wakes the worker when items arrive or a flush/close is requested.
    work_cv: Condvar,
    /// Wakes `flush()` callers when the queue drains.
    idle_cv: Condvar,
    capacity: usize,
    flush_delay: Duration,
}

/// Collects items from any number of producers and delivers them to a
/// single consumer callback, either when the queue reaches `capacity` or
/// after `flush_delay` of inactivity since the first queued item.
///
/// Deliveries are single-flight: the consumer receives the entire queued
/// batch as one ordered list and is never invoked again before it returns.
/// Items queued during a delivery go into the next batch. The consumer is
/// expected to handle its own errors; a failed delivery simply leaves the
/// batcher ready for the next one.
pub struct Batcher<T: Send + 'static> {
    shared: std::sync::Arc<Shared<T>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: thread::ThreadId,
}

impl<T: Send + 'static> Batcher<T> {
    /// Creates a batcher and spawns its delivery worker.
    pub fn new<F>(capacity: usize, flush_delay: Duration, mut processor: F) -> Self
    where
        F: FnMut(Vec<T>) + Send + 'static,
    {
        let shared = std::sync::Arc::new(Shared {
            state: Mutex::new(BatcherState {
                queue: VecDeque::new(),
                deadline: None,
                flush_requested: false,
                delivering: false,
                closed: false,
            }),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            capacity: capacity.max(1),
            flush_delay,
        });

        let worker_shared = shared.clone();
        let worker = thread::spawn(move || loop {
            let batch = {
                let mut st = worker_shared.state.lock();
                loop {
                    if st.queue.is_empty() {
                        st.deadline = None;
                        st.flush_requested = false;
                        worker_shared.idle_cv.notify_all();
                        if st.closed {
                            return;
                        }
                        worker_shared.work_cv.wait(&mut st);
                        continue;
                    }
                    if st.closed
                        || st.flush_requested
                        || st.queue.len() >= worker_shared.capacity
                    {
                        break;
                    }
                    let deadline = st.deadline.unwrap_or_else(Instant::now);
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    worker_shared.work_cv.wait_for(&mut st, deadline - now);
                }
                st.flush_requested = false;
                st.deadline = None;
                st.delivering = true;
                st.queue.drain(..).collect::<Vec<T>>()
            };

            processor(batch);

            let mut st = worker_shared.state.lock();
            st.delivering = false;
            worker_shared.idle_cv.notify_all();
        });

        let worker_id = worker.thread().id();
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
            worker_id,
        }
    }

    /// Appends an item.
    ///
    /// Reaching `capacity` triggers delivery immediately; otherwise a
    /// delivery is scheduled `flush_delay` after the first queued item.
    /// Items queued after `close()` are dropped.
    pub fn queue(&self, item: T) {
        let mut st = self.shared.state.lock();
        if st.closed {
            return;
        }
        st.queue.push_back(item);
        if st.deadline.is_none() {
            st.deadline = Some(Instant::now() + self.shared.flush_delay);
        }
        self.shared.work_cv.notify_all();
    }

    /// Current queue length, for callers applying backpressure.
    pub fn count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Forces delivery of whatever is queued and blocks until the queue has
    /// drained and no delivery is running.
    ///
    /// Called from the consumer callback itself, this is a no-op: the
    /// running delivery already owns the queue.
    pub fn flush(&self) {
        if thread::current().id() == self.worker_id {
            return;
        }
        let mut st = self.shared.state.lock();
        if st.queue.is_empty() && !st.delivering {
            return;
        }
        st.flush_requested = true;
        self.shared.work_cv.notify_all();
        while !st.queue.is_empty() || st.delivering {
            self.shared.idle_cv.wait(&mut st);
        }
    }

    /// Delivers any remaining items and joins the worker. From the
    /// consumer callback it only marks the batcher closed.
    pub fn close(&self) {
        {
            let mut st = self.shared.state.lock();
            st.closed = true;
            self.shared.work_cv.notify_all();
        }
        if thread::current().id() == self.worker_id {
            return;
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl<T: Send + 'static> Drop for Batcher<T> {
    fn drop(&mut self) {
        self.close();
    }
}
