//! Configuration for the replication engine.

use crate::replicator::SessionIdFactory;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Direction of a replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Remote → local.
    Pull,
    /// Local → remote.
    Push,
}

/// Configuration for one replicator.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Remote database URL.
    pub remote_url: String,
    /// Replication direction.
    pub direction: Direction,
    /// Whether the replication keeps running after draining the backlog.
    pub continuous: bool,
    /// Whether a push replication may create the remote database.
    pub create_target: bool,
    /// Name of a server-side filter applied to the change feed.
    pub filter_name: Option<String>,
    /// Parameters forwarded to the server-side filter.
    pub filter_params: Option<Value>,
    /// Inbox batch capacity.
    pub inbox_capacity: usize,
    /// Inbox flush delay.
    pub inbox_delay: Duration,
    /// Pull insert-batch capacity.
    pub insert_capacity: usize,
    /// Pull insert-batch flush delay.
    pub insert_delay: Duration,
    /// Maximum concurrent pull fetches.
    pub max_open_connections: usize,
    /// Backpressure bound on the pending-pull backlog.
    pub max_pending_pulls: usize,
    /// Debounce delay for checkpoint saves.
    pub checkpoint_save_delay: Duration,
    /// Retry configuration for continuous-mode feed restarts.
    pub retry: RetryConfig,
    /// Factory for replication session identifiers.
    pub session_ids: Arc<SessionIdFactory>,
}

impl ReplicatorConfig {
    /// Creates a configuration with the default tuning constants.
    pub fn new(remote_url: impl Into<String>, direction: Direction) -> Self {
        Self {
            remote_url: remote_url.into(),
            direction,
            continuous: false,
            create_target: false,
            filter_name: None,
            filter_params: None,
            inbox_capacity: 100,
            inbox_delay: Duration::from_millis(500),
            insert_capacity: 200,
            insert_delay: Duration::from_secs(1),
            max_open_connections: 16,
            max_pending_pulls: 1000,
            checkpoint_save_delay: Duration::from_secs(2),
            retry: RetryConfig::default(),
            session_ids: Arc::new(SessionIdFactory::new()),
        }
    }

    /// Creates a pull configuration.
    pub fn pull(remote_url: impl Into<String>) -> Self {
        Self::new(remote_url, Direction::Pull)
    }

    /// Creates a push configuration.
    pub fn push(remote_url: impl Into<String>) -> Self {
        Self::new(remote_url, Direction::Push)
    }

    /// Sets continuous mode.
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Allows a push replication to create the remote database.
    pub fn with_create_target(mut self, create_target: bool) -> Self {
        self.create_target = create_target;
        self
    }

    /// Sets the server-side filter name.
    pub fn with_filter_name(mut self, name: impl Into<String>) -> Self {
        self.filter_name = Some(name.into());
        self
    }

    /// Sets the server-side filter parameters.
    pub fn with_filter_params(mut self, params: Value) -> Self {
        self.filter_params = Some(params);
        self
    }

    /// Sets the inbox batch capacity.
    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }

    /// Sets the inbox flush delay.
    pub fn with_inbox_delay(mut self, delay: Duration) -> Self {
        self.inbox_delay = delay;
        self
    }

    /// Sets the pull insert-batch capacity.
    pub fn with_insert_capacity(mut self, capacity: usize) -> Self {
        self.insert_capacity = capacity;
        self
    }

    /// Sets the pull insert-batch flush delay.
    pub fn with_insert_delay(mut self, delay: Duration) -> Self {
        self.insert_delay = delay;
        self
    }

    /// Sets the maximum number of concurrent pull fetches.
    pub fn with_max_open_connections(mut self, max: usize) -> Self {
        self.max_open_connections = max.max(1);
        self
    }

    /// Sets the backpressure bound on the pending-pull backlog.
    pub fn with_max_pending_pulls(mut self, max: usize) -> Self {
        self.max_pending_pulls = max.max(1);
        self
    }

    /// Sets the debounce delay for checkpoint saves.
    pub fn with_checkpoint_save_delay(mut self, delay: Duration) -> Self {
        self.checkpoint_save_delay = delay;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the session-id factory, so several replicators share one
    /// counter bound to the hosting application.
    pub fn with_session_ids(mut self, factory: Arc<SessionIdFactory>) -> Self {
        self.session_ids = factory;
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
