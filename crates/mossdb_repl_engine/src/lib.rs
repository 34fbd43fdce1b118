//! # MossDB Replication Engine
//!
//! Replication protocol engine for MossDB: synchronizes a local
//! revision-tree store with a remote store over an HTTP change-feed
//! protocol, in either direction, one-shot or continuously.
//!
//! This crate provides:
//! - `Replicator` state machine (stopped → running → stopped, with an
//!   offline state for continuous runs)
//! - Pull path: change-feed consumption, bounded concurrent fetches,
//!   batched local inserts
//! - Push path: revs-diff against the remote, bulk upload with verbatim
//!   revision IDs
//! - `SequenceTracker` for out-of-order completion of concurrent fetches
//! - `Batcher` for debounced, single-flight batch delivery
//! - Session negotiation and debounced checkpoint persistence
//!
//! ## Key Invariants
//!
//! - A persisted checkpoint never claims progress past work that has not
//!   durably committed: checkpoint advancement only reflects a contiguous
//!   completed prefix of pulled revisions
//! - At most one checkpoint PUT is in flight per replicator
//! - Network I/O never executes while an engine lock is held
//!
//! The local store, transport, change feed and authenticator are
//! collaborators consumed through traits; in-memory implementations are
//! provided for tests.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod batcher;
mod checkpoint;
mod config;
mod error;
mod events;
mod feed;
mod pull;
mod push;
mod replicator;
mod sequence;
mod store;
mod transport;

pub use auth::{Authenticator, SessionAuthenticator};
pub use batcher::Batcher;
pub use config::{Direction, ReplicatorConfig, RetryConfig};
pub use error::{ReplError, ReplResult};
pub use events::{ReplicatorEvent, ReplicatorState};
pub use feed::{ChangeFeed, FeedMode, FeedSink, MockChangeFeed};
pub use replicator::{Replicator, SessionIdFactory};
pub use sequence::SequenceTracker;
pub use store::{InsertOutcome, LocalStore, MemoryStore, RevisionFilter};
pub use transport::{Method, MockTransport, RecordedRequest, Transport};
