//! # MossDB Replication Protocol
//!
//! Replication wire types and JSON codecs for MossDB.
//!
//! This crate provides:
//! - `Revision` for document edits moving through a replication
//! - `ChangeEntry` for rows of the remote change feed
//! - Request/response bodies for `_revs_diff`, `_bulk_docs`, checkpoint
//!   documents and `_session`
//! - `RevisionHistory` for the `_revisions` ancestry encoding
//!
//! This is a pure protocol crate with no I/O operations. The change-feed
//! protocol is JSON over HTTP, so every wire body here round-trips through
//! `serde_json`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod error;
mod messages;
mod revision;

pub use change_feed::ChangeEntry;
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    BulkDocsRequest, BulkDocsResponse, BulkDocsResult, CheckpointBody, MissingRevs,
    RevisionHistory, RevsDiffRequest, RevsDiffResponse, SessionInfo, UserContext,
};
pub use revision::{parse_rev_id, Revision, RevisionList};
