//! Transport layer abstraction for replication requests.

use crate::error::{ReplError, ReplResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;

/// HTTP method of a replication request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET.
    Get,
    /// PUT.
    Put,
    /// POST.
    Post,
}

impl Method {
    /// Returns the method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
        }
    }
}

/// A transport handles one HTTP exchange with the remote database.
///
/// `path` is appended to the remote database URL; an empty path addresses
/// the database itself. Calls block until the exchange completes — the
/// engine supplies the threading, so implementations must be safe to call
/// from many threads at once.
///
/// This abstracts the network layer, allowing different implementations
/// (reqwest, ureq, mock for testing, etc.).
pub trait Transport: Send + Sync {
    /// Sends a request and returns the decoded JSON response body.
    ///
    /// Non-2xx responses surface as [`ReplError::Transport`] carrying the
    /// status code.
    fn send(&self, method: Method, path: &str, body: Option<&Value>) -> ReplResult<Value>;
}

/// One request observed by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: Method,
    /// Request path.
    pub path: String,
    /// Request body, if one was sent.
    pub body: Option<Value>,
}

struct MockRule {
    method: Method,
    path_prefix: String,
    queued: VecDeque<ReplResult<Value>>,
    sticky: Option<ReplResult<Value>>,
}

/// A mock transport scripted with per-endpoint responses.
///
/// Responses are matched by method and longest path prefix. Queued
/// responses (via [`MockTransport::push_response`]) are consumed first, in
/// order; a sticky response (via [`MockTransport::set_response`] or
/// [`MockTransport::set_error`]) answers every remaining call. Unmatched
/// requests answer 404.
#[derive(Default)]
pub struct MockTransport {
    rules: Mutex<Vec<MockRule>>,
    log: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    /// Creates a mock with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    fn rule_mut<'a>(
        rules: &'a mut Vec<MockRule>,
        method: Method,
        path_prefix: &str,
    ) -> &'a mut MockRule {
        let position = rules
            .iter()
            .position(|r| r.method == method && r.path_prefix == path_prefix);
        match position {
            Some(i) => &mut rules[i],
            None => {
                rules.push(MockRule {
                    method,
                    path_prefix: path_prefix.to_string(),
                    queued: VecDeque::new(),
                    sticky: None,
                });
                rules.last_mut().unwrap()
            }
        }
    }

    /// Sets the response for every request matching the prefix.
    pub fn set_response(&self, method: Method, path_prefix: &str, response: Value) {
        let mut rules = self.rules.lock();
        Self::rule_mut(&mut rules, method, path_prefix).sticky = Some(Ok(response));
    }

    /// Sets the error for every request matching the prefix.
    pub fn set_error(&self, method: Method, path_prefix: &str, error: ReplError) {
        let mut rules = self.rules.lock();
        Self::rule_mut(&mut rules, method, path_prefix).sticky = Some(Err(error));
    }

    /// Queues a one-shot response for the prefix, consumed before any
    /// sticky response.
    pub fn push_response(&self, method: Method, path_prefix: &str, result: ReplResult<Value>) {
        let mut rules = self.rules.lock();
        Self::rule_mut(&mut rules, method, path_prefix)
            .queued
            .push_back(result);
    }

    /// Every request observed so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.log.lock().clone()
    }

    /// Observed requests matching a method and path prefix.
    pub fn requests_matching(&self, method: Method, path_prefix: &str) -> Vec<RecordedRequest> {
        self.log
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path.starts_with(path_prefix))
            .cloned()
            .collect()
    }
}

impl Transport for MockTransport {
    fn send(&self, method: Method, path: &str, body: Option<&Value>) -> ReplResult<Value> {
        self.log.lock().push(RecordedRequest {
            method,
            path: path.to_string(),
            body: body.cloned(),
        });

        let mut rules = self.rules.lock();
        let best = rules
            .iter_mut()
            .filter(|r| r.method == method && path.starts_with(r.path_prefix.as_str()))
            .max_by_key(|r| r.path_prefix.len());

        match best {
            Some(rule) => match rule.queued.pop_front() {
                Some(result) => result,
                None => match &rule.sticky {
                    Some(result) => result.clone(),
                    None => Err(ReplError::from_status(
                        404,
                        format!("no mock response for {} {}", method.as_str(), path),
                    )),
                },
            },
            None => Err(ReplError::from_status(
                404,
                format!("no mock response for {} {}", method.as_str(), path),
            )),
        }
    }
}
