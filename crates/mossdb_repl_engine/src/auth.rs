//! Authentication interface for the remote database.

use serde_json::{json, Value};

/// Negotiates authentication with the remote database.
///
/// The engine only asks three questions: whether a cookie session must be
/// established before replicating, what to POST to log in, and where to
/// POST it. Credential storage and header-based schemes live behind the
/// transport and are invisible here.
pub trait Authenticator: Send + Sync {
    /// Returns true if a cookie session must be probed/established before
    /// replicating.
    fn uses_cookie_login(&self) -> bool;

    /// The login request body, or `None` when no login is required.
    fn login_parameters(&self, remote_url: &str) -> Option<Value>;

    /// The path the login body is POSTed to.
    fn login_path(&self, remote_url: &str) -> String;
}

/// Name/password authenticator for `_session`-style cookie login.
#[derive(Debug, Clone)]
pub struct SessionAuthenticator {
    username: String,
    password: String,
}

impl SessionAuthenticator {
    /// Creates an authenticator for the given credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Authenticator for SessionAuthenticator {
    fn uses_cookie_login(&self) -> bool {
        true
    }

    fn login_parameters(&self, _remote_url: &str) -> Option<Value> {
        Some(json!({
            "name": self.username,
            "password": self.password,
        }))
    }

    fn login_path(&self, _remote_url: &str) -> String {
        "/_session".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_authenticator_login() {
        let auth = SessionAuthenticator::new("alice", "secret");
        assert!(auth.uses_cookie_login());
        assert_eq!(auth.login_path("http://remote/db"), "/_session");

        let params = auth.login_parameters("http://remote/db").unwrap();
        assert_eq!(params["name"], json!("alice"));
        assert_eq!(params["password"], json!("secret"));
    }
}
