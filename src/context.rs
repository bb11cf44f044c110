//! Request context and the well-known keys standard strategies read from it.
use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Context key holding the id of the current user.
pub const USER_ID: &str = "userId";
/// Context key holding the id of the current session.
pub const SESSION_ID: &str = "sessionId";
/// Context key holding the address of the remote peer.
pub const REMOTE_ADDRESS: &str = "remoteAddress";
/// Context key holding the hostname of the application instance.
pub const HOSTNAME: &str = "HOSTNAME";

/// Per-request data consulted by strategies (user id, session id, remote address, ...).
///
/// There is no fixed schema. Strategies read only the keys they understand and treat a missing
/// key as "not applicable".
///
/// ```
/// # use unleash_client::Context;
/// let context = Context::new()
///     .with("userId", "42")
///     .with("remoteAddress", "10.0.0.1");
/// assert_eq!(context.get("userId"), Some("42"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, From, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(HashMap<String, String>);

impl Context {
    /// Create an empty context.
    pub fn new() -> Context {
        Context::default()
    }

    /// Return the context with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Context {
        self.insert(key, value);
        self
    }

    /// Set `key` to `value`, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Get the value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Get the value for `key`, treating an empty string as absent.
    pub(crate) fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Context {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Context(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
