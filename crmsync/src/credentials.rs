//! Credential store shared by the session and the REST client.
//!
//! Holds the bearer token and username of the logged-in user. Token issuance
//! happens elsewhere; this type only remembers the result of a login.

use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Login {
    token: String,
    username: String,
}

/// Cloneable handle to the current login, if any.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    inner: Arc<RwLock<Option<Login>>>,
}

impl Credentials {
    /// Create an empty store (logged out).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that is already logged in.
    #[must_use]
    pub fn with_login(token: impl Into<String>, username: impl Into<String>) -> Self {
        let creds = Self::new();
        creds.set(token, username);
        creds
    }

    /// Record a login, replacing any previous one.
    pub fn set(&self, token: impl Into<String>, username: impl Into<String>) {
        *self.inner.write() = Some(Login {
            token: token.into(),
            username: username.into(),
        });
    }

    /// Forget the current login.
    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    /// Bearer token of the current login.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.inner.read().as_ref().map(|l| l.token.clone())
    }

    /// Username of the current login.
    #[must_use]
    pub fn username(&self) -> Option<String> {
        self.inner.read().as_ref().map(|l| l.username.clone())
    }

    /// Token and username together, read atomically.
    #[must_use]
    pub fn login(&self) -> Option<(String, String)> {
        self.inner
            .read()
            .as_ref()
            .map(|l| (l.token.clone(), l.username.clone()))
    }
}
