//! Bearer-token authentication for broker connections.

use std::collections::HashMap;

/// Static table mapping bearer tokens to usernames.
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    tokens: HashMap<String, String>,
}

impl TokenTable {
    /// Build a table from `(token, username)` pairs.
    pub fn from_pairs<T, U>(pairs: impl IntoIterator<Item = (T, U)>) -> Self
    where
        T: Into<String>,
        U: Into<String>,
    {
        Self {
            tokens: pairs
                .into_iter()
                .map(|(token, user)| (token.into(), user.into()))
                .collect(),
        }
    }

    /// Username the token belongs to, if any. Empty tokens never match.
    #[must_use]
    pub fn lookup(&self, token: &str) -> Option<&str> {
        if token.is_empty() {
            return None;
        }
        self.tokens.get(token).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl From<HashMap<String, String>> for TokenTable {
    fn from(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}
