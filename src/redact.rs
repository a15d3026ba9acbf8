//! User-data log redaction.
//!
//! Document keys are user data. Anywhere a key can reach a log line or an
//! error message it is wrapped in `<ud>` tags so a downstream redaction pass
//! can strip it. The raw key stays available for wire use via `as_str`.

use std::fmt;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RedactedKey(String);

impl RedactedKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The unredacted key, for wire encoding only.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RedactedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ud>{}</ud>", self.0)
    }
}

impl fmt::Debug for RedactedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ud>{}</ud>", self.0)
    }
}

impl From<&str> for RedactedKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for RedactedKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}
