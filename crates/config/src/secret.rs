use serde::{Deserialize, Serialize};
use std::fmt;

const REDACTED: &str = "***";

/// A string that must never end up in logs.
///
/// `Debug` and `Display` both print a placeholder; use [`expose()`](Self::expose)
/// at the single point where the real value is needed (building request
/// headers).
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Secret").field(&REDACTED).finish()
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatting_never_leaks() {
        let secret = Secret::new("eyJhbGciOiJIUzI1NiJ9.service-role");
        assert_eq!(format!("{secret}"), "***");
        assert!(!format!("{secret:?}").contains("service-role"));
        assert_eq!(secret.expose(), "eyJhbGciOiJIUzI1NiJ9.service-role");
    }

    #[test]
    fn test_whitespace_counts_as_empty() {
        assert!(Secret::new("  ").is_empty());
        assert!(!Secret::new("key").is_empty());
    }
}
