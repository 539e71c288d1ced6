//! Worker identity token.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::SourceError;

/// Identities end up in file names and shell command lines, so keep them to
/// a conservative character set.
static IDENTITY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid identity regex"));

/// Maximum identity length in bytes.
const MAX_IDENTITY_LEN: usize = 64;

/// Opaque, stable name of one worker slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Validate and wrap an identity name.
    pub fn new(name: impl Into<String>) -> Result<Self, SourceError> {
        let name = name.into();
        if name.len() > MAX_IDENTITY_LEN {
            return Err(SourceError::InvalidIdentity {
                reason: format!("longer than {MAX_IDENTITY_LEN} bytes"),
                name,
            });
        }
        if !IDENTITY_PATTERN.is_match(&name) {
            return Err(SourceError::InvalidIdentity {
                name,
                reason: "only ASCII letters, digits, '.', '-' and '_' are allowed".to_string(),
            });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identity {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
