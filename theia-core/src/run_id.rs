//! Run identifiers.
//!
//! A run id namespaces every artifact one training invocation writes:
//! checkpoints, best-model snapshots, saved weights and tracked metrics.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp layout used for generated ids.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Length of the random suffix appended to generated ids.
const SUFFIX_LEN: usize = 8;

/// Identifier of a single training run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Wrap a caller-supplied id.
    ///
    /// The id becomes a directory name, so it must be non-empty and free of
    /// path separators, parent references and whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self, CoreError> {
        let id = id.into();
        let reason = if id.is_empty() {
            Some("must not be empty")
        } else if id.contains('/') || id.contains('\\') {
            Some("must not contain path separators")
        } else if id == "." || id.contains("..") {
            Some("must not reference parent directories")
        } else if id.chars().any(char::is_whitespace) {
            Some("must not contain whitespace")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(CoreError::InvalidRunId {
                id,
                reason: reason.to_string(),
            }),
            None => Ok(Self(id)),
        }
    }

    /// Generate a fresh id: local timestamp plus a random suffix.
    pub fn generate() -> Self {
        let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT);
        Self(format!("{timestamp}_{}", random_suffix()))
    }

    /// This id with a random suffix appended, e.g. `dense_1f0c9a2b`.
    pub fn with_random_suffix(&self) -> Self {
        Self(format!("{}_{}", self.0, random_suffix()))
    }

    /// Use `explicit` when given, otherwise generate an id.
    ///
    /// The flag reports whether the id came from the caller.
    pub fn resolve(explicit: Option<&str>) -> Result<(Self, bool), CoreError> {
        match explicit {
            Some(id) => Ok((Self::new(id)?, true)),
            None => Ok((Self::generate(), false)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn random_suffix() -> String {
    let mut uuid = uuid::Uuid::new_v4().simple().to_string();
    uuid.truncate(SUFFIX_LEN);
    uuid
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<std::path::Path> for RunId {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(&self.0)
    }
}

impl TryFrom<String> for RunId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}
