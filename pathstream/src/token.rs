//! Consistency tokens and the modes that decide whether reads are pinned to one.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque version marker (an entity tag) of a path's committed state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsistencyToken(Arc<str>);

impl ConsistencyToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Arc::from(value.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsistencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsistencyToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ConsistencyToken {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// How a read stream reacts to the remote path changing underneath it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyMode {
    /// No token is requested or checked.
    None,
    /// Reads are pinned to the token observed on the first read, or to the
    /// caller-supplied one.
    #[default]
    Etag,
}

impl fmt::Display for ConsistencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyMode::None => f.write_str("none"),
            ConsistencyMode::Etag => f.write_str("etag"),
        }
    }
}

impl std::str::FromStr for ConsistencyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(ConsistencyMode::None),
            "etag" => Ok(ConsistencyMode::Etag),
            other => Err(format!("unknown consistency mode '{other}'")),
        }
    }
}
