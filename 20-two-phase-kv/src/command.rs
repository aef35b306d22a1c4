use std::fmt;

use serde::{Deserialize, Serialize};

/// Mutations that go through the two-phase commit protocol.
///
/// GET never appears here: reads bypass the coordinator entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Put,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Put => f.write_str("PUT"),
            Operation::Delete => f.write_str("DELETE"),
        }
    }
}

/// One in-flight change: what a replica stages on prepare and applies on commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub operation: Operation,
    pub key: String,
    pub value: Option<String>,
}

impl Proposal {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            operation: Operation::Put,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            operation: Operation::Delete,
            key: key.into(),
            value: None,
        }
    }

    /// A PUT must carry a value; a DELETE never needs one.
    pub fn is_well_formed(&self) -> bool {
        match self.operation {
            Operation::Put => self.value.is_some(),
            Operation::Delete => true,
        }
    }
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{} {} {}", self.operation, self.key, value),
            None => write!(f, "{} {}", self.operation, self.key),
        }
    }
}
