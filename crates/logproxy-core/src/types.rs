use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for one connected viewer.
///
/// A reconnecting client always gets a fresh id; ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerId(pub Uuid);

impl ConsumerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One ingested log line.
///
/// Field order is part of the wire contract: `timestamp` is serialized
/// before `text`, the timestamp as an RFC 3339 instant in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

impl LogEvent {
    /// Stamp `text` with the current wall clock.
    pub fn new(text: impl Into<String>) -> Self {
        Self::at(Utc::now(), text)
    }

    pub fn at(timestamp: DateTime<Utc>, text: impl Into<String>) -> Self {
        Self {
            timestamp,
            text: text.into(),
        }
    }

    /// Encode to the JSON wire record.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
