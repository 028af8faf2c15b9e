use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// A canonical UTC timestamp string, `YYYY-MM-DDTHH:MM:SS.mmmZ`.
///
/// Timestamps are assigned once by the replica a message originates on
/// and then stored and replicated verbatim: the string itself is the
/// identity key, and its fixed width makes lexicographic order the
/// chronological order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Timestamp(SmolStr);

const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// The earliest representable instant after `self`, one millisecond
    /// on. Falls back to the current clock for unparseable input.
    pub fn successor(&self) -> Self {
        match DateTime::parse_from_rfc3339(self.as_str()) {
            Ok(instant) => {
                Self::from_datetime(instant.with_timezone(&Utc) + TimeDelta::milliseconds(1))
            }
            Err(_) => Self::now(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_datetime(instant: DateTime<Utc>) -> Self {
        Self(SmolStr::new(instant.format(FORMAT).to_string()))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Timestamp {
    fn from(value: &str) -> Self {
        Self(SmolStr::new(value))
    }
}

impl From<String> for Timestamp {
    fn from(value: String) -> Self {
        Self(SmolStr::new(value))
    }
}
