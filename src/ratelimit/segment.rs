//! Query segments.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ArlError;

/// The time window a count query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    /// The current one-second bucket
    Second,
    /// Every bucket the tier still retains for the key
    Hour,
}

impl Segment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::Second => "second",
            Segment::Hour => "hour",
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Segment {
    type Err = ArlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "second" => Ok(Segment::Second),
            "hour" => Ok(Segment::Hour),
            _ => Err(ArlError::UnknownSegment(s.to_string())),
        }
    }
}

/// Wire encoding used by byte-oriented callers: 0 is second, 1 is hour.
impl TryFrom<u8> for Segment {
    type Error = ArlError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Segment::Second),
            1 => Ok(Segment::Hour),
            other => Err(ArlError::UnknownSegment(other.to_string())),
        }
    }
}
