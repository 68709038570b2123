// src/error.rs
//
// Error taxonomy for snippet generation.
//
//   Config   - camera folder missing, no segment files in it
//   Range    - query end <= start, or query outside indexed coverage
//   Assembly - nothing resolved to assemble
//   Io       - media open/read/write failure
//   Tracker  - per-object tracker init/update failure (recovered locally)
//   Cancelled - abandoned by the runner after its timeout

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::TimeRange;

pub type Result<T> = std::result::Result<T, SnippetError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Range,
    Assembly,
    Io,
    Tracker,
    Cancelled,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Range => "range",
            Self::Assembly => "assembly",
            Self::Io => "io",
            Self::Tracker => "tracker",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SnippetError {
    #[error("camera folder {} does not exist", .0.display())]
    FolderNotFound(PathBuf),

    #[error("no segment files named YYYY-MM-DDTHH-MM-SSZ.mp4 in {}", .0.display())]
    NoSegments(PathBuf),

    #[error("end time {end} is not after start time {start}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("requested {query} lies outside indexed coverage {first_start} - {last_end}")]
    OutsideCoverage {
        query: TimeRange,
        first_start: DateTime<Utc>,
        last_end: DateTime<Utc>,
    },

    #[error("no segments overlap {0}")]
    NoOverlap(TimeRange),

    #[error("nothing to assemble for {0}: resolved segment list is empty")]
    EmptyResolution(TimeRange),

    #[error("media I/O on {target}: {reason}")]
    Io { target: String, reason: String },

    #[error("tracker failure: {0}")]
    Tracker(String),

    #[error("task cancelled")]
    Cancelled,
}

impl SnippetError {
    pub fn io(path: &Path, reason: impl fmt::Display) -> Self {
        Self::Io {
            target: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// I/O failure not tied to a file, e.g. drawing onto a decoded frame.
    pub fn media(target: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Io {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn tracker(reason: impl fmt::Display) -> Self {
        Self::Tracker(reason.to_string())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::FolderNotFound(_) | Self::NoSegments(_) => ErrorCategory::Config,
            Self::InvalidRange { .. } | Self::OutsideCoverage { .. } | Self::NoOverlap(_) => {
                ErrorCategory::Range
            }
            Self::EmptyResolution(_) => ErrorCategory::Assembly,
            Self::Io { .. } => ErrorCategory::Io,
            Self::Tracker(_) => ErrorCategory::Tracker,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }
}
