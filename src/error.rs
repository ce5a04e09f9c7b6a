use std::time::Duration;

use thiserror::Error;

/// A stream chunk that could not be decoded into a report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed frame ({reason}): {line:?}")]
pub struct MalformedFrame {
    pub line: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    MalformedFrame(#[from] MalformedFrame),

    #[error("invalid snapshot: {field} {reason}")]
    InvalidSnapshot {
        field: String,
        reason: &'static str,
    },

    #[error("command failed (exit status: {status:?}): {stderr}")]
    CommandFailed {
        status: Option<i32>,
        stderr: String,
    },

    #[error("command timed out after {0:?}")]
    CommandTimeout(Duration),

    #[error("session crashed: {0}")]
    SessionCrashed(String),

    #[error("failed to spawn {program}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A setting was issued before the first full-state snapshot arrived.
    #[error("device state not available yet")]
    NotReady,

    /// The session ended while the command was still in flight.
    #[error("command cancelled: session ended")]
    Cancelled,
}

impl Error {
    pub(crate) fn missing(field: &str) -> Self {
        Error::InvalidSnapshot {
            field: field.to_string(),
            reason: "is missing",
        }
    }

    pub(crate) fn no_report(source: &str) -> Self {
        Error::InvalidSnapshot {
            field: source.to_string(),
            reason: "contains no report",
        }
    }

    pub(crate) fn mistyped(field: &str) -> Self {
        Error::InvalidSnapshot {
            field: field.to_string(),
            reason: "has an unexpected type",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
