//! Error types for selection, archiving, extraction, and the wire protocol

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Framing and codec errors on an archive or job stream
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("path traversal attempt blocked: {0}")]
    PathTraversal(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("protocol version mismatch (expected {expected}, got {actual})")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("stream ended before the end-of-archive marker")]
    Truncated,

    #[error("archive declared {declared} entries but carried {actual}")]
    CountMismatch { declared: u64, actual: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

/// Which part of a transfer failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureSide {
    /// Scanning or reading the source tree
    SourceScan,
    /// Producing or consuming the byte stream
    Stream,
    /// Creating or writing destination files
    DestinationWrite,
    /// Setting up or tearing down the channel between nodes
    Channel,
}

impl fmt::Display for FailureSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureSide::SourceScan => write!(f, "source scan"),
            FailureSide::Stream => write!(f, "stream"),
            FailureSide::DestinationWrite => write!(f, "destination write"),
            FailureSide::Channel => write!(f, "channel"),
        }
    }
}

/// Common view over the errors a transfer half can produce.
pub trait TransferFailure: std::error::Error {
    /// The side that failed
    fn side(&self) -> FailureSide;

    /// Offending relative path, when one is known
    fn path(&self) -> Option<&str> {
        None
    }

    /// Flatten into the form sent back from a remote node
    fn to_remote(&self) -> RemoteFailure {
        RemoteFailure {
            side: self.side(),
            path: self.path().map(str::to_owned),
            message: self.to_string(),
        }
    }
}

/// Errors while choosing the files to transfer
#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("failed to scan {path}: {source}")]
    Walk {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl TransferFailure for SelectionError {
    fn side(&self) -> FailureSide {
        FailureSide::SourceScan
    }

    fn path(&self) -> Option<&str> {
        match self {
            SelectionError::Pattern { .. } => None,
            SelectionError::Walk { path, .. } => Some(path),
        }
    }
}

/// Errors while serializing a selection into an archive stream
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("{path} changed while being archived (expected {expected} bytes, read {actual})")]
    Changed {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("failed to write archive stream: {0}")]
    Stream(#[source] ProtocolError),
}

impl From<io::Error> for ArchiveError {
    fn from(e: io::Error) -> Self {
        ArchiveError::Stream(ProtocolError::Io(e))
    }
}

impl TransferFailure for ArchiveError {
    fn side(&self) -> FailureSide {
        match self {
            ArchiveError::Read { .. } | ArchiveError::Changed { .. } => FailureSide::SourceScan,
            ArchiveError::Stream(_) => FailureSide::Stream,
        }
    }

    fn path(&self) -> Option<&str> {
        match self {
            ArchiveError::Read { path, .. } | ArchiveError::Changed { path, .. } => Some(path),
            ArchiveError::Stream(_) => None,
        }
    }
}

/// Errors while materializing entries under a destination root
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("refusing entry {path}: {reason}")]
    PathTraversal { path: String, reason: String },

    #[error("failed to read archive stream at {}: {source}", .path.as_deref().unwrap_or("start"))]
    Stream {
        path: Option<String>,
        #[source]
        source: ProtocolError,
    },
}

impl ExtractionError {
    pub(crate) fn write(path: &str, source: io::Error) -> Self {
        ExtractionError::Write {
            path: path.to_owned(),
            source,
        }
    }

    pub(crate) fn stream(path: Option<&str>, source: ProtocolError) -> Self {
        ExtractionError::Stream {
            path: path.map(str::to_owned),
            source,
        }
    }
}

impl TransferFailure for ExtractionError {
    fn side(&self) -> FailureSide {
        match self {
            ExtractionError::Write { .. } | ExtractionError::PathTraversal { .. } => {
                FailureSide::DestinationWrite
            }
            ExtractionError::Stream { .. } => FailureSide::Stream,
        }
    }

    fn path(&self) -> Option<&str> {
        match self {
            ExtractionError::Write { path, .. } | ExtractionError::PathTraversal { path, .. } => {
                Some(path)
            }
            ExtractionError::Stream { path, .. } => path.as_deref(),
        }
    }
}

/// Which half of a co-located copy failed
#[derive(Error, Debug)]
pub enum CopyFailure {
    #[error(transparent)]
    Source(#[from] ArchiveError),

    #[error(transparent)]
    Destination(#[from] ExtractionError),
}

impl TransferFailure for CopyFailure {
    fn side(&self) -> FailureSide {
        match self {
            CopyFailure::Source(e) => e.side(),
            CopyFailure::Destination(e) => e.side(),
        }
    }

    fn path(&self) -> Option<&str> {
        match self {
            CopyFailure::Source(e) => e.path(),
            CopyFailure::Destination(e) => e.path(),
        }
    }
}

/// A co-located copy that stopped part way
#[derive(Error, Debug)]
#[error("copy stopped after {copied} entries: {source}")]
pub struct CopyError {
    /// Entries fully written before the failure
    pub copied: u64,
    #[source]
    pub source: CopyFailure,
}

impl TransferFailure for CopyError {
    fn side(&self) -> FailureSide {
        self.source.side()
    }

    fn path(&self) -> Option<&str> {
        self.source.path()
    }
}

/// Failure reported by the counterpart of an asynchronous transfer.
///
/// Travels over the wire, so it carries a rendered message rather than the
/// original error value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub side: FailureSide,
    pub path: Option<String>,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(side: FailureSide, message: impl Into<String>) -> Self {
        Self {
            side,
            path: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{} failed at {}: {}", self.side, path, self.message),
            None => write!(f, "{} failed: {}", self.side, self.message),
        }
    }
}

impl std::error::Error for RemoteFailure {}
