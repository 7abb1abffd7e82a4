use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while decoding a tagged log stream.
///
/// Offsets are char positions into the decoded input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid tag timestamp {digits:?} at offset {offset}")]
    InvalidTimestamp { digits: String, offset: usize },

    #[error("tag close without a tag open at offset {offset}")]
    StrayTagClose { offset: usize },
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read log file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse log file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },
}

impl LoadError {
    /// True when the log file simply does not exist yet.
    pub fn is_missing(&self) -> bool {
        matches!(self, LoadError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}
