//! Writer backend trait for dataset output
//!
//! Defines the interface for appending serialized records to storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum WriterError {
    /// Output directory or period file could not be created or opened
    Open { path: PathBuf, source: io::Error },
    /// Appending or flushing a line failed
    Append { path: PathBuf, source: io::Error },
    /// Item could not be encoded as a single JSON line
    Encode(serde_json::Error),
}

impl WriterError {
    pub fn open(path: &Path, source: io::Error) -> Self {
        WriterError::Open {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn append(path: &Path, source: io::Error) -> Self {
        WriterError::Append {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for WriterError {
    fn from(err: serde_json::Error) -> Self {
        WriterError::Encode(err)
    }
}

impl std::fmt::Display for WriterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriterError::Open { path, source } => {
                write!(f, "Cannot open dataset file {}: {}", path.display(), source)
            }
            WriterError::Append { path, source } => {
                write!(f, "Failed to append to {}: {}", path.display(), source)
            }
            WriterError::Encode(e) => write!(f, "Cannot encode record as JSON line: {}", e),
        }
    }
}

impl std::error::Error for WriterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WriterError::Open { source, .. } | WriterError::Append { source, .. } => Some(source),
            WriterError::Encode(e) => Some(e),
        }
    }
}

/// Backend trait for append-only line storage
#[async_trait]
pub trait WriterBackend: Send {
    /// Append one line. `at` selects the rotation period the line belongs to.
    /// The line must be durable (flushed) when this returns.
    async fn append_line(&mut self, line: &str, at: DateTime<Utc>) -> Result<(), WriterError>;

    async fn flush(&mut self) -> Result<(), WriterError>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}
