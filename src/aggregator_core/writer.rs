//! Dataset writers
//!
//! `DatasetWriter` appends completed records, `PairWriter` appends DPO pairs.
//! Both count successes and failures; a failed write is reported to the
//! caller once and never retried.

use super::jsonl_writer::{RotatingJsonlWriter, RotationPeriod};
use super::preference::PreferencePair;
use super::record::CompleteRecord;
use super::writer_backend::{WriterBackend, WriterError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

pub const TRAINING_DATA_PREFIX: &str = "training_data";
pub const DPO_PAIRS_PREFIX: &str = "dpo_pairs";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub written: u64,
    pub failed: u64,
}

/// Serializes items and hands them to a backend, keeping counts
struct CountingWriter {
    backend: Box<dyn WriterBackend>,
    stats: WriterStats,
}

impl CountingWriter {
    async fn write<T: Serialize>(&mut self, item: &T, at: DateTime<Utc>) -> Result<(), WriterError> {
        let result = match serde_json::to_string(item) {
            Ok(line) => self.backend.append_line(&line, at).await,
            Err(e) => Err(WriterError::from(e)),
        };
        match result {
            Ok(()) => self.stats.written += 1,
            Err(_) => self.stats.failed += 1,
        }
        result
    }
}

pub struct DatasetWriter {
    inner: CountingWriter,
}

impl DatasetWriter {
    /// JSONL output at `<dir>/training_data_<period>.jsonl`
    pub fn jsonl(dir: impl Into<PathBuf>, period: RotationPeriod) -> Result<Self, WriterError> {
        let backend = RotatingJsonlWriter::new(dir, TRAINING_DATA_PREFIX, period)?;
        Ok(Self::with_backend(Box::new(backend)))
    }

    pub fn with_backend(backend: Box<dyn WriterBackend>) -> Self {
        Self {
            inner: CountingWriter {
                backend,
                stats: WriterStats::default(),
            },
        }
    }

    /// Append one record; rotation follows the record's completion time.
    pub async fn write(&mut self, record: &CompleteRecord) -> Result<(), WriterError> {
        self.inner.write(record, record.completed_at).await
    }

    pub async fn flush(&mut self) -> Result<(), WriterError> {
        self.inner.backend.flush().await
    }

    pub fn backend_type(&self) -> &'static str {
        self.inner.backend.backend_type()
    }

    pub fn stats(&self) -> WriterStats {
        self.inner.stats
    }
}

pub struct PairWriter {
    inner: CountingWriter,
}

impl PairWriter {
    /// JSONL output at `<dir>/dpo_pairs_<period>.jsonl`
    pub fn jsonl(dir: impl Into<PathBuf>, period: RotationPeriod) -> Result<Self, WriterError> {
        let backend = RotatingJsonlWriter::new(dir, DPO_PAIRS_PREFIX, period)?;
        Ok(Self::with_backend(Box::new(backend)))
    }

    pub fn with_backend(backend: Box<dyn WriterBackend>) -> Self {
        Self {
            inner: CountingWriter {
                backend,
                stats: WriterStats::default(),
            },
        }
    }

    pub async fn write(&mut self, pair: &PreferencePair) -> Result<(), WriterError> {
        self.inner.write(pair, pair.created_at).await
    }

    pub async fn flush(&mut self) -> Result<(), WriterError> {
        self.inner.backend.flush().await
    }

    pub fn stats(&self) -> WriterStats {
        self.inner.stats
    }
}
