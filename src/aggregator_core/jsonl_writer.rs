//! JSONL writer with time-based file rotation
//!
//! Lines land in `<dir>/<prefix>_<period>.jsonl`; a new file is opened the
//! first time a line belongs to a new period. Every append is flushed.

use super::writer_backend::{WriterBackend, WriterError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPeriod {
    Hourly,
    Daily,
    Monthly,
}

impl RotationPeriod {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "hourly" => Some(RotationPeriod::Hourly),
            "daily" => Some(RotationPeriod::Daily),
            "monthly" => Some(RotationPeriod::Monthly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RotationPeriod::Hourly => "hourly",
            RotationPeriod::Daily => "daily",
            RotationPeriod::Monthly => "monthly",
        }
    }

    /// Period label used in file names
    pub fn stamp(&self, at: DateTime<Utc>) -> String {
        let format = match self {
            RotationPeriod::Hourly => "%Y%m%d%H",
            RotationPeriod::Daily => "%Y%m%d",
            RotationPeriod::Monthly => "%Y%m",
        };
        at.format(format).to_string()
    }
}

pub struct RotatingJsonlWriter {
    dir: PathBuf,
    prefix: String,
    period: RotationPeriod,
    current: Option<PeriodFile>,
}

struct PeriodFile {
    stamp: String,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl PeriodFile {
    fn flush(&mut self) -> Result<(), WriterError> {
        self.writer
            .flush()
            .map_err(|e| WriterError::append(&self.path, e))
    }
}

impl RotatingJsonlWriter {
    /// Creates `dir` if missing; files are opened lazily on first append.
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        period: RotationPeriod,
    ) -> Result<Self, WriterError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| WriterError::open(&dir, e))?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
            period,
            current: None,
        })
    }

    pub fn path_for(&self, at: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{}_{}.jsonl", self.prefix, self.period.stamp(at)))
    }

    fn file_for(&mut self, at: DateTime<Utc>) -> Result<&mut PeriodFile, WriterError> {
        let stamp = self.period.stamp(at);
        let stale = self
            .current
            .as_ref()
            .map_or(true, |current| current.stamp != stamp);

        if stale {
            if let Some(mut previous) = self.current.take() {
                previous.flush()?;
            }
            let path = self.path_for(at);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| WriterError::open(&path, e))?;
            log::info!("📝 Writing {} to: {}", self.prefix, path.display());
            self.current = Some(PeriodFile {
                stamp,
                path,
                writer: BufWriter::new(file),
            });
        }

        let path = self.path_for(at);
        self.current.as_mut().ok_or_else(|| {
            WriterError::open(&path, io::Error::new(io::ErrorKind::NotFound, "no open period file"))
        })
    }
}

impl Drop for RotatingJsonlWriter {
    fn drop(&mut self) {
        if let Some(current) = self.current.as_mut() {
            let _ = current.flush();
        }
    }
}

#[async_trait]
impl WriterBackend for RotatingJsonlWriter {
    async fn append_line(&mut self, line: &str, at: DateTime<Utc>) -> Result<(), WriterError> {
        let file = self.file_for(at)?;
        writeln!(file.writer, "{}", line).map_err(|e| WriterError::append(&file.path, e))?;
        file.flush()
    }

    async fn flush(&mut self) -> Result<(), WriterError> {
        match self.current.as_mut() {
            Some(current) => current.flush(),
            None => Ok(()),
        }
    }

    fn backend_type(&self) -> &'static str {
        "JSONL"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_period_stamps() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 30, 0).unwrap();
        assert_eq!(RotationPeriod::Monthly.stamp(at), "202403");
        assert_eq!(RotationPeriod::Daily.stamp(at), "20240309");
        assert_eq!(RotationPeriod::Hourly.stamp(at), "2024030907");
        assert_eq!(RotationPeriod::from_str("Daily"), Some(RotationPeriod::Daily));
        assert_eq!(RotationPeriod::from_str("weekly"), None);
    }

    #[tokio::test]
    async fn test_rotates_across_periods() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            RotatingJsonlWriter::new(dir.path().join("out"), "training_data", RotationPeriod::Monthly)
                .unwrap();

        let march = Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 0).unwrap();
        let april = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 1).unwrap();
        writer.append_line("{\"n\":1}", march).await.unwrap();
        writer.append_line("{\"n\":2}", march).await.unwrap();
        writer.append_line("{\"n\":3}", april).await.unwrap();

        let march_file =
            std::fs::read_to_string(dir.path().join("out/training_data_202403.jsonl")).unwrap();
        let april_file =
            std::fs::read_to_string(dir.path().join("out/training_data_202404.jsonl")).unwrap();
        assert_eq!(march_file.lines().count(), 2);
        assert_eq!(april_file, "{\"n\":3}\n");
    }

    #[tokio::test]
    async fn test_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        {
            let mut writer =
                RotatingJsonlWriter::new(dir.path(), "dpo_pairs", RotationPeriod::Daily).unwrap();
            writer.append_line("first", at).await.unwrap();
        }
        let mut writer =
            RotatingJsonlWriter::new(dir.path(), "dpo_pairs", RotationPeriod::Daily).unwrap();
        writer.append_line("second", at).await.unwrap();

        let content = std::fs::read_to_string(writer.path_for(at)).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_open_failure_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, "file in the way").unwrap();

        let err =
            RotatingJsonlWriter::new(blocker.join("out"), "training_data", RotationPeriod::Monthly)
                .err()
                .unwrap();
        assert!(matches!(err, WriterError::Open { ref path, .. } if path.ends_with("out")));
        assert!(err.to_string().contains("not_a_dir"));
    }
}
