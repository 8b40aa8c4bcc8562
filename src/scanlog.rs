use chrono::{DateTime, Utc};
use log::error;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

use crate::error::FlyScanError;

/// One completed scan line, as appended to the JSONL scan log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanLineRecord {
    pub timestamp: DateTime<Utc>,
    pub start: f64,
    pub end: f64,
    pub step: f64,
    pub trigger_period: f64,
    pub triggers: u64,
    pub captured: u64,
    pub elapsed_s: f64,
}

/// Buffered JSONL writer for per-line scan records.
#[derive(Debug)]
pub struct ScanLog {
    buffer: Vec<ScanLineRecord>,
    buffer_size: usize,
    file_path: PathBuf,
    flush_failures: usize,
    max_flush_failures: usize,
}

impl ScanLog {
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize) -> Self {
        let mut path = file_path.into();
        if path.extension() != Some(std::ffi::OsStr::new("jsonl")) {
            path.set_extension("jsonl");
        }

        Self {
            buffer: Vec::with_capacity(buffer_size),
            buffer_size,
            file_path: path,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    pub fn add(&mut self, record: ScanLineRecord) -> Result<(), FlyScanError> {
        self.buffer.push(record);

        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }

        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), FlyScanError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let file_result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path);

        let mut file = match file_result {
            Ok(f) => f,
            Err(e) => {
                self.flush_failures += 1;
                error!(
                    "Flush failure {}/{}: failed to open scan log: {}",
                    self.flush_failures, self.max_flush_failures, e
                );
                if self.flush_failures >= self.max_flush_failures {
                    return Err(FlyScanError::Io(e));
                }
                return Ok(());
            }
        };

        for record in &self.buffer {
            let line = serde_json::to_string(record)
                .map_err(|e| FlyScanError::Protocol(format!("Record serialization failed: {e}")))?;
            writeln!(file, "{line}")?;
        }

        self.buffer.clear();
        self.flush_failures = 0;
        Ok(())
    }
}

impl Drop for ScanLog {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ScanLineRecord {
        ScanLineRecord {
            timestamp: Utc::now(),
            start: 0.0,
            end: 9.0,
            step: 1.0,
            trigger_period: 0.1,
            triggers: 10,
            captured: 10,
            elapsed_s: 1.25,
        }
    }

    #[test]
    fn test_records_written_as_jsonl() {
        let dir = std::env::temp_dir().join("zebra-flyscan-scanlog-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("lines");

        {
            let mut log = ScanLog::new(&path, 8);
            log.add(record()).unwrap();
            log.add(record()).unwrap();
            // Drop flushes the buffered records
        }

        let written = std::fs::read_to_string(path.with_extension("jsonl")).unwrap();
        let lines: Vec<_> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: ScanLineRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.triggers, 10);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_buffer_flushes_when_full() {
        let dir = std::env::temp_dir().join("zebra-flyscan-scanlog-full-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("lines");

        let mut log = ScanLog::new(&path, 2);
        log.add(record()).unwrap();
        log.add(record()).unwrap();

        let written = std::fs::read_to_string(path.with_extension("jsonl")).unwrap();
        assert_eq!(written.lines().count(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
